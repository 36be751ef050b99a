//! OAuth2 client-credentials tokens, cached per (token URL, client id).

use crate::error::{Error, Result};
use crate::http::retry::{send_with_retry, RetryPolicy};
use crate::http::transport::{Request, Transport};
use crate::secrets::SecretRegistry;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub const DEFAULT_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

impl ClientCredentials {
    pub fn cache_key(&self) -> (String, String) {
        (self.token_url.clone(), self.client_id.clone())
    }
}

/// Immutable once published to the cache.
#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    pub token_type: String,
    pub expires_at: Instant,
}

impl Token {
    pub fn is_fresh(&self, now: Instant, skew: Duration) -> bool {
        match self.expires_at.checked_sub(skew) {
            Some(refresh_at) => now < refresh_at,
            None => false,
        }
    }

    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct TokenCache {
    entries: RwLock<HashMap<(String, String), Arc<Token>>>,
    refresh: Mutex<()>,
    skew: Duration,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SKEW)
    }
}

impl TokenCache {
    pub fn new(skew: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refresh: Mutex::new(()),
            skew,
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<Arc<Token>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .get(key)
            .filter(|token| token.is_fresh(Instant::now(), self.skew))
            .cloned()
    }

    /// Return a fresh cached token or run `fetch` exactly once while other
    /// callers wait, then publish its result.
    pub fn get_or_refresh<F>(&self, key: (String, String), fetch: F) -> Result<Arc<Token>>
    where
        F: FnOnce() -> Result<Token>,
    {
        if let Some(token) = self.cached(&key) {
            return Ok(token);
        }

        let _refresh = match self.refresh.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(token) = self.cached(&key) {
            return Ok(token);
        }

        let token = Arc::new(fetch()?);
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key, token.clone());
        Ok(token)
    }

    pub fn get_token(
        &self,
        transport: &dyn Transport,
        credentials: &ClientCredentials,
        secrets: &SecretRegistry,
    ) -> Result<Arc<Token>> {
        self.get_or_refresh(credentials.cache_key(), || {
            fetch_client_credentials(transport, credentials, secrets)
        })
    }
}

/// Exchange client credentials at the token URL.
pub fn fetch_client_credentials(
    transport: &dyn Transport,
    credentials: &ClientCredentials,
    secrets: &SecretRegistry,
) -> Result<Token> {
    secrets.register(&credentials.client_secret);

    let mut form = vec![("grant_type", "client_credentials")];
    if let Some(scope) = &credentials.scope {
        form.push(("scope", scope.as_str()));
    }
    let basic = base64::engine::general_purpose::STANDARD.encode(format!(
        "{}:{}",
        credentials.client_id, credentials.client_secret
    ));
    let request = Request::post(credentials.token_url.as_str())
        .header("Authorization", format!("Basic {}", basic))
        .header("Accept", "application/json")
        .form(&form);

    tracing::debug!(token_url = %credentials.token_url, client_id = %credentials.client_id, "fetching bearer token");
    let issued_at = Instant::now();
    let response = send_with_retry(transport, &request, &RetryPolicy::disabled(), &|s| {
        secrets.redact(s)
    })?;

    if !response.is_success() {
        let status = response.status;
        let preview = secrets.redact(&response.preview(1024));
        return Err(Error::auth_token_failed(
            &credentials.token_url,
            format!("status {}: {}", status, preview),
        ));
    }

    let body = response.bytes()?;
    let parsed: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
        Error::auth_token_failed(&credentials.token_url, format!("invalid token response: {}", e))
    })?;
    secrets.register(&parsed.access_token);

    // No expires_in: usable for this request only, never served from cache.
    let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(0));
    Ok(Token {
        value: parsed.access_token,
        token_type: parsed.token_type.unwrap_or_else(|| "bearer".to_string()),
        expires_at: issued_at + lifetime,
    })
}
