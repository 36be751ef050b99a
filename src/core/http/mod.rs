//! HTTP client for remote backends: authentication, CSRF handshake, retries,
//! downloads. Wire access goes through a [`Transport`] so steps can be driven
//! against a scripted backend.

pub mod retry;
pub mod scripted;
pub mod transport;

pub use retry::RetryPolicy;
pub use transport::{
    Body, ClientCert, Method, ReqwestFactory, Request, Response, Transport, TransportFactory,
    TransportOptions,
};

use crate::cancel::CancellationToken;
use crate::error::{BackendRejectedDetails, Error, Result};
use crate::secrets::SecretRegistry;
use crate::token::{ClientCredentials, TokenCache};
use base64::Engine;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CSRF_HEADER: &str = "X-Csrf-Token";
const PREVIEW_LIMIT: usize = 1024;

#[derive(Debug, Clone, Default)]
pub enum Auth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
    ClientCredentials(ClientCredentials),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub auth: Auth,
    /// `-1` disables retries, `0` selects the default.
    pub max_retries: i64,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_statuses: Vec<u16>,
    /// When set, mutating requests carry a token fetched from this URL.
    pub csrf_url: Option<String>,
    pub transport: TransportOptions,
    /// Step cancellation; cuts retry backoff short.
    pub cancel: Option<CancellationToken>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            auth: Auth::None,
            max_retries: 0,
            min_backoff: policy.min_backoff,
            max_backoff: policy.max_backoff,
            retry_statuses: Vec::new(),
            csrf_url: None,
            transport: TransportOptions::default(),
            cancel: None,
        }
    }
}

impl ClientOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            retry_statuses: self.retry_statuses.clone(),
            cancel: self.cancel.clone(),
            ..RetryPolicy::from_max_retries(self.max_retries)
        }
    }
}

pub struct HttpClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    policy: RetryPolicy,
    secrets: Arc<SecretRegistry>,
    tokens: Arc<TokenCache>,
    csrf_token: Mutex<Option<String>>,
}

impl HttpClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ClientOptions,
        secrets: Arc<SecretRegistry>,
        tokens: Arc<TokenCache>,
    ) -> Self {
        match &options.auth {
            Auth::Basic { password, .. } => secrets.register(password),
            Auth::Bearer(token) => secrets.register(token),
            Auth::ClientCredentials(c) => secrets.register(&c.client_secret),
            Auth::None => {}
        }
        let policy = options.retry_policy();
        Self {
            transport,
            options,
            policy,
            secrets,
            tokens,
            csrf_token: Mutex::new(None),
        }
    }

    /// Build a client with a fresh transport (own connection pool and cookie jar).
    pub fn build(
        factory: &dyn TransportFactory,
        options: ClientOptions,
        secrets: Arc<SecretRegistry>,
        tokens: Arc<TokenCache>,
    ) -> Result<Self> {
        let transport = factory.build(&options.transport)?;
        Ok(Self::new(transport, options, secrets, tokens))
    }

    pub fn secrets(&self) -> &SecretRegistry {
        &self.secrets
    }

    fn redact(&self, text: &str) -> String {
        self.secrets.redact(text)
    }

    fn authorization(&self) -> Result<Option<String>> {
        Ok(match &self.options.auth {
            Auth::None => None,
            Auth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                Some(format!("Basic {}", encoded))
            }
            Auth::Bearer(token) => Some(format!("Bearer {}", token)),
            Auth::ClientCredentials(credentials) => Some(
                self.tokens
                    .get_token(self.transport.as_ref(), credentials, &self.secrets)?
                    .authorization(),
            ),
        })
    }

    fn csrf_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.csrf_token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fetch_csrf_token(&self, url: &str, authorization: Option<&str>) -> Result<String> {
        let mut request = Request::new(Method::HEAD, url).header(CSRF_HEADER, "fetch");
        if let Some(value) = authorization {
            request.set_header("Authorization", value);
        }
        tracing::debug!(url = %self.redact(url), "fetching CSRF token");

        let response = self.send_raw(&request)?;
        self.register_cookies(&response);
        if !response.is_success() {
            return Err(Error::auth_csrf_failed(
                self.redact(url),
                format!("status {}", response.status),
            ));
        }
        let token = response
            .header(CSRF_HEADER)
            .map(str::to_string)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("required"))
            .ok_or_else(|| {
                Error::auth_csrf_failed(self.redact(url), "response carried no token header")
            })?;
        self.secrets.register(&token);
        Ok(token)
    }

    fn csrf_token(&self, url: &str, authorization: Option<&str>, refresh: bool) -> Result<String> {
        let mut slot = self.csrf_slot();
        if !refresh {
            if let Some(token) = slot.as_ref() {
                return Ok(token.clone());
            }
        }
        let token = self.fetch_csrf_token(url, authorization)?;
        *slot = Some(token.clone());
        Ok(token)
    }

    fn send_raw(&self, request: &Request) -> Result<Response> {
        retry::send_with_retry(self.transport.as_ref(), request, &self.policy, &|s| {
            self.secrets.redact(s)
        })
    }

    fn register_cookies(&self, response: &Response) {
        for cookie in response.header_values("Set-Cookie") {
            let pair = cookie.split(';').next().unwrap_or_default();
            if let Some((_, value)) = pair.split_once('=') {
                self.secrets.register(value.trim());
            }
        }
    }

    /// Issue a request and return the response whatever its status.
    ///
    /// Attaches authorization, completes the CSRF handshake before the first
    /// mutating call, and replays once if the backend reports the token as
    /// expired (`403` with `X-Csrf-Token: Required`).
    pub fn execute(&self, request: Request) -> Result<Response> {
        let mut request = request;
        let authorization = self.authorization()?;
        if let Some(value) = &authorization {
            request.set_header("Authorization", value.as_str());
        }

        let csrf_url = match &self.options.csrf_url {
            Some(url) if request.is_mutating() => Some(url.clone()),
            _ => None,
        };
        if let Some(url) = &csrf_url {
            let token = self.csrf_token(url, authorization.as_deref(), false)?;
            request.set_header(CSRF_HEADER, token);
        }

        tracing::debug!(method = %request.method, url = %self.redact(&request.url), "sending request");
        let response = self.send_raw(&request)?;
        self.register_cookies(&response);

        let csrf_rejected = response.status == 403
            && response
                .header(CSRF_HEADER)
                .map(|v| v.eq_ignore_ascii_case("required"))
                .unwrap_or(false);
        let response = match (&csrf_url, csrf_rejected) {
            (Some(url), true) => {
                tracing::debug!("CSRF token rejected, refetching once");
                drop(response);
                let token = self.csrf_token(url, authorization.as_deref(), true)?;
                request.set_header(CSRF_HEADER, token);
                let replay = self.send_raw(&request)?;
                self.register_cookies(&replay);
                replay
            }
            _ => response,
        };

        tracing::debug!(
            method = %request.method,
            url = %self.redact(&request.url),
            status = response.status,
            "received response"
        );
        Ok(response)
    }

    /// Turn a non-2xx response into a `BackendError` with a redacted body preview.
    pub fn check_status(&self, method: &Method, url: &str, response: Response) -> Result<Response> {
        if response.is_success() {
            return Ok(response);
        }
        let status = response.status;
        let body_preview = self.redact(&response.preview(PREVIEW_LIMIT));
        tracing::debug!(status, body = %body_preview, "backend rejected request");
        Err(Error::http_backend_rejected(BackendRejectedDetails {
            method: method.to_string(),
            url: self.redact(url),
            status,
            body_preview,
        }))
    }

    /// Execute and require a 2xx status.
    pub fn send(&self, request: Request) -> Result<Response> {
        let method = request.method.clone();
        let url = request.url.clone();
        let response = self.execute(request)?;
        self.check_status(&method, &url, response)
    }

    pub fn get(&self, url: &str) -> Result<Response> {
        self.send(Request::get(url))
    }

    pub fn head(&self, url: &str) -> Result<Response> {
        self.send(Request::new(Method::HEAD, url))
    }

    pub fn delete(&self, url: &str) -> Result<Response> {
        self.send(Request::new(Method::DELETE, url))
    }

    pub fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> Result<Response> {
        self.send(
            Request::post(url)
                .header("Content-Type", content_type)
                .body(body),
        )
    }

    pub fn put(&self, url: &str, content_type: &str, body: Vec<u8>) -> Result<Response> {
        self.send(
            Request::new(Method::PUT, url)
                .header("Content-Type", content_type)
                .body(body),
        )
    }

    /// Stream a GET response into `target`. The body lands in a sibling temp
    /// file first and is renamed into place once complete.
    pub fn download(&self, url: &str, target: &Path) -> Result<u64> {
        let mut response = self.get(url)?;

        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        crate::utils::io::ensure_dir(parent, "create download directory")?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let tmp = parent.join(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4().simple()));

        let written = (|| -> io::Result<u64> {
            let mut file = fs::File::create(&tmp)?;
            let written = io::copy(&mut response.body, &mut file)?;
            file.sync_all()?;
            fs::rename(&tmp, target)?;
            Ok(written)
        })();

        match written {
            Ok(bytes) => {
                tracing::debug!(url = %self.redact(url), path = %target.display(), bytes, "downloaded");
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(Error::internal_io(
                    e.to_string(),
                    Some(format!("download to {}", target.display())),
                ))
            }
        }
    }
}
