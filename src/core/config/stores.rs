//! Secret stores queried for parameters that declare a credential or vault source.

use crate::error::{Error, Result};
use crate::http::{Auth, ClientOptions, HttpClient, Method, Request, TransportFactory};
use crate::secrets::SecretRegistry;
use crate::token::TokenCache;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Credentials mounted by the pipeline host, addressed by credential id.
pub trait CredentialStore: Send + Sync {
    fn credential(&self, credential_id: &str, field: &str) -> Result<Option<String>>;
}

/// Files laid out as `<root>/<credentialId>/<field>`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl CredentialStore for FileCredentialStore {
    fn credential(&self, credential_id: &str, field: &str) -> Result<Option<String>> {
        if credential_id.is_empty()
            || credential_id.contains("..")
            || credential_id.contains('/')
            || field.contains('/')
        {
            return Ok(None);
        }
        let path = self.root.join(credential_id).join(field);
        let bytes = crate::utils::io::read_optional(&path, "read credential")?;
        Ok(bytes.map(|b| {
            String::from_utf8_lossy(&b)
                .trim_end_matches(['\n', '\r'])
                .to_string()
        }))
    }
}

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub server_url: String,
    pub namespace: Option<String>,
    pub token: String,
}

/// Key/value secret engine lookups.
pub trait VaultStore: Send + Sync {
    /// Fetch the secret at `path`. `None` when the path does not exist.
    fn read_secret(&self, settings: &VaultSettings, path: &str) -> Result<Option<Map<String, Value>>>;
}

/// Vault over HTTP, reading KV version 2 mounts (`<mount>/data/<rest>`).
pub struct HttpVaultStore {
    factory: Arc<dyn TransportFactory>,
    secrets: Arc<SecretRegistry>,
}

impl HttpVaultStore {
    pub fn new(factory: Arc<dyn TransportFactory>, secrets: Arc<SecretRegistry>) -> Self {
        Self { factory, secrets }
    }
}

/// `piper/pipeline/x` → `piper/data/pipeline/x`.
pub fn kv2_data_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    match trimmed.split_once('/') {
        Some((mount, rest)) => format!("{}/data/{}", mount, rest),
        None => format!("{}/data", trimmed),
    }
}

impl VaultStore for HttpVaultStore {
    fn read_secret(&self, settings: &VaultSettings, path: &str) -> Result<Option<Map<String, Value>>> {
        let http = HttpClient::build(
            self.factory.as_ref(),
            ClientOptions {
                auth: Auth::None,
                max_retries: -1,
                ..ClientOptions::default()
            },
            self.secrets.clone(),
            Arc::new(TokenCache::default()),
        )?;
        self.secrets.register(&settings.token);

        let url = format!(
            "{}/v1/{}",
            settings.server_url.trim_end_matches('/'),
            kv2_data_path(path)
        );
        let mut request = Request::new(Method::GET, url.as_str()).header("X-Vault-Token", settings.token.as_str());
        if let Some(namespace) = &settings.namespace {
            request.set_header("X-Vault-Namespace", namespace.as_str());
        }

        let response = http.execute(request)?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = http.check_status(&Method::GET, &url, response)?;
        let body = response.json()?;
        match body.pointer("/data/data") {
            Some(Value::Object(map)) => Ok(Some(map.clone())),
            Some(Value::Null) | None => Ok(None),
            Some(_) => Err(Error::http_parse(
                "vault secret",
                "data.data is not an object",
            )),
        }
    }
}

#[derive(Clone, Default)]
pub struct SecretStores {
    pub credentials: Option<Arc<dyn CredentialStore>>,
    pub vault: Option<Arc<dyn VaultStore>>,
}
