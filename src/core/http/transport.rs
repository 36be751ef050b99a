//! Wire-level transport: the seam between the HTTP client and the network.

use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

pub use reqwest::Method;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Set a header, replacing any existing value with the same name.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json(self, value: &Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(value.to_string().into_bytes())
    }

    /// `application/x-www-form-urlencoded` body.
    pub fn form(self, pairs: &[(&str, &str)]) -> Self {
        let encoded = form_encode(pairs);
        self.header("Content-Type", "application/x-www-form-urlencoded")
            .body(encoded.into_bytes())
    }

    /// Methods that change server state and therefore need a CSRF token.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
        )
    }
}

pub fn form_encode(pairs: &[(&str, &str)]) -> String {
    let mut url = match reqwest::Url::parse("http://localhost/") {
        Ok(url) => url,
        Err(_) => return String::new(),
    };
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in pairs {
            query.append_pair(key, value);
        }
    }
    url.query().unwrap_or_default().to_string()
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Streaming response body. Dropping it closes the underlying connection.
pub struct Body(Box<dyn Read + Send>);

impl Body {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self(Box::new(reader))
    }

    pub fn empty() -> Self {
        Self::new(std::io::empty())
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Body(..)")
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn bytes(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.body
            .read_to_end(&mut buf)
            .map_err(|e| Error::http_parse("response body", e.to_string()))?;
        Ok(buf)
    }

    pub fn text(self) -> Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn json(self) -> Result<Value> {
        let bytes = self.bytes()?;
        serde_json::from_slice(&bytes).map_err(|e| Error::http_parse("JSON response", e.to_string()))
    }

    /// First `limit` bytes of the body, for diagnostics. Consumes the body.
    pub fn preview(mut self, limit: usize) -> String {
        let mut buf = Vec::new();
        let _ = (&mut self.body).take(limit as u64).read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

pub trait Transport: Send + Sync {
    /// Send one request. `Err` means the request never produced an HTTP
    /// response (connection refused, timeout, TLS failure).
    fn send(&self, request: &Request) -> Result<Response>;
}

#[derive(Debug, Clone)]
pub enum ClientCert {
    /// PEM bundle holding certificate chain and unencrypted private key.
    Pem(Vec<u8>),
    Pkcs12 { der: Vec<u8>, password: String },
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub client_cert: Option<ClientCert>,
    pub accept_invalid_certs: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(180),
            client_cert: None,
            accept_invalid_certs: false,
        }
    }
}

/// Builds transports; lets steps run against a scripted backend in tests.
pub trait TransportFactory: Send + Sync {
    fn build(&self, options: &TransportOptions) -> Result<Arc<dyn Transport>>;
}

#[derive(Debug, Default)]
pub struct ReqwestFactory;

impl TransportFactory for ReqwestFactory {
    fn build(&self, options: &TransportOptions) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(ReqwestTransport::new(options)?))
    }
}

/// Blocking reqwest transport with its own connection pool and cookie jar.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs);

        builder = match &options.client_cert {
            None => builder.use_rustls_tls(),
            Some(ClientCert::Pem(pem)) => {
                let identity = reqwest::Identity::from_pem(pem).map_err(|e| {
                    Error::config_invalid_value("clientCertificate", None, None, e.to_string())
                })?;
                builder.use_rustls_tls().identity(identity)
            }
            Some(ClientCert::Pkcs12 { der, password }) => {
                let identity = reqwest::Identity::from_pkcs12_der(der, password).map_err(|e| {
                    Error::config_invalid_value("clientCertificate", None, None, e.to_string())
                })?;
                builder.use_native_tls().identity(identity)
            }
        };

        let client = builder
            .build()
            .map_err(|e| Error::internal_unexpected(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|e| {
            Error::http_transport(request.method.as_str(), request.url.as_str(), e.to_string(), 1)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(Response::new(status, headers, Body::new(response)))
    }
}
