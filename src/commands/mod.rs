//! Steps shipped in the binary, and the helpers they share.

use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::http::{Auth, ClientCert, ClientOptions, TransportOptions};
use crate::job::MAX_POLL_DURATION;
use crate::runner::Step;
use crate::step::{ParameterSpec, ALL_SCOPES};
use crate::token::ClientCredentials;
use crate::utils::io;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

pub mod get_config;
pub mod integration_artifact_deploy;
pub mod pipeline_env;
pub mod remote_job;

/// Every registered step, in help order.
pub fn all() -> Vec<Step> {
    vec![
        get_config::step(),
        pipeline_env::read_step(),
        pipeline_env::write_step(),
        remote_job::step(),
        integration_artifact_deploy::step(),
    ]
}

pub fn find(name: &str) -> Option<Step> {
    all().into_iter().find(|s| s.name() == name)
}

/// A positive int parameter counted in `unit`, or `None` when unset.
/// Values the job clock cannot hold are rejected here, before anything is
/// submitted.
pub(crate) fn duration_param(config: &ResolvedConfig, name: &str, unit: Duration) -> Result<Option<Duration>> {
    let Some(value) = config.int(name) else {
        return Ok(None);
    };
    let invalid = |problem: &str| {
        Error::config_invalid_value(name, None, Some(value.to_string()), problem)
    };
    if value <= 0 {
        return Err(invalid("must be positive"));
    }
    u32::try_from(value)
        .ok()
        .and_then(|v| unit.checked_mul(v))
        .filter(|d| *d <= MAX_POLL_DURATION)
        .map(Some)
        .ok_or_else(|| invalid("too large"))
}

// ============================================================================
// Backend connection parameters
// ============================================================================

/// Connection parameters shared by steps that talk to an HTTP backend.
pub fn connection_params() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec::string("credentialsId")
            .scopes(ALL_SCOPES)
            .describe("Credential holding username/password or client secret"),
        ParameterSpec::string("username").from_credential("credentialsId", "username"),
        ParameterSpec::string("password").from_credential("credentialsId", "password"),
        ParameterSpec::string("tokenUrl").describe("OAuth2 token endpoint (client credentials)"),
        ParameterSpec::string("clientId"),
        ParameterSpec::string("clientSecret").from_credential("credentialsId", "clientSecret"),
        ParameterSpec::string("tokenScope"),
        ParameterSpec::string("csrfUrl")
            .describe("URL answering `X-Csrf-Token: fetch`; enables the CSRF handshake"),
        ParameterSpec::string("clientCertificate")
            .describe("PEM bundle or PKCS#12 file (.p12/.pfx) for mutual TLS"),
        ParameterSpec::string("clientCertificatePassword")
            .from_credential("credentialsId", "certificatePassword"),
        ParameterSpec::bool("insecureSkipVerify").default_value(false),
        ParameterSpec::int("maxRetries")
            .default_value(0)
            .scopes(ALL_SCOPES)
            .describe("-1 disables retries, 0 selects the default"),
        ParameterSpec::int("requestTimeoutInSeconds").default_value(180),
    ]
}

fn client_cert(config: &ResolvedConfig) -> Result<Option<ClientCert>> {
    let Some(path) = config.str("clientCertificate") else {
        return Ok(None);
    };
    let path = crate::config::expand_path(path);
    let bytes = io::read_optional(&path, "read client certificate")?.ok_or_else(|| {
        Error::config_invalid_value(
            "clientCertificate",
            None,
            Some(path.display().to_string()),
            "file does not exist",
        )
    })?;
    let pkcs12 = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("p12") | Some("pfx")
    );
    Ok(Some(if pkcs12 {
        ClientCert::Pkcs12 {
            der: bytes,
            password: config.string("clientCertificatePassword").unwrap_or_default(),
        }
    } else {
        ClientCert::Pem(bytes)
    }))
}

/// Client options from the connection parameters. Client credentials win
/// over basic auth when both are configured.
pub fn client_options(config: &ResolvedConfig) -> Result<ClientOptions> {
    let auth = match (config.str("tokenUrl"), config.str("clientId")) {
        (Some(token_url), Some(client_id)) => Auth::ClientCredentials(ClientCredentials {
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: config.require_str("clientSecret")?.to_string(),
            scope: config.string("tokenScope"),
        }),
        _ => match config.str("username") {
            Some(username) => Auth::Basic {
                username: username.to_string(),
                password: config.string("password").unwrap_or_default(),
            },
            None => Auth::None,
        },
    };

    let timeout = config.int("requestTimeoutInSeconds").unwrap_or(180);
    if timeout <= 0 {
        return Err(Error::config_invalid_value(
            "requestTimeoutInSeconds",
            None,
            Some(timeout.to_string()),
            "must be positive",
        ));
    }

    Ok(ClientOptions {
        auth,
        max_retries: config.int("maxRetries").unwrap_or(0),
        csrf_url: config.string("csrfUrl"),
        transport: TransportOptions {
            request_timeout: Duration::from_secs(timeout as u64),
            client_cert: client_cert(config)?,
            accept_invalid_certs: config.bool("insecureSkipVerify"),
            ..TransportOptions::default()
        },
        ..ClientOptions::default()
    })
}

/// Read a value from stdin, refusing to block on an interactive terminal.
pub fn read_stdin(field: &str) -> Result<String> {
    use std::io::IsTerminal;

    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Err(Error::validation_invalid_argument(
            field,
            format!("no --{} given and stdin is a terminal", field),
        ));
    }
    let mut buf = String::new();
    stdin
        .read_to_string(&mut buf)
        .map_err(|e| Error::internal_io(e.to_string(), Some("read stdin".to_string())))?;
    Ok(buf)
}

/// `@path` reads a file, anything else is taken literally.
pub fn read_inline_or_file(raw: &str, field: &str) -> Result<String> {
    match raw.strip_prefix('@') {
        Some(path) if path.trim().is_empty() => Err(Error::validation_invalid_argument(
            field,
            "'@' needs a file path",
        )),
        Some(path) => io::read_file(Path::new(path.trim()), &format!("read {}", field)),
        None => Ok(raw.to_string()),
    }
}
