//! CLI response formatting and output.
//!
//! Provides the JSON envelope printed on stdout after every step.

use pipestep::error::Hint;
use pipestep::secrets::SecretRegistry;
use pipestep::{Error, Result, StepOutcome};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CliError>,
}

#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: String,
    pub kind: String,
    pub category: String,
    pub message: String,
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<Hint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl<T: Serialize> CliResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Secrets are masked on the JSON tree, before escaping.
    fn to_json(&self, secrets: &SecretRegistry) -> Result<String> {
        let serialize_err =
            |e: serde_json::Error| Error::internal_json(e.to_string(), Some("serialize response".to_string()));
        let value = serde_json::to_value(self).map_err(serialize_err)?;
        serde_json::to_string_pretty(&secrets.redact_value(&value)).map_err(serialize_err)
    }
}

impl CliResponse<()> {
    pub fn from_error(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CliError {
                code: err.code.as_str().to_string(),
                kind: err.code.kind().to_string(),
                category: err.category().to_string(),
                message: err.message.clone(),
                details: err.details.clone(),
                hints: if err.hints.is_empty() {
                    None
                } else {
                    Some(err.hints.clone())
                },
                retryable: err.retryable,
            }),
        }
    }
}

fn print_response<T: Serialize>(response: &CliResponse<T>, secrets: &SecretRegistry) -> Result<()> {
    use std::io::{self, Write};

    let payload = response.to_json(secrets)?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{}", payload) {
        if e.kind() == io::ErrorKind::BrokenPipe {
            return Ok(()); // Exit gracefully on SIGPIPE
        }
        return Err(Error::internal_io(
            e.to_string(),
            Some("write stdout".to_string()),
        ));
    }
    Ok(())
}

pub fn print_error(err: &Error, secrets: &SecretRegistry) -> Result<()> {
    print_response(&CliResponse::<()>::from_error(err), secrets)
}

pub fn print_outcome(outcome: &StepOutcome, secrets: &SecretRegistry) -> Result<()> {
    match (&outcome.error, &outcome.output) {
        (Some(err), _) => print_error(err, secrets),
        (None, Some(data)) => print_response(&CliResponse::success(data), secrets),
        (None, None) => print_response(&CliResponse::success(Value::Null), secrets),
    }
}

pub fn exit_code_to_u8(code: i32) -> u8 {
    code.clamp(0, 255) as u8
}
