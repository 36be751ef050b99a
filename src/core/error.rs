use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingParameter,
    ConfigInvalidValue,
    ConfigInvalidFile,
    ConfigAliasConflict,

    ValidationInvalidArgument,

    AuthTokenFailed,
    AuthCsrfFailed,

    HttpTransportFailed,
    HttpBackendRejected,
    HttpParseFailed,

    JobSubmitFailed,
    JobFailed,
    JobAborted,
    JobTimedOut,
    JobCancelled,

    ArtifactDownloadFailed,

    StepBuildFailed,
    StepTestFailed,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingParameter => "config.missing_parameter",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigInvalidFile => "config.invalid_file",
            ErrorCode::ConfigAliasConflict => "config.alias_conflict",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::AuthTokenFailed => "auth.token_failed",
            ErrorCode::AuthCsrfFailed => "auth.csrf_failed",

            ErrorCode::HttpTransportFailed => "http.transport_failed",
            ErrorCode::HttpBackendRejected => "http.backend_rejected",
            ErrorCode::HttpParseFailed => "http.parse_failed",

            ErrorCode::JobSubmitFailed => "job.submit_failed",
            ErrorCode::JobFailed => "job.failed",
            ErrorCode::JobAborted => "job.aborted",
            ErrorCode::JobTimedOut => "job.timed_out",
            ErrorCode::JobCancelled => "job.cancelled",

            ErrorCode::ArtifactDownloadFailed => "artifact.download_failed",

            ErrorCode::StepBuildFailed => "step.build_failed",
            ErrorCode::StepTestFailed => "step.test_failed",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Error kind as reported in the final diagnostic line.
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingParameter
            | ErrorCode::ConfigInvalidValue
            | ErrorCode::ConfigInvalidFile
            | ErrorCode::ConfigAliasConflict
            | ErrorCode::ValidationInvalidArgument => "ConfigError",

            ErrorCode::AuthTokenFailed | ErrorCode::AuthCsrfFailed => "AuthError",

            ErrorCode::HttpTransportFailed => "TransportError",
            ErrorCode::HttpBackendRejected => "BackendError",
            ErrorCode::HttpParseFailed => "ParseError",

            ErrorCode::JobSubmitFailed | ErrorCode::JobFailed | ErrorCode::JobAborted => {
                "JobFailed"
            }
            ErrorCode::JobTimedOut => "JobTimedOut",
            ErrorCode::JobCancelled => "JobCancelled",

            ErrorCode::ArtifactDownloadFailed => "ArtifactError",

            ErrorCode::StepBuildFailed => "BuildError",
            ErrorCode::StepTestFailed => "TestError",

            ErrorCode::InternalIoError => "IOError",
            ErrorCode::InternalJsonError | ErrorCode::InternalUnexpected => "InternalError",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::ConfigMissingParameter
            | ErrorCode::ConfigInvalidValue
            | ErrorCode::ConfigInvalidFile
            | ErrorCode::ConfigAliasConflict
            | ErrorCode::ValidationInvalidArgument => ErrorCategory::Configuration,

            ErrorCode::AuthTokenFailed | ErrorCode::AuthCsrfFailed => ErrorCategory::Auth,

            ErrorCode::HttpTransportFailed
            | ErrorCode::HttpBackendRejected
            | ErrorCode::HttpParseFailed
            | ErrorCode::JobSubmitFailed
            | ErrorCode::JobFailed
            | ErrorCode::JobAborted
            | ErrorCode::JobTimedOut
            | ErrorCode::JobCancelled
            | ErrorCode::ArtifactDownloadFailed => ErrorCategory::Service,

            ErrorCode::StepBuildFailed => ErrorCategory::Build,
            ErrorCode::StepTestFailed => ErrorCategory::Test,

            ErrorCode::InternalIoError
            | ErrorCode::InternalJsonError
            | ErrorCode::InternalUnexpected => ErrorCategory::Undefined,
        }
    }
}

/// Failure category reported in telemetry. The host may drive a retry policy from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    #[default]
    Undefined,
    Configuration,
    Auth,
    Build,
    Test,
    Service,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Undefined => "undefined",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Build => "build",
            ErrorCategory::Test => "test",
            ErrorCategory::Service => "service",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParameterDetails {
    pub parameter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRejectedDetails {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub body_preview: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub job: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_millis: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
    pub category: Option<ErrorCategory>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
            category: None,
        }
    }

    /// Effective category: an explicit override wins over the code's default.
    pub fn category(&self) -> ErrorCategory {
        self.category.unwrap_or_else(|| self.code.category())
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn config_missing_parameter(parameter: impl Into<String>) -> Self {
        let parameter = parameter.into();
        let message = format!("mandatory parameter '{}' has no value", parameter);
        Self::new(
            ErrorCode::ConfigMissingParameter,
            message,
            to_details(ConfigParameterDetails {
                parameter,
                layer: None,
                value: None,
                problem: None,
            }),
        )
    }

    pub fn config_invalid_value(
        parameter: impl Into<String>,
        layer: Option<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let parameter = parameter.into();
        let problem = problem.into();
        let message = match &layer {
            Some(layer) => format!("parameter '{}' from {}: {}", parameter, layer, problem),
            None => format!("parameter '{}': {}", parameter, problem),
        };
        Self::new(
            ErrorCode::ConfigInvalidValue,
            message,
            to_details(ConfigParameterDetails {
                parameter,
                layer,
                value,
                problem: Some(problem),
            }),
        )
    }

    pub fn config_alias_conflict(
        parameter: impl Into<String>,
        layer: impl Into<String>,
        keys: Vec<String>,
    ) -> Self {
        let parameter = parameter.into();
        let layer = layer.into();
        let message = format!(
            "conflicting values for parameter '{}' in {} (keys: {})",
            parameter,
            layer,
            keys.join(", ")
        );
        Self::new(
            ErrorCode::ConfigAliasConflict,
            message,
            serde_json::json!({ "parameter": parameter, "layer": layer, "keys": keys }),
        )
    }

    pub fn config_invalid_file(path: impl Into<String>, error: impl Into<String>) -> Self {
        let path = path.into();
        let error = error.into();
        Self::new(
            ErrorCode::ConfigInvalidFile,
            format!("configuration file '{}' could not be read: {}", path, error),
            serde_json::json!({ "path": path, "error": error }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        let field = field.into();
        let problem = problem.into();
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("invalid argument '{}': {}", field, problem),
            serde_json::json!({ "field": field, "problem": problem }),
        )
    }

    pub fn auth_token_failed(token_url: impl Into<String>, reason: impl Into<String>) -> Self {
        let token_url = token_url.into();
        let reason = reason.into();
        Self::new(
            ErrorCode::AuthTokenFailed,
            format!("failed to fetch bearer token from {}: {}", token_url, reason),
            serde_json::json!({ "tokenUrl": token_url, "reason": reason }),
        )
    }

    pub fn auth_csrf_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        let url = url.into();
        let reason = reason.into();
        Self::new(
            ErrorCode::AuthCsrfFailed,
            format!("fetching X-Csrf-Token from {} failed: {}", url, reason),
            serde_json::json!({ "url": url, "reason": reason }),
        )
    }

    pub fn http_transport(
        method: impl Into<String>,
        url: impl Into<String>,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let method = method.into();
        let url = url.into();
        let error = error.into();
        Self::new(
            ErrorCode::HttpTransportFailed,
            format!("HTTP {} request to {} failed: {}", method, url, error),
            serde_json::json!({
                "method": method,
                "url": url,
                "error": error,
                "attempts": attempts,
            }),
        )
        .with_retryable(true)
    }

    pub fn http_backend_rejected(details: BackendRejectedDetails) -> Self {
        let message = format!(
            "HTTP {} request to {} returned status {}",
            details.method, details.url, details.status
        );
        Self::new(ErrorCode::HttpBackendRejected, message, to_details(details))
    }

    pub fn http_parse(context: impl Into<String>, error: impl Into<String>) -> Self {
        let context = context.into();
        let error = error.into();
        Self::new(
            ErrorCode::HttpParseFailed,
            format!("failed to parse {}: {}", context, error),
            serde_json::json!({ "context": context, "error": error }),
        )
    }

    pub fn job_submit_failed(job: impl Into<String>, status: u16, body_preview: String) -> Self {
        let job = job.into();
        Self::new(
            ErrorCode::JobSubmitFailed,
            format!("submitting job '{}' failed with status {}", job, status),
            serde_json::json!({ "job": job, "status": status, "bodyPreview": body_preview }),
        )
    }

    pub fn job_failed(details: JobDetails) -> Self {
        let message = format!(
            "job '{}' failed: {}",
            details.job,
            details.reason.as_deref().unwrap_or("no reason reported")
        );
        Self::new(ErrorCode::JobFailed, message, to_details(details))
    }

    pub fn job_aborted(details: JobDetails) -> Self {
        let message = format!(
            "job '{}' was aborted: {}",
            details.job,
            details.reason.as_deref().unwrap_or("no reason reported")
        );
        Self::new(ErrorCode::JobAborted, message, to_details(details))
    }

    pub fn job_timed_out(details: JobDetails) -> Self {
        let message = format!(
            "job '{}' did not finish within its maximum runtime",
            details.job
        );
        Self::new(ErrorCode::JobTimedOut, message, to_details(details))
    }

    pub fn job_cancelled(details: JobDetails) -> Self {
        let message = format!("polling of job '{}' was cancelled", details.job);
        Self::new(ErrorCode::JobCancelled, message, to_details(details))
    }

    pub fn artifact_download_failed(
        name: impl Into<String>,
        url: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let url = url.into();
        let reason = reason.into();
        Self::new(
            ErrorCode::ArtifactDownloadFailed,
            format!("mandatory artifact '{}' could not be downloaded: {}", name, reason),
            serde_json::json!({ "name": name, "url": url, "reason": reason }),
        )
    }

    pub fn build_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StepBuildFailed, message, Value::Null)
    }

    pub fn test_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StepTestFailed, message, Value::Null)
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        let message = match &context {
            Some(context) => format!("{}: {}", context, error),
            None => error.clone(),
        };
        Self::new(
            ErrorCode::InternalIoError,
            message,
            to_details(InternalIoErrorDetails { error, context }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        let message = match &context {
            Some(context) => format!("{}: {}", context, error),
            None => error.clone(),
        };
        Self::new(
            ErrorCode::InternalJsonError,
            message,
            serde_json::json!({ "error": error, "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            error.clone(),
            serde_json::json!({ "error": error }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_follows_code_unless_overridden() {
        let err = Error::job_timed_out(JobDetails {
            job: "build".to_string(),
            job_id: Some("J1".to_string()),
            reason: None,
            error_details: None,
            elapsed_millis: Some(2000),
        });
        assert_eq!(err.category(), ErrorCategory::Service);
        assert_eq!(err.code.kind(), "JobTimedOut");

        let err = err.with_category(ErrorCategory::Build);
        assert_eq!(err.category(), ErrorCategory::Build);
    }

    #[test]
    fn config_errors_name_parameter_and_layer() {
        let err = Error::config_invalid_value(
            "maxRuntimeInMinutes",
            Some("CLI flags".to_string()),
            Some("ten".to_string()),
            "expected an integer",
        );
        assert_eq!(err.code.as_str(), "config.invalid_value");
        assert!(err.message.contains("maxRuntimeInMinutes"));
        assert!(err.message.contains("CLI flags"));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn unknown_failures_are_undefined() {
        let err = Error::internal_io("disk full", Some("write pipeline env".to_string()));
        assert_eq!(err.category(), ErrorCategory::Undefined);
        assert_eq!(err.code.kind(), "IOError");
    }
}
