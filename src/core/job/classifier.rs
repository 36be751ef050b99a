//! Pure mappings from a poll response body to a job outcome.

use crate::error::{Error, Result};
use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Running,
    Succeeded,
    Failed(String),
    Aborted(String),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Running)
    }
}

/// Must be deterministic and side-effect free: the same body always yields
/// the same outcome. `Err` only for bodies that cannot be parsed at all.
pub trait Classifier: Send + Sync {
    fn classify(&self, body: &str) -> Result<Outcome>;
}

/// Backend state names grouped by outcome. Matching ignores case.
#[derive(Debug, Clone, Default)]
pub struct StateTable {
    pub running: Vec<String>,
    pub success: Vec<String>,
    pub failure: Vec<String>,
    pub aborted: Vec<String>,
}

impl StateTable {
    pub fn new(running: &[&str], success: &[&str], failure: &[&str]) -> Self {
        let owned = |xs: &[&str]| -> Vec<String> { xs.iter().map(|s| s.to_string()).collect() };
        Self {
            running: owned(running),
            success: owned(success),
            failure: owned(failure),
            aborted: Vec::new(),
        }
    }

    pub fn with_aborted(mut self, aborted: &[&str]) -> Self {
        self.aborted = aborted.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Unknown states are failures: a job we cannot interpret is not a success.
    pub fn outcome(&self, state: &str, reason: Option<String>) -> Outcome {
        let state = state.trim();
        let has = |set: &[String]| set.iter().any(|s| s.eq_ignore_ascii_case(state));
        let describe = || reason.clone().unwrap_or_else(|| format!("backend state {}", state));
        if has(&self.running) {
            Outcome::Running
        } else if has(&self.success) {
            Outcome::Succeeded
        } else if has(&self.aborted) {
            Outcome::Aborted(describe())
        } else if has(&self.failure) {
            Outcome::Failed(describe())
        } else {
            Outcome::Failed(format!("unknown backend state '{}'", state))
        }
    }
}

pub fn parse_path(expression: &str, parameter: &str) -> Result<JsonPath> {
    JsonPath::parse(expression).map_err(|e| {
        Error::config_invalid_value(parameter, None, Some(expression.to_string()), e.to_string())
    })
}

fn first_string(path: &JsonPath, value: &Value) -> Option<String> {
    match path.query(value).first()? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// OData or custom JSON: state and optional reason addressed by JSONPath.
pub struct JsonStateClassifier {
    state: JsonPath,
    reason: Option<JsonPath>,
    table: StateTable,
}

impl JsonStateClassifier {
    pub fn new(state: JsonPath, reason: Option<JsonPath>, table: StateTable) -> Self {
        Self {
            state,
            reason,
            table,
        }
    }
}

impl Classifier for JsonStateClassifier {
    fn classify(&self, body: &str) -> Result<Outcome> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::http_parse("job status response", e.to_string()))?;
        let Some(state) = first_string(&self.state, &value) else {
            return Ok(Outcome::Failed("status response carried no state".to_string()));
        };
        let reason = self.reason.as_ref().and_then(|p| first_string(p, &value));
        Ok(self.table.outcome(&state, reason))
    }
}

/// XML-ish or text bodies: the first capture group of `state` holds the state.
pub struct PatternClassifier {
    state: Regex,
    reason: Option<Regex>,
    table: StateTable,
}

impl PatternClassifier {
    pub fn new(state: Regex, reason: Option<Regex>, table: StateTable) -> Self {
        Self {
            state,
            reason,
            table,
        }
    }
}

fn first_capture(re: &Regex, body: &str) -> Option<String> {
    let caps = re.captures(body)?;
    caps.get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().trim().to_string())
}

impl Classifier for PatternClassifier {
    fn classify(&self, body: &str) -> Result<Outcome> {
        let Some(state) = first_capture(&self.state, body) else {
            return Ok(Outcome::Failed("status response carried no state".to_string()));
        };
        let reason = self.reason.as_ref().and_then(|re| first_capture(re, body));
        Ok(self.table.outcome(&state, reason))
    }
}

/// Plain text with sentinel lines: failure beats success; neither means running.
pub struct SentinelClassifier {
    success: Regex,
    failure: Option<Regex>,
}

impl SentinelClassifier {
    pub fn new(success: Regex, failure: Option<Regex>) -> Self {
        Self { success, failure }
    }
}

impl Classifier for SentinelClassifier {
    fn classify(&self, body: &str) -> Result<Outcome> {
        if let Some(failure) = &self.failure {
            if let Some(m) = failure.find(body) {
                return Ok(Outcome::Failed(m.as_str().trim().to_string()));
            }
        }
        if self.success.is_match(body) {
            return Ok(Outcome::Succeeded);
        }
        Ok(Outcome::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StateTable {
        StateTable::new(&["RUNNING", "DEPLOYING"], &["FINISHED", "SUCCESS"], &["FAIL", "ERROR"])
            .with_aborted(&["ABORTED"])
    }

    #[test]
    fn odata_status_is_classified() {
        let c = JsonStateClassifier::new(parse_path("$.d.Status", "statePath").unwrap(), None, table());
        assert_eq!(c.classify(r#"{"d":{"Status":"DEPLOYING"}}"#).unwrap(), Outcome::Running);
        assert_eq!(c.classify(r#"{"d":{"Status":"success"}}"#).unwrap(), Outcome::Succeeded);
        assert_eq!(
            c.classify(r#"{"d":{"Status":"FAIL"}}"#).unwrap(),
            Outcome::Failed("backend state FAIL".to_string())
        );
    }

    #[test]
    fn reason_is_extracted_on_failure() {
        let c = JsonStateClassifier::new(
            parse_path("$.state", "statePath").unwrap(),
            Some(parse_path("$.message", "reasonPath").unwrap()),
            table(),
        );
        assert_eq!(
            c.classify(r#"{"state":"ABORTED","message":"cancelled by operator"}"#).unwrap(),
            Outcome::Aborted("cancelled by operator".to_string())
        );
    }

    #[test]
    fn unknown_and_missing_states_fail() {
        let c = JsonStateClassifier::new(parse_path("$.state", "statePath").unwrap(), None, table());
        assert!(matches!(c.classify(r#"{"state":"WEIRD"}"#).unwrap(), Outcome::Failed(r) if r.contains("WEIRD")));
        assert!(matches!(c.classify(r#"{"other":1}"#).unwrap(), Outcome::Failed(_)));
        assert!(c.classify("<html>").is_err());
    }

    #[test]
    fn classification_is_repeatable() {
        let c = JsonStateClassifier::new(parse_path("$.state", "statePath").unwrap(), None, table());
        let body = r#"{"state":"RUNNING"}"#;
        assert_eq!(c.classify(body).unwrap(), c.classify(body).unwrap());
    }

    #[test]
    fn xml_status_by_pattern() {
        let c = PatternClassifier::new(
            Regex::new(r"<Status>([^<]*)</Status>").unwrap(),
            Some(Regex::new(r"<Message>([^<]*)</Message>").unwrap()),
            table(),
        );
        let body = "<Job><Status>ERROR</Status><Message>compile failed</Message></Job>";
        assert_eq!(c.classify(body).unwrap(), Outcome::Failed("compile failed".to_string()));
    }

    #[test]
    fn sentinel_text() {
        let c = SentinelClassifier::new(
            Regex::new(r"(?m)^Process finished successfully").unwrap(),
            Some(Regex::new(r"(?m)^ERROR: .*$").unwrap()),
        );
        assert_eq!(c.classify("step 1\nstep 2").unwrap(), Outcome::Running);
        assert_eq!(c.classify("Process finished successfully").unwrap(), Outcome::Succeeded);
        assert_eq!(
            c.classify("ERROR: disk quota\nProcess finished successfully").unwrap(),
            Outcome::Failed("ERROR: disk quota".to_string())
        );
    }
}
