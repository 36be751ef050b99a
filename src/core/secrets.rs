//! Process-wide registry of strings that must never reach a log line.

use serde_json::Value;
use std::sync::{Arc, OnceLock, RwLock};

pub const REDACTION_MARKER: &str = "***";

/// Append-only set of secret strings. Registration never removes or clears.
#[derive(Debug, Default)]
pub struct SecretRegistry {
    secrets: RwLock<Vec<String>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by the logging layer.
    pub fn global() -> Arc<SecretRegistry> {
        static GLOBAL: OnceLock<Arc<SecretRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(SecretRegistry::new()))
            .clone()
    }

    /// Register a secret. Strings of one character or less are ignored. The
    /// URL-query-encoded form is registered too, since secrets end up in
    /// query strings and form bodies.
    pub fn register(&self, secret: &str) {
        if secret.chars().count() <= 1 {
            return;
        }
        let encoded = url_query_escape(secret);

        let mut secrets = match self.secrets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for candidate in [secret.to_string(), encoded] {
            if !secrets.contains(&candidate) {
                secrets.push(candidate);
            }
        }
        // Longest first, so a secret containing another is masked whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, secret: &str) -> bool {
        self.read().iter().any(|s| s == secret)
    }

    /// Replace every occurrence of every registered secret with `***`.
    /// One left-to-right pass: inserted markers are never scanned again.
    pub fn redact(&self, text: &str) -> String {
        let secrets = self.read();
        if !secrets.iter().any(|s| text.contains(s.as_str())) {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        'scan: while let Some(c) = rest.chars().next() {
            for secret in secrets.iter() {
                if let Some(after) = rest.strip_prefix(secret.as_str()) {
                    out.push_str(REDACTION_MARKER);
                    rest = after;
                    continue 'scan;
                }
            }
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }

    /// Redact every string leaf (and key) of a JSON value. Serialized JSON
    /// escapes quotes and backslashes, so redacting the text form misses
    /// secrets that contain them.
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Number(n) => {
                let text = n.to_string();
                let redacted = self.redact(&text);
                if redacted == text {
                    value.clone()
                } else {
                    Value::String(redacted)
                }
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (self.redact(k), self.redact_value(v)))
                    .collect(),
            ),
            Value::Null | Value::Bool(_) => value.clone(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<String>> {
        match self.secrets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn url_query_escape(value: &str) -> String {
    let mut url = match reqwest::Url::parse("http://localhost/") {
        Ok(url) => url,
        Err(_) => return value.to_string(),
    };
    url.query_pairs_mut().append_pair("s", value);
    url.query()
        .and_then(|q| q.strip_prefix("s="))
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}
