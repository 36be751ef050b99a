//! Fan-out of log records and lifecycle events to configured sinks.
//!
//! A failing or panicking sink never aborts the step: errors are reported on
//! stderr and swallowed.

pub mod file_collector;
pub mod splunk;

pub use file_collector::CollectorSink;
pub use splunk::SplunkSink;

use crate::config::HooksConfig;
use crate::error::{Error, Result};
use crate::http::TransportFactory;
use crate::secrets::SecretRegistry;
use crate::telemetry::TelemetryRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// One emitted (already redacted) log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub time: String,
    pub level: String,
    pub step: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// What a sink learns about the error that ended a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FatalReport {
    pub step: String,
    pub code: String,
    pub kind: String,
    pub category: String,
    pub message: String,
    pub details: Value,
    pub time: String,
}

impl FatalReport {
    pub fn from_error(step: &str, err: &Error, secrets: &SecretRegistry) -> Self {
        let details = secrets.redact_value(&err.details);
        Self {
            step: step.to_string(),
            code: err.code.as_str().to_string(),
            kind: err.code.kind().to_string(),
            category: err.category().to_string(),
            message: secrets.redact(&err.message),
            details,
            time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Sinks must be cheap in `on_log`: buffer, do not block.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn on_log(&self, _record: &LogRecord) {}

    fn on_fatal(&self, _report: &FatalReport) -> Result<()> {
        Ok(())
    }

    fn on_finish(&self, _telemetry: &TelemetryRecord) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct HookBus {
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn Sink>) {
        match self.sinks.write() {
            Ok(mut guard) => guard.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Calls run on a snapshot so a sink may log without holding the lock.
    fn snapshot(&self) -> Vec<Arc<dyn Sink>> {
        match self.sinks.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn on_log(&self, record: &LogRecord) {
        for sink in self.snapshot() {
            let _ = catch_unwind(AssertUnwindSafe(|| sink.on_log(record)));
        }
    }

    pub fn on_fatal(&self, report: &FatalReport) {
        self.each("on_fatal", |sink| sink.on_fatal(report));
    }

    pub fn on_finish(&self, telemetry: &TelemetryRecord) {
        self.each("on_finish", |sink| sink.on_finish(telemetry));
    }

    pub fn close(&self) {
        self.each("close", |sink| sink.close());
    }

    // Lifecycle failures go to stderr directly; logging them through tracing
    // would feed them back into the sinks being reported on.
    fn each(&self, event: &str, call: impl Fn(&dyn Sink) -> Result<()>) {
        for sink in self.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| call(sink.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => eprintln!("hook {} failed in {}: {}", sink.name(), event, err),
                Err(_) => eprintln!("hook {} panicked in {}", sink.name(), event),
            }
        }
    }
}

/// Sinks declared in the `hooks` section of the custom config.
pub fn sinks_from_config(
    hooks: &HooksConfig,
    step: &str,
    correlation_id: &str,
    env_root: &Path,
    factory: &dyn TransportFactory,
    secrets: Arc<SecretRegistry>,
) -> Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if let Some(collector) = &hooks.collector {
        let dir = crate::config::expand_path(&collector.directory);
        let dir = if dir.is_absolute() { dir } else { env_root.join(dir) };
        sinks.push(Arc::new(CollectorSink::new(&dir, step)));
    }
    if let Some(splunk) = hooks.splunk.as_ref().filter(|s| !s.url.is_empty()) {
        sinks.push(Arc::new(SplunkSink::new(
            splunk,
            correlation_id,
            factory,
            secrets,
        )?));
    }
    Ok(sinks)
}
