//! Local log collector: one directory, three files per step.

use super::{FatalReport, LogRecord, Sink};
use crate::error::{Error, Result};
use crate::telemetry::TelemetryRecord;
use crate::utils::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct CollectorSink {
    dir: PathBuf,
    step: String,
    records: Mutex<Vec<LogRecord>>,
}

impl CollectorSink {
    pub fn new(dir: &Path, step: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            step: step.to_string(),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(format!("{}_log.jsonl", self.step))
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.dir.join(format!("{}_telemetry.json", self.step))
    }

    pub fn error_details_path(&self) -> PathBuf {
        self.dir.join(format!("{}_errorDetails.json", self.step))
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<LogRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T, op: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| Error::internal_json(e.to_string(), Some(op.to_string())))?;
        io::write_file_atomic(path, &content, op)
    }
}

impl Sink for CollectorSink {
    fn name(&self) -> &str {
        "collector"
    }

    fn on_log(&self, record: &LogRecord) {
        self.records().push(record.clone());
    }

    fn on_fatal(&self, report: &FatalReport) -> Result<()> {
        self.write_json(&self.error_details_path(), report, "write error details")
    }

    fn on_finish(&self, telemetry: &TelemetryRecord) -> Result<()> {
        self.write_json(&self.telemetry_path(), telemetry, "write telemetry")
    }

    fn close(&self) -> Result<()> {
        let records = std::mem::take(&mut *self.records());
        let mut content = String::new();
        for record in &records {
            let line = serde_json::to_string(record)
                .map_err(|e| Error::internal_json(e.to_string(), Some("write log".to_string())))?;
            content.push_str(&line);
            content.push('\n');
        }
        io::write_file_atomic(&self.log_path(), &content, "write log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::secrets::SecretRegistry;
    use crate::telemetry::Telemetry;
    use std::collections::BTreeMap;

    #[test]
    fn writes_log_telemetry_and_error_details() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectorSink::new(dir.path(), "deploy");

        for message in ["first", "second"] {
            sink.on_log(&LogRecord {
                time: "t".to_string(),
                level: "info".to_string(),
                step: "deploy".to_string(),
                message: message.to_string(),
                fields: BTreeMap::new(),
            });
        }
        let err = Error::job_submit_failed("deploy", 500, "boom".to_string());
        sink.on_fatal(&FatalReport::from_error("deploy", &err, &SecretRegistry::new()))
            .unwrap();
        let telemetry = Telemetry::start("deploy");
        telemetry.set_error_category(ErrorCategory::Service);
        sink.on_finish(&telemetry.finish(true, None, None)).unwrap();
        sink.close().unwrap();

        let log = std::fs::read_to_string(sink.log_path()).unwrap();
        let lines: Vec<LogRecord> = log
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].message, "second");

        let details: FatalReport =
            serde_json::from_str(&std::fs::read_to_string(sink.error_details_path()).unwrap())
                .unwrap();
        assert_eq!(details.code, "job.submit_failed");

        let record: TelemetryRecord =
            serde_json::from_str(&std::fs::read_to_string(sink.telemetry_path()).unwrap()).unwrap();
        assert_eq!(record.error_category, ErrorCategory::Service);
    }
}
