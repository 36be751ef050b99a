//! Per-step telemetry: wall clock, error code and category, custom fields.

use crate::error::ErrorCategory;
use crate::pipeline_env::PipelineEnv;
use crate::subprocess::{run_checked, CommandSpec, Subprocess};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// PE key holding the commit the pipeline builds.
pub const COMMIT_KEY: &str = "git.commitId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub step_name: String,
    pub duration_millis: u64,
    /// `0` on success, `1` on any error surfaced by the step.
    pub error_code: u8,
    pub error_category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id_hash: Option<String>,
    pub custom: BTreeMap<String, String>,
    pub timestamp: String,
}

#[derive(Debug, Default)]
struct Accumulated {
    category: Option<ErrorCategory>,
    custom: BTreeMap<String, String>,
}

/// Started at step entry; `finish` produces the one record of the invocation.
#[derive(Debug)]
pub struct Telemetry {
    step: String,
    started: Instant,
    state: Mutex<Accumulated>,
}

impl Telemetry {
    pub fn start(step: &str) -> Self {
        Self {
            step: step.to_string(),
            started: Instant::now(),
            state: Mutex::new(Accumulated::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Accumulated> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_error_category(&self, category: ErrorCategory) {
        self.state().category = Some(category);
    }

    pub fn error_category(&self) -> ErrorCategory {
        self.state().category.unwrap_or_default()
    }

    pub fn add_custom(&self, key: &str, value: impl Into<String>) {
        self.state().custom.insert(key.to_string(), value.into());
    }

    pub fn finish(
        &self,
        failed: bool,
        commit_hash: Option<String>,
        correlation_id: Option<&str>,
    ) -> TelemetryRecord {
        let state = self.state();
        TelemetryRecord {
            step_name: self.step.clone(),
            duration_millis: self.started.elapsed().as_millis() as u64,
            error_code: u8::from(failed),
            error_category: if failed {
                state.category.unwrap_or_default()
            } else {
                ErrorCategory::Undefined
            },
            commit_hash,
            correlation_id_hash: correlation_id
                .filter(|id| !id.is_empty())
                .map(hash_correlation_id),
            custom: state.custom.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn hash_correlation_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Commit under build: PE `git.commitId`, else `git rev-parse HEAD`.
pub fn commit_hash(pe: Option<&PipelineEnv>, subprocess: &dyn Subprocess) -> Option<String> {
    let from_pe = pe
        .and_then(|pe| pe.read(COMMIT_KEY).ok().flatten())
        .and_then(|v| v.as_text().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());
    if from_pe.is_some() {
        return from_pe;
    }
    let spec = CommandSpec::new("git").args(["rev-parse", "HEAD"]);
    match run_checked(subprocess, &spec) {
        Ok(hash) if !hash.is_empty() => Some(hash),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(error = %err.message, "no commit hash available");
            None
        }
    }
}
