//! Download job artifacts into the publish directory and register them with
//! the pipeline environment.

use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::job::{JobResult, JobState};
use crate::pipeline_env::PipelineEnv;
use crate::utils::template;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory under the env root that the host publishes.
pub const OUT_DIR: &str = "out";
/// PE key listing everything downloaded by the step.
pub const PUBLISHED_KEY: &str = "artifacts.published";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub name: String,
    /// Remote URL; `{id}` is replaced by the job id.
    pub url: String,
    pub local_name: String,
    pub mandatory: bool,
    /// PE key that receives the local path.
    pub pe_key: Option<String>,
    /// Also fetch when the job did not succeed (logs, reports).
    pub on_failure: bool,
}

impl ArtifactSpec {
    pub fn new(local_name: &str, url: &str) -> Self {
        Self {
            name: local_name.to_string(),
            url: url.to_string(),
            local_name: local_name.to_string(),
            mandatory: true,
            pe_key: None,
            on_failure: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn pe_key(mut self, key: &str) -> Self {
        self.pe_key = Some(key.to_string());
        self
    }

    pub fn on_failure(mut self) -> Self {
        self.on_failure = true;
        self
    }

    /// Parse `file=url[|pe=key][|optional][|onFailure]`.
    pub fn parse(entry: &str) -> Result<Self> {
        let mut parts = entry.split('|').map(str::trim);
        let head = parts.next().unwrap_or_default();
        let (local_name, url) = head.split_once('=').ok_or_else(|| {
            Error::validation_invalid_argument("artifacts", format!("expected file=url, got '{}'", entry))
        })?;
        let mut spec = ArtifactSpec::new(local_name.trim(), url.trim());
        for flag in parts {
            match flag.split_once('=') {
                Some(("pe", key)) => spec = spec.pe_key(key.trim()),
                None if flag == "optional" => spec = spec.optional(),
                None if flag == "onFailure" => spec = spec.on_failure(),
                _ => {
                    return Err(Error::validation_invalid_argument(
                        "artifacts",
                        format!("unknown artifact option '{}' in '{}'", flag, entry),
                    ))
                }
            }
        }
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        let name = self.local_name.as_str();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(Error::validation_invalid_argument(
                "artifacts",
                format!("'{}' is not a plain file name", name),
            ));
        }
        if self.url.is_empty() {
            return Err(Error::validation_invalid_argument(
                "artifacts",
                format!("artifact '{}' has no URL", self.name),
            ));
        }
        Ok(())
    }

    fn kind(&self) -> String {
        Path::new(&self.local_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "file".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub local_path: PathBuf,
    pub name: String,
    pub mandatory: bool,
    pub kind: String,
}

pub struct ArtifactSink {
    http: Arc<HttpClient>,
    out_dir: PathBuf,
}

impl ArtifactSink {
    pub fn new(http: Arc<HttpClient>, env_root: &Path) -> Self {
        Self {
            http,
            out_dir: env_root.join(OUT_DIR),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Download the artifacts of a finished job.
    ///
    /// For a successful job a mandatory artifact that cannot be fetched is an
    /// `ArtifactError`. For an unsuccessful job only `on_failure` artifacts
    /// are fetched and every failure is skipped so the job's own reason stays
    /// the reported one.
    pub fn collect(&self, result: &JobResult, specs: &[ArtifactSpec]) -> Result<Vec<Artifact>> {
        let succeeded = matches!(result.state(), JobState::Succeeded);
        let mut artifacts = Vec::new();

        for spec in specs {
            if !succeeded && !spec.on_failure {
                continue;
            }
            spec.validate()?;
            let url = template::render_braces(&spec.url, &[("id", result.id())]);
            let target = self.out_dir.join(&spec.local_name);

            match self.http.download(&url, &target) {
                Ok(bytes) => {
                    tracing::info!(artifact = %spec.name, path = %target.display(), bytes, "artifact downloaded");
                    artifacts.push(Artifact {
                        local_path: target,
                        name: spec.name.clone(),
                        mandatory: spec.mandatory,
                        kind: spec.kind(),
                    });
                }
                Err(err) if spec.mandatory && succeeded => {
                    return Err(Error::artifact_download_failed(
                        &spec.name,
                        self.http.secrets().redact(&url),
                        err.message,
                    ));
                }
                Err(err) => {
                    tracing::warn!(artifact = %spec.name, error = %err.message, "optional artifact skipped");
                }
            }
        }
        Ok(artifacts)
    }

    /// Record downloaded paths in the PE: each artifact's own key plus the
    /// conventional list under [`PUBLISHED_KEY`].
    pub fn register(
        &self,
        pe: &PipelineEnv,
        specs: &[ArtifactSpec],
        artifacts: &[Artifact],
    ) -> Result<()> {
        for artifact in artifacts {
            let key = specs
                .iter()
                .find(|s| s.name == artifact.name)
                .and_then(|s| s.pe_key.as_deref());
            if let Some(key) = key {
                pe.write(key, artifact.local_path.display().to_string())?;
            }
        }
        if !artifacts.is_empty() {
            let listed = serde_json::to_value(artifacts)
                .map_err(|e| Error::internal_json(e.to_string(), Some("list artifacts".to_string())))?;
            pe.write(PUBLISHED_KEY, listed)?;
        }
        Ok(())
    }
}
