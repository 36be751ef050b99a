//! Step lifecycle: sources → sinks → resolve → run → flush → report.
//!
//! The business function returns a `Result`; only the runner decides the
//! exit code. Telemetry, the pipeline environment and the sinks are
//! finalized on every path, including a panic inside the step.

use crate::artifact::ArtifactSink;
use crate::cancel::CancellationToken;
use crate::config::{
    expand_path, parse_parameters, project_config_file, ConfigFile, ConfigSources, FileCredentialStore, HttpVaultStore,
    ResolvedConfig, Resolver, SecretStores,
};
use crate::error::{Error, ErrorCategory, Result};
use crate::hooks::{self, FatalReport, HookBus};
use crate::http::{ClientOptions, HttpClient, ReqwestFactory, TransportFactory};
use crate::job::JobDriver;
use crate::pipeline_env::{EnvValue, PipelineEnv};
use crate::secrets::SecretRegistry;
use crate::step::StepSpec;
use crate::subprocess::{Subprocess, SystemSubprocess};
use crate::telemetry::{self, Telemetry, TelemetryRecord};
use crate::token::TokenCache;
use crate::utils::io;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_ENV_ROOT: &str = ".pipeline";
const CUSTOM_CONFIG_FILE: &str = "config.yml";
const DEFAULTS_FILE: &str = "defaults.yaml";

/// Stage name variables of Jenkins, Azure DevOps and GitHub Actions.
const CI_STAGE_VARS: [&str; 3] = ["STAGE_NAME", "SYSTEM_STAGEDISPLAYNAME", "GITHUB_JOB"];

// ============================================================================
// Options and collaborators
// ============================================================================

/// Flags shared by every step.
#[derive(Debug, Clone, Default)]
pub struct GeneralOptions {
    pub correlation_id: Option<String>,
    pub verbose: bool,
    pub no_telemetry: bool,
    pub step_config: Option<String>,
    pub custom_config: Option<String>,
    pub default_config: Vec<String>,
    pub env_root: Option<String>,
    pub stage_name: Option<String>,
    pub parameters_json: Option<String>,
    pub log_format: Option<String>,
    pub credentials_root: Option<String>,
    /// Skip the `customDefaults` list of the custom config file.
    pub ignore_custom_defaults: bool,
}

impl GeneralOptions {
    pub fn env_root(&self) -> PathBuf {
        expand_path(self.env_root.as_deref().unwrap_or(DEFAULT_ENV_ROOT))
    }
}

/// Process-wide services a run uses. Tests swap the transport, subprocess
/// runner and environment.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn TransportFactory>,
    pub subprocess: Arc<dyn Subprocess>,
    pub secrets: Arc<SecretRegistry>,
    pub tokens: Arc<TokenCache>,
    pub hooks: Arc<HookBus>,
    pub cancel: CancellationToken,
    /// `PIPESTEP_*` variables (prefix stripped). `None` captures the process environment.
    pub env: Option<BTreeMap<String, String>>,
    /// CI system variables used to infer the stage. `None` reads the process environment.
    pub ci_env: Option<BTreeMap<String, String>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            transport: Arc::new(ReqwestFactory),
            subprocess: Arc::new(SystemSubprocess),
            secrets: Arc::new(SecretRegistry::new()),
            tokens: Arc::new(TokenCache::default()),
            hooks: Arc::new(HookBus::new()),
            cancel: CancellationToken::new(),
            env: None,
            ci_env: None,
        }
    }
}

// ============================================================================
// Steps
// ============================================================================

pub type StepFn = fn(&RunContext) -> Result<Value>;

/// A step: its static description plus the business function.
#[derive(Clone)]
pub struct Step {
    pub spec: StepSpec,
    pub run: StepFn,
}

impl Step {
    pub fn new(spec: StepSpec, run: StepFn) -> Self {
        Self { spec, run }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Everything a business function may touch.
pub struct RunContext {
    pub spec: StepSpec,
    pub config: ResolvedConfig,
    pub sources: ConfigSources,
    pub stores: SecretStores,
    pub telemetry: Telemetry,
    pub pe: PipelineEnv,
    pub env_root: PathBuf,
    pub secrets: Arc<SecretRegistry>,
    pub hooks: Arc<HookBus>,
    pub tokens: Arc<TokenCache>,
    pub transport: Arc<dyn TransportFactory>,
    pub subprocess: Arc<dyn Subprocess>,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Write a declared output to the pipeline environment.
    pub fn publish(&self, key: &str, value: impl Into<EnvValue>) -> Result<()> {
        let value = value.into();
        let Some(output) = self.spec.output_for(key) else {
            return Err(Error::internal_unexpected(format!(
                "step '{}' does not declare output '{}'",
                self.spec.name, key
            )));
        };
        if output.kind != value.kind() {
            return Err(Error::internal_unexpected(format!(
                "output '{}' of step '{}' must be {:?}, got {:?}",
                key,
                self.spec.name,
                output.kind,
                value.kind()
            )));
        }
        self.pe.write(key, value)
    }

    pub fn http_client(&self, mut options: ClientOptions) -> Result<Arc<HttpClient>> {
        if options.cancel.is_none() {
            options.cancel = Some(self.cancel.clone());
        }
        HttpClient::build(
            self.transport.as_ref(),
            options,
            self.secrets.clone(),
            self.tokens.clone(),
        )
        .map(Arc::new)
    }

    pub fn job_driver(&self, http: Arc<HttpClient>) -> JobDriver {
        JobDriver::new(http, self.cancel.clone())
    }

    pub fn artifact_sink(&self, http: Arc<HttpClient>) -> ArtifactSink {
        ArtifactSink::new(http, &self.env_root)
    }

    /// Resolve another step's configuration over the same sources.
    pub fn resolve(&self, spec: &StepSpec) -> Result<ResolvedConfig> {
        Resolver::new(&self.sources, Some(&self.pe), &self.stores, &self.secrets).resolve(spec)
    }
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub output: Option<Value>,
    pub error: Option<Error>,
    /// Single-line summary printed last on stderr when the step failed.
    pub diagnostic: Option<String>,
    pub telemetry: TelemetryRecord,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub fn diagnostic(step: &str, err: &Error, secrets: &SecretRegistry) -> String {
    let reason = err.message.lines().next().unwrap_or_default();
    secrets.redact(&format!(
        "{}: {} [{}] {}",
        step,
        err.code.kind(),
        err.category(),
        reason
    ))
}

// ============================================================================
// Runner
// ============================================================================

pub struct StepRunner {
    options: GeneralOptions,
    collaborators: Collaborators,
}

impl StepRunner {
    pub fn new(options: GeneralOptions, collaborators: Collaborators) -> Self {
        Self {
            options,
            collaborators,
        }
    }

    pub fn options(&self) -> &GeneralOptions {
        &self.options
    }

    fn stores(&self, env_root: &Path) -> SecretStores {
        let credentials_root = self
            .options
            .credentials_root
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| env_root.join("credentials"));
        SecretStores {
            credentials: Some(Arc::new(FileCredentialStore::new(credentials_root))),
            vault: Some(Arc::new(HttpVaultStore::new(
                self.collaborators.transport.clone(),
                self.collaborators.secrets.clone(),
            ))),
        }
    }

    /// `--stageName`, else `stageName` from the host parameters, else the
    /// stage the CI system reports. Returns the name and where it came from.
    pub fn stage_name(&self, parameters: Option<&Map<String, Value>>) -> Option<(String, &'static str)> {
        if let Some(stage) = self.options.stage_name.as_deref().filter(|s| !s.is_empty()) {
            return Some((stage.to_string(), "command line"));
        }
        let from_parameters = parameters
            .and_then(|p| p.get("stageName"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        if let Some(stage) = from_parameters {
            return Some((stage.to_string(), "parametersJSON"));
        }
        let lookup = |name: &str| match &self.collaborators.ci_env {
            Some(env) => env.get(name).cloned(),
            None => std::env::var(name).ok(),
        };
        CI_STAGE_VARS
            .into_iter()
            .find_map(|var| lookup(var).filter(|s| !s.is_empty()))
            .map(|stage| (stage, "CI environment"))
    }

    /// Gather every configuration layer for this invocation.
    pub fn load_sources(&self, env_root: &Path, flags: Map<String, Value>) -> Result<ConfigSources> {
        let mut sources = ConfigSources {
            flags,
            ..ConfigSources::default()
        };
        if let Some(raw) = &self.options.parameters_json {
            sources.parameters_json = Some(parse_parameters(raw, "parametersJSON")?);
        }
        if let Some((stage, origin)) = self.stage_name(sources.parameters_json.as_ref()) {
            tracing::debug!(stage = %stage, from = origin, "stage selected");
            sources.stage = Some(stage);
        }

        let custom = match &self.options.custom_config {
            Some(path) => ConfigFile::load(&project_config_file(&expand_path(path)), false)?,
            None => ConfigFile::load(&project_config_file(&env_root.join(CUSTOM_CONFIG_FILE)), true)?,
        };

        let mut default_paths: Vec<PathBuf> = Vec::new();
        if !self.options.ignore_custom_defaults {
            default_paths.extend(
                custom
                    .iter()
                    .flat_map(|c| c.custom_defaults.iter())
                    .map(|p| expand_path(p)),
            );
        }
        if self.options.default_config.is_empty() {
            default_paths.push(env_root.join(DEFAULTS_FILE));
        } else {
            default_paths.extend(self.options.default_config.iter().map(|p| expand_path(p)));
        }
        for path in default_paths {
            if let Some(file) = ConfigFile::load(&path, true)? {
                sources.defaults.push(file);
            }
        }
        sources.custom = custom;

        match &self.collaborators.env {
            Some(env) => sources.env = env.clone(),
            None => sources.capture_env(),
        }
        if let Some(token) = sources.env.get("vaultToken") {
            self.collaborators.secrets.register(token);
        }

        if let Some(path) = &self.options.step_config {
            let path = expand_path(path);
            let origin = path.display().to_string();
            let content = io::read_file(&path, "read step config")
                .map_err(|e| Error::config_invalid_file(origin.clone(), e.message))?;
            sources.step_config = Some(parse_parameters(&content, &origin)?);
        }
        Ok(sources)
    }

    fn install_sinks(&self, sources: &ConfigSources, step: &str, env_root: &Path) {
        let correlation_id = self.options.correlation_id.clone().unwrap_or_default();
        match hooks::sinks_from_config(
            &sources.hooks(),
            step,
            &correlation_id,
            env_root,
            self.collaborators.transport.as_ref(),
            self.collaborators.secrets.clone(),
        ) {
            Ok(sinks) => {
                for sink in sinks {
                    tracing::debug!(sink = sink.name(), "hook installed");
                    self.collaborators.hooks.register(sink);
                }
            }
            Err(err) => tracing::warn!(error = %err.message, "hooks not installed"),
        }
    }

    fn prepare(
        &self,
        step: &Step,
        flags: Map<String, Value>,
        env_root: &Path,
        pe: PipelineEnv,
        telemetry: Telemetry,
    ) -> std::result::Result<RunContext, (Error, PipelineEnv, Telemetry)> {
        let sources = match self.load_sources(env_root, flags) {
            Ok(sources) => sources,
            Err(err) => return Err((err, pe, telemetry)),
        };
        self.install_sinks(&sources, step.name(), env_root);

        let stores = self.stores(env_root);
        let resolved = Resolver::new(&sources, Some(&pe), &stores, &self.collaborators.secrets)
            .resolve(&step.spec);
        let config = match resolved {
            Ok(config) => config,
            Err(err) => {
                let err = if err.code.kind() == "ConfigError" {
                    err
                } else {
                    err.with_category(ErrorCategory::Configuration)
                };
                return Err((err, pe, telemetry));
            }
        };

        let c = &self.collaborators;
        Ok(RunContext {
            spec: step.spec.clone(),
            config,
            sources,
            stores,
            telemetry,
            pe,
            env_root: env_root.to_path_buf(),
            secrets: c.secrets.clone(),
            hooks: c.hooks.clone(),
            tokens: c.tokens.clone(),
            transport: c.transport.clone(),
            subprocess: c.subprocess.clone(),
            cancel: c.cancel.clone(),
        })
    }

    /// Run one step to completion and report how it ended.
    pub fn run(&self, step: &Step, flags: Map<String, Value>) -> StepOutcome {
        let env_root = self.options.env_root();
        let telemetry = Telemetry::start(step.name());
        let pe = PipelineEnv::open(&env_root);
        tracing::debug!(step = step.name(), env_root = %env_root.display(), "step starting");

        let (result, pe, telemetry) = match self.prepare(step, flags, &env_root, pe, telemetry) {
            Err((err, pe, telemetry)) => (Err(err), pe, telemetry),
            Ok(ctx) => {
                let result = catch_unwind(AssertUnwindSafe(|| (step.run)(&ctx))).unwrap_or_else(
                    |panic| {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        Err(Error::internal_unexpected(format!("step panicked: {}", reason)))
                    },
                );
                (result, ctx.pe, ctx.telemetry)
            }
        };

        self.finish(step, result, pe, telemetry)
    }

    fn finish(
        &self,
        step: &Step,
        result: Result<Value>,
        pe: PipelineEnv,
        telemetry: Telemetry,
    ) -> StepOutcome {
        let secrets = &self.collaborators.secrets;
        let bus = &self.collaborators.hooks;

        let flushed = pe.flush();
        let result = match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(flush_err)) => Err(flush_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(flush_err)) => {
                tracing::warn!(error = %flush_err.message, "pipeline environment not fully written");
                Err(err)
            }
        };

        if let Err(err) = &result {
            telemetry.set_error_category(err.category());
            tracing::error!(code = err.code.as_str(), "{}", err.message);
            bus.on_fatal(&FatalReport::from_error(step.name(), err, secrets));
        }

        let correlation_id = self.options.correlation_id.as_deref();
        let record = if self.options.no_telemetry {
            telemetry.finish(result.is_err(), None, correlation_id)
        } else {
            let commit = telemetry::commit_hash(Some(&pe), self.collaborators.subprocess.as_ref());
            let record = telemetry.finish(result.is_err(), commit, correlation_id);
            bus.on_finish(&record);
            record
        };
        bus.close();

        match result {
            Ok(output) => StepOutcome {
                exit_code: 0,
                output: Some(output),
                error: None,
                diagnostic: None,
                telemetry: record,
            },
            Err(err) => StepOutcome {
                exit_code: 1,
                output: None,
                diagnostic: Some(diagnostic(step.name(), &err, secrets)),
                error: Some(err),
                telemetry: record,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_env::ValueKind;
    use crate::step::ParameterSpec;
    use serde_json::json;
    use std::fs;

    fn runner(root: &Path, env: &[(&str, &str)]) -> StepRunner {
        let options = GeneralOptions {
            env_root: Some(root.display().to_string()),
            no_telemetry: true,
            ..GeneralOptions::default()
        };
        let collaborators = Collaborators {
            env: Some(env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ci_env: Some(BTreeMap::new()),
            ..Collaborators::default()
        };
        StepRunner::new(options, collaborators)
    }

    fn echo_step() -> Step {
        Step::new(
            StepSpec::new("echo", "echo a value")
                .param(ParameterSpec::string("message").mandatory())
                .output("echo.message", ValueKind::Text),
            |ctx| {
                let message = ctx.config.require_str("message")?;
                ctx.publish("echo.message", message)?;
                Ok(json!({ "message": message }))
            },
        )
    }

    #[test]
    fn successful_step_flushes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut flags = Map::new();
        flags.insert("message".to_string(), json!("hi"));

        let outcome = runner(dir.path(), &[]).run(&echo_step(), flags);

        assert!(outcome.success());
        assert_eq!(outcome.output.unwrap()["message"], "hi");
        let stored = fs::read_to_string(
            dir.path().join("commonPipelineEnvironment").join("echo").join("message"),
        )
        .unwrap();
        assert_eq!(stored, "hi");
        assert_eq!(outcome.telemetry.error_code, 0);
    }

    #[test]
    fn missing_parameter_is_configuration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = runner(dir.path(), &[]).run(&echo_step(), Map::new());

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.telemetry.error_category, ErrorCategory::Configuration);
        let diagnostic = outcome.diagnostic.unwrap();
        assert!(diagnostic.starts_with("echo: ConfigError [configuration]"));
    }

    #[test]
    fn custom_config_in_env_root_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.yml"),
            "steps:\n  echo:\n    message: from-file\n",
        )
        .unwrap();
        let outcome = runner(dir.path(), &[]).run(&echo_step(), Map::new());
        assert_eq!(outcome.output.unwrap()["message"], "from-file");
    }

    #[test]
    fn panicking_step_still_reports() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::new(StepSpec::new("boom", "panics"), |_| panic!("kaboom"));
        let outcome = runner(dir.path(), &[]).run(&step, Map::new());
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.diagnostic.unwrap().contains("kaboom"));
    }

    #[test]
    fn undeclared_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::new(StepSpec::new("rogue", "writes anywhere"), |ctx| {
            ctx.publish("git.commitId", "abc")?;
            Ok(Value::Null)
        });
        let outcome = runner(dir.path(), &[]).run(&step, Map::new());
        assert_eq!(outcome.exit_code, 1);
        assert!(!dir.path().join("commonPipelineEnvironment/git/commitId").exists());
    }

    #[test]
    fn secrets_are_redacted_from_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::new(
            StepSpec::new("leaky", "fails with its password")
                .param(ParameterSpec::string("password").secret()),
            |ctx| {
                let password = ctx.config.require_str("password")?;
                Err(Error::build_failed(format!("login with {} refused", password)))
            },
        );
        let outcome = runner(dir.path(), &[("password", "hunter2")]).run(&step, Map::new());
        let diagnostic = outcome.diagnostic.unwrap();
        assert_eq!(diagnostic, "leaky: BuildError [build] login with *** refused");
    }

    fn staged_runner(stage: Option<&str>, parameters: Option<&str>, ci: &[(&str, &str)]) -> StepRunner {
        let options = GeneralOptions {
            stage_name: stage.map(str::to_string),
            parameters_json: parameters.map(str::to_string),
            ..GeneralOptions::default()
        };
        let collaborators = Collaborators {
            env: Some(BTreeMap::new()),
            ci_env: Some(ci.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Collaborators::default()
        };
        StepRunner::new(options, collaborators)
    }

    #[test]
    fn stage_name_falls_back_to_parameters_then_ci() {
        let dir = tempfile::tempdir().unwrap();
        let stage = |r: StepRunner| r.load_sources(dir.path(), Map::new()).unwrap().stage;

        let ci = [("GITHUB_JOB", "acceptance")];
        assert_eq!(stage(staged_runner(None, None, &ci)).as_deref(), Some("acceptance"));
        assert_eq!(
            stage(staged_runner(None, Some(r#"{"stageName":"Release"}"#), &ci)).as_deref(),
            Some("Release")
        );
        assert_eq!(
            stage(staged_runner(Some("Build"), Some(r#"{"stageName":"Release"}"#), &ci)).as_deref(),
            Some("Build")
        );
        assert_eq!(stage(staged_runner(None, None, &[])), None);
    }

    #[test]
    fn custom_defaults_can_be_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shared.yml"), "steps:\n  echo:\n    message: shared\n").unwrap();
        let shared = dir.path().join("shared.yml").display().to_string();
        fs::write(
            dir.path().join("config.yaml"),
            format!("customDefaults:\n  - {}\n", shared),
        )
        .unwrap();

        // config.yaml is found through the config.yml fallback
        let outcome = runner(dir.path(), &[]).run(&echo_step(), Map::new());
        assert_eq!(outcome.output.unwrap()["message"], "shared");

        let mut ignoring = runner(dir.path(), &[]);
        ignoring.options.ignore_custom_defaults = true;
        let outcome = ignoring.run(&echo_step(), Map::new());
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.telemetry.error_category, ErrorCategory::Configuration);
    }
}
