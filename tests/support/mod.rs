#![allow(dead_code)]

use pipestep::commands;
use pipestep::http::scripted::{ScriptedFactory, ScriptedTransport};
use pipestep::runner::{Collaborators, GeneralOptions};
use pipestep::secrets::SecretRegistry;
use pipestep::subprocess::{CommandOutput, CommandSpec, Subprocess};
use pipestep::{Result, StepOutcome, StepRunner};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// `git` stand-in so telemetry never shells out during tests.
pub struct FixedCommit;

impl Subprocess for FixedCommit {
    fn run(&self, _spec: &CommandSpec) -> Result<CommandOutput> {
        Ok(CommandOutput {
            status: 0,
            stdout: "0123abcd\n".to_string(),
            stderr: String::new(),
        })
    }
}

/// One pipeline workspace with a scripted backend.
pub struct Harness {
    pub dir: TempDir,
    pub transport: Arc<ScriptedTransport>,
    pub secrets: Arc<SecretRegistry>,
    pub options: GeneralOptions,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let options = GeneralOptions {
            env_root: Some(dir.path().join(".pipeline").display().to_string()),
            no_telemetry: true,
            ..GeneralOptions::default()
        };
        Self {
            dir,
            transport: Arc::new(ScriptedTransport::new()),
            secrets: Arc::new(SecretRegistry::new()),
            options,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join(".pipeline")
    }

    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn runner(&self) -> StepRunner {
        let collaborators = Collaborators {
            transport: Arc::new(ScriptedFactory(self.transport.clone())),
            subprocess: Arc::new(FixedCommit),
            secrets: self.secrets.clone(),
            env: Some(Default::default()),
            ci_env: Some(Default::default()),
            ..Collaborators::default()
        };
        StepRunner::new(self.options.clone(), collaborators)
    }

    pub fn run(&self, step: &str, flags: Value) -> StepOutcome {
        let step = commands::find(step).unwrap();
        let flags: Map<String, Value> = flags.as_object().cloned().unwrap_or_default();
        self.runner().run(&step, flags)
    }
}
