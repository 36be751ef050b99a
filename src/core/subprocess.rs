//! External programs, run without a shell.
//!
//! Arguments go through argv and secrets through stdin or the per-call
//! environment. The process environment of this binary is never modified.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefers stderr, falls back to stdout if stderr is empty.
    pub fn error_text(&self) -> &str {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        }
    }
}

pub trait Subprocess: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

#[derive(Debug, Default)]
pub struct SystemSubprocess;

impl Subprocess for SystemSubprocess {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let context = format!("run {}", spec.program);
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        tracing::debug!(program = %spec.program, args = spec.args.len(), "starting subprocess");
        let mut child = command
            .spawn()
            .map_err(|e| Error::internal_io(e.to_string(), Some(context.clone())))?;

        if let (Some(input), Some(mut pipe)) = (&spec.stdin, child.stdin.take()) {
            pipe.write_all(input)
                .map_err(|e| Error::internal_io(e.to_string(), Some(context.clone())))?;
        }

        let output: Output = child
            .wait_with_output()
            .map_err(|e| Error::internal_io(e.to_string(), Some(context.clone())))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run and require exit status 0, returning trimmed stdout.
pub fn run_checked(runner: &dyn Subprocess, spec: &CommandSpec) -> Result<String> {
    let output = runner.run(spec)?;
    if !output.success() {
        return Err(Error::internal_io(
            format!("{} exited with {}: {}", spec.program, output.status, output.error_text()),
            Some(format!("run {}", spec.program)),
        ));
    }
    Ok(output.stdout.trim().to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn passes_env_and_stdin_per_call() {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("printf '%s:' \"$REGION\"; cat")
            .env("REGION", "eu-central-1")
            .stdin("from-stdin");
        let out = SystemSubprocess.run(&spec).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "eu-central-1:from-stdin");
    }

    #[test]
    fn run_checked_reports_stderr() {
        let spec = CommandSpec::new("sh").arg("-c").arg("echo bad >&2; exit 3");
        let err = run_checked(&SystemSubprocess, &spec).unwrap_err();
        assert!(err.message.contains("exited with 3"));
        assert!(err.message.contains("bad"));
    }

    #[test]
    fn missing_program_is_io_error() {
        let err = SystemSubprocess
            .run(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
    }
}
