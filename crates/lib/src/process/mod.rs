//! External processes.
//!
//! Every tool the deployer shells out to is reached through a typed port
//! ([`git::GitRunner`], [`helmfile::ChartRenderer`], [`bazel::BuildRunner`],
//! [`kubectl::ClusterClient`], [`ScriptRunner`]). The CLI-backed
//! implementations all funnel through [`run`], which takes an explicit
//! [`CommandEnv`] instead of reading or mutating the process environment.

pub mod bazel;
pub mod git;
pub mod helmfile;
pub mod kubectl;

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cancel::{CancelReason, CancelToken};
use crate::logging::truncate_for_log;

#[derive(Debug, Error)]
pub enum ProcessError {
  #[error("failed to start {command}: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{command} exited with {}: {stderr}", exit_status(.code))]
  Failed {
    command: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("{command} interrupted: {reason}")]
  Cancelled { command: String, reason: CancelReason },

  #[error("unable to parse output of {command}: {message}")]
  Parse { command: String, message: String },
}

fn exit_status(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("code {}", code),
    None => "signal".to_string(),
  }
}

/// Environment for a child process. Values are immutable: every `with*`
/// call returns a new environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandEnv {
  inherit: bool,
  vars: BTreeMap<String, String>,
  removed: BTreeSet<String>,
}

impl CommandEnv {
  /// Start from the parent's environment.
  pub fn inherit() -> Self {
    CommandEnv {
      inherit: true,
      ..Default::default()
    }
  }

  /// Start from an empty environment.
  pub fn empty() -> Self {
    CommandEnv::default()
  }

  pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
    let key = key.into();
    let mut env = self.clone();
    env.removed.remove(&key);
    env.vars.insert(key, value.into());
    env
  }

  pub fn with_path(&self, key: impl Into<String>, value: &Path) -> Self {
    self.with(key, value.to_string_lossy())
  }

  pub fn without(&self, key: impl Into<String>) -> Self {
    let key = key.into();
    let mut env = self.clone();
    env.vars.remove(&key);
    env.removed.insert(key);
    env
  }

  /// Explicitly set variables (not including inherited ones).
  pub fn vars(&self) -> &BTreeMap<String, String> {
    &self.vars
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.vars.get(key).map(String::as_str)
  }

  fn apply(&self, command: &mut Command) {
    if !self.inherit {
      command.env_clear();
    }
    for key in &self.removed {
      command.env_remove(key);
    }
    command.envs(&self.vars);
  }
}

/// A fully described process invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
  pub program: PathBuf,
  pub args: Vec<OsString>,
  pub current_dir: Option<PathBuf>,
  pub env: CommandEnv,
}

impl CommandSpec {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    CommandSpec {
      program: program.into(),
      args: Vec::new(),
      current_dir: None,
      env: CommandEnv::inherit(),
    }
  }

  pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.current_dir = Some(dir.into());
    self
  }

  pub fn env(mut self, env: CommandEnv) -> Self {
    self.env = env;
    self
  }

  /// `program arg1 arg2`, for logs and error messages.
  pub fn display(&self) -> String {
    let mut parts = vec![self.program.to_string_lossy().into_owned()];
    parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
  }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
  pub stdout: String,
  pub stderr: String,
}

/// Run a process to completion. The child is killed if `token` fires first.
pub async fn run(spec: &CommandSpec, token: &CancelToken) -> Result<CommandOutput, ProcessError> {
  let command_display = spec.display();
  info!(command = %command_display, dir = ?spec.current_dir, env = ?spec.env.vars(), "running");

  let mut command = Command::new(&spec.program);
  command
    .args(&spec.args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
  if let Some(dir) = &spec.current_dir {
    command.current_dir(dir);
  }
  spec.env.apply(&mut command);

  let start = Instant::now();
  let child = command.spawn().map_err(|source| ProcessError::Spawn {
    command: command_display.clone(),
    source,
  })?;

  let output = tokio::select! {
    output = child.wait_with_output() => output.map_err(|source| ProcessError::Spawn {
      command: command_display.clone(),
      source,
    })?,
    reason = token.cancelled() => {
      return Err(ProcessError::Cancelled { command: command_display, reason });
    }
  };

  let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
  let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
  debug!(
    command = %command_display,
    duration = ?start.elapsed(),
    stdout_len = stdout.len(),
    stdout = %truncate_for_log(&stdout),
    "completed"
  );

  if !output.status.success() {
    if !stderr.is_empty() {
      debug!(stderr = %truncate_for_log(&stderr), "command stderr");
    }
    return Err(ProcessError::Failed {
      command: command_display,
      code: output.status.code(),
      stderr: truncate_for_log(stderr.trim()).to_string(),
    });
  }

  Ok(CommandOutput { stdout, stderr })
}

/// Runs the helper shell scripts that ship in the workspace (TLS secrets,
/// Vault configuration, log collection).
#[async_trait]
pub trait ScriptRunner: Send + Sync {
  async fn run_script(&self, script: &Path, args: &[String], env: &CommandEnv, token: &CancelToken)
  -> Result<(), ProcessError>;
}

/// Executes scripts directly as child processes.
#[derive(Debug, Clone, Default)]
pub struct ShellScriptRunner;

#[async_trait]
impl ScriptRunner for ShellScriptRunner {
  async fn run_script(
    &self,
    script: &Path,
    args: &[String],
    env: &CommandEnv,
    token: &CancelToken,
  ) -> Result<(), ProcessError> {
    let spec = CommandSpec::new(script).args(args).env(env.clone());
    run(&spec, token).await.map(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::shell_cmd;
  use std::time::Duration;

  fn sh(script: &str) -> CommandSpec {
    let (shell, args) = shell_cmd(script);
    CommandSpec::new(shell).args(args)
  }

  #[tokio::test]
  async fn captures_stdout() {
    let output = run(&sh("echo hello"), &CancelToken::new()).await.unwrap();
    assert_eq!(output.stdout.trim(), "hello");
  }

  #[tokio::test]
  async fn env_is_explicit() {
    let env = CommandEnv::inherit().with("GIT_COMMIT", "abc");
    let output = run(&sh("echo $GIT_COMMIT").env(env), &CancelToken::new())
      .await
      .unwrap();
    assert_eq!(output.stdout.trim(), "abc");
  }

  #[tokio::test]
  async fn empty_env_clears_parent_variables() {
    let env = CommandEnv::empty().with("ONLY", "1");
    let output = run(&sh("echo \"${HOME:-unset}:$ONLY\"").env(env), &CancelToken::new())
      .await
      .unwrap();
    assert_eq!(output.stdout.trim(), "unset:1");
  }

  #[test]
  fn env_builder_does_not_mutate_original() {
    let base = CommandEnv::inherit().with("A", "1");
    let derived = base.with("B", "2").without("A");
    assert_eq!(base.get("A"), Some("1"));
    assert_eq!(base.get("B"), None);
    assert_eq!(derived.get("A"), None);
    assert_eq!(derived.get("B"), Some("2"));
  }

  #[tokio::test]
  async fn failure_reports_exit_code_and_stderr() {
    let err = run(&sh("echo broken >&2; exit 3"), &CancelToken::new())
      .await
      .unwrap_err();
    match err {
      ProcessError::Failed { code, stderr, .. } => {
        assert_eq!(code, Some(3));
        assert_eq!(stderr, "broken");
      }
      other => panic!("unexpected error: {}", other),
    }
  }

  #[tokio::test]
  async fn missing_program_is_spawn_error() {
    let err = run(&CommandSpec::new("/nonexistent/universe-deployer-tool"), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, ProcessError::Spawn { .. }));
  }

  #[tokio::test]
  async fn cancellation_kills_the_child() {
    let token = CancelToken::new().child_with_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let err = run(&sh("sleep 30"), &token).await.unwrap_err();
    assert!(matches!(
      err,
      ProcessError::Cancelled {
        reason: CancelReason::DeadlineExceeded,
        ..
      }
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[tokio::test]
  async fn script_runner_passes_args_and_env() {
    let temp = tempfile::TempDir::new().unwrap();
    let out = temp.path().join("out.txt");
    let env = CommandEnv::inherit().with_path("OUT", &out);
    let args = vec!["-c".to_string(), "echo hi > \"$OUT\"".to_string()];
    ShellScriptRunner
      .run_script(Path::new("/bin/sh"), &args, &env, &CancelToken::new())
      .await
      .unwrap();
    assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "hi");
  }
}
