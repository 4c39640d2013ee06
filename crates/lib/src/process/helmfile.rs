//! The chart templating tool (helmfile).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CommandEnv, CommandSpec, ProcessError, run};
use crate::cancel::CancelToken;

/// One entry of `helmfile list --output json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelmRelease {
  pub chart: String,
  pub enabled: bool,
  pub installed: bool,
  /// `key:value` pairs separated by commas.
  pub labels: String,
  pub name: String,
  pub namespace: String,
  pub version: String,
}

/// Everything a helmfile invocation needs besides the subcommand.
#[derive(Debug, Clone)]
pub struct HelmfileInvocation {
  pub helmfile_binary: PathBuf,
  pub helm_binary: PathBuf,
  /// Working directory; `config_file` is relative to it.
  pub config_dir: PathBuf,
  pub config_file: String,
  pub environment: String,
  pub env: CommandEnv,
}

impl HelmfileInvocation {
  fn command(&self) -> CommandSpec {
    CommandSpec::new(&self.helmfile_binary)
      .current_dir(&self.config_dir)
      .env(self.env.clone())
  }

  /// Same invocation with a different helmfile config file.
  pub fn with_config_file(&self, config_file: impl Into<String>) -> Self {
    HelmfileInvocation {
      config_file: config_file.into(),
      ..self.clone()
    }
  }

  fn common_args(&self, subcommand: &str) -> Vec<String> {
    vec![
      subcommand.to_string(),
      "--allow-no-matching-release".to_string(),
      "--helm-binary".to_string(),
      self.helm_binary.to_string_lossy().into_owned(),
      "--file".to_string(),
      self.config_file.clone(),
      "--environment".to_string(),
      self.environment.clone(),
    ]
  }

  pub fn list_args(&self, selectors: &[String]) -> Vec<String> {
    let mut args = self.common_args("list");
    args.extend(["--output", "json", "--skip-charts"].map(String::from));
    push_selectors(&mut args, selectors);
    args
  }

  pub fn write_values_args(&self, selectors: &[String], output_file_template: &str) -> Vec<String> {
    let mut args = self.common_args("write-values");
    args.extend([
      "--output-file-template".to_string(),
      output_file_template.to_string(),
      "--skip-deps".to_string(),
    ]);
    push_selectors(&mut args, selectors);
    args
  }

  pub fn sync_args(&self, action: SyncAction, selectors: &[String], extra: &[String]) -> Vec<String> {
    let mut args = self.common_args(action.subcommand());
    push_selectors(&mut args, selectors);
    args.extend(extra.iter().cloned());
    args
  }
}

fn push_selectors(args: &mut Vec<String>, selectors: &[String]) {
  for selector in selectors {
    args.push("--selector".to_string());
    args.push(selector.clone());
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
  Apply,
  Destroy,
}

impl SyncAction {
  fn subcommand(self) -> &'static str {
    match self {
      SyncAction::Apply => "apply",
      SyncAction::Destroy => "destroy",
    }
  }
}

#[async_trait]
pub trait ChartRenderer: Send + Sync {
  async fn version(&self, invocation: &HelmfileInvocation, token: &CancelToken) -> Result<String, ProcessError>;

  /// Install helm plugins required by the helmfile config.
  async fn init(&self, invocation: &HelmfileInvocation, token: &CancelToken) -> Result<(), ProcessError>;

  async fn list_releases(
    &self,
    invocation: &HelmfileInvocation,
    selectors: &[String],
    token: &CancelToken,
  ) -> Result<Vec<HelmRelease>, ProcessError>;

  /// Render each matching release's values to a path built from
  /// `output_file_template`.
  async fn write_values(
    &self,
    invocation: &HelmfileInvocation,
    selectors: &[String],
    output_file_template: &str,
    token: &CancelToken,
  ) -> Result<(), ProcessError>;

  /// Apply or destroy matching releases directly against the cluster.
  async fn sync(
    &self,
    invocation: &HelmfileInvocation,
    action: SyncAction,
    selectors: &[String],
    extra_args: &[String],
    token: &CancelToken,
  ) -> Result<(), ProcessError>;
}

#[derive(Debug, Clone, Default)]
pub struct HelmfileCli;

#[async_trait]
impl ChartRenderer for HelmfileCli {
  async fn version(&self, invocation: &HelmfileInvocation, token: &CancelToken) -> Result<String, ProcessError> {
    let output = run(&invocation.command().arg("--version"), token).await?;
    Ok(output.stdout.trim().to_string())
  }

  async fn init(&self, invocation: &HelmfileInvocation, token: &CancelToken) -> Result<(), ProcessError> {
    let spec = invocation.command().args([
      "--helm-binary".to_string(),
      invocation.helm_binary.to_string_lossy().into_owned(),
      "init".to_string(),
      "--force".to_string(),
    ]);
    run(&spec, token).await.map(|_| ())
  }

  async fn list_releases(
    &self,
    invocation: &HelmfileInvocation,
    selectors: &[String],
    token: &CancelToken,
  ) -> Result<Vec<HelmRelease>, ProcessError> {
    let spec = invocation.command().args(invocation.list_args(selectors));
    let output = run(&spec, token).await?;
    parse_releases(&output.stdout).map_err(|err| ProcessError::Parse {
      command: spec.display(),
      message: err.to_string(),
    })
  }

  async fn write_values(
    &self,
    invocation: &HelmfileInvocation,
    selectors: &[String],
    output_file_template: &str,
    token: &CancelToken,
  ) -> Result<(), ProcessError> {
    let spec = invocation
      .command()
      .args(invocation.write_values_args(selectors, output_file_template));
    run(&spec, token).await.map(|_| ())
  }

  async fn sync(
    &self,
    invocation: &HelmfileInvocation,
    action: SyncAction,
    selectors: &[String],
    extra_args: &[String],
    token: &CancelToken,
  ) -> Result<(), ProcessError> {
    let spec = invocation
      .command()
      .args(invocation.sync_args(action, selectors, extra_args));
    run(&spec, token).await.map(|_| ())
  }
}

/// Empty output means no releases matched.
pub fn parse_releases(stdout: &str) -> Result<Vec<HelmRelease>, serde_json::Error> {
  if stdout.trim().is_empty() {
    return Ok(Vec::new());
  }
  serde_json::from_str(stdout)
}
