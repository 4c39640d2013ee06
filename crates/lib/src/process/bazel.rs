//! Builds of deployment artifacts, releases and container/chart pushes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::{CommandEnv, CommandOutput, CommandSpec, ProcessError, run};
use crate::cancel::CancelToken;
use crate::consts::{CREATE_RELEASES_TARGET, DEPLOYMENT_ARTIFACTS_TARGET, PUSH_CONTAINERS_AND_CHARTS_TARGET};
use crate::pool::{PoolError, PoolLease, ResourcePool};
use crate::universe_config::ComponentCommit;
use crate::util::retry::{Backoff, retry};

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Pool(#[from] PoolError),

  #[error(transparent)]
  Process(#[from] ProcessError),

  #[error("build of {target} produced no output file")]
  NoOutput { target: String },

  #[error("failed to copy {from} to {to}: {source}")]
  Copy {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// The commit being built and where its source is checked out.
#[derive(Debug, Clone)]
pub struct BuildRequest {
  pub commit: String,
  pub semantic_version: String,
  pub workspace_dir: PathBuf,
}

#[async_trait]
pub trait BuildRunner: Send + Sync {
  /// Build the deployment artifacts tar of the checked out commit.
  async fn build_deployment_artifacts(
    &self,
    request: &BuildRequest,
    output: &Path,
    token: &CancelToken,
  ) -> Result<(), BuildError>;

  /// Build and publish release artifacts for exactly the given
  /// `(component, commit)` pairs.
  async fn create_releases(
    &self,
    request: &BuildRequest,
    missing: &[ComponentCommit],
    token: &CancelToken,
  ) -> Result<(), BuildError>;

  /// Push the checked out commit's containers and Helm charts.
  async fn push_containers_and_charts(
    &self,
    request: &BuildRequest,
    secrets_dir: &Path,
    token: &CancelToken,
  ) -> Result<(), BuildError>;
}

/// [`BuildRunner`] that invokes bazel. When a pool is configured, every
/// invocation leases a pool directory and uses it as bazel's output root,
/// so concurrent builds never share server state.
///
/// Builds fetch dependencies and pushes talk to registries, so a failing
/// bazel exit is retried with `retry`. The lease is held across attempts.
#[derive(Debug, Clone)]
pub struct BazelCli {
  pub binary: PathBuf,
  pub startup_opts: Vec<String>,
  pub build_opts: Vec<String>,
  pub env: CommandEnv,
  pub pool: Option<Arc<ResourcePool>>,
  pub retry: Backoff,
}

impl BazelCli {
  pub fn default_retry() -> Backoff {
    Backoff::exponential(Duration::from_secs(10), 2, 3)
  }

  async fn run_with_retry(&self, spec: &CommandSpec, token: &CancelToken) -> Result<CommandOutput, BuildError> {
    retry(
      &self.retry,
      token,
      |err: &ProcessError| matches!(err, ProcessError::Failed { .. }),
      || run(spec, token),
    )
    .await
    .map_err(|err| BuildError::Process(err.into_inner()))
  }

  async fn lease(&self, token: &CancelToken) -> Result<Option<PoolLease>, BuildError> {
    match &self.pool {
      Some(pool) => Ok(Some(pool.get_directory(token).await?)),
      None => Ok(None),
    }
  }

  /// `bazel <startup opts> [--output_user_root] <command> <build opts> <defines>`.
  pub fn command_args(&self, request: &BuildRequest, lease: Option<&Path>, command: &str) -> Vec<String> {
    let mut args = self.startup_opts.clone();
    if let Some(dir) = lease {
      args.push(format!("--output_user_root={}", dir.display()));
    }
    args.push(command.to_string());
    args.extend(self.build_opts.iter().cloned());
    args.push(format!("--define=COMMIT={}", request.commit));
    if !request.semantic_version.is_empty() {
      args.push(format!("--define=SEMANTIC_VERSION={}", request.semantic_version));
    }
    args
  }

  fn spec(&self, request: &BuildRequest, args: Vec<String>) -> CommandSpec {
    CommandSpec::new(&self.binary)
      .current_dir(&request.workspace_dir)
      .env(self.env.clone())
      .args(args)
  }
}

#[async_trait]
impl BuildRunner for BazelCli {
  async fn build_deployment_artifacts(
    &self,
    request: &BuildRequest,
    output: &Path,
    token: &CancelToken,
  ) -> Result<(), BuildError> {
    let lease = self.lease(token).await?;
    let lease_dir = lease.as_ref().map(PoolLease::dir);

    let mut build = self.command_args(request, lease_dir, "build");
    build.push(DEPLOYMENT_ARTIFACTS_TARGET.to_string());
    self.run_with_retry(&self.spec(request, build), token).await?;

    let mut cquery = self.command_args(request, lease_dir, "cquery");
    cquery.extend(["--output=files".to_string(), DEPLOYMENT_ARTIFACTS_TARGET.to_string()]);
    let files = run(&self.spec(request, cquery), token).await?;
    let built = first_output_file(&files.stdout).ok_or_else(|| BuildError::NoOutput {
      target: DEPLOYMENT_ARTIFACTS_TARGET.to_string(),
    })?;
    let built = request.workspace_dir.join(built);

    if let Some(parent) = output.parent() {
      std::fs::create_dir_all(parent).map_err(|source| BuildError::Copy {
        from: built.clone(),
        to: output.to_path_buf(),
        source,
      })?;
    }
    std::fs::copy(&built, output).map_err(|source| BuildError::Copy {
      from: built.clone(),
      to: output.to_path_buf(),
      source,
    })?;
    info!(commit = %request.commit, output = %output.display(), "deployment artifacts built");
    Ok(())
  }

  async fn create_releases(
    &self,
    request: &BuildRequest,
    missing: &[ComponentCommit],
    token: &CancelToken,
  ) -> Result<(), BuildError> {
    if missing.is_empty() {
      return Ok(());
    }
    let lease = self.lease(token).await?;
    let mut args = self.command_args(request, lease.as_ref().map(PoolLease::dir), "run");
    args.push(CREATE_RELEASES_TARGET.to_string());
    args.push("--".to_string());
    for item in missing {
      args.push("--component-commit".to_string());
      args.push(format!("{}:{}", item.component, item.commit));
    }
    self.run_with_retry(&self.spec(request, args), token).await?;
    Ok(())
  }

  async fn push_containers_and_charts(
    &self,
    request: &BuildRequest,
    secrets_dir: &Path,
    token: &CancelToken,
  ) -> Result<(), BuildError> {
    let lease = self.lease(token).await?;
    let mut args = self.command_args(request, lease.as_ref().map(PoolLease::dir), "run");
    args.push(PUSH_CONTAINERS_AND_CHARTS_TARGET.to_string());
    let spec = self
      .spec(request, args)
      .env(self.env.with_path("SECRETS_DIR", secrets_dir));
    self.run_with_retry(&spec, token).await?;
    Ok(())
  }
}

fn first_output_file(stdout: &str) -> Option<&str> {
  stdout.lines().map(str::trim).find(|line| !line.is_empty())
}
