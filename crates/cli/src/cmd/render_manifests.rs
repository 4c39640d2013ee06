//! Implementation of the `universe-deployer render-manifests` command.
//!
//! This is the entry point the multi-version generator invokes from inside a
//! commit's extracted deployment artifacts, so its flags are a stable
//! interface between releases.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use universe_deployer_lib::manifests::{HelmfileManifestsRenderer, RenderRequest};
use universe_deployer_lib::process::CommandEnv;
use universe_deployer_lib::process::helmfile::HelmfileCli;

use crate::output::{OutputFormat, print_json, print_stat, print_success};

#[derive(Debug, Args)]
pub struct RenderManifestsArgs {
  #[arg(long)]
  pub commit: String,

  /// Extracted deployment artifacts of `--commit`
  #[arg(long)]
  pub commit_dir: PathBuf,

  #[arg(long)]
  pub config_commit: String,

  /// Render a single component; all components when omitted
  #[arg(long = "component")]
  pub components: Vec<String>,

  #[arg(long, default_value = "")]
  pub default_chart_registry: String,

  /// Manifests tar to write
  #[arg(long)]
  pub output: PathBuf,

  #[arg(long)]
  pub secrets_dir: Option<PathBuf>,

  #[arg(long)]
  pub universe_config: PathBuf,

  /// Render the Universe Config as is instead of trimming it to `--commit`
  #[arg(long)]
  pub snapshot: bool,

  #[arg(long, env = "CLUSTER_PREFIX", default_value = "")]
  pub cluster_prefix: String,

  #[arg(long, env = "TEST_ENVIRONMENT_ID", default_value = "")]
  pub test_environment_id: String,

  #[arg(long, value_enum, default_value_t)]
  pub format: OutputFormat,
}

/// Execute the render-manifests command.
pub fn cmd_render_manifests(args: &RenderManifestsArgs) -> Result<()> {
  let request = RenderRequest {
    commit: args.commit.clone(),
    config_commit: args.config_commit.clone(),
    components: args.components.clone(),
    artifacts_dir: args.commit_dir.clone(),
    universe_config_file: args.universe_config.clone(),
    default_chart_registry: args.default_chart_registry.clone(),
    secrets_dir: args.secrets_dir.clone(),
    output: args.output.clone(),
    snapshot: args.snapshot,
    cluster_prefix: args.cluster_prefix.clone(),
    test_environment_id: args.test_environment_id.clone(),
  };
  let env = CommandEnv::inherit()
    .with("CLUSTER_PREFIX", args.cluster_prefix.as_str())
    .with("TEST_ENVIRONMENT_ID", args.test_environment_id.as_str());
  let renderer = HelmfileManifestsRenderer::new(Arc::new(HelmfileCli), env);

  let (rt, token) = super::runtime()?;
  let manifests = rt
    .block_on(renderer.generate(&request, &token))
    .with_context(|| format!("Failed to render manifests of commit {}", args.commit))?;

  if args.format.is_json() {
    return print_json(&manifests);
  }
  print_success(&format!("Wrote {}", args.output.display()));
  print_stat("Commit", &args.commit);
  print_stat("Config commit", &args.config_commit);
  print_stat("Manifests", &manifests.len().to_string());
  Ok(())
}
