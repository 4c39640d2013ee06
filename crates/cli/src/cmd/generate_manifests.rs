//! Implementation of the `universe-deployer generate-manifests` command.
//!
//! Renders every `(component, commit, configCommit)` of one or more Universe
//! Configs and writes the combined manifests tar, without touching any cluster.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;

use universe_deployer_lib::artifacts::{ArtifactSource, HttpArtifactRepository};
use universe_deployer_lib::consts::HEAD;
use universe_deployer_lib::manifests::ArtifactBinaryRenderer;
use universe_deployer_lib::multi_version::{GeneratorSettings, MultiVersionManifestsGenerator};
use universe_deployer_lib::paths;
use universe_deployer_lib::process::CommandEnv;
use universe_deployer_lib::process::git::GitCli;
use universe_deployer_lib::universe_config::{UniverseConfigFiles, WalkComponents};

use crate::output::{format_duration, print_stat, print_success};

#[derive(Debug, Args)]
pub struct GenerateManifestsArgs {
  #[arg(long = "universe-config", required = true)]
  pub universe_configs: Vec<PathBuf>,

  /// Manifests tar to write
  #[arg(long)]
  pub output: PathBuf,

  /// Working tree commit; replaces HEAD in the Universe Config
  #[arg(long, default_value = "")]
  pub commit: String,

  /// Deployment artifacts of the working tree commit
  #[arg(long)]
  pub deployment_artifacts_tar: Option<PathBuf>,

  #[arg(long)]
  pub artifact_repository_url: Option<String>,

  /// Git repository used to archive config commits
  #[arg(long, default_value = ".")]
  pub repo_dir: PathBuf,

  /// Remote to fetch config commits from
  #[arg(long, default_value = "")]
  pub config_commit_git_remote: String,

  #[arg(long)]
  pub cache_dir: Option<PathBuf>,

  #[arg(long, default_value = "")]
  pub default_chart_registry: String,

  #[arg(long)]
  pub secrets_dir: Option<PathBuf>,

  #[arg(long, default_value_t = 0)]
  pub parallelism: usize,

  #[arg(long, env = "CLUSTER_PREFIX", default_value = "")]
  pub cluster_prefix: String,

  #[arg(long, env = "TEST_ENVIRONMENT_ID", default_value = "")]
  pub test_environment_id: String,
}

/// Execute the generate-manifests command.
pub fn cmd_generate_manifests(args: &GenerateManifestsArgs) -> Result<()> {
  let start = Instant::now();
  let mut universe_config = UniverseConfigFiles::read(&args.universe_configs)?.merged()?;
  if !args.commit.is_empty() {
    universe_config.replace_commits(&BTreeMap::from([(HEAD.to_string(), args.commit.clone())]));
  }
  universe_config.validate_commits()?;

  let env = CommandEnv::inherit();
  let artifacts = match &args.artifact_repository_url {
    Some(url) => {
      let mut repository = HttpArtifactRepository::new(url.as_str());
      if let Some(secrets_dir) = &args.secrets_dir {
        repository = repository.with_credentials_from(secrets_dir)?;
      }
      Some(Arc::new(repository) as Arc<dyn ArtifactSource>)
    }
    None => None,
  };
  let settings = GeneratorSettings {
    head_commit: args.commit.clone(),
    head_deployment_artifacts_tar: args.deployment_artifacts_tar.clone(),
    repo_dir: args.repo_dir.clone(),
    config_commit_git_remote: args.config_commit_git_remote.clone(),
    default_chart_registry: args.default_chart_registry.clone(),
    secrets_dir: args.secrets_dir.clone(),
    cluster_prefix: args.cluster_prefix.clone(),
    test_environment_id: args.test_environment_id.clone(),
    parallelism: args.parallelism,
  };
  let cache_dir = args.cache_dir.clone().unwrap_or_else(paths::cache_dir);
  let generator = MultiVersionManifestsGenerator::new(
    settings,
    &cache_dir,
    artifacts,
    Arc::new(ArtifactBinaryRenderer::new(env.clone())),
    Arc::new(GitCli::new(env)),
  )?;

  let (rt, token) = super::runtime()?;
  let manifests = rt
    .block_on(generator.generate_manifests(&universe_config, &args.output, &token))
    .context("Manifest generation failed")?;

  print_success(&format!("Wrote {}", args.output.display()));
  print_stat("Manifests", &manifests.len().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
