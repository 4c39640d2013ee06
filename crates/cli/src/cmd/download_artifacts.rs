//! Implementation of the `universe-deployer download-artifacts` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;

use universe_deployer_lib::artifacts::{ArtifactSource, HttpArtifactRepository};
use universe_deployer_lib::manifests::ArtifactBinaryRenderer;
use universe_deployer_lib::multi_version::{GeneratorSettings, MultiVersionManifestsGenerator};
use universe_deployer_lib::paths;
use universe_deployer_lib::process::CommandEnv;
use universe_deployer_lib::process::git::GitCli;
use universe_deployer_lib::universe_config::{ComponentCommit, UniverseConfigFiles};

use crate::output::{OutputFormat, print_json, print_success, print_warning};

#[derive(Debug, Args)]
pub struct DownloadArtifactsArgs {
  #[arg(long = "universe-config", required = true)]
  pub universe_configs: Vec<PathBuf>,

  #[arg(long)]
  pub artifact_repository_url: String,

  /// Directory holding the repository credentials
  #[arg(long)]
  pub secrets_dir: Option<PathBuf>,

  /// Commit whose artifacts come from the working tree and are not downloaded
  #[arg(long, default_value = "")]
  pub commit: String,

  #[arg(long)]
  pub cache_dir: Option<PathBuf>,

  #[arg(long, default_value_t = 0)]
  pub parallelism: usize,

  /// Exit with an error when any artifact is missing
  #[arg(long)]
  pub fail_on_missing: bool,

  #[arg(long, value_enum, default_value_t)]
  pub format: OutputFormat,
}

/// Execute the download-artifacts command.
///
/// Fills the cache with every non-HEAD deployment artifacts tar and lists the
/// `(component, commit)` pairs the repository does not have.
pub fn cmd_download_artifacts(args: &DownloadArtifactsArgs) -> Result<()> {
  let universe_config = UniverseConfigFiles::read(&args.universe_configs)?.merged()?;

  let mut repository = HttpArtifactRepository::new(args.artifact_repository_url.as_str());
  if let Some(secrets_dir) = &args.secrets_dir {
    repository = repository.with_credentials_from(secrets_dir)?;
  }
  let env = CommandEnv::inherit();
  let settings = GeneratorSettings {
    head_commit: args.commit.clone(),
    parallelism: args.parallelism,
    ..GeneratorSettings::default()
  };
  let cache_dir = args.cache_dir.clone().unwrap_or_else(paths::cache_dir);
  let generator = MultiVersionManifestsGenerator::new(
    settings,
    &cache_dir,
    Some(Arc::new(repository) as Arc<dyn ArtifactSource>),
    Arc::new(ArtifactBinaryRenderer::new(env.clone())),
    Arc::new(GitCli::new(env)),
  )?;

  let (rt, token) = super::runtime()?;
  let not_found = rt
    .block_on(generator.try_download_deployment_artifacts(&universe_config, &token))
    .context("Download failed")?;
  let missing: Vec<ComponentCommit> = not_found.iter().map(|e| e.component_commit()).collect();

  if args.format.is_json() {
    print_json(&missing)?;
  } else if missing.is_empty() {
    print_success("All deployment artifacts are available");
  } else {
    for component_commit in &missing {
      print_warning(&format!(
        "missing: component {}, commit {}",
        component_commit.component, component_commit.commit
      ));
    }
  }

  if args.fail_on_missing && !missing.is_empty() {
    bail!("{} deployment artifacts not found", missing.len());
  }
  Ok(())
}
