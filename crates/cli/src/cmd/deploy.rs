//! Implementation of the `universe-deployer deploy` and `undeploy` commands.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tempfile::TempDir;
use tracing::{info, warn};

use universe_deployer_lib::artifacts::{ArtifactSource, HttpArtifactRepository};
use universe_deployer_lib::cancel::CancelToken;
use universe_deployer_lib::config::DeployerConfig;
use universe_deployer_lib::consts::{DEFAULT_APPLICATIONS_TO_NOT_DELETE_REGEX, HEAD};
use universe_deployer_lib::deployer::{
  ClusterProvisioner, CommandProvisioner, Deployer, DeployerOptions, DeployerPaths, DeployerPorts, HealthCheckOptions,
  ServiceDeploymentMethod, ensure_environment_allowed,
};
use universe_deployer_lib::manifests::ArtifactBinaryRenderer;
use universe_deployer_lib::paths;
use universe_deployer_lib::pool::ResourcePool;
use universe_deployer_lib::process::bazel::BazelCli;
use universe_deployer_lib::process::git::{GitCli, GitRunner};
use universe_deployer_lib::process::helmfile::HelmfileCli;
use universe_deployer_lib::process::kubectl::KubectlClient;
use universe_deployer_lib::process::{CommandEnv, CommandSpec, ShellScriptRunner};
use universe_deployer_lib::universe_config::{UniverseConfigFiles, WalkComponents, resolve_references};

use crate::output::{format_duration, print_info, print_stat, print_success};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum DeploymentMethod {
  /// Push manifests to the manifests repository for Argo CD to sync
  #[default]
  Argocd,
  /// Render manifests only
  Disabled,
}

impl From<DeploymentMethod> for ServiceDeploymentMethod {
  fn from(method: DeploymentMethod) -> Self {
    match method {
      DeploymentMethod::Argocd => ServiceDeploymentMethod::ArgoCd,
      DeploymentMethod::Disabled => ServiceDeploymentMethod::Disabled,
    }
  }
}

#[derive(Debug, Args)]
pub struct DeployArgs {
  /// Helmfile environment to deploy
  #[arg(long)]
  pub idc_env: String,

  /// Git commit of the working tree; replaces HEAD in the Universe Config
  #[arg(long)]
  pub commit: String,

  /// Universe Config files; environments may be spread across files
  #[arg(long = "universe-config", required = true)]
  pub universe_configs: Vec<PathBuf>,

  /// Deployer configuration (YAML)
  #[arg(long)]
  pub deployer_config: PathBuf,

  #[arg(long, default_value = "")]
  pub semantic_version: String,

  /// Defaults to the user cache directory
  #[arg(long)]
  pub cache_dir: Option<PathBuf>,

  /// Defaults to a fresh directory that is removed on exit
  #[arg(long)]
  pub temp_dir: Option<PathBuf>,

  #[arg(long)]
  pub runfiles_dir: Option<PathBuf>,

  #[arg(long)]
  pub workspace_dir: Option<PathBuf>,

  #[arg(long)]
  pub home_dir: Option<PathBuf>,

  #[arg(long)]
  pub secrets_dir: Option<PathBuf>,

  #[arg(long, env = "KUBECONFIG")]
  pub kubeconfig: Option<PathBuf>,

  /// Collect cluster logs below this directory while waiting for releases
  #[arg(long)]
  pub build_artifacts_dir: Option<PathBuf>,

  /// Use this tar instead of building the working tree
  #[arg(long)]
  pub deployment_artifacts_tar: Option<PathBuf>,

  /// Base URL of the deployment artifacts repository
  #[arg(long)]
  pub artifact_repository_url: Option<String>,

  #[arg(long, default_value = "bazel")]
  pub bazel_binary: PathBuf,

  #[arg(long = "bazel-startup-opt", allow_hyphen_values = true)]
  pub bazel_startup_opts: Vec<String>,

  #[arg(long = "bazel-build-opt", allow_hyphen_values = true)]
  pub bazel_build_opts: Vec<String>,

  /// Share at most this many bazel output roots with other processes
  #[arg(long)]
  pub max_pool_dirs: Option<usize>,

  #[arg(long, default_value = "")]
  pub default_chart_registry: String,

  #[arg(long, value_enum, default_value_t)]
  pub deployment_method: DeploymentMethod,

  /// Argo CD Applications to delete when undeploying
  #[arg(long, default_value = ".*")]
  pub delete_regex: String,

  /// Argo CD Applications to keep when undeploying
  #[arg(long, default_value = DEFAULT_APPLICATIONS_TO_NOT_DELETE_REGEX)]
  pub not_delete_regex: String,

  #[arg(long)]
  pub delete_argo_cd: bool,

  #[arg(long)]
  pub delete_gitea: bool,

  #[arg(long)]
  pub delete_vault: bool,

  /// Push HEAD's containers and Helm charts
  #[arg(long)]
  pub include_push: bool,

  #[arg(long)]
  pub include_deploy_k8s_tls_secrets: bool,

  #[arg(long)]
  pub skip_vault_configure: bool,

  #[arg(long)]
  pub skip_vault_load_secrets: bool,

  /// Recreate the manifests repository from its initial data
  #[arg(long)]
  pub initialize_git_repo: bool,

  /// Commit manifests locally without pushing
  #[arg(long)]
  pub dry_run: bool,

  #[arg(long, default_value_t = 0)]
  pub source_sequence_number: i64,

  /// Command that creates the clusters, such as a kind setup script
  #[arg(long)]
  pub provision_command: Option<PathBuf>,

  /// Undeploy before deploying
  #[arg(long)]
  pub undeploy_first: bool,

  #[arg(long, default_value = "15m")]
  pub health_timeout: humantime::Duration,

  #[arg(long, default_value = "10m")]
  pub undeploy_timeout: humantime::Duration,

  /// Maximum concurrent manifest renders; 0 means unlimited
  #[arg(long, default_value_t = 0)]
  pub parallelism: usize,

  #[arg(long, env = "CLUSTER_PREFIX", default_value = "")]
  pub cluster_prefix: String,

  #[arg(long, env = "TEST_ENVIRONMENT_ID", default_value = "")]
  pub test_environment_id: String,
}

/// Execute the deploy command.
pub fn cmd_deploy(args: &DeployArgs) -> Result<()> {
  ensure_environment_allowed(&args.idc_env)?;
  let (rt, token) = super::runtime()?;
  let start = Instant::now();
  let manifests = rt.block_on(async {
    let (mut deployer, _temp_guard) = build_deployer(args, &token).await?;
    let result = async {
      if args.undeploy_first {
        deployer.undeploy(&token).await.context("Undeploy failed")?;
      }
      deployer.deploy(&token).await.context("Deploy failed")?;
      Ok::<_, anyhow::Error>(deployer.state().manifests().map(|m| m.len()).unwrap_or(0))
    }
    .await;
    deployer.terminate_background_processes().await;
    result
  })?;

  println!();
  print_success(&format!("Deployed {} to {}", args.commit, args.idc_env));
  print_stat("Manifests", &manifests.to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}

/// Execute the undeploy command.
pub fn cmd_undeploy(args: &DeployArgs) -> Result<()> {
  ensure_environment_allowed(&args.idc_env)?;
  let (rt, token) = super::runtime()?;
  let start = Instant::now();
  rt.block_on(async {
    let (mut deployer, _temp_guard) = build_deployer(args, &token).await?;
    let result = deployer.undeploy(&token).await.context("Undeploy failed");
    deployer.terminate_background_processes().await;
    result
  })?;

  print_success(&format!("Undeployed {}", args.idc_env));
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}

/// The deployer and, when no `--temp-dir` was given, the guard that removes
/// its temp dir.
async fn build_deployer(args: &DeployArgs, token: &CancelToken) -> Result<(Deployer, Option<TempDir>)> {
  let env = CommandEnv::inherit();
  let git: Arc<dyn GitRunner> = Arc::new(GitCli::new(env.clone()));
  let config = DeployerConfig::read_file(&args.deployer_config)?;
  config.validate()?;

  let (temp_dir, temp_guard) = match &args.temp_dir {
    Some(dir) => (dir.clone(), None),
    None => {
      let guard = tempfile::Builder::new()
        .prefix("universe-deployer-")
        .tempdir()
        .context("Failed to create temp dir")?;
      (guard.path().to_path_buf(), Some(guard))
    }
  };

  let mut options = DeployerOptions {
    argo_applications_to_delete_regex: args.delete_regex.clone(),
    argo_applications_to_not_delete_regex: args.not_delete_regex.clone(),
    build_artifacts_dir: args.build_artifacts_dir.clone(),
    cache_dir: args.cache_dir.clone().unwrap_or_else(paths::cache_dir),
    cluster_prefix: args.cluster_prefix.clone(),
    commit: args.commit.clone(),
    delete_argo_cd: args.delete_argo_cd,
    delete_gitea: args.delete_gitea,
    delete_vault: args.delete_vault,
    git_pusher_dry_run: args.dry_run,
    idc_env: args.idc_env.clone(),
    deployment_method: args.deployment_method.into(),
    include_push: args.include_push,
    initialize_git_repo: args.initialize_git_repo,
    head_deployment_artifacts_tar: canonical(&args.deployment_artifacts_tar)?,
    home_dir: args.home_dir.clone(),
    include_deploy_k8s_tls_secrets: args.include_deploy_k8s_tls_secrets,
    include_vault_configure: !args.skip_vault_configure,
    include_vault_load_secrets: !args.skip_vault_load_secrets,
    kubeconfig: args
      .kubeconfig
      .clone()
      .unwrap_or_else(|| paths::home_dir().join(".kube").join("config")),
    override_default_chart_registry: args.default_chart_registry.clone(),
    runfiles_dir: canonical(&args.runfiles_dir)?,
    secrets_dir: args.secrets_dir.clone(),
    semantic_version: args.semantic_version.clone(),
    source_sequence_number: args.source_sequence_number,
    test_environment_id: args.test_environment_id.clone(),
    temp_dir,
    workspace_dir: canonical(&args.workspace_dir)?,
    health: HealthCheckOptions {
      timeout: *args.health_timeout,
      ..HealthCheckOptions::default()
    },
    undeploy_timeout: *args.undeploy_timeout,
    undeploy_interval: Duration::from_secs(5),
    parallelism: args.parallelism,
    env: env.clone(),
    config,
    ..DeployerOptions::default()
  };
  let paths = DeployerPaths::resolve(&options)?;

  let files = UniverseConfigFiles::read(&args.universe_configs)?;
  let mut universe_config = files.merged()?;
  universe_config.replace_commits(&BTreeMap::from([(HEAD.to_string(), args.commit.clone())]));
  let remote = &options.config.component_commit_git_remote;
  if !remote.is_empty() {
    resolve_references(&mut universe_config, git.as_ref(), &paths.workspace_dir, remote, token).await?;
  }
  universe_config.validate_commits()?;
  options.universe_config = universe_config;

  let artifacts = match &args.artifact_repository_url {
    Some(url) => {
      let repository = HttpArtifactRepository::new(url.as_str()).with_credentials_from(&paths.all_environments_secrets_dir)?;
      Some(Arc::new(repository) as Arc<dyn ArtifactSource>)
    }
    None => {
      warn!("no artifact repository; every component must be at the working tree commit");
      None
    }
  };
  let pool = args
    .max_pool_dirs
    .map(|max| Arc::new(ResourcePool::new(paths::pool_dir(), max)));
  let provisioner = args.provision_command.as_ref().map(|command| {
    Arc::new(CommandProvisioner {
      spec: CommandSpec::new(command).env(env.clone()),
    }) as Arc<dyn ClusterProvisioner>
  });

  let ports = DeployerPorts {
    git,
    helmfile: Arc::new(HelmfileCli),
    builder: Arc::new(BazelCli {
      binary: args.bazel_binary.clone(),
      startup_opts: args.bazel_startup_opts.clone(),
      build_opts: args.bazel_build_opts.clone(),
      env: env.clone(),
      pool,
      retry: BazelCli::default_retry(),
    }),
    cluster: Arc::new(KubectlClient {
      binary: paths.kubectl_binary.clone(),
      kubeconfig: options.kubeconfig.clone(),
      env: env.clone(),
    }),
    scripts: Arc::new(ShellScriptRunner),
    artifacts,
    renderer: Arc::new(ArtifactBinaryRenderer::new(env)),
    provisioner,
  };

  print_info(&format!("Environment {} at commit {}", options.idc_env, options.commit));
  info!(temp_dir = %options.temp_dir.display(), "deployer options");
  Ok((Deployer::new(options, ports, token)?, temp_guard))
}

/// Subprocesses run in other working directories, so existing paths given on
/// the command line are made absolute up front.
fn canonical(path: &Option<PathBuf>) -> Result<Option<PathBuf>> {
  path
    .as_ref()
    .map(|path| dunce::canonicalize(path).with_context(|| format!("Failed to resolve {}", path.display())))
    .transpose()
}
