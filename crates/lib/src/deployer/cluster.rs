//! Cluster prerequisites applied directly with helmfile, plus the helper
//! scripts and port-forwards they need.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::background::free_port;
use super::{DeployError, Deployer};
use crate::cancel::CancelToken;
use crate::consts::{COLLECT_K8S_LOGS_SCRIPT, DEPLOY_K8S_TLS_SECRETS_SCRIPT, VAULT_CONFIGURE_SCRIPT, VAULT_LOAD_SECRETS_SCRIPT};
use crate::process::helmfile::{HelmfileInvocation, SyncAction};
use crate::process::kubectl::{KubectlClient, ResourceKind};
use crate::process::{CommandEnv, CommandSpec, ProcessError, run};
use crate::util::retry::{Backoff, retry};

/// A release set in its own helmfile config file.
#[derive(Debug, Clone, Copy)]
pub struct ClusterService {
  pub config_file: &'static str,
  pub selector: &'static str,
}

pub const DEBUG_TOOLS: ClusterService = ClusterService {
  config_file: "helmfile-debugTools.yaml",
  selector: "component=debugTools",
};
pub const COREDNS: ClusterService = ClusterService {
  config_file: "helmfile-coredns.yaml",
  selector: "chart=coredns",
};
pub const VAULT: ClusterService = ClusterService {
  config_file: "helmfile-vault.yaml",
  selector: "component=vault",
};
pub const GITEA: ClusterService = ClusterService {
  config_file: "helmfile-gitea.yaml",
  selector: "component=gitea",
};
pub const ARGO_CD: ClusterService = ClusterService {
  config_file: "helmfile-argocd.yaml",
  selector: "component=argocd",
};

const VAULT_NAMESPACE: &str = "vault";
const VAULT_SERVICE: &str = "service/vault";
const VAULT_PORT: &str = "8200";
const GITEA_NAMESPACE: &str = "gitea";
const GITEA_SERVICE: &str = "service/gitea-http";
const GITEA_PORT: &str = "3000";

/// Creates or validates the target clusters before anything is deployed.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
  async fn provision(&self, token: &CancelToken) -> Result<(), ProcessError>;
}

/// Provisions by running a command, such as a kind setup script.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
  pub spec: CommandSpec,
}

#[async_trait]
impl ClusterProvisioner for CommandProvisioner {
  async fn provision(&self, token: &CancelToken) -> Result<(), ProcessError> {
    run(&self.spec, token).await.map(|_| ())
  }
}

/// `remote` with its host and port replaced by `localhost:<port>`. Remotes
/// that are not URLs are returned unchanged.
pub fn local_remote(remote: &str, port: u16) -> Result<String, DeployError> {
  let Ok(mut url) = reqwest::Url::parse(remote) else {
    return Ok(remote.to_string());
  };
  if !matches!(url.scheme(), "http" | "https") {
    return Ok(remote.to_string());
  }
  let invalid = |message: &str| DeployError::InvalidUrl {
    url: remote.to_string(),
    message: message.to_string(),
  };
  url.set_host(Some("localhost")).map_err(|err| invalid(&err.to_string()))?;
  url.set_port(Some(port)).map_err(|()| invalid("cannot set port"))?;
  Ok(url.to_string())
}

impl Deployer {
  /// Environment shared by every subprocess the deployer starts.
  pub(super) fn base_env(&self) -> CommandEnv {
    let env = self.options.env.with_path("HOME", &self.paths.home_dir);
    if self.options.kubeconfig.as_os_str().is_empty() {
      return env;
    }
    env.with_path("KUBECONFIG", &self.options.kubeconfig)
  }

  fn script_env(&self) -> CommandEnv {
    self
      .base_env()
      .with_path("KUBECTL", &self.paths.kubectl_binary)
      .with_path("SECRETS_DIR", &self.paths.secrets_dir)
  }

  pub(super) fn helmfile_invocation(&self, config_file: &str) -> HelmfileInvocation {
    HelmfileInvocation {
      helmfile_binary: self.paths.helmfile_binary.clone(),
      helm_binary: self.paths.helm_binary.clone(),
      config_dir: self.paths.helmfile_config_dir.clone(),
      config_file: config_file.to_string(),
      environment: self.options.idc_env.clone(),
      env: self
        .base_env()
        .with_path("HELM_CHART_VERSIONS_DIR", &self.paths.helm_chart_versions_dir)
        .with_path("SECRETS_DIR", &self.paths.secrets_dir),
    }
  }

  pub(super) async fn initialize_helmfile(&self, token: &CancelToken) -> Result<(), DeployError> {
    let invocation = self.helmfile_invocation("helmfile.yaml");
    let version = self.ports.helmfile.version(&invocation, token).await?;
    info!(version = %version, "helmfile");
    self.ports.helmfile.init(&invocation, token).await?;
    Ok(())
  }

  async fn sync_service(&self, service: ClusterService, action: SyncAction, token: &CancelToken) -> Result<(), DeployError> {
    info!(config_file = service.config_file, selector = service.selector, action = ?action, "helmfile");
    let invocation = self.helmfile_invocation(service.config_file);
    self
      .ports
      .helmfile
      .sync(&invocation, action, &[service.selector.to_string()], &[], token)
      .await?;
    Ok(())
  }

  /// Deployed only to clusters whose helmfile values enable it.
  pub async fn deploy_debug_tools(&self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(DEBUG_TOOLS, SyncAction::Apply, token).await
  }

  pub async fn deploy_core_dns(&self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(COREDNS, SyncAction::Apply, token).await
  }

  pub async fn deploy_argo_cd(&self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(ARGO_CD, SyncAction::Apply, token).await
  }

  pub async fn delete_argo_cd(&self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(ARGO_CD, SyncAction::Destroy, token).await
  }

  pub async fn delete_gitea(&self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(GITEA, SyncAction::Destroy, token).await
  }

  pub async fn delete_vault(&self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(VAULT, SyncAction::Destroy, token).await
  }

  /// Apply Vault, then configure it and load secrets through a port-forward.
  pub async fn deploy_vault(&self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(VAULT, SyncAction::Apply, token).await?;
    let options = &self.options;
    if !options.include_vault_configure && !options.include_vault_load_secrets {
      return Ok(());
    }
    let port = self.start_port_forward(VAULT_NAMESPACE, VAULT_SERVICE, VAULT_PORT)?;
    let env = self.script_env().with("VAULT_ADDR", format!("http://localhost:{}", port));
    if options.include_vault_configure {
      self.run_script_with_retry(VAULT_CONFIGURE_SCRIPT, &env, token).await?;
    }
    if options.include_vault_load_secrets {
      self.run_script_with_retry(VAULT_LOAD_SECRETS_SCRIPT, &env, token).await?;
    }
    Ok(())
  }

  /// Apply Gitea and push to it through a port-forward from now on.
  pub async fn deploy_gitea(&mut self, token: &CancelToken) -> Result<(), DeployError> {
    self.sync_service(GITEA, SyncAction::Apply, token).await?;
    let port = self.start_port_forward(GITEA_NAMESPACE, GITEA_SERVICE, GITEA_PORT)?;
    let remote = local_remote(&self.initialized()?.manifests_git_remote, port)?;
    info!(port, "pushing manifests through port-forward");
    self.manifests_push_remote = Some(remote);
    Ok(())
  }

  /// Forward a free local port to `service` until the deployer terminates
  /// its background processes.
  pub fn start_port_forward(&self, namespace: &str, service: &str, remote_port: &str) -> Result<u16, DeployError> {
    let port = free_port().map_err(|source| DeployError::Io {
      path: "127.0.0.1:0".into(),
      source,
    })?;
    let kubectl = KubectlClient {
      binary: self.paths.kubectl_binary.clone(),
      kubeconfig: self.options.kubeconfig.clone(),
      env: self.base_env(),
    };
    let spec = kubectl.port_forward_spec(namespace, service, port, remote_port);
    info!(namespace, service, local_port = port, remote_port, "starting port-forward");
    self
      .background
      .spawn_restarting(format!("port-forward {}/{}", namespace, service), spec);
    Ok(port)
  }

  async fn run_script(&self, relative: &str, env: &CommandEnv, token: &CancelToken) -> Result<(), DeployError> {
    let script = self.paths.runfiles_dir.join(relative);
    self.ports.scripts.run_script(&script, &[], env, token).await?;
    Ok(())
  }

  /// Scripts that talk to a freshly started port-forward may fail until it
  /// is ready.
  async fn run_script_with_retry(&self, relative: &str, env: &CommandEnv, token: &CancelToken) -> Result<(), DeployError> {
    let backoff = Backoff::exponential(Duration::from_secs(2), 2, 5);
    retry(
      &backoff,
      token,
      |err: &DeployError| matches!(err, DeployError::Process(ProcessError::Failed { .. })),
      || self.run_script(relative, env, token),
    )
    .await
    .map_err(|err| err.into_inner())
  }

  /// Create the wildcard TLS secret used by ingresses.
  pub async fn deploy_k8s_tls_secrets(&self, token: &CancelToken) -> Result<(), DeployError> {
    self
      .run_script(DEPLOY_K8S_TLS_SECRETS_SCRIPT, &self.script_env(), token)
      .await
  }

  /// Dump cluster logs below `<build artifacts dir>/k8s-logs/<kube context>`.
  /// Does nothing when no build artifacts dir is configured.
  pub async fn collect_k8s_logs(&self, token: &CancelToken) -> Result<(), DeployError> {
    let Some(build_artifacts_dir) = &self.options.build_artifacts_dir else {
      return Ok(());
    };
    for kube_context in self.get_kube_contexts() {
      let log_dir = build_artifacts_dir.join("k8s-logs").join(&kube_context);
      let env = self
        .base_env()
        .with("KUBECONTEXT", kube_context.as_str())
        .with_path("KUBECTL", &self.paths.kubectl_binary)
        .with_path("LOGDIR", &log_dir);
      self.run_script(COLLECT_K8S_LOGS_SCRIPT, &env, token).await?;
    }
    Ok(())
  }

  /// Verify that every cluster answers before deploying to it.
  pub async fn initialize_k8s_clients(&mut self, token: &CancelToken) -> Result<(), DeployError> {
    if !self.options.config.k8s_api_enabled || self.k8s_clients_initialized {
      return Ok(());
    }
    let kube_contexts = self.get_kube_contexts();
    info!(kube_contexts = ?kube_contexts, "Testing connection to Kubernetes clusters");
    let backoff = Backoff::exponential(Duration::from_secs(1), 2, 5);
    let this = &*self;
    retry(
      &backoff,
      token,
      |err: &DeployError| matches!(err, DeployError::Cluster { .. }),
      || this.list_all(ResourceKind::Deployment, token),
    )
    .await
    .map_err(|err| err.into_inner())?;
    info!(kube_contexts = ?kube_contexts, "Connected to Kubernetes clusters");
    self.k8s_clients_initialized = true;
    Ok(())
  }

  pub(super) async fn provision(&self, token: &CancelToken) -> Result<(), DeployError> {
    let Some(provisioner) = &self.ports.provisioner else {
      return Ok(());
    };
    info!("provisioning clusters");
    if let Err(err) = provisioner.provision(token).await {
      warn!(error = %err, "provisioning failed");
      return Err(err.into());
    }
    Ok(())
  }
}
