//! Health verification of deployed releases.
//!
//! Every rendered manifest is matched to a live Deployment, DaemonSet or Job
//! through the `app.kubernetes.io/instance` label. A resource that carries
//! commit labels must carry the manifest's commits, so an old version that
//! happens to be healthy is not mistaken for the new one.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use super::{DeployError, Deployer};
use crate::cancel::CancelToken;
use crate::config::{ConfigError, NamespacedNameRegex};
use crate::consts::{CONFIG_COMMIT_LABEL, INSTANCE_LABEL, VERSION_LABEL};
use crate::manifests::{Manifest, Manifests};
use crate::process::kubectl::{K8sResource, ResourceKind};
use crate::util::commit::is_git_commit;
use crate::util::retry::{Backoff, retry};

pub const TROUBLESHOOTING_HINT: &str = "At least one application (Helm release) was deployed but is not yet healthy.\n\
If the Helm release does not define a Deployment nor a Job, then add it to \
universeDeployer.ignoreHealthCheckFor in deployment/helmfile/defaults.yaml.gotmpl.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnhealthyReason {
  #[error("resource has Git commit {found} but expected {expected}")]
  WrongCommit { found: String, expected: String },

  #[error("resource has config commit {found} but expected {expected}")]
  WrongConfigCommit { found: String, expected: String },

  #[error("deployment not available: {0}")]
  DeploymentNotAvailable(String),

  #[error("deployment condition not found")]
  DeploymentConditionNotFound,

  #[error("daemonSet not ready: {ready}/{desired} replicas are healthy")]
  DaemonSetNotReady { ready: i64, desired: i64 },

  #[error("job not complete: {0}")]
  JobNotComplete(String),

  #[error("job condition not found")]
  JobConditionNotFound,

  #[error("not found")]
  NotFound,
}

impl UnhealthyReason {
  pub fn is_wrong_version(&self) -> bool {
    matches!(
      self,
      UnhealthyReason::WrongCommit { .. } | UnhealthyReason::WrongConfigCommit { .. }
    )
  }
}

/// A release that was still unhealthy when the wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhealthyRelease {
  pub release_name: String,
  pub namespace: String,
  pub reason: UnhealthyReason,
}

#[derive(Debug, Clone)]
pub struct ManifestStatus {
  pub manifest: Manifest,
  pub healthy: bool,
  pub reason: Option<UnhealthyReason>,
  /// Kind of the matched live resource.
  pub kind: Option<ResourceKind>,
}

/// Live workloads of every cluster.
#[derive(Debug, Clone, Default)]
pub struct LiveResources {
  pub deployments: Vec<K8sResource>,
  pub daemon_sets: Vec<K8sResource>,
  pub jobs: Vec<K8sResource>,
}

#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
  pub timeout: Duration,
  pub interval: Duration,
  /// No troubleshooting output before this much time has passed.
  pub help_grace: Duration,
  pub help_interval: Duration,
}

impl Default for HealthCheckOptions {
  fn default() -> Self {
    HealthCheckOptions {
      timeout: Duration::from_secs(15 * 60),
      interval: Duration::from_secs(5),
      help_grace: Duration::from_secs(3 * 60),
      help_interval: Duration::from_secs(60),
    }
  }
}

fn is_matching_instance(manifest: &Manifest, resource: &K8sResource) -> bool {
  resource.label(INSTANCE_LABEL) == manifest.instance()
}

/// Labels that are not commits belong to charts that do not follow the
/// labeling convention; those are assumed to match.
fn ensure_matching_commit(manifest: &Manifest, resource: &K8sResource) -> Result<(), UnhealthyReason> {
  let found = resource.label(VERSION_LABEL);
  if !is_git_commit(found) {
    return Ok(());
  }
  if found != manifest.git_commit {
    return Err(UnhealthyReason::WrongCommit {
      found: found.to_string(),
      expected: manifest.git_commit.clone(),
    });
  }
  let found_config = resource.label(CONFIG_COMMIT_LABEL);
  if !is_git_commit(found_config) {
    return Ok(());
  }
  if found_config != manifest.config_commit {
    return Err(UnhealthyReason::WrongConfigCommit {
      found: found_config.to_string(),
      expected: manifest.config_commit.clone(),
    });
  }
  Ok(())
}

fn deployment_health(resource: &K8sResource) -> Result<(), UnhealthyReason> {
  match resource.condition("Available") {
    Some(cond) if cond.status == "True" => Ok(()),
    Some(cond) => Err(UnhealthyReason::DeploymentNotAvailable(cond.reason.clone())),
    None => Err(UnhealthyReason::DeploymentConditionNotFound),
  }
}

fn daemon_set_health(resource: &K8sResource) -> Result<(), UnhealthyReason> {
  let desired = resource.status.desired_number_scheduled;
  let ready = resource.status.number_ready;
  if desired == ready {
    Ok(())
  } else {
    Err(UnhealthyReason::DaemonSetNotReady { ready, desired })
  }
}

fn job_health(resource: &K8sResource) -> Result<(), UnhealthyReason> {
  match resource.condition("Complete") {
    Some(cond) if cond.status == "True" => Ok(()),
    Some(cond) => Err(UnhealthyReason::JobNotComplete(cond.reason.clone())),
    None => Err(UnhealthyReason::JobConditionNotFound),
  }
}

/// Status of each manifest, in manifest order. Deployments are searched
/// first, then DaemonSets, then Jobs.
pub fn manifests_status(
  manifests: &Manifests,
  ignore: &[NamespacedNameRegex],
  live: &LiveResources,
) -> Result<Vec<ManifestStatus>, ConfigError> {
  type HealthFn = fn(&K8sResource) -> Result<(), UnhealthyReason>;
  let searches: [(ResourceKind, &[K8sResource], HealthFn); 3] = [
    (ResourceKind::Deployment, &live.deployments, deployment_health),
    (ResourceKind::DaemonSet, &live.daemon_sets, daemon_set_health),
    (ResourceKind::Job, &live.jobs, job_health),
  ];

  let mut statuses = Vec::with_capacity(manifests.len());
  'manifests: for manifest in &manifests.manifests {
    for rule in ignore {
      if rule.matches(manifest.namespace(), manifest.release_name())? {
        statuses.push(ManifestStatus {
          manifest: manifest.clone(),
          healthy: true,
          reason: None,
          kind: None,
        });
        continue 'manifests;
      }
    }

    let mut status = ManifestStatus {
      manifest: manifest.clone(),
      healthy: false,
      reason: Some(UnhealthyReason::NotFound),
      kind: None,
    };
    for (kind, resources, health) in &searches {
      let Some(resource) = resources.iter().find(|r| is_matching_instance(manifest, r)) else {
        continue;
      };
      let result = ensure_matching_commit(manifest, resource).and_then(|()| health(resource));
      status.kind = Some(*kind);
      status.healthy = result.is_ok();
      status.reason = result.err();
      break;
    }
    statuses.push(status);
  }
  Ok(statuses)
}

/// Unhealthy releases and failed cluster queries are polled again. Anything
/// else, such as an invalid ignore pattern, fails the wait at once.
fn is_retryable(err: &DeployError) -> bool {
  matches!(err, DeployError::NotHealthy { .. } | DeployError::Cluster { .. })
}

impl Deployer {
  /// Resources of `kind` from every kube context.
  pub(super) async fn list_all(&self, kind: ResourceKind, token: &CancelToken) -> Result<Vec<K8sResource>, DeployError> {
    let mut all = Vec::new();
    for kube_context in self.get_kube_contexts() {
      let items = self
        .ports
        .cluster
        .list(&kube_context, kind, token)
        .await
        .map_err(|source| DeployError::Cluster {
          kube_context: kube_context.clone(),
          source,
        })?;
      all.extend(items);
    }
    Ok(all)
  }

  pub async fn get_manifests_status(
    &self,
    manifests: &Manifests,
    token: &CancelToken,
  ) -> Result<Vec<ManifestStatus>, DeployError> {
    let live = LiveResources {
      deployments: self.list_all(ResourceKind::Deployment, token).await?,
      daemon_sets: self.list_all(ResourceKind::DaemonSet, token).await?,
      jobs: self.list_all(ResourceKind::Job, token).await?,
    };
    Ok(manifests_status(
      manifests,
      &self.options.config.ignore_health_check_for,
      &live,
    )?)
  }

  /// Poll until every manifest is healthy or the timeout elapses.
  pub async fn wait_for_k8s_resources(&self, manifests: &Manifests, token: &CancelToken) -> Result<(), DeployError> {
    let options = &self.options.health;
    info!(total = manifests.len(), timeout = ?options.timeout, "BEGIN");
    let start = Instant::now();
    let next_help = Mutex::new(start + options.help_grace);

    let next_help = &next_help;
    let attempt = move || async move {
      let statuses = self.get_manifests_status(manifests, token).await?;
      let unhealthy: Vec<UnhealthyRelease> = statuses
        .iter()
        .filter(|status| !status.healthy)
        .map(|status| UnhealthyRelease {
          release_name: status.manifest.release_name().to_string(),
          namespace: status.manifest.namespace().to_string(),
          reason: status.reason.clone().unwrap_or(UnhealthyReason::NotFound),
        })
        .collect();
      for release in &unhealthy {
        info!(
          name = %release.release_name,
          namespace = %release.namespace,
          reason = %release.reason,
          "Unhealthy application"
        );
      }
      let total = statuses.len();
      if unhealthy.is_empty() {
        return Ok(total);
      }
      info!(unhealthy = unhealthy.len(), total, "Waiting for applications to become healthy");

      let show_help = {
        let mut next = next_help.lock().unwrap_or_else(|e| e.into_inner());
        let due = Instant::now() >= *next;
        if due {
          *next = Instant::now() + options.help_interval;
        }
        due
      };
      if show_help {
        if let Err(err) = self.collect_k8s_logs(token).await {
          warn!(error = %err, "unable to collect logs");
        }
        error!(
          "{}\nThis will continue to wait for a total of {:?}.",
          TROUBLESHOOTING_HINT, options.timeout
        );
      }
      Err(DeployError::NotHealthy {
        unhealthy: unhealthy.len(),
        total,
        releases: unhealthy,
      })
    };

    let backoff = Backoff::linear(options.timeout, options.interval);
    match retry(&backoff, token, is_retryable, attempt).await {
      Ok(total) => {
        info!(total, duration = ?start.elapsed(), "All applications are healthy");
        Ok(())
      }
      Err(err) => {
        error!("{}", TROUBLESHOOTING_HINT);
        Err(err.into_inner())
      }
    }
  }
}
