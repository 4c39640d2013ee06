//! Read-only access to live cluster state via `kubectl get -o json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CommandEnv, CommandSpec, ProcessError, run};
use crate::cancel::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
  Deployment,
  DaemonSet,
  Job,
  ArgoApplication,
}

impl ResourceKind {
  fn resource(self) -> &'static str {
    match self {
      ResourceKind::Deployment => "deployments.apps",
      ResourceKind::DaemonSet => "daemonsets.apps",
      ResourceKind::Job => "jobs.batch",
      ResourceKind::ArgoApplication => "applications.argoproj.io",
    }
  }
}

impl std::fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.resource())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
  pub name: String,
  pub namespace: String,
  pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
  #[serde(rename = "type")]
  pub type_: String,
  pub status: String,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceStatus {
  pub conditions: Vec<Condition>,
  pub desired_number_scheduled: i64,
  pub number_ready: i64,
}

/// The subset of a Deployment, DaemonSet, Job or Application that health
/// checks look at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sResource {
  pub metadata: ObjectMeta,
  pub status: ResourceStatus,
}

impl K8sResource {
  pub fn label(&self, name: &str) -> &str {
    self.metadata.labels.get(name).map(String::as_str).unwrap_or_default()
  }

  pub fn condition(&self, type_: &str) -> Option<&Condition> {
    self.status.conditions.iter().find(|cond| cond.type_ == type_)
  }
}

#[derive(Debug, Deserialize)]
struct ResourceList {
  #[serde(default)]
  items: Vec<K8sResource>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
  /// All resources of `kind` in every namespace of `kube_context`.
  async fn list(
    &self,
    kube_context: &str,
    kind: ResourceKind,
    token: &CancelToken,
  ) -> Result<Vec<K8sResource>, ProcessError>;
}

#[derive(Debug, Clone)]
pub struct KubectlClient {
  pub binary: PathBuf,
  pub kubeconfig: PathBuf,
  pub env: CommandEnv,
}

impl KubectlClient {
  fn command(&self) -> CommandSpec {
    CommandSpec::new(&self.binary).env(self.env.with_path("KUBECONFIG", &self.kubeconfig))
  }

  /// Long-running `kubectl port-forward` for a service.
  pub fn port_forward_spec(&self, namespace: &str, service: &str, local_port: u16, remote_port: &str) -> CommandSpec {
    self.command().args([
      "port-forward".to_string(),
      "--namespace".to_string(),
      namespace.to_string(),
      service.to_string(),
      format!("{}:{}", local_port, remote_port),
    ])
  }
}

#[async_trait]
impl ClusterClient for KubectlClient {
  async fn list(
    &self,
    kube_context: &str,
    kind: ResourceKind,
    token: &CancelToken,
  ) -> Result<Vec<K8sResource>, ProcessError> {
    let spec = self
      .command()
      .args(["--context", kube_context, "get", kind.resource(), "--all-namespaces", "--output", "json"]);
    let output = run(&spec, token).await?;
    parse_resource_list(&output.stdout).map_err(|err| ProcessError::Parse {
      command: spec.display(),
      message: err.to_string(),
    })
  }
}

pub fn parse_resource_list(stdout: &str) -> Result<Vec<K8sResource>, serde_json::Error> {
  let list: ResourceList = serde_json::from_str(stdout)?;
  Ok(list.items)
}
