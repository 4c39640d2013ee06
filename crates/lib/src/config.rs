//! YAML configuration.
//!
//! [`DeployerConfig`] describes one target environment: where manifests are
//! pushed, which cluster features are enabled, and the cluster topology.
//! [`DeploymentArtifactsConfig`] ships inside every deployment artifacts tar
//! and describes how that commit's charts map to registries.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("ComponentCommitGitRemote and ComponentConfigCommitGitRemote must have the same value")]
  RemoteMismatch,

  #[error("invalid URL '{url}': {message}")]
  InvalidUrl { url: String, message: String },

  #[error("invalid regex '{pattern}': {source}")]
  InvalidRegex {
    pattern: String,
    #[source]
    source: regex::Error,
  },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeContextConfig {
  pub kube_context: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvailabilityZoneConfig {
  pub kube_context: String,
  pub network_cluster: KubeContextConfig,
  pub quick_connect: KubeContextConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegionConfig {
  pub kube_context: String,
  pub availability_zones: BTreeMap<String, AvailabilityZoneConfig>,
}

/// Releases matching a namespace and a name regex are assumed healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespacedNameRegex {
  pub namespace: String,
  pub name: String,
}

impl NamespacedNameRegex {
  pub fn matches(&self, namespace: &str, name: &str) -> Result<bool, ConfigError> {
    if self.namespace != namespace {
      return Ok(false);
    }
    let re = compile_regex(&self.name)?;
    Ok(re.is_match(name))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmRepository {
  pub registry: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployerConfig {
  pub manifests_git_remote: String,
  pub manifests_git_branch: String,
  /// Relative path of the push state file in the manifests repository.
  /// Empty disables the sequence guard.
  pub push_state_file_name: String,
  pub component_commit_git_remote: String,
  pub component_config_commit_git_remote: String,
  pub k8s_api_enabled: bool,
  pub argo_cd_enabled: bool,
  pub vault_enabled: bool,
  /// Relative to the workspace directory.
  pub patch_command: String,
  pub ignore_health_check_for: Vec<NamespacedNameRegex>,
  /// Host (and optional path) of the default Helm repository, without scheme.
  pub idc_helm_repository_url: String,
  /// Overrides the registry derived from `idcHelmRepositoryUrl`.
  pub default_chart_registry: String,
  pub global: KubeContextConfig,
  pub regions: BTreeMap<String, RegionConfig>,
}

impl DeployerConfig {
  pub fn from_yaml(yaml: &str, path: &Path) -> Result<Self, ConfigError> {
    serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_yaml(&yaml, path)
  }

  /// References in the Universe Config are resolved against one remote, so
  /// both remotes must agree.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.component_commit_git_remote != self.component_config_commit_git_remote {
      return Err(ConfigError::RemoteMismatch);
    }
    Ok(())
  }

  /// Registry used for charts whose repository has no explicit registry.
  pub fn default_chart_registry(&self) -> Result<String, ConfigError> {
    if !self.default_chart_registry.is_empty() {
      return Ok(self.default_chart_registry.clone());
    }
    registry_host(&self.idc_helm_repository_url)
  }

  /// Every distinct non-empty kube context, sorted.
  pub fn kube_contexts(&self) -> Vec<String> {
    let mut contexts = BTreeSet::new();
    contexts.insert(self.global.kube_context.as_str());
    for region in self.regions.values() {
      contexts.insert(region.kube_context.as_str());
      for az in region.availability_zones.values() {
        contexts.insert(az.kube_context.as_str());
        contexts.insert(az.network_cluster.kube_context.as_str());
        contexts.insert(az.quick_connect.kube_context.as_str());
      }
    }
    contexts
      .into_iter()
      .filter(|context| !context.is_empty())
      .map(str::to_string)
      .collect()
  }
}

/// Per-environment settings inside a deployment artifacts tar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactsEnvironment {
  pub idc_helm_repository_url: String,
  pub regions: BTreeMap<String, RegionConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentArtifactsConfig {
  pub helm_repositories: BTreeMap<String, HelmRepository>,
  pub environments: BTreeMap<String, ArtifactsEnvironment>,
}

impl DeploymentArtifactsConfig {
  /// A missing file yields an empty config.
  pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
    let yaml = match std::fs::read_to_string(path) {
      Ok(yaml) => yaml,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    serde_yaml::from_str(&yaml).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Repository name to registry, skipping repositories without one.
  pub fn repo_to_registry(&self) -> BTreeMap<String, String> {
    self
      .helm_repositories
      .iter()
      .filter(|(_, repo)| !repo.registry.is_empty())
      .map(|(name, repo)| (name.clone(), repo.registry.clone()))
      .collect()
  }
}

/// Host part of a Helm repository URL given without a scheme. Empty input
/// means no default registry.
pub fn registry_host(repository_url: &str) -> Result<String, ConfigError> {
  if repository_url.is_empty() {
    return Ok(String::new());
  }
  let url = format!("https://{}", repository_url);
  let parsed = reqwest::Url::parse(&url).map_err(|err| ConfigError::InvalidUrl {
    url: url.clone(),
    message: err.to_string(),
  })?;
  let host = parsed.host_str().unwrap_or_default();
  Ok(match parsed.port() {
    Some(port) => format!("{}:{}", host, port),
    None => host.to_string(),
  })
}

pub fn compile_regex(pattern: &str) -> Result<Regex, ConfigError> {
  Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
    pattern: pattern.to_string(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const SAMPLE: &str = r#"
manifestsGitRemote: https://git.example.com/idc-argocd.git
manifestsGitBranch: main
pushStateFileName: push_state.json
componentCommitGitRemote: https://git.example.com/idc.git
componentConfigCommitGitRemote: https://git.example.com/idc.git
k8sApiEnabled: true
argoCdEnabled: true
ignoreHealthCheckFor:
  - namespace: idcs-system
    name: "^.*-db-migrate$"
idcHelmRepositoryUrl: charts.example.com/intelcloud
global:
  kubeContext: kind-idc-global
regions:
  us-dev-1:
    kubeContext: kind-idc-us-dev-1
    availabilityZones:
      us-dev-1a:
        kubeContext: kind-idc-us-dev-1
        networkCluster:
          kubeContext: kind-idc-us-dev-1a-network
"#;

  fn sample() -> DeployerConfig {
    DeployerConfig::from_yaml(SAMPLE, Path::new("deployer.yaml")).unwrap()
  }

  #[test]
  fn parses_camel_case_yaml() {
    let config = sample();
    assert_eq!(config.manifests_git_branch, "main");
    assert!(config.k8s_api_enabled);
    assert!(!config.vault_enabled);
    assert_eq!(config.regions["us-dev-1"].availability_zones.len(), 1);
    config.validate().unwrap();
  }

  #[test]
  fn kube_contexts_are_distinct_and_non_empty() {
    assert_eq!(
      sample().kube_contexts(),
      vec!["kind-idc-global", "kind-idc-us-dev-1", "kind-idc-us-dev-1a-network"]
    );
  }

  #[test]
  fn default_registry_comes_from_repository_url_unless_overridden() {
    let mut config = sample();
    assert_eq!(config.default_chart_registry().unwrap(), "charts.example.com");
    config.default_chart_registry = "registry.local:5001".to_string();
    assert_eq!(config.default_chart_registry().unwrap(), "registry.local:5001");
  }

  #[test]
  fn registry_host_keeps_port() {
    assert_eq!(registry_host("localhost:5001/charts").unwrap(), "localhost:5001");
    assert_eq!(registry_host("").unwrap(), "");
  }

  #[test]
  fn mismatched_remotes_are_rejected() {
    let mut config = sample();
    config.component_config_commit_git_remote = "https://elsewhere/idc.git".to_string();
    assert_eq!(
      config.validate().unwrap_err().to_string(),
      "ComponentCommitGitRemote and ComponentConfigCommitGitRemote must have the same value"
    );
  }

  #[test]
  fn ignore_list_matches_namespace_and_name_regex() {
    let entry = &sample().ignore_health_check_for[0];
    assert!(entry.matches("idcs-system", "compute-db-migrate").unwrap());
    assert!(!entry.matches("idcs-system", "compute-api-server").unwrap());
    assert!(!entry.matches("other", "compute-db-migrate").unwrap());
  }

  #[test]
  fn missing_artifacts_config_is_empty() {
    let temp = TempDir::new().unwrap();
    let config = DeploymentArtifactsConfig::read_file(&temp.path().join("config.yaml")).unwrap();
    assert_eq!(config, DeploymentArtifactsConfig::default());
  }

  #[test]
  fn artifacts_config_maps_repositories_to_registries() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.yaml");
    std::fs::write(
      &path,
      "helmRepositories:\n  idc-networking:\n    registry: net.example.com\n  idc:\n    registry: \"\"\n",
    )
    .unwrap();
    let config = DeploymentArtifactsConfig::read_file(&path).unwrap();
    assert_eq!(
      config.repo_to_registry(),
      BTreeMap::from([("idc-networking".to_string(), "net.example.com".to_string())])
    );
  }
}
