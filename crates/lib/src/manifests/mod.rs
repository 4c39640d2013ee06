//! Rendered application manifests.
//!
//! A [`Manifest`] is one Helm release destined for an Argo CD Application.
//! Its `config.json` lives at a path that encodes scope, region or
//! environment, kube context and release name.

mod owned;
mod render;
mod secrets;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

pub use owned::{OWNED_DIRECTORY_README, owned_directories_in_tar, write_config_json_files};
pub use render::{
  ArtifactBinaryRenderer, CommitManifestsRenderer, HelmfileManifestsRenderer, RenderRequest, Selectors,
  helm_releases_to_manifests,
};
pub use secrets::make_secrets;

use crate::config::ConfigError;
use crate::consts::ARGO_CD_CONFIG_FILE_NAME;
use crate::process::ProcessError;
use crate::task_group::TaskGroupError;
use crate::universe_config::UniverseConfigError;
use crate::util::tar::{TarError, extract};

#[derive(Debug, Error)]
pub enum RenderError {
  #[error("required parameter {name} is empty")]
  RequiredParameter { name: &'static str },

  #[error("more than one component is unsupported")]
  TooManyComponents,

  #[error("environment {environment} not found in {config_file}")]
  EnvironmentNotFound { environment: String, config_file: PathBuf },

  #[error("kubeContext is not set for release {release}")]
  MissingKubeContext { release: String },

  #[error("environmentName is not set for release {release}")]
  MissingEnvironmentName { release: String },

  #[error("region is not set for release {release}")]
  MissingRegion { release: String },

  #[error("unknown geographicScope '{scope}'")]
  UnknownScope { scope: String },

  #[error("unable to parse chart '{chart}'")]
  InvalidChart { chart: String },

  #[error("'helmRepositories.{repo}.registry' and 'environments.{environment}.helm.registry' are empty in {config_file}")]
  MissingRegistry {
    repo: String,
    environment: String,
    config_file: PathBuf,
  },

  #[error("invalid manifest {path}: {source}")]
  InvalidManifest {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  UniverseConfig(#[from] UniverseConfigError),

  #[error(transparent)]
  Process(#[from] ProcessError),

  #[error(transparent)]
  Tar(#[from] TarError),

  #[error(transparent)]
  Tasks(#[from] TaskGroupError),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RenderError + '_ {
  move |source| RenderError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Content of an Argo CD `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envconfig {
  pub release_name: String,
  pub chart_name: String,
  pub chart_version: String,
  pub chart_registry: String,
  pub namespace: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub git_commit: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub config_commit: String,
}

/// Where a chart is pulled from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartReference {
  pub registry: String,
  pub name: String,
  pub version: String,
}

impl ChartReference {
  /// Each non-empty field of `overrides` replaces the field of `self`.
  pub fn merge(&self, overrides: &ChartReference) -> ChartReference {
    let pick = |base: &String, over: &String| if over.is_empty() { base.clone() } else { over.clone() };
    ChartReference {
      registry: pick(&self.registry, &overrides.registry),
      name: pick(&self.name, &overrides.name),
      version: pick(&self.version, &overrides.version),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFileData {
  pub envconfig: Envconfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
  pub config_commit: String,
  pub config_file_data: ConfigFileData,
  /// Relative path such as
  /// `applications/idc-global-services/dev/kind-idc-global/billing/config.json`.
  pub config_file_name: String,
  pub git_commit: String,
  pub kube_context: String,
}

impl Manifest {
  pub fn release_name(&self) -> &str {
    &self.config_file_data.envconfig.release_name
  }

  pub fn namespace(&self) -> &str {
    &self.config_file_data.envconfig.namespace
  }

  /// Value of the `app.kubernetes.io/instance` label of the release's resources.
  pub fn instance(&self) -> String {
    format!("{}-{}", self.kube_context, self.release_name())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifests {
  pub manifests: Vec<Manifest>,
}

impl Manifests {
  /// Order by config file name so that output and diffs are stable.
  pub fn sort(&mut self) {
    self.manifests.sort_by(|a, b| a.config_file_name.cmp(&b.config_file_name));
  }

  pub fn extend(&mut self, other: Manifests) {
    self.manifests.extend(other.manifests);
  }

  pub fn len(&self) -> usize {
    self.manifests.len()
  }

  pub fn is_empty(&self) -> bool {
    self.manifests.is_empty()
  }

  /// Recover manifests from a manifests tar. Every `config.json` becomes one
  /// manifest; the kube context is the name of the directory above the
  /// release directory.
  pub fn from_tar(tar: &Path, commit: &str, config_commit: &str) -> Result<Manifests, RenderError> {
    let temp = tempfile::Builder::new()
      .prefix("manifests_tar_")
      .tempdir()
      .map_err(io_error(tar))?;
    extract(tar, temp.path())?;
    let mut manifests = Self::from_dir(temp.path(), commit, config_commit)?;
    manifests.sort();
    Ok(manifests)
  }

  pub(crate) fn from_dir(dir: &Path, commit: &str, config_commit: &str) -> Result<Manifests, RenderError> {
    let mut manifests = Manifests::default();
    for entry in WalkDir::new(dir).sort_by_file_name() {
      let entry = entry.map_err(|err| RenderError::Io {
        path: dir.to_path_buf(),
        source: std::io::Error::other(err),
      })?;
      if !entry.file_type().is_file() || entry.file_name() != ARGO_CD_CONFIG_FILE_NAME {
        continue;
      }
      let path = entry.path();
      let relative = path.strip_prefix(dir).unwrap_or(path);
      let content = std::fs::read_to_string(path).map_err(io_error(path))?;
      let config_file_data: ConfigFileData =
        serde_json::from_str(&content).map_err(|source| RenderError::InvalidManifest {
          path: relative.to_path_buf(),
          source,
        })?;
      let kube_context = relative
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
      manifests.manifests.push(Manifest {
        config_commit: config_commit.to_string(),
        config_file_data,
        config_file_name: relative.to_string_lossy().into_owned(),
        git_commit: commit.to_string(),
        kube_context,
      });
    }
    Ok(manifests)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::util::tar::create_deterministic;
  use crate::util::testutil::{fake_commit, write_files};
  use tempfile::TempDir;

  pub(crate) fn manifest(config_file_name: &str, kube_context: &str, release: &str, namespace: &str) -> Manifest {
    Manifest {
      config_commit: fake_commit('c'),
      config_file_data: ConfigFileData {
        envconfig: Envconfig {
          release_name: release.to_string(),
          chart_name: format!("intelcloud/{}", release),
          chart_version: "0.0.1".to_string(),
          chart_registry: "registry.example.com".to_string(),
          namespace: namespace.to_string(),
          git_commit: fake_commit('a'),
          config_commit: fake_commit('c'),
        },
      },
      config_file_name: config_file_name.to_string(),
      git_commit: fake_commit('a'),
      kube_context: kube_context.to_string(),
    }
  }

  #[test]
  fn chart_reference_merge_keeps_base_for_empty_fields() {
    let base = ChartReference {
      registry: "default.example.com".to_string(),
      name: "intelcloud/billing".to_string(),
      version: "0.0.1".to_string(),
    };
    let merged = base.merge(&ChartReference {
      registry: "net.example.com".to_string(),
      ..Default::default()
    });
    assert_eq!(merged.registry, "net.example.com");
    assert_eq!(merged.name, "intelcloud/billing");
    assert_eq!(merged.version, "0.0.1");
    assert_eq!(base.merge(&ChartReference::default()), base);
  }

  #[test]
  fn envconfig_omits_empty_commits() {
    let data = ConfigFileData {
      envconfig: Envconfig {
        release_name: "billing".to_string(),
        ..Default::default()
      },
    };
    let json = serde_json::to_string(&data).unwrap();
    assert!(json.contains("\"releaseName\":\"billing\""));
    assert!(!json.contains("gitCommit"));
  }

  #[test]
  fn from_tar_derives_kube_context_from_path() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let json = r#"{"envconfig":{"releaseName":"us-dev-1-compute-api-server","chartName":"intelcloud/compute-api-server","chartVersion":"0.0.1","chartRegistry":"r","namespace":"idcs-system"}}"#;
    write_files(
      &src,
      &[
        ("applications/idc-regional/us-dev-1/kind-us-dev-1/us-dev-1-compute-api-server/config.json", json),
        ("applications/idc-regional/us-dev-1/kind-us-dev-1/us-dev-1-compute-api-server/values.yaml", "a: 1"),
        ("applications/idc-regional/README.md", "owned"),
      ],
    );
    let tar = temp.path().join("manifests.tar");
    create_deterministic(&src, &tar).unwrap();

    let manifests = Manifests::from_tar(&tar, &fake_commit('a'), &fake_commit('b')).unwrap();
    assert_eq!(manifests.len(), 1);
    let manifest = &manifests.manifests[0];
    assert_eq!(manifest.kube_context, "kind-us-dev-1");
    assert_eq!(manifest.git_commit, fake_commit('a'));
    assert_eq!(manifest.config_commit, fake_commit('b'));
    assert_eq!(manifest.instance(), "kind-us-dev-1-us-dev-1-compute-api-server");
    assert_eq!(manifest.namespace(), "idcs-system");
  }

  #[test]
  fn sort_orders_by_config_file_name() {
    let mut manifests = Manifests {
      manifests: vec![
        manifest("applications/b/config.json", "k", "b", "ns"),
        manifest("applications/a/config.json", "k", "a", "ns"),
      ],
    };
    manifests.sort();
    assert_eq!(manifests.manifests[0].release_name(), "a");
  }
}
