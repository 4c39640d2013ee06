//! The Universe Config: which commit of each component is deployed where.
//!
//! A Universe Config is a JSON tree `environment -> region -> availability
//! zone`, each level carrying a map of enabled components. Every operation on
//! the tree is built on [`WalkComponents`], a visitor over the flattened
//! components.

mod files;
mod resolve;
mod walk;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::fs::atomic_write;

pub use files::UniverseConfigFiles;
pub use resolve::resolve_references;
pub use walk::{ComponentCommit, ComponentCommitsMode, ComponentLocation, GroupedByCommit, WalkComponents};

#[derive(Debug, Error)]
pub enum UniverseConfigError {
  #[error("failed to read Universe Config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse Universe Config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write Universe Config {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("commit '{commit}' in Universe Config is not a valid Git hash")]
  InvalidCommit { commit: String },

  #[error("environment {environment} is defined in multiple files: {file_name}")]
  DuplicateEnvironment { environment: String, file_name: String },

  #[error("file {file_name} is not formatted correctly; rewrite it with `universe-deployer universe-config format`")]
  Changed { file_name: String },

  #[error("unable to resolve reference '{reference}' using 'git ls-remote {remote}'")]
  UnresolvedReference { reference: String, remote: String },

  #[error("git ls-remote {remote} failed: {source}")]
  LsRemote {
    remote: String,
    #[source]
    source: crate::process::ProcessError,
  },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseConfig {
  #[serde(rename = "_doc", default, skip_serializing_if = "String::is_empty")]
  pub doc: String,
  #[serde(default)]
  pub environments: BTreeMap<String, UniverseEnvironment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseEnvironment {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub components: BTreeMap<String, UniverseComponent>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub regions: BTreeMap<String, UniverseRegion>,
  /// Render every release of the environment regardless of `components`.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub force_all_components: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseRegion {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub components: BTreeMap<String, UniverseComponent>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub availability_zones: BTreeMap<String, UniverseAvailabilityZone>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseAvailabilityZone {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub components: BTreeMap<String, UniverseComponent>,
}

/// One enabled component. Only `commit` and `config_commit` drive deployment;
/// the remaining fields annotate the commit for humans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseComponent {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub commit: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub config_commit: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub author_date: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub author_email: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub author_name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub committer_date: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub committer_email: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub committer_name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub subject: String,
}

impl UniverseComponent {
  pub fn new(commit: impl Into<String>) -> Self {
    UniverseComponent {
      commit: commit.into(),
      ..Default::default()
    }
  }
}

impl UniverseConfig {
  pub fn from_json(json: &str, path: &Path) -> Result<Self, UniverseConfigError> {
    serde_json::from_str(json).map_err(|source| UniverseConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn read_file(path: &Path) -> Result<Self, UniverseConfigError> {
    let content = fs::read_to_string(path).map_err(|source| UniverseConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content, path)
  }

  /// Two-space indented JSON followed by a newline. Unchanged data always
  /// serializes to the same bytes.
  pub fn to_json(&self) -> String {
    // Serializing string-keyed maps and plain structs cannot fail.
    let mut json = serde_json::to_string_pretty(self).unwrap_or_default();
    json.push('\n');
    json
  }

  pub fn write_file(&self, path: &Path) -> Result<(), UniverseConfigError> {
    atomic_write(path, self.to_json().as_bytes()).map_err(|source| UniverseConfigError::Write {
      path: path.to_path_buf(),
      source,
    })
  }

  /// A copy holding only the components accepted by `predicate`. Regions,
  /// availability zones and environments left without any component are
  /// dropped.
  pub fn filtered(&self, predicate: impl Fn(&str, &UniverseComponent) -> bool) -> UniverseConfig {
    let mut filtered = UniverseConfig {
      doc: self.doc.clone(),
      environments: BTreeMap::new(),
    };
    let _ = self.walk_components(|location, component| {
      if !predicate(&location.component, component) {
        return Ok::<_, std::convert::Infallible>(());
      }
      let env = filtered
        .environments
        .entry(location.environment.clone())
        .or_insert_with(|| UniverseEnvironment {
          force_all_components: self
            .environments
            .get(&location.environment)
            .is_some_and(|env| env.force_all_components),
          ..Default::default()
        });
      let components = if location.region.is_empty() {
        &mut env.components
      } else {
        let region = env.regions.entry(location.region.clone()).or_default();
        if location.availability_zone.is_empty() {
          &mut region.components
        } else {
          &mut region
            .availability_zones
            .entry(location.availability_zone.clone())
            .or_default()
            .components
        }
      };
      components.insert(location.component.clone(), component.clone());
      Ok(())
    });
    filtered
  }

  /// A copy holding only components deployed at `commit`.
  pub fn trimmed(&self, commit: &str) -> UniverseConfig {
    self.filtered(|_, component| component.commit == commit)
  }
}
