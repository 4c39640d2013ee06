use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::walk::{ComponentLocation, WalkComponents, walk_config, walk_config_mut};
use super::{UniverseComponent, UniverseConfig, UniverseConfigError};
use crate::util::fs::files_equal;

/// A set of Universe Config files, keyed by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniverseConfigFiles {
  pub configs: BTreeMap<PathBuf, UniverseConfig>,
}

impl UniverseConfigFiles {
  pub fn read<P: AsRef<Path>>(paths: &[P]) -> Result<Self, UniverseConfigError> {
    let mut configs = BTreeMap::new();
    for path in paths {
      let path = path.as_ref();
      configs.insert(path.to_path_buf(), UniverseConfig::read_file(path)?);
    }
    Ok(UniverseConfigFiles { configs })
  }

  /// Wrap a single in-memory config under an empty file name.
  pub fn from_config(config: UniverseConfig) -> Self {
    UniverseConfigFiles {
      configs: BTreeMap::from([(PathBuf::new(), config)]),
    }
  }

  /// Combine every file into one config. An environment may only be defined
  /// in one file.
  pub fn merged(&self) -> Result<UniverseConfig, UniverseConfigError> {
    let mut merged = UniverseConfig::default();
    for (path, config) in &self.configs {
      for (environment, env) in &config.environments {
        if merged.environments.contains_key(environment) {
          return Err(UniverseConfigError::DuplicateEnvironment {
            environment: environment.clone(),
            file_name: path.display().to_string(),
          });
        }
        merged.environments.insert(environment.clone(), env.clone());
      }
    }
    Ok(merged)
  }

  pub fn write_files(&self) -> Result<(), UniverseConfigError> {
    for (path, config) in &self.configs {
      debug!(path = %path.display(), "writing Universe Config");
      config.write_file(path)?;
    }
    Ok(())
  }

  /// Fail if rewriting any file would change its bytes.
  pub fn check_unchanged_files(&self) -> Result<(), UniverseConfigError> {
    let temp = tempfile::Builder::new()
      .prefix("universe_config_")
      .tempdir()
      .map_err(|source| UniverseConfigError::Write {
        path: std::env::temp_dir(),
        source,
      })?;
    for (path, config) in &self.configs {
      let temp_path = temp.path().join(format!("{}.json", uuid::Uuid::new_v4()));
      config.write_file(&temp_path)?;
      let equal = files_equal(&temp_path, path).map_err(|source| UniverseConfigError::Read {
        path: path.clone(),
        source,
      })?;
      if !equal {
        return Err(UniverseConfigError::Changed {
          file_name: path.display().to_string(),
        });
      }
    }
    Ok(())
  }
}

impl WalkComponents for UniverseConfigFiles {
  fn walk_components<E>(
    &self,
    mut f: impl FnMut(&ComponentLocation, &UniverseComponent) -> Result<(), E>,
  ) -> Result<(), E> {
    for (path, config) in &self.configs {
      walk_config(&path.to_string_lossy(), config, &mut f)?;
    }
    Ok(())
  }

  fn walk_components_mut<E>(
    &mut self,
    mut f: impl FnMut(&ComponentLocation, &mut UniverseComponent) -> Result<(), E>,
  ) -> Result<(), E> {
    for (path, config) in &mut self.configs {
      walk_config_mut(&path.to_string_lossy(), config, &mut f)?;
    }
    Ok(())
  }
}
