//! Content-addressed file cache.
//!
//! A key names a file that was produced deterministically from the inputs
//! folded into a [`Hasher`]. Entries are written to a temp file inside the
//! cache directory and renamed into place, so readers only ever see complete
//! files. Entries are never modified after they are created.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

const TMP_SUBDIR: &str = "tmp";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("invalid cache key '{key}'")]
  InvalidKey { key: String },

  #[error("cache I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cache key '{key}' not found")]
  NotFound { key: String },
}

#[derive(Debug, Clone)]
pub struct Cache {
  dir: PathBuf,
}

impl Cache {
  pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
    let dir = dir.into();
    let tmp = dir.join(TMP_SUBDIR);
    fs::create_dir_all(&tmp).map_err(|source| CacheError::Io { path: tmp, source })?;
    Ok(Cache { dir })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn is_cached(&self, key: &str) -> Result<bool, CacheError> {
    Ok(self.path_for(key)?.is_file())
  }

  /// Path of the cached file for `key`. Fails if it does not exist.
  pub fn file(&self, key: &str) -> Result<PathBuf, CacheError> {
    let path = self.path_for(key)?;
    if !path.is_file() {
      return Err(CacheError::NotFound { key: key.to_string() });
    }
    Ok(path)
  }

  /// A unique path on the same filesystem as the cache for the caller to
  /// write into before calling [`Cache::move_file_to_cache`].
  pub fn temp_file_path(&self, key: &str) -> Result<PathBuf, CacheError> {
    validate_key(key)?;
    Ok(self.dir.join(TMP_SUBDIR).join(format!("{}.{}", key, uuid::Uuid::new_v4())))
  }

  /// Atomically rename `temp_path` into the cache. When two writers race the
  /// last rename wins, which is harmless because content for a key is
  /// deterministic.
  pub fn move_file_to_cache(&self, key: &str, temp_path: &Path) -> Result<PathBuf, CacheError> {
    let path = self.path_for(key)?;
    fs::rename(temp_path, &path).map_err(|source| CacheError::Io {
      path: path.clone(),
      source,
    })?;
    info!(cache_key = key, path = %path.display(), "stored in cache");
    Ok(path)
  }

  fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
    validate_key(key)?;
    Ok(self.dir.join(key))
  }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
  let valid = !key.is_empty()
    && key != TMP_SUBDIR
    && !key.starts_with('.')
    && key
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
  if valid {
    Ok(())
  } else {
    Err(CacheError::InvalidKey { key: key.to_string() })
  }
}

/// Rolling SHA-256 over named inputs, in the order they are added. Callers
/// must add inputs in a fixed order for keys to be reproducible.
#[derive(Debug, Clone, Default)]
pub struct Hasher {
  digest: Sha256,
}

impl Hasher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_string(&mut self, name: &str, value: &str) -> &mut Self {
    debug!(name, value, "hashing string");
    self.add_field(name, value.as_bytes());
    self
  }

  pub fn add_file(&mut self, name: &str, path: &Path) -> Result<&mut Self, CacheError> {
    let io_err = |source| CacheError::Io {
      path: path.to_path_buf(),
      source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut content = Vec::new();
    file.read_to_end(&mut content).map_err(io_err)?;
    debug!(name, path = %path.display(), len = content.len(), "hashing file");
    self.add_field(name, &content);
    Ok(self)
  }

  fn add_field(&mut self, name: &str, value: &[u8]) {
    // Length prefixes keep ("ab", "c") distinct from ("a", "bc").
    self.digest.update((name.len() as u64).to_le_bytes());
    self.digest.update(name.as_bytes());
    self.digest.update((value.len() as u64).to_le_bytes());
    self.digest.update(value);
  }

  /// Hex digest of everything added so far.
  pub fn sum(&self) -> String {
    hex::encode(self.digest.clone().finalize())
  }
}
