//! A bounded set of directories, each exclusively leased across processes.
//!
//! Every directory `<base>/<i>` has a sibling lock file `<base>/<i>.lock`
//! guarded by a non-blocking `flock`. Holding the lock is holding the lease,
//! so two build invocations in separate processes never share a directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cancel::{CancelReason, CancelToken};

pub const DEFAULT_MAX_POOL_DIRS: usize = 4;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PoolError {
  #[error("failed to create pool directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open pool lock file {path}: {source}")]
  OpenLock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to lock {path}: {source}")]
  Lock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("waiting for a pool directory in {base_dir}: {reason}")]
  Cancelled { base_dir: PathBuf, reason: CancelReason },
}

/// Written into a held lock file for diagnostics.
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseMetadata {
  pub pid: u32,
  pub started_at_unix: u64,
}

#[derive(Debug)]
pub struct ResourcePool {
  base_dir: PathBuf,
  max_pool_dirs: usize,
  retry_interval: Duration,
  next: AtomicUsize,
}

/// An exclusively held pool directory. Dropping it releases the lock.
#[derive(Debug)]
pub struct PoolLease {
  dir: PathBuf,
  lock_path: PathBuf,
  _file: File,
}

impl PoolLease {
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

impl Drop for PoolLease {
  fn drop(&mut self) {
    debug!(dir = %self.dir.display(), "released pool directory");
  }
}

impl ResourcePool {
  pub fn new(base_dir: impl Into<PathBuf>, max_pool_dirs: usize) -> Self {
    ResourcePool {
      base_dir: base_dir.into(),
      max_pool_dirs: max_pool_dirs.max(1),
      retry_interval: DEFAULT_RETRY_INTERVAL,
      next: AtomicUsize::new(0),
    }
  }

  pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
    self.retry_interval = retry_interval;
    self
  }

  pub fn base_dir(&self) -> &Path {
    &self.base_dir
  }

  /// Lease a directory, waiting until one is free or `token` fires.
  pub async fn get_directory(&self, token: &CancelToken) -> Result<PoolLease, PoolError> {
    let mut logged = false;
    loop {
      if let Some(lease) = self.try_get_directory()? {
        return Ok(lease);
      }
      if !logged {
        info!(base_dir = %self.base_dir.display(), max_pool_dirs = self.max_pool_dirs, "all pool directories are in use, waiting");
        logged = true;
      }
      token
        .sleep(self.retry_interval)
        .await
        .map_err(|reason| PoolError::Cancelled {
          base_dir: self.base_dir.clone(),
          reason,
        })?;
    }
  }

  /// One pass over every candidate directory, starting after the last one
  /// handed out. Returns `None` when all are held.
  pub fn try_get_directory(&self) -> Result<Option<PoolLease>, PoolError> {
    std::fs::create_dir_all(&self.base_dir).map_err(|source| PoolError::CreateDir {
      path: self.base_dir.clone(),
      source,
    })?;

    let start = self.next.fetch_add(1, Ordering::Relaxed);
    for offset in 0..self.max_pool_dirs {
      let index = (start + offset) % self.max_pool_dirs;
      let dir = self.base_dir.join(index.to_string());
      let lock_path = self.base_dir.join(format!("{}.lock", index));

      let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| PoolError::OpenLock {
          path: lock_path.clone(),
          source,
        })?;

      match try_lock(&file) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
        Err(source) => return Err(PoolError::Lock { path: lock_path, source }),
      }

      std::fs::create_dir_all(&dir).map_err(|source| PoolError::CreateDir {
        path: dir.clone(),
        source,
      })?;
      if let Err(err) = write_metadata(&file) {
        debug!(path = %lock_path.display(), error = %err, "unable to write lease metadata");
      }
      debug!(dir = %dir.display(), "acquired pool directory");
      return Ok(Some(PoolLease {
        dir,
        lock_path,
        _file: file,
      }));
    }
    Ok(None)
  }
}

fn write_metadata(file: &File) -> io::Result<()> {
  let metadata = LeaseMetadata {
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
  };
  file.set_len(0)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer(&mut writer, &metadata).map_err(io::Error::other)?;
  writer.flush()
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<()> {
  Err(io::Error::new(
    io::ErrorKind::Unsupported,
    "pool directories require flock",
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn pool(temp: &TempDir, max: usize) -> ResourcePool {
    ResourcePool::new(temp.path().join("pool"), max).with_retry_interval(Duration::from_millis(10))
  }

  #[tokio::test]
  async fn leases_are_distinct_directories() {
    let temp = TempDir::new().unwrap();
    let pool = pool(&temp, 2);
    let token = CancelToken::new();
    let a = pool.get_directory(&token).await.unwrap();
    let b = pool.get_directory(&token).await.unwrap();
    assert_ne!(a.dir(), b.dir());
    assert!(a.dir().is_dir());
    assert!(pool.try_get_directory().unwrap().is_none());
  }

  #[tokio::test]
  async fn lease_metadata_names_this_process() {
    let temp = TempDir::new().unwrap();
    let pool = pool(&temp, 1);
    let lease = pool.get_directory(&CancelToken::new()).await.unwrap();
    let metadata: LeaseMetadata =
      serde_json::from_str(&std::fs::read_to_string(lease.lock_path()).unwrap()).unwrap();
    assert_eq!(metadata.pid, std::process::id());
  }

  #[tokio::test]
  async fn single_directory_is_held_until_released() {
    let temp = TempDir::new().unwrap();
    let pool = std::sync::Arc::new(pool(&temp, 1));
    let token = CancelToken::new();
    let first = pool.get_directory(&token).await.unwrap();

    let waiter = {
      let pool = pool.clone();
      let token = token.clone();
      tokio::spawn(async move { pool.get_directory(&token).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    let first_dir = first.dir().to_path_buf();
    drop(first);
    let second = waiter.await.unwrap().unwrap();
    assert_eq!(second.dir(), first_dir);
  }

  #[tokio::test]
  async fn waiting_respects_deadline() {
    let temp = TempDir::new().unwrap();
    let pool = pool(&temp, 1);
    let _held = pool.get_directory(&CancelToken::new()).await.unwrap();
    let token = CancelToken::new().child_with_timeout(Duration::from_millis(50));
    let err = pool.get_directory(&token).await.unwrap_err();
    assert!(matches!(
      err,
      PoolError::Cancelled {
        reason: CancelReason::DeadlineExceeded,
        ..
      }
    ));
  }
}
