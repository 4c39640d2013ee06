//! Filesystem helpers.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Write `content` to `path` without leaving a partial file behind.
///
/// Content goes to a sibling temp file which is then renamed over `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
  let parent = path.parent().unwrap_or_else(|| Path::new("."));
  fs::create_dir_all(parent)?;
  let file_name = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default();
  let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
  fs::write(&temp_path, content)?;
  fs::rename(&temp_path, path).inspect_err(|_| {
    let _ = fs::remove_file(&temp_path);
  })
}

/// Recursively copy `src` to `dest`, creating `dest` and preserving file modes.
pub fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
  for entry in WalkDir::new(src).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let relative = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    let target = dest.join(relative);
    let file_type = entry.file_type();
    if file_type.is_dir() {
      fs::create_dir_all(&target)?;
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path())?;
      symlink(&link, &target)?;
    } else {
      fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  fs::copy(target, link).map(|_| ())
}

/// Make every file and directory under `path` owner-writable so that it can
/// be deleted. Extracted artifacts are often read-only.
pub fn make_writable_all(path: &Path) -> io::Result<()> {
  if !path.exists() {
    return Ok(());
  }
  for entry in WalkDir::new(path) {
    let entry = entry.map_err(io::Error::other)?;
    if entry.file_type().is_symlink() {
      continue;
    }
    let mut permissions = entry.metadata().map_err(io::Error::other)?.permissions();
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      permissions.set_mode(permissions.mode() | 0o700);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    fs::set_permissions(entry.path(), permissions)?;
  }
  Ok(())
}

/// Remove a directory tree, treating a missing directory as success.
pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
  match fs::remove_dir_all(path) {
    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
    other => other,
  }
}

/// Compare two files byte for byte. A missing file is never equal.
pub fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
  let read = |path: &Path| match fs::read(path) {
    Ok(bytes) => Ok(Some(bytes)),
    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(err) => Err(err),
  };
  match (read(a)?, read(b)?) {
    (Some(a), Some(b)) => Ok(a == b),
    _ => Ok(false),
  }
}
