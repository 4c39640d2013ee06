//! Deterministic tar archives.
//!
//! Archives written here have entries sorted by path, owner and group
//! `root:0`, and mtime 0. Identical directory contents therefore always
//! produce byte-identical archives, which content-addressed caching and
//! minimal Git diffs both depend on.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum TarError {
  #[error("failed to create tar {path}: {source}")]
  Create {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to extract tar {path} into {dest}: {source}")]
  Extract {
    path: PathBuf,
    dest: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read tar {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Archive the contents of `src_dir` (not the directory itself) into `output`.
pub fn create_deterministic(src_dir: &Path, output: &Path) -> Result<(), TarError> {
  let create_err = |source: io::Error| TarError::Create {
    path: output.to_path_buf(),
    source,
  };

  if let Some(parent) = output.parent() {
    fs::create_dir_all(parent).map_err(create_err)?;
  }
  let file = File::create(output).map_err(create_err)?;
  let mut builder = Builder::new(BufWriter::new(file));
  builder.follow_symlinks(false);

  for entry in WalkDir::new(src_dir).sort_by_file_name() {
    let entry = entry.map_err(|e| create_err(io::Error::other(e)))?;
    let relative = entry.path().strip_prefix(src_dir).map_err(|e| create_err(io::Error::other(e)))?;
    if relative.as_os_str().is_empty() {
      continue;
    }

    let metadata = entry.path().symlink_metadata().map_err(create_err)?;
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("root").map_err(create_err)?;
    header.set_groupname("root").map_err(create_err)?;
    header.set_mode(mode_of(&metadata));

    let file_type = entry.file_type();
    if file_type.is_dir() {
      header.set_entry_type(EntryType::Directory);
      header.set_size(0);
      builder
        .append_data(&mut header, relative, io::empty())
        .map_err(create_err)?;
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(create_err)?;
      header.set_entry_type(EntryType::Symlink);
      header.set_size(0);
      builder
        .append_link(&mut header, relative, &target)
        .map_err(create_err)?;
    } else {
      header.set_entry_type(EntryType::Regular);
      header.set_size(metadata.len());
      let file = File::open(entry.path()).map_err(create_err)?;
      builder
        .append_data(&mut header, relative, BufReader::new(file))
        .map_err(create_err)?;
    }
  }

  builder
    .into_inner()
    .and_then(|mut writer| io::Write::flush(&mut writer))
    .map_err(create_err)
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
  if metadata.is_dir() { 0o755 } else { 0o644 }
}

/// Extract `archive` into `dest`, overwriting files that already exist.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), TarError> {
  let extract_err = |source: io::Error| TarError::Extract {
    path: archive.to_path_buf(),
    dest: dest.to_path_buf(),
    source,
  };
  fs::create_dir_all(dest).map_err(extract_err)?;
  let file = File::open(archive).map_err(extract_err)?;
  let mut archive = Archive::new(BufReader::new(file));
  archive.set_preserve_permissions(true);
  archive.set_overwrite(true);
  archive.unpack(dest).map_err(extract_err)
}

/// Paths of all regular files in `archive`, normalized without a leading `./`.
pub fn list_files(archive: &Path) -> Result<Vec<PathBuf>, TarError> {
  let read_err = |source: io::Error| TarError::Read {
    path: archive.to_path_buf(),
    source,
  };
  let file = File::open(archive).map_err(read_err)?;
  let mut archive = Archive::new(BufReader::new(file));
  let mut files = Vec::new();
  for entry in archive.entries().map_err(read_err)? {
    let entry = entry.map_err(read_err)?;
    if entry.header().entry_type().is_file() {
      let path = entry.path().map_err(read_err)?;
      files.push(
        path
          .components()
          .filter(|component| !matches!(component, Component::CurDir))
          .collect::<PathBuf>(),
      );
    }
  }
  Ok(files)
}
