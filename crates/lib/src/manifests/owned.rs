use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{Manifests, RenderError, io_error};
use crate::consts::{OWNED_DIRECTORY_MARKER_FILE_NAME, OWNED_DIRECTORY_README_FILE_NAME};
use crate::util::tar::list_files;

pub const OWNED_DIRECTORY_README: &str = "\
# Owned by Universe Deployer

The contents of this directory are generated. The Universe Deployer replaces
this directory in its entirety every time it pushes manifests, so manual edits
here will be lost. Change the Universe Config or the Helm values instead.
";

/// Write one `config.json` per manifest below `manifest_dir`, then mark the
/// release directory and its parent (the kube context directory) as owned.
pub fn write_config_json_files(manifests: &Manifests, manifest_dir: &Path) -> Result<(), RenderError> {
  let mut owned = BTreeSet::new();
  for manifest in &manifests.manifests {
    let path = manifest_dir.join(&manifest.config_file_name);
    let mut json = serde_json::to_string_pretty(&manifest.config_file_data).map_err(|source| {
      RenderError::InvalidManifest {
        path: path.clone(),
        source,
      }
    })?;
    json.push('\n');
    trace!(path = %path.display(), json = %json, "config.json");

    let Some(release_dir) = path.parent() else {
      continue;
    };
    fs::create_dir_all(release_dir).map_err(io_error(release_dir))?;
    fs::write(&path, json).map_err(io_error(&path))?;
    owned.insert(release_dir.to_path_buf());
    if let Some(parent) = release_dir.parent() {
      owned.insert(parent.to_path_buf());
    }
  }

  for dir in owned {
    for name in [OWNED_DIRECTORY_README_FILE_NAME, OWNED_DIRECTORY_MARKER_FILE_NAME] {
      let path = dir.join(name);
      fs::write(&path, OWNED_DIRECTORY_README).map_err(io_error(&path))?;
    }
  }
  Ok(())
}

/// Directories (relative to the tar root) that contain an ownership marker.
pub fn owned_directories_in_tar(tar: &Path) -> Result<Vec<PathBuf>, RenderError> {
  let owned: BTreeSet<PathBuf> = list_files(tar)?
    .into_iter()
    .filter(|path| path.file_name().is_some_and(|name| name == OWNED_DIRECTORY_MARKER_FILE_NAME))
    .filter_map(|path| path.parent().map(Path::to_path_buf))
    .collect();
  debug!(count = owned.len(), tar = %tar.display(), "owned directories");
  Ok(owned.into_iter().collect())
}
