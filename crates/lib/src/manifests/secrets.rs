//! Random bootstrap secrets for development environments.
//!
//! Some charts cannot be rendered without these. They end up in plaintext in
//! the manifests repository, so this is only for disposable environments.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, info};

use super::{RenderError, io_error};
use crate::config::RegionConfig;

const GLOBAL_DATABASES: &[&str] = &[
  "authz",
  "billing",
  "catalog",
  "cloudaccount",
  "cloudcredits",
  "cloudmonitor",
  "insights",
  "metering",
  "notification",
  "productcatalog",
  "training",
  "usage",
];

const REGIONAL_DATABASES: &[&str] = &[
  "cloudmonitor-logs",
  "compute",
  "dpai",
  "fleet-admin",
  "insights",
  "kfaas",
  "netbox-postgres",
  "netbox-redis",
  "network",
  "quota-management-service",
  "sdn-vn-controller",
  "storage",
  "training",
];

/// Create every secret file that does not exist yet. Existing files are
/// never overwritten.
pub fn make_secrets(regions: &BTreeMap<String, RegionConfig>, secrets_dir: &Path) -> Result<(), RenderError> {
  create_private_dir(secrets_dir).map_err(io_error(secrets_dir))?;

  let mut names = vec!["gitea_admin_password".to_string()];
  for (region, region_config) in regions {
    names.push(format!("{}-netbox_secretKey", region));
    for availability_zone in region_config.availability_zones.keys() {
      names.push(format!("{}-inspector_password", availability_zone));
      names.push(format!("{}-ironic_password", availability_zone));
    }
  }

  let mut databases: Vec<String> = GLOBAL_DATABASES.iter().map(|db| db.to_string()).collect();
  for region in regions.keys() {
    databases.extend(REGIONAL_DATABASES.iter().map(|db| format!("{}-{}", region, db)));
  }
  for database in &databases {
    names.push(format!("{}_db_admin_password", database));
    names.push(format!("{}_db_user_password", database));
  }

  let mut created = 0usize;
  for name in &names {
    let path = secrets_dir.join(name);
    if create_uuid_secret_file_if_missing(&path).map_err(io_error(&path))? {
      created += 1;
    }
  }
  info!(secrets_dir = %secrets_dir.display(), created, total = names.len(), "secrets ready");
  Ok(())
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
  #[cfg(unix)]
  {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
  }
  #[cfg(not(unix))]
  {
    fs::create_dir_all(dir)
  }
}

/// Returns true if the file was created.
fn create_uuid_secret_file_if_missing(path: &Path) -> io::Result<bool> {
  let mut options = OpenOptions::new();
  options.write(true).create_new(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
  }
  let mut file = match options.open(path) {
    Ok(file) => file,
    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
      debug!(path = %path.display(), "skipping existing secret file");
      return Ok(false);
    }
    Err(err) => return Err(err),
  };
  debug!(path = %path.display(), "creating new secret file");
  file.write_all(uuid::Uuid::new_v4().to_string().as_bytes())?;
  Ok(true)
}
