//! Push rendered manifests to the Git repository watched by Argo CD.
//!
//! The push state file records the sequence number of the pipeline run that
//! last pushed. A run with a smaller number is rejected, which keeps a slow,
//! older run from overwriting the manifests of a newer one. The check and the
//! push are not atomic: two runs racing on the same branch can both pass it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::manifests::{Manifests, RenderError, owned_directories_in_tar};
use crate::process::git::GitRunner;
use crate::process::{CommandEnv, CommandSpec, ProcessError, run};
use crate::util::fs::{atomic_write, copy_dir, make_writable_all, remove_dir_all_if_exists};
use crate::util::tar::{TarError, extract};

pub const PUSH_STATE_DOC: &str = "This file is managed by Universe Deployer. \
sequenceNumber must never decrease; pushes from older pipeline runs are rejected.";

#[derive(Debug, Error)]
pub enum GitPushError {
  #[error(
    "push rejected: source sequence number {source_sequence_number} is less than sequence number {stored_sequence_number} in {path}"
  )]
  SequenceRegression {
    source_sequence_number: i64,
    stored_sequence_number: i64,
    path: PathBuf,
  },

  #[error("required parameter {name} is empty")]
  RequiredParameter { name: &'static str },

  #[error("invalid push state file {path}: {source}")]
  PushState {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("patch command failed: {0}")]
  Patch(#[source] ProcessError),

  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Git(#[from] ProcessError),

  #[error(transparent)]
  Manifests(#[from] RenderError),

  #[error(transparent)]
  Tar(#[from] TarError),
}

impl GitPushError {
  /// Errors that a retry cannot fix.
  pub fn is_permanent(&self) -> bool {
    !matches!(self, GitPushError::Git(_))
  }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> GitPushError + '_ {
  move |source| GitPushError::Io {
    path: path.to_path_buf(),
    source,
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushState {
  #[serde(rename = "_doc", default)]
  pub doc: String,
  #[serde(rename = "sequenceNumber", default)]
  pub sequence_number: i64,
}

impl PushState {
  /// A missing file is sequence number 0.
  pub fn read_file(path: &Path) -> Result<PushState, GitPushError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "push state file does not exist");
        return Ok(PushState::default());
      }
      Err(err) => return Err(io_error(path)(err)),
    };
    serde_json::from_str(&content).map_err(|source| GitPushError::PushState {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn write_file(&self, path: &Path) -> Result<(), GitPushError> {
    let mut json = serde_json::to_string_pretty(self).map_err(|source| GitPushError::PushState {
      path: path.to_path_buf(),
      source,
    })?;
    json.push('\n');
    atomic_write(path, json.as_bytes()).map_err(io_error(path))
  }
}

/// Selects Argo CD Applications by name.
#[derive(Debug, Clone)]
pub struct ApplicationFilter {
  delete: Regex,
  keep: Regex,
}

impl ApplicationFilter {
  pub fn new(delete: Regex, keep: Regex) -> Self {
    ApplicationFilter { delete, keep }
  }

  pub fn matches(&self, name: &str) -> bool {
    self.delete.is_match(name) && !self.keep.is_match(name)
  }
}

#[derive(Debug, Clone, Default)]
pub struct GitPushRequest {
  pub git_remote: String,
  pub git_branch: String,
  /// Working tree location.
  pub clone_dir: PathBuf,
  /// Use an existing working tree in `clone_dir` instead of cloning.
  pub reuse_clone: bool,
  /// Push to a new branch named `<prefix>-<UTC timestamp>`.
  pub new_branch_prefix: Option<String>,
  pub manifests_tar: Option<PathBuf>,
  pub replace_owned_directories: bool,
  /// Remove the directories of matching applications before extracting.
  pub delete_applications: Option<ApplicationFilter>,
  /// Run in the working tree after the manifests are in place.
  pub patch_command: Option<PathBuf>,
  /// Relative path of the push state file. Empty disables the sequence guard.
  pub push_state_file_name: String,
  pub source_sequence_number: i64,
  pub commit_messages: Vec<String>,
  /// Do everything except the final push.
  pub dry_run: bool,
  pub env: CommandEnv,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitPushOutcome {
  pub branch: String,
  pub committed: bool,
  pub pushed: bool,
}

pub struct GitPusher {
  git: Arc<dyn GitRunner>,
}

impl GitPusher {
  pub fn new(git: Arc<dyn GitRunner>) -> Self {
    GitPusher { git }
  }

  pub async fn push(&self, request: &GitPushRequest, token: &CancelToken) -> Result<GitPushOutcome, GitPushError> {
    info!(remote = %request.git_remote, branch = %request.git_branch, dry_run = request.dry_run, "BEGIN");
    let start = Instant::now();
    if request.git_remote.is_empty() {
      return Err(GitPushError::RequiredParameter { name: "git_remote" });
    }
    if request.git_branch.is_empty() {
      return Err(GitPushError::RequiredParameter { name: "git_branch" });
    }
    let dir = &request.clone_dir;

    if request.reuse_clone && dir.join(".git").exists() {
      info!(dir = %dir.display(), "using existing working tree");
    } else {
      make_writable_all(dir).map_err(io_error(dir))?;
      remove_dir_all_if_exists(dir).map_err(io_error(dir))?;
      if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
      }
      self
        .git
        .clone_branch(&request.git_remote, &request.git_branch, dir, token)
        .await?;
    }

    let mut branch = request.git_branch.clone();
    if let Some(prefix) = &request.new_branch_prefix {
      branch = format!("{}-{}", prefix, chrono::Utc::now().format("%Y%m%d-%H%M%S"));
      self.git.checkout_new_branch(dir, &branch, token).await?;
    }

    let push_state_file = (!request.push_state_file_name.is_empty()).then(|| dir.join(&request.push_state_file_name));
    let stored = match &push_state_file {
      Some(path) => Some(PushState::read_file(path)?),
      None => None,
    };

    if let Some(filter) = &request.delete_applications {
      delete_application_dirs(dir, filter)?;
    }

    if let Some(tar) = &request.manifests_tar {
      if request.replace_owned_directories {
        for owned in owned_directories_in_tar(tar)? {
          let path = dir.join(&owned);
          debug!(path = %path.display(), "removing owned directory");
          remove_dir_all_if_exists(&path).map_err(io_error(&path))?;
        }
      }
      extract(tar, dir)?;
    }

    if let Some(patch_command) = &request.patch_command {
      let spec = CommandSpec::new(patch_command)
        .current_dir(dir)
        .env(request.env.clone());
      run(&spec, token).await.map_err(GitPushError::Patch)?;
    }

    self.git.add_all(dir, token).await?;
    if !self.git.has_staged_changes(dir, token).await? {
      info!(duration = ?start.elapsed(), "no changes to push");
      return Ok(GitPushOutcome {
        branch,
        committed: false,
        pushed: false,
      });
    }

    if let (Some(path), Some(stored)) = (&push_state_file, &stored) {
      if request.source_sequence_number < stored.sequence_number {
        warn!(
          source_sequence_number = request.source_sequence_number,
          stored_sequence_number = stored.sequence_number,
          "rejecting push from an older run"
        );
        return Err(GitPushError::SequenceRegression {
          source_sequence_number: request.source_sequence_number,
          stored_sequence_number: stored.sequence_number,
          path: path.clone(),
        });
      }
      PushState {
        doc: PUSH_STATE_DOC.to_string(),
        sequence_number: request.source_sequence_number,
      }
      .write_file(path)?;
      self.git.add_all(dir, token).await?;
    }

    self.git.commit(dir, &request.commit_messages, token).await?;

    if request.dry_run {
      info!(dir = %dir.display(), duration = ?start.elapsed(), "dry run, not pushing");
      return Ok(GitPushOutcome {
        branch,
        committed: true,
        pushed: false,
      });
    }

    self.git.push(dir, &request.git_remote, &branch, token).await?;
    info!(branch = %branch, duration = ?start.elapsed(), "END");
    Ok(GitPushOutcome {
      branch,
      committed: true,
      pushed: true,
    })
  }
}

/// Release directories (those holding a `config.json`) of the applications
/// selected by `filter`.
fn delete_application_dirs(dir: &Path, filter: &ApplicationFilter) -> Result<(), GitPushError> {
  let manifests = Manifests::from_dir(dir, "", "")?;
  for manifest in &manifests.manifests {
    let name = manifest.instance();
    if !filter.matches(&name) {
      continue;
    }
    let Some(release_dir) = Path::new(&manifest.config_file_name).parent() else {
      continue;
    };
    let path = dir.join(release_dir);
    info!(application = %name, path = %path.display(), "deleting application");
    remove_dir_all_if_exists(&path).map_err(io_error(&path))?;
  }
  Ok(())
}

/// Create the manifests repository from the initial data directory and push
/// it, replacing whatever the branch held.
pub async fn init_manifests_repository(
  git: &dyn GitRunner,
  dir: &Path,
  initial_data_dir: &Path,
  remote: &str,
  branch: &str,
  token: &CancelToken,
) -> Result<(), GitPushError> {
  info!(dir = %dir.display(), initial_data_dir = %initial_data_dir.display(), "initializing manifests repository");
  make_writable_all(dir).map_err(io_error(dir))?;
  remove_dir_all_if_exists(dir).map_err(io_error(dir))?;
  copy_dir(initial_data_dir, dir).map_err(io_error(dir))?;
  git.init(dir, branch, token).await?;
  git.add_all(dir, token).await?;
  git
    .commit(dir, &["Initialize manifests repository".to_string()], token)
    .await?;
  git.push(dir, remote, branch, token).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::manifests::tests::manifest;
  use crate::manifests::write_config_json_files;
  use crate::process::git::GitCli;
  use crate::util::tar::create_deterministic;
  use crate::util::testutil::{git, git_available, write_files};
  use tempfile::TempDir;

  const BILLING: &str = "applications/idc-global-services/dev/kind-global/billing/config.json";
  const COMPUTE: &str = "applications/idc-global-services/dev/kind-global/compute/config.json";

  struct Remote {
    temp: TempDir,
    url: String,
  }

  impl Remote {
    /// A bare repository whose `main` branch holds `files`.
    fn new(files: &[(&str, &str)]) -> Self {
      let temp = TempDir::new().unwrap();
      let bare = temp.path().join("remote.git");
      fs::create_dir_all(&bare).unwrap();
      git(&bare, &["init", "--bare", "--initial-branch", "main", "."]);
      let seed = temp.path().join("seed");
      fs::create_dir_all(&seed).unwrap();
      git(&seed, &["init", "--initial-branch", "main", "."]);
      write_files(&seed, files);
      git(&seed, &["add", "--all"]);
      git(&seed, &["commit", "-m", "seed"]);
      let url = bare.to_string_lossy().into_owned();
      git(&seed, &["push", &url, "HEAD:refs/heads/main"]);
      Remote { temp, url }
    }

    fn head(&self) -> String {
      git(Path::new(&self.url), &["rev-parse", "main"])
    }

    fn show(&self, path: &str) -> String {
      git(Path::new(&self.url), &["show", &format!("main:{}", path)])
    }

    fn request(&self, tar: Option<PathBuf>, sequence_number: i64) -> GitPushRequest {
      GitPushRequest {
        git_remote: self.url.clone(),
        git_branch: "main".to_string(),
        clone_dir: self.temp.path().join("clone"),
        manifests_tar: tar,
        replace_owned_directories: true,
        push_state_file_name: "push_state.json".to_string(),
        source_sequence_number: sequence_number,
        commit_messages: vec!["Update manifests".to_string(), "details".to_string()],
        ..Default::default()
      }
    }

    fn manifests_tar(&self, config_files: &[&str]) -> PathBuf {
      let src = self.temp.path().join(format!("src-{}", uuid::Uuid::new_v4()));
      let manifests = Manifests {
        manifests: config_files
          .iter()
          .map(|file| {
            let release = Path::new(file).parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
            manifest(file, "kind-global", &release, "idcs-system")
          })
          .collect(),
      };
      write_config_json_files(&manifests, &src).unwrap();
      let tar = self.temp.path().join(format!("{}.tar", uuid::Uuid::new_v4()));
      create_deterministic(&src, &tar).unwrap();
      tar
    }
  }

  fn pusher() -> GitPusher {
    GitPusher::new(Arc::new(GitCli::default()))
  }

  #[test]
  fn push_state_defaults_to_zero() {
    let temp = TempDir::new().unwrap();
    let state = PushState::read_file(&temp.path().join("missing.json")).unwrap();
    assert_eq!(state.sequence_number, 0);
  }

  #[test]
  fn push_state_round_trips_with_doc() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("push_state.json");
    PushState {
      doc: PUSH_STATE_DOC.to_string(),
      sequence_number: 42,
    }
    .write_file(&path)
    .unwrap();
    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("\"_doc\""));
    assert!(content.contains("\"sequenceNumber\": 42"));
    assert_eq!(PushState::read_file(&path).unwrap().sequence_number, 42);
  }

  #[test]
  fn application_filter_keeps_protected_names() {
    let filter = ApplicationFilter::new(Regex::new(".*").unwrap(), Regex::new("^app-of-apps$").unwrap());
    assert!(filter.matches("kind-global-billing"));
    assert!(!filter.matches("app-of-apps"));
  }

  #[tokio::test]
  async fn pushes_manifests_and_sequence_number() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("README.md", "manifests")]);
    let tar = remote.manifests_tar(&[BILLING]);
    let outcome = pusher()
      .push(&remote.request(Some(tar), 7), &CancelToken::new())
      .await
      .unwrap();
    assert!(outcome.pushed);
    assert!(remote.show(BILLING).contains("\"releaseName\": \"billing\""));
    assert!(remote.show("push_state.json").contains("\"sequenceNumber\": 7"));
    assert_eq!(remote.show("README.md"), "manifests");
  }

  #[tokio::test]
  async fn owned_directories_are_replaced() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("README.md", "manifests")]);
    let first = remote.manifests_tar(&[BILLING, COMPUTE]);
    pusher()
      .push(&remote.request(Some(first), 1), &CancelToken::new())
      .await
      .unwrap();

    let second = remote.manifests_tar(&[BILLING]);
    pusher()
      .push(&remote.request(Some(second), 2), &CancelToken::new())
      .await
      .unwrap();
    let files = git(Path::new(&remote.url), &["ls-tree", "-r", "--name-only", "main"]);
    assert!(files.contains(BILLING));
    assert!(!files.contains(COMPUTE), "{}", files);
  }

  #[tokio::test]
  async fn older_run_is_rejected() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("push_state.json", "{\"sequenceNumber\": 5}\n")]);
    let before = remote.head();
    let tar = remote.manifests_tar(&[BILLING]);
    let err = pusher()
      .push(&remote.request(Some(tar), 3), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      GitPushError::SequenceRegression {
        source_sequence_number: 3,
        stored_sequence_number: 5,
        ..
      }
    ));
    assert!(err.is_permanent());
    assert_eq!(remote.head(), before);
  }

  #[tokio::test]
  async fn unchanged_tree_is_not_committed() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("README.md", "manifests")]);
    let before = remote.head();
    // The guard does not apply when there is nothing to push.
    let outcome = pusher()
      .push(&remote.request(None, -1), &CancelToken::new())
      .await
      .unwrap();
    assert!(!outcome.committed);
    assert_eq!(remote.head(), before);
  }

  #[tokio::test]
  async fn dry_run_commits_locally_only() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("README.md", "manifests")]);
    let before = remote.head();
    let request = GitPushRequest {
      dry_run: true,
      ..remote.request(Some(remote.manifests_tar(&[BILLING])), 1)
    };
    let outcome = pusher().push(&request, &CancelToken::new()).await.unwrap();
    assert!(outcome.committed);
    assert!(!outcome.pushed);
    assert_eq!(remote.head(), before);
    assert_eq!(git(&request.clone_dir, &["log", "-1", "--format=%s"]), "Update manifests");
  }

  #[tokio::test]
  async fn matching_applications_are_deleted() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("README.md", "manifests")]);
    pusher()
      .push(
        &remote.request(Some(remote.manifests_tar(&[BILLING, COMPUTE])), 1),
        &CancelToken::new(),
      )
      .await
      .unwrap();

    let request = GitPushRequest {
      delete_applications: Some(ApplicationFilter::new(
        Regex::new("compute").unwrap(),
        Regex::new("^app-of-apps$").unwrap(),
      )),
      ..remote.request(None, 2)
    };
    pusher().push(&request, &CancelToken::new()).await.unwrap();
    let files = git(Path::new(&remote.url), &["ls-tree", "-r", "--name-only", "main"]);
    assert!(files.contains(BILLING));
    assert!(!files.contains(COMPUTE));
  }

  #[tokio::test]
  async fn failing_patch_command_aborts() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("README.md", "manifests")]);
    let request = GitPushRequest {
      patch_command: Some(PathBuf::from("/bin/false")),
      ..remote.request(Some(remote.manifests_tar(&[BILLING])), 1)
    };
    let err = pusher().push(&request, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, GitPushError::Patch(_)), "{}", err);
  }

  #[tokio::test]
  async fn new_branch_is_timestamped() {
    if !git_available() {
      return;
    }
    let remote = Remote::new(&[("README.md", "manifests")]);
    let request = GitPushRequest {
      new_branch_prefix: Some("deploy".to_string()),
      ..remote.request(Some(remote.manifests_tar(&[BILLING])), 1)
    };
    let outcome = pusher().push(&request, &CancelToken::new()).await.unwrap();
    assert!(outcome.branch.starts_with("deploy-"));
    let refs = git(Path::new(&remote.url), &["branch", "--list"]);
    assert!(refs.contains(&outcome.branch));
  }
}
