//! Git operations used by reference resolution, config grafting and the
//! manifests pusher.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use super::{CommandEnv, CommandSpec, ProcessError, run};
use crate::cancel::CancelToken;

/// Identity used for commits made by the deployer.
pub const BOT_NAME: &str = "Universe Deployer";
pub const BOT_EMAIL: &str = "universe-deployer@localhost";

#[async_trait]
pub trait GitRunner: Send + Sync {
  /// Map of reference name (`refs/heads/main` and `main`) to commit hash.
  async fn ls_remote(
    &self,
    repo_dir: &Path,
    remote: &str,
    token: &CancelToken,
  ) -> Result<BTreeMap<String, String>, ProcessError>;

  /// Shallow clone of a single branch into `dest`.
  async fn clone_branch(&self, remote: &str, branch: &str, dest: &Path, token: &CancelToken)
  -> Result<(), ProcessError>;

  /// Create an empty repository with `branch` checked out.
  async fn init(&self, dir: &Path, branch: &str, token: &CancelToken) -> Result<(), ProcessError>;

  async fn checkout_new_branch(&self, dir: &Path, branch: &str, token: &CancelToken) -> Result<(), ProcessError>;

  async fn add_all(&self, dir: &Path, token: &CancelToken) -> Result<(), ProcessError>;

  async fn has_staged_changes(&self, dir: &Path, token: &CancelToken) -> Result<bool, ProcessError>;

  /// Commit staged changes. Each message becomes one `-m` paragraph.
  async fn commit(&self, dir: &Path, messages: &[String], token: &CancelToken) -> Result<(), ProcessError>;

  /// Push the current HEAD to `branch` on `remote`.
  async fn push(&self, dir: &Path, remote: &str, branch: &str, token: &CancelToken) -> Result<(), ProcessError>;

  /// Make `commit` available locally.
  async fn fetch_commit(&self, repo_dir: &Path, remote: &str, commit: &str, token: &CancelToken)
  -> Result<(), ProcessError>;

  /// Write a tar of `paths` at `commit` to `output`.
  async fn archive(
    &self,
    repo_dir: &Path,
    commit: &str,
    paths: &[&str],
    output: &Path,
    token: &CancelToken,
  ) -> Result<(), ProcessError>;
}

/// [`GitRunner`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
  binary: String,
  env: CommandEnv,
}

impl Default for GitCli {
  fn default() -> Self {
    GitCli::new(CommandEnv::inherit())
  }
}

impl GitCli {
  pub fn new(env: CommandEnv) -> Self {
    GitCli {
      binary: "git".to_string(),
      env,
    }
  }

  fn command(&self, dir: &Path) -> CommandSpec {
    CommandSpec::new(&self.binary).current_dir(dir).env(self.env.clone())
  }
}

#[async_trait]
impl GitRunner for GitCli {
  async fn ls_remote(
    &self,
    repo_dir: &Path,
    remote: &str,
    token: &CancelToken,
  ) -> Result<BTreeMap<String, String>, ProcessError> {
    let spec = self.command(repo_dir).args(["ls-remote", remote]);
    let output = run(&spec, token).await?;
    parse_ls_remote(&output.stdout).map_err(|message| ProcessError::Parse {
      command: spec.display(),
      message,
    })
  }

  async fn clone_branch(
    &self,
    remote: &str,
    branch: &str,
    dest: &Path,
    token: &CancelToken,
  ) -> Result<(), ProcessError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let spec = self
      .command(parent)
      .args(["clone", "--depth", "1", "--single-branch", "--branch", branch, remote])
      .arg(dest);
    run(&spec, token).await.map(|_| ())
  }

  async fn init(&self, dir: &Path, branch: &str, token: &CancelToken) -> Result<(), ProcessError> {
    let spec = self.command(dir).args(["init", "--initial-branch", branch, "."]);
    run(&spec, token).await.map(|_| ())
  }

  async fn checkout_new_branch(&self, dir: &Path, branch: &str, token: &CancelToken) -> Result<(), ProcessError> {
    let spec = self.command(dir).args(["checkout", "-b", branch]);
    run(&spec, token).await.map(|_| ())
  }

  async fn add_all(&self, dir: &Path, token: &CancelToken) -> Result<(), ProcessError> {
    let spec = self.command(dir).args(["add", "--all"]);
    run(&spec, token).await.map(|_| ())
  }

  async fn has_staged_changes(&self, dir: &Path, token: &CancelToken) -> Result<bool, ProcessError> {
    let spec = self.command(dir).args(["diff", "--cached", "--quiet"]);
    match run(&spec, token).await {
      Ok(_) => Ok(false),
      Err(ProcessError::Failed { code: Some(1), .. }) => Ok(true),
      Err(err) => Err(err),
    }
  }

  async fn commit(&self, dir: &Path, messages: &[String], token: &CancelToken) -> Result<(), ProcessError> {
    let mut spec = self.command(dir).args([
      "-c",
      format!("user.name={}", BOT_NAME).as_str(),
      "-c",
      format!("user.email={}", BOT_EMAIL).as_str(),
      "commit",
    ]);
    for message in messages {
      spec = spec.args(["-m", message.as_str()]);
    }
    run(&spec, token).await.map(|_| ())
  }

  async fn push(&self, dir: &Path, remote: &str, branch: &str, token: &CancelToken) -> Result<(), ProcessError> {
    let spec = self
      .command(dir)
      .args(["push", remote, format!("HEAD:refs/heads/{}", branch).as_str()]);
    run(&spec, token).await.map(|_| ())
  }

  async fn fetch_commit(
    &self,
    repo_dir: &Path,
    remote: &str,
    commit: &str,
    token: &CancelToken,
  ) -> Result<(), ProcessError> {
    let spec = self.command(repo_dir).args(["fetch", "--depth", "1", remote, commit]);
    run(&spec, token).await.map(|_| ())
  }

  async fn archive(
    &self,
    repo_dir: &Path,
    commit: &str,
    paths: &[&str],
    output: &Path,
    token: &CancelToken,
  ) -> Result<(), ProcessError> {
    let spec = self
      .command(repo_dir)
      .args(["archive", "--format", "tar", "--output"])
      .arg(output)
      .arg(commit)
      .arg("--")
      .args(paths.iter().copied());
    run(&spec, token).await.map(|_| ())
  }
}

/// Parse `git ls-remote` output. Branches and tags are also reachable by
/// short name; for annotated tags the peeled commit wins.
pub fn parse_ls_remote(output: &str) -> Result<BTreeMap<String, String>, String> {
  let mut refs = BTreeMap::new();
  let mut peeled = BTreeMap::new();
  for line in output.lines().filter(|line| !line.trim().is_empty()) {
    let Some((hash, name)) = line.split_once('\t') else {
      return Err(format!("unexpected line '{}'", line));
    };
    let (name, is_peeled) = match name.strip_suffix("^{}") {
      Some(name) => (name, true),
      None => (name, false),
    };
    let mut names = vec![name.to_string()];
    if let Some(short) = name.strip_prefix("refs/heads/").or_else(|| name.strip_prefix("refs/tags/")) {
      names.push(short.to_string());
    }
    for name in names {
      if is_peeled {
        peeled.insert(name, hash.to_string());
      } else {
        refs.entry(name).or_insert_with(|| hash.to_string());
      }
    }
  }
  refs.extend(peeled);
  Ok(refs)
}

#[cfg(test)]
pub mod fake {
  //! In-memory [`GitRunner`] for tests.

  use std::collections::BTreeMap;
  use std::path::{Path, PathBuf};
  use std::sync::Mutex;

  use async_trait::async_trait;

  use super::GitRunner;
  use crate::cancel::CancelToken;
  use crate::process::ProcessError;
  use crate::util::tar::create_deterministic;

  #[derive(Default)]
  pub struct FakeGit {
    remote_refs: BTreeMap<String, String>,
    /// Directory whose contents `archive` returns for a commit.
    trees: BTreeMap<String, PathBuf>,
    calls: Mutex<Vec<String>>,
  }

  impl FakeGit {
    pub fn with_remote_ref(mut self, name: &str, commit: &str) -> Self {
      self.remote_refs.insert(name.to_string(), commit.to_string());
      self
    }

    pub fn with_tree(mut self, commit: &str, dir: &Path) -> Self {
      self.trees.insert(commit.to_string(), dir.to_path_buf());
      self
    }

    pub fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
      self.calls.lock().unwrap().push(call);
    }
  }

  fn unsupported(what: &str) -> ProcessError {
    ProcessError::Failed {
      command: format!("fake git {}", what),
      code: Some(128),
      stderr: "not supported by FakeGit".to_string(),
    }
  }

  #[async_trait]
  impl GitRunner for FakeGit {
    async fn ls_remote(&self, _: &Path, remote: &str, _: &CancelToken) -> Result<BTreeMap<String, String>, ProcessError> {
      self.record(format!("ls-remote {}", remote));
      Ok(self.remote_refs.clone())
    }

    async fn clone_branch(&self, _: &str, _: &str, _: &Path, _: &CancelToken) -> Result<(), ProcessError> {
      Err(unsupported("clone"))
    }

    async fn init(&self, _: &Path, _: &str, _: &CancelToken) -> Result<(), ProcessError> {
      Err(unsupported("init"))
    }

    async fn checkout_new_branch(&self, _: &Path, _: &str, _: &CancelToken) -> Result<(), ProcessError> {
      Err(unsupported("checkout"))
    }

    async fn add_all(&self, _: &Path, _: &CancelToken) -> Result<(), ProcessError> {
      Err(unsupported("add"))
    }

    async fn has_staged_changes(&self, _: &Path, _: &CancelToken) -> Result<bool, ProcessError> {
      Err(unsupported("diff"))
    }

    async fn commit(&self, _: &Path, _: &[String], _: &CancelToken) -> Result<(), ProcessError> {
      Err(unsupported("commit"))
    }

    async fn push(&self, _: &Path, _: &str, _: &str, _: &CancelToken) -> Result<(), ProcessError> {
      Err(unsupported("push"))
    }

    async fn fetch_commit(&self, _: &Path, remote: &str, commit: &str, _: &CancelToken) -> Result<(), ProcessError> {
      self.record(format!("fetch {} {}", remote, commit));
      Ok(())
    }

    async fn archive(
      &self,
      _: &Path,
      commit: &str,
      _: &[&str],
      output: &Path,
      _: &CancelToken,
    ) -> Result<(), ProcessError> {
      self.record(format!("archive {}", commit));
      let Some(dir) = self.trees.get(commit) else {
        return Err(unsupported("archive of unknown commit"));
      };
      create_deterministic(dir, output).map_err(|err| ProcessError::Failed {
        command: "fake git archive".to_string(),
        code: Some(1),
        stderr: err.to_string(),
      })
    }
  }
}
