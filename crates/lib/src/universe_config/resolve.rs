use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use super::{UniverseConfigError, WalkComponents};
use crate::cancel::CancelToken;
use crate::process::git::GitRunner;

/// Replace branch and tag names in commits and config commits with the
/// hashes they point to on `remote`. Hashes and `HEAD` are left alone. Any
/// reference that the remote does not know is fatal.
pub async fn resolve_references<W: WalkComponents>(
  tree: &mut W,
  git: &dyn GitRunner,
  repo_dir: &Path,
  remote: &str,
  token: &CancelToken,
) -> Result<(), UniverseConfigError> {
  let references = tree.unresolved_references();
  if references.is_empty() {
    return Ok(());
  }

  let remote_refs = git
    .ls_remote(repo_dir, remote, token)
    .await
    .map_err(|source| UniverseConfigError::LsRemote {
      remote: remote.to_string(),
      source,
    })?;

  let mut resolved = BTreeMap::new();
  for reference in references {
    let Some(commit) = remote_refs.get(&reference) else {
      return Err(UniverseConfigError::UnresolvedReference {
        reference,
        remote: remote.to_string(),
      });
    };
    resolved.insert(reference, commit.clone());
  }
  info!(resolved = ?resolved, "Git references resolved");

  tree.replace_commits(&resolved);
  tree.replace_config_commits(&resolved);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::HEAD;
  use crate::process::git::fake::FakeGit;
  use crate::universe_config::{UniverseComponent, UniverseConfig, UniverseEnvironment};
  use crate::util::testutil::fake_commit;

  fn config_with(commit: &str, config_commit: &str) -> UniverseConfig {
    let mut config = UniverseConfig::default();
    config.environments.insert(
      "dev".to_string(),
      UniverseEnvironment {
        components: BTreeMap::from([(
          "compute".to_string(),
          UniverseComponent {
            commit: commit.to_string(),
            config_commit: config_commit.to_string(),
            ..Default::default()
          },
        )]),
        ..Default::default()
      },
    );
    config
  }

  #[tokio::test]
  async fn resolves_branches_in_commit_and_config_commit() {
    let git = FakeGit::default()
      .with_remote_ref("main", &fake_commit('1'))
      .with_remote_ref("v1.0", &fake_commit('2'));
    let mut config = config_with("main", "v1.0");

    resolve_references(&mut config, &git, Path::new("."), "origin", &CancelToken::new())
      .await
      .unwrap();

    let component = &config.environments["dev"].components["compute"];
    assert_eq!(component.commit, fake_commit('1'));
    assert_eq!(component.config_commit, fake_commit('2'));
  }

  #[tokio::test]
  async fn skips_ls_remote_when_everything_is_resolved() {
    let git = FakeGit::default();
    let mut config = config_with(HEAD, "");

    resolve_references(&mut config, &git, Path::new("."), "origin", &CancelToken::new())
      .await
      .unwrap();
    assert_eq!(git.calls(), Vec::<String>::new());
  }

  #[tokio::test]
  async fn unknown_reference_is_fatal() {
    let git = FakeGit::default().with_remote_ref("main", &fake_commit('1'));
    let mut config = config_with("feature/missing", "");

    let err = resolve_references(&mut config, &git, Path::new("."), "origin", &CancelToken::new())
      .await
      .unwrap_err();
    assert_eq!(
      err.to_string(),
      "unable to resolve reference 'feature/missing' using 'git ls-remote origin'"
    );
  }
}
