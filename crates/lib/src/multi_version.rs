//! Manifests for every component version referenced by a Universe Config.
//!
//! Each distinct `(component, commit, configCommit)` is rendered on its own by
//! the renderer that shipped with that commit, and the per-tuple manifest tars
//! are cached. Finished tuples are sent over a channel to a single combiner
//! task. Once every sender is gone the combiner extracts the per-tuple tars
//! in tuple order, so collisions always resolve the same way.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactError, ArtifactSource, deployment_artifacts_file_name};
use crate::cache::{Cache, CacheError, Hasher};
use crate::cancel::CancelToken;
use crate::consts::{CONFIG_DIRS, MULTI_VERSION_CACHE_SUBDIR};
use crate::manifests::{CommitManifestsRenderer, Manifests, RenderError, RenderRequest};
use crate::process::ProcessError;
use crate::process::git::GitRunner;
use crate::task_group::{TaskGroup, TaskGroupError};
use crate::universe_config::{ComponentCommit, ComponentCommitsMode, UniverseConfig, UniverseConfigError, WalkComponents};
use crate::util::fs::{copy_dir, make_writable_all, remove_dir_all_if_exists};
use crate::util::tar::{TarError, create_deterministic, extract};

#[derive(Debug, Error)]
pub enum GeneratorError {
  #[error(
    "deployment artifacts for component {component}, commit {commit} must be downloaded but ArtifactRepositoryUrl is empty"
  )]
  NoArtifactRepository { component: String, commit: String },

  #[error("commit 'HEAD' specified but HeadDeploymentArtifactsTar '{path}' is invalid")]
  InvalidHeadTar { path: PathBuf },

  #[error("deployment artifacts for component {component}, commit {commit}: {source}")]
  Artifact {
    component: String,
    commit: String,
    #[source]
    source: ArtifactError,
  },

  #[error("config commit {config_commit}: {source}")]
  ConfigCommit {
    config_commit: String,
    #[source]
    source: ProcessError,
  },

  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  UniverseConfig(#[from] UniverseConfigError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Render(#[from] RenderError),

  #[error(transparent)]
  Tar(#[from] TarError),

  #[error(transparent)]
  Tasks(#[from] TaskGroupError),

  #[error("manifests combiner stopped before {component_commit} was received")]
  CombinerClosed { component_commit: String },

  #[error("manifests combiner failed: {0}")]
  Combiner(#[from] JoinError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> GeneratorError + '_ {
  move |source| GeneratorError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// An artifact that the repository does not have.
#[derive(Debug)]
pub struct NotFoundError {
  pub component: String,
  pub commit: String,
  pub error: ArtifactError,
}

impl NotFoundError {
  pub fn component_commit(&self) -> ComponentCommit {
    ComponentCommit {
      component: self.component.clone(),
      commit: self.commit.clone(),
      config_commit: String::new(),
    }
  }
}

/// The rendered manifests of one tuple, tagged with the tuple's position in
/// sort order.
struct TupleManifests {
  index: usize,
  tar: PathBuf,
  manifests: Manifests,
}

/// Receive every tuple until all senders are dropped, then extract the tars
/// in tuple order into `combined_dir`.
async fn combine(mut results: mpsc::Receiver<TupleManifests>, combined_dir: PathBuf) -> Result<Manifests, GeneratorError> {
  let mut received = Vec::new();
  while let Some(tuple) = results.recv().await {
    debug!(index = tuple.index, manifests = tuple.manifests.len(), "combining");
    received.push(tuple);
  }
  received.sort_by_key(|tuple| tuple.index);

  std::fs::create_dir_all(&combined_dir).map_err(io_error(&combined_dir))?;
  let mut manifests = Manifests::default();
  for tuple in received {
    extract(&tuple.tar, &combined_dir)?;
    manifests.extend(tuple.manifests);
  }
  manifests.sort();
  Ok(manifests)
}

/// Inputs that are the same for every tuple.
#[derive(Debug, Clone, Default)]
pub struct GeneratorSettings {
  /// The working tree commit. Tuples at this commit use
  /// `head_deployment_artifacts_tar` instead of a download.
  pub head_commit: String,
  pub head_deployment_artifacts_tar: Option<PathBuf>,
  /// Git repository used to archive config commits.
  pub repo_dir: PathBuf,
  /// Remote to fetch config commits from. Empty skips the fetch.
  pub config_commit_git_remote: String,
  pub default_chart_registry: String,
  pub secrets_dir: Option<PathBuf>,
  pub cluster_prefix: String,
  pub test_environment_id: String,
  /// Maximum concurrent tuples; zero means unlimited.
  pub parallelism: usize,
}

#[derive(Clone)]
pub struct MultiVersionManifestsGenerator {
  settings: Arc<GeneratorSettings>,
  cache: Cache,
  artifact_source: Option<Arc<dyn ArtifactSource>>,
  renderer: Arc<dyn CommitManifestsRenderer>,
  git: Arc<dyn GitRunner>,
}

impl MultiVersionManifestsGenerator {
  /// `cache_dir` is the shared cache root; entries go in a versioned subdir.
  pub fn new(
    settings: GeneratorSettings,
    cache_dir: &Path,
    artifact_source: Option<Arc<dyn ArtifactSource>>,
    renderer: Arc<dyn CommitManifestsRenderer>,
    git: Arc<dyn GitRunner>,
  ) -> Result<Self, GeneratorError> {
    Ok(MultiVersionManifestsGenerator {
      settings: Arc::new(settings),
      cache: Cache::new(cache_dir.join(MULTI_VERSION_CACHE_SUBDIR))?,
      artifact_source,
      renderer,
      git,
    })
  }

  fn is_head(&self, commit: &str) -> bool {
    !self.settings.head_commit.is_empty() && commit == self.settings.head_commit
  }

  /// Render every tuple of `universe_config` and write the combined tar to
  /// `output`.
  pub async fn generate_manifests(
    &self,
    universe_config: &UniverseConfig,
    output: &Path,
    token: &CancelToken,
  ) -> Result<Manifests, GeneratorError> {
    info!("BEGIN");
    let start = Instant::now();

    let mut universe_config = universe_config.clone();
    universe_config.normalize();
    universe_config.validate_commits()?;
    let component_commits = universe_config.component_commits(ComponentCommitsMode::IncludeAll);
    debug!(component_commits = ?component_commits, "component commits");

    let temp = tempfile::Builder::new()
      .prefix("universe_deployer_multi_version_")
      .tempdir()
      .map_err(io_error(output))?;
    let temp_dir = Arc::new(temp.path().to_path_buf());
    let universe_config = Arc::new(universe_config);

    let (sender, receiver) = mpsc::channel(component_commits.len().max(1));
    let combiner = tokio::spawn(combine(receiver, temp.path().join("manifests")));

    let mut group: TaskGroup<()> = match self.settings.parallelism {
      0 => TaskGroup::new(token),
      limit => TaskGroup::with_limit(token, limit),
    };
    for (index, component_commit) in component_commits.iter().enumerate() {
      let generator = self.clone();
      let component_commit = component_commit.clone();
      let universe_config = universe_config.clone();
      let temp_dir = temp_dir.clone();
      let sender = sender.clone();
      group.spawn(component_commit.to_string(), move |token| async move {
        let (tar, manifests) = generator
          .generate_component_commit(&component_commit, &universe_config, &temp_dir, &token)
          .await?;
        sender
          .send(TupleManifests { index, tar, manifests })
          .await
          .map_err(|_| GeneratorError::CombinerClosed {
            component_commit: component_commit.to_string(),
          })
      });
    }
    // The combiner finishes once the last task has dropped its sender.
    drop(sender);

    if let Err(err) = group.wait().await {
      combiner.abort();
      return Err(err.into());
    }
    let manifests = combiner.await??;
    create_deterministic(&temp.path().join("manifests"), output)?;

    info!(
      output = %output.display(),
      component_commits = component_commits.len(),
      manifests = manifests.len(),
      duration = ?start.elapsed(),
      "END"
    );
    Ok(manifests)
  }

  async fn generate_component_commit(
    &self,
    component_commit: &ComponentCommit,
    universe_config: &UniverseConfig,
    temp_dir: &Path,
    token: &CancelToken,
  ) -> Result<(PathBuf, Manifests), GeneratorError> {
    let ComponentCommit {
      component,
      commit,
      config_commit,
    } = component_commit;
    info!(component, commit, config_commit, "BEGIN");
    let start = Instant::now();

    let trimmed = universe_config.filtered(|name, c| {
      name == component.as_str() && c.commit == *commit && c.config_commit == *config_commit
    });
    let trimmed_file = temp_dir.join(format!("universe_config_{}_{}_{}.json", component, commit, config_commit));
    trimmed.write_file(&trimmed_file)?;

    let mut hasher = Hasher::new();
    hasher
      .add_string("commit", commit)
      .add_string("component", component)
      .add_string("configCommit", config_commit)
      .add_string("DefaultChartRegistry", &self.settings.default_chart_registry);
    hasher.add_file("universeConfigFile", &trimmed_file)?;
    let cache_key = format!("manifests_{}.tar", hasher.sum());

    let cached = if self.cache.is_cached(&cache_key)? {
      info!(component, commit, config_commit, cache_key = %cache_key, "cache hit");
      self.cache.file(&cache_key)?
    } else {
      let temp_path = self.cache.temp_file_path(&cache_key)?;
      self
        .render_component_commit(component_commit, &trimmed_file, temp_dir, &temp_path, token)
        .await?;
      self.cache.move_file_to_cache(&cache_key, &temp_path)?
    };

    let tar = temp_dir.join(format!("manifests_{}_{}_{}.tar", component, commit, config_commit));
    std::fs::copy(&cached, &tar).map_err(io_error(&tar))?;
    let manifests = Manifests::from_tar(&tar, commit, config_commit)?;

    info!(component, commit, config_commit, manifests = manifests.len(), duration = ?start.elapsed(), "END");
    Ok((tar, manifests))
  }

  async fn render_component_commit(
    &self,
    component_commit: &ComponentCommit,
    universe_config_file: &Path,
    temp_dir: &Path,
    output: &Path,
    token: &CancelToken,
  ) -> Result<(), GeneratorError> {
    let ComponentCommit {
      component,
      commit,
      config_commit,
    } = component_commit;
    let work_dir = temp_dir.join(component).join(commit).join(config_commit);
    let artifacts_dir = work_dir.join("deployment_artifacts");
    std::fs::create_dir_all(&artifacts_dir).map_err(io_error(&artifacts_dir))?;

    let artifacts_tar = self.deployment_artifacts_tar(component, commit, token).await?;
    extract(&artifacts_tar, &artifacts_dir)?;

    if !config_commit.is_empty() && config_commit != commit {
      self
        .graft_config_commit(config_commit, &work_dir, &artifacts_dir, token)
        .await?;
    }

    let request = RenderRequest {
      commit: commit.clone(),
      config_commit: config_commit.clone(),
      components: vec![component.clone()],
      artifacts_dir,
      universe_config_file: universe_config_file.to_path_buf(),
      default_chart_registry: self.settings.default_chart_registry.clone(),
      secrets_dir: self.settings.secrets_dir.clone(),
      output: output.to_path_buf(),
      snapshot: false,
      cluster_prefix: self.settings.cluster_prefix.clone(),
      test_environment_id: self.settings.test_environment_id.clone(),
    };
    self.renderer.render(&request, token).await?;
    Ok(())
  }

  /// Replace the config directories of the extracted artifacts with those of
  /// `config_commit`.
  async fn graft_config_commit(
    &self,
    config_commit: &str,
    work_dir: &Path,
    artifacts_dir: &Path,
    token: &CancelToken,
  ) -> Result<(), GeneratorError> {
    info!(config_commit, "using config from config commit");
    let env_config_dir = work_dir.join("env_config");
    std::fs::create_dir_all(&env_config_dir).map_err(io_error(&env_config_dir))?;

    let config_tar = if self.is_head(config_commit) {
      self.head_tar()?
    } else {
      let config_tar = work_dir.join("env_config.tar");
      let git_error = |source| GeneratorError::ConfigCommit {
        config_commit: config_commit.to_string(),
        source,
      };
      let repo_dir = &self.settings.repo_dir;
      if !self.settings.config_commit_git_remote.is_empty() {
        self
          .git
          .fetch_commit(repo_dir, &self.settings.config_commit_git_remote, config_commit, token)
          .await
          .map_err(git_error)?;
      }
      self
        .git
        .archive(repo_dir, config_commit, CONFIG_DIRS, &config_tar, token)
        .await
        .map_err(git_error)?;
      config_tar
    };
    extract(&config_tar, &env_config_dir)?;

    for dir in CONFIG_DIRS {
      let target = artifacts_dir.join(dir);
      let source = env_config_dir.join(dir);
      debug!(target = %target.display(), source = %source.display(), "replacing config directory");
      if target.exists() {
        make_writable_all(&target).map_err(io_error(&target))?;
      }
      remove_dir_all_if_exists(&target).map_err(io_error(&target))?;
      if source.is_dir() {
        copy_dir(&source, &target).map_err(io_error(&target))?;
      } else {
        warn!(config_commit, dir, "config commit has no such directory");
      }
    }
    Ok(())
  }

  fn head_tar(&self) -> Result<PathBuf, GeneratorError> {
    match &self.settings.head_deployment_artifacts_tar {
      Some(path) if path.is_file() => Ok(path.clone()),
      other => Err(GeneratorError::InvalidHeadTar {
        path: other.clone().unwrap_or_default(),
      }),
    }
  }

  /// Local path of the deployment artifacts tar, downloading it into the
  /// cache if needed.
  async fn deployment_artifacts_tar(
    &self,
    component: &str,
    commit: &str,
    token: &CancelToken,
  ) -> Result<PathBuf, GeneratorError> {
    if self.is_head(commit) {
      return self.head_tar();
    }
    self.download_deployment_artifacts(component, commit, token).await
  }

  async fn download_deployment_artifacts(
    &self,
    component: &str,
    commit: &str,
    token: &CancelToken,
  ) -> Result<PathBuf, GeneratorError> {
    let cache_key = deployment_artifacts_file_name(component, commit);
    if self.cache.is_cached(&cache_key)? {
      debug!(component, commit, cache_key = %cache_key, "deployment artifacts cached");
      return Ok(self.cache.file(&cache_key)?);
    }
    let Some(source) = &self.artifact_source else {
      return Err(GeneratorError::NoArtifactRepository {
        component: component.to_string(),
        commit: commit.to_string(),
      });
    };
    let temp_path = self.cache.temp_file_path(&cache_key)?;
    if let Err(source_error) = source.download(component, commit, &temp_path, token).await {
      let _ = std::fs::remove_file(&temp_path);
      return Err(GeneratorError::Artifact {
        component: component.to_string(),
        commit: commit.to_string(),
        source: source_error,
      });
    }
    Ok(self.cache.move_file_to_cache(&cache_key, &temp_path)?)
  }

  /// Download every non-HEAD deployment artifacts tar. Artifacts the
  /// repository does not have are returned instead of failing.
  pub async fn try_download_deployment_artifacts(
    &self,
    universe_config: &UniverseConfig,
    token: &CancelToken,
  ) -> Result<Vec<NotFoundError>, GeneratorError> {
    let mut universe_config = universe_config.clone();
    universe_config.normalize();
    let component_commits = universe_config.component_commits(ComponentCommitsMode::IncludeComponentCommit);

    let mut group: TaskGroup<Option<NotFoundError>> = match self.settings.parallelism {
      0 => TaskGroup::new(token),
      limit => TaskGroup::with_limit(token, limit),
    };
    for component_commit in component_commits {
      if self.is_head(&component_commit.commit) {
        continue;
      }
      let generator = self.clone();
      group.spawn(
        format!("download {}:{}", component_commit.component, component_commit.commit),
        move |token| async move {
          let ComponentCommit { component, commit, .. } = component_commit;
          match generator.download_deployment_artifacts(&component, &commit, &token).await {
            Ok(_) => Ok(None),
            Err(GeneratorError::Artifact { source, .. }) if source.is_not_found() => {
              info!(component, commit, "deployment artifacts not found");
              Ok(Some(NotFoundError {
                component,
                commit,
                error: source,
              }))
            }
            Err(err) => Err(err),
          }
        },
      );
    }
    let not_found: Vec<NotFoundError> = group.wait().await?.into_iter().flatten().collect();
    info!(not_found = not_found.len(), "download complete");
    Ok(not_found)
  }
}
