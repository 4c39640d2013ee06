//! Rendering of one commit's manifests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ChartReference, ConfigFileData, Envconfig, Manifest, Manifests, RenderError, io_error, make_secrets, write_config_json_files};
use crate::cancel::CancelToken;
use crate::config::{DeploymentArtifactsConfig, registry_host};
use crate::consts::{
  ARGO_CD_CONFIG_FILE_NAME, ARTIFACTS_CONFIG_FILE, HELM_BINARY, HELM_CHART_VERSIONS_DIR, HELMFILE_BINARY,
  HELMFILE_CONFIG_DIR, RENDERER_BINARY,
};
use crate::process::helmfile::{ChartRenderer, HelmRelease, HelmfileInvocation};
use crate::process::{CommandEnv, CommandSpec, run};
use crate::task_group::TaskGroup;
use crate::universe_config::{UniverseConfig, UniverseEnvironment};
use crate::util::tar::create_deterministic;

/// Chart name prefix used when a chart is served from the default registry.
const DEFAULT_REGISTRY_CHART_PREFIX: &str = "intelcloud/";

/// Inputs for rendering one `(commit, configCommit)` of one or all components.
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
  pub commit: String,
  pub config_commit: String,
  /// Empty renders every component with `helmfile.yaml`; one component uses
  /// `helmfile-<component>.yaml`.
  pub components: Vec<String>,
  /// Extracted deployment artifacts (binaries and helmfile config).
  pub artifacts_dir: PathBuf,
  pub universe_config_file: PathBuf,
  /// Overrides the registry derived from each environment's Helm repository.
  pub default_chart_registry: String,
  pub secrets_dir: Option<PathBuf>,
  /// Manifests tar to write.
  pub output: PathBuf,
  /// Render the Universe Config as is instead of trimming it to `commit`.
  pub snapshot: bool,
  pub cluster_prefix: String,
  pub test_environment_id: String,
}

/// Renders a commit's manifests into `request.output`.
#[async_trait]
pub trait CommitManifestsRenderer: Send + Sync {
  async fn render(&self, request: &RenderRequest, token: &CancelToken) -> Result<(), RenderError>;
}

/// Helmfile selectors of one environment, grouped by output layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selectors {
  pub global: Vec<String>,
  /// Regional and availability zone releases share a layout.
  pub regional: Vec<String>,
  pub network: Vec<String>,
}

impl Selectors {
  pub fn for_environment(environment: &UniverseEnvironment) -> Self {
    if environment.force_all_components {
      return Selectors {
        global: vec!["geographicScope=global".to_string()],
        regional: vec!["geographicScope=regional".to_string(), "geographicScope=az".to_string()],
        network: vec!["geographicScope=az-network".to_string()],
      };
    }

    let mut selectors = Selectors::default();
    for component in environment.components.keys() {
      selectors
        .global
        .push(format!("geographicScope=global,component={}", component));
    }
    for (region, universe_region) in &environment.regions {
      for component in universe_region.components.keys() {
        selectors
          .regional
          .push(format!("geographicScope=regional,region={},component={}", region, component));
      }
      for (availability_zone, universe_az) in &universe_region.availability_zones {
        for component in universe_az.components.keys() {
          selectors.regional.push(format!(
            "geographicScope=az,region={},availabilityZone={},component={}",
            region, availability_zone, component
          ));
          selectors.network.push(format!(
            "geographicScope=az-network,region={},availabilityZone={},component={}",
            region, availability_zone, component
          ));
        }
      }
    }
    selectors
  }

  pub fn all(&self) -> Vec<String> {
    [&self.global, &self.regional, &self.network]
      .into_iter()
      .flatten()
      .cloned()
      .collect()
  }

  /// `(description, selectors, output file template)` for every non-empty group.
  fn write_values_groups(&self, manifest_dir: &Path) -> Vec<(&'static str, Vec<String>, String)> {
    let dir = manifest_dir.display();
    let release = "{{ .Release.Labels.kubeContext }}/{{ .Release.Name }}/values.yaml";
    [
      (
        "manifests generator, global",
        &self.global,
        format!("{}/applications/idc-global-services/{{{{ .Release.Labels.environmentName }}}}/{}", dir, release),
      ),
      (
        "manifests generator, regional",
        &self.regional,
        format!("{}/applications/idc-regional/{{{{ .Release.Labels.region }}}}/{}", dir, release),
      ),
      (
        "manifests generator, network",
        &self.network,
        format!("{}/applications/idc-network/{{{{ .Release.Labels.region }}}}/{}", dir, release),
      ),
    ]
    .into_iter()
    .filter(|(_, selectors, _)| !selectors.is_empty())
    .map(|(description, selectors, template)| (description, selectors.clone(), template))
    .collect()
  }
}

fn parse_labels(labels: &str) -> BTreeMap<&str, &str> {
  labels
    .split(',')
    .filter_map(|pair| pair.split_once(':'))
    .collect()
}

/// Convert helmfile releases into manifests with their canonical paths and
/// resolved chart registries.
#[allow(clippy::too_many_arguments)]
pub fn helm_releases_to_manifests(
  releases: &[HelmRelease],
  repo_to_registry: &BTreeMap<String, String>,
  default_chart_registry: &str,
  environment: &str,
  artifacts_config_file: &Path,
  commit: &str,
  config_commit: &str,
) -> Result<Manifests, RenderError> {
  let mut manifests = Manifests::default();
  for release in releases {
    let labels = parse_labels(&release.labels);
    debug!(release = %release.name, labels = ?labels, "release labels");
    let label = |name: &str| labels.get(name).copied().unwrap_or_default();

    let kube_context = label("kubeContext");
    if kube_context.is_empty() {
      return Err(RenderError::MissingKubeContext {
        release: release.name.clone(),
      });
    }

    // "idc-networking/amd64/ovn-central" is repo "idc-networking", chart "amd64/ovn-central".
    let Some((repo, chart_name)) = release.chart.split_once('/') else {
      return Err(RenderError::InvalidChart {
        chart: release.chart.clone(),
      });
    };

    // Charts of a repository with its own registry keep their name; all
    // others are served from the default registry under a common prefix.
    let from_default = ChartReference {
      registry: default_chart_registry.to_string(),
      name: format!("{}{}", DEFAULT_REGISTRY_CHART_PREFIX, chart_name),
      version: release.version.clone(),
    };
    let chart = match repo_to_registry.get(repo) {
      Some(registry) if !registry.is_empty() => from_default.merge(&ChartReference {
        registry: registry.clone(),
        name: chart_name.to_string(),
        version: String::new(),
      }),
      _ if default_chart_registry.is_empty() => {
        return Err(RenderError::MissingRegistry {
          repo: repo.to_string(),
          environment: environment.to_string(),
          config_file: artifacts_config_file.to_path_buf(),
        });
      }
      _ => from_default,
    };

    let scope_dir = match label("geographicScope") {
      "global" => {
        let environment_name = label("environmentName");
        if environment_name.is_empty() {
          return Err(RenderError::MissingEnvironmentName {
            release: release.name.clone(),
          });
        }
        format!("applications/idc-global-services/{}", environment_name)
      }
      scope @ ("regional" | "az" | "az-network") => {
        let region = label("region");
        if region.is_empty() {
          return Err(RenderError::MissingRegion {
            release: release.name.clone(),
          });
        }
        let layout = if scope == "az-network" { "idc-network" } else { "idc-regional" };
        format!("applications/{}/{}", layout, region)
      }
      scope => {
        return Err(RenderError::UnknownScope {
          scope: scope.to_string(),
        });
      }
    };

    manifests.manifests.push(Manifest {
      config_commit: config_commit.to_string(),
      config_file_data: ConfigFileData {
        envconfig: Envconfig {
          release_name: release.name.clone(),
          chart_name: chart.name,
          chart_version: chart.version,
          chart_registry: chart.registry,
          namespace: release.namespace.clone(),
          git_commit: commit.to_string(),
          config_commit: config_commit.to_string(),
        },
      },
      config_file_name: format!(
        "{}/{}/{}/{}",
        scope_dir, kube_context, release.name, ARGO_CD_CONFIG_FILE_NAME
      ),
      git_commit: commit.to_string(),
      kube_context: kube_context.to_string(),
    });
  }
  manifests.sort();
  Ok(manifests)
}

fn helmfile_config_file(components: &[String]) -> Result<String, RenderError> {
  match components {
    [] => Ok("helmfile.yaml".to_string()),
    [component] => Ok(format!("helmfile-{}.yaml", component)),
    _ => Err(RenderError::TooManyComponents),
  }
}

/// Renders in-process by driving helmfile from the extracted artifacts.
pub struct HelmfileManifestsRenderer {
  chart_renderer: Arc<dyn ChartRenderer>,
  env: CommandEnv,
}

impl HelmfileManifestsRenderer {
  pub fn new(chart_renderer: Arc<dyn ChartRenderer>, env: CommandEnv) -> Self {
    HelmfileManifestsRenderer { chart_renderer, env }
  }

  /// Render and also return the manifests.
  pub async fn generate(&self, request: &RenderRequest, token: &CancelToken) -> Result<Manifests, RenderError> {
    info!(commit = %request.commit, config_commit = %request.config_commit, "BEGIN");
    let start = Instant::now();

    if request.artifacts_dir.as_os_str().is_empty() {
      return Err(RenderError::RequiredParameter { name: "artifacts_dir" });
    }
    let config_file = helmfile_config_file(&request.components)?;

    let universe_config = UniverseConfig::read_file(&request.universe_config_file)?;
    let universe_config = if request.snapshot {
      universe_config
    } else {
      universe_config.trimmed(&request.commit)
    };
    debug!(universe_config = %universe_config.to_json(), "universe config");

    let temp = tempfile::Builder::new()
      .prefix("universe_deployer_manifests_generator_")
      .tempdir()
      .map_err(io_error(&request.output))?;

    let artifacts_dir = &request.artifacts_dir;
    let artifacts_config_file = artifacts_dir.join(ARTIFACTS_CONFIG_FILE);
    let artifacts_config = DeploymentArtifactsConfig::read_file(&artifacts_config_file)?;
    let repo_to_registry = artifacts_config.repo_to_registry();

    let secrets_dir = request
      .secrets_dir
      .clone()
      .unwrap_or_else(|| temp.path().join("local/secrets"));

    let env = self
      .env
      .with("CONFIG_COMMIT", request.config_commit.as_str())
      .with("GIT_COMMIT", request.commit.as_str())
      .with_path("HELM_CHART_VERSIONS_DIR", &artifacts_dir.join(HELM_CHART_VERSIONS_DIR))
      .with_path("SECRETS_DIR", &secrets_dir);

    let manifest_dir = temp.path().join("manifests");
    std::fs::create_dir_all(&manifest_dir).map_err(io_error(&manifest_dir))?;

    let mut manifests = Manifests::default();
    for (environment, universe_environment) in &universe_config.environments {
      info!(environment = %environment, force_all_components = universe_environment.force_all_components, "processing environment");
      let Some(artifacts_environment) = artifacts_config.environments.get(environment) else {
        return Err(RenderError::EnvironmentNotFound {
          environment: environment.clone(),
          config_file: artifacts_config_file.clone(),
        });
      };

      let invocation = HelmfileInvocation {
        helmfile_binary: artifacts_dir.join(HELMFILE_BINARY),
        helm_binary: artifacts_dir.join(HELM_BINARY),
        config_dir: artifacts_dir.join(HELMFILE_CONFIG_DIR),
        config_file: config_file.clone(),
        environment: environment.clone(),
        env: env.clone(),
      };
      let selectors = Selectors::for_environment(universe_environment);
      debug!(selectors = ?selectors, "selectors");

      let version = self.chart_renderer.version(&invocation, token).await?;
      info!(version = %version, "helmfile");

      make_secrets(&artifacts_environment.regions, &secrets_dir)?;

      let releases = self
        .render_environment(&invocation, &selectors, &manifest_dir, token)
        .await?;

      let default_chart_registry = if request.default_chart_registry.is_empty() {
        registry_host(&artifacts_environment.idc_helm_repository_url)?
      } else {
        request.default_chart_registry.clone()
      };
      info!(default_chart_registry = %default_chart_registry, "chart registry");

      let environment_manifests = helm_releases_to_manifests(
        &releases,
        &repo_to_registry,
        &default_chart_registry,
        environment,
        &artifacts_config_file,
        &request.commit,
        &request.config_commit,
      )?;
      write_config_json_files(&environment_manifests, &manifest_dir)?;
      manifests.extend(environment_manifests);
    }

    create_deterministic(&manifest_dir, &request.output)?;
    manifests.sort();
    info!(
      output = %request.output.display(),
      count = manifests.len(),
      duration = ?start.elapsed(),
      "END"
    );
    Ok(manifests)
  }

  /// List releases and write their values concurrently.
  async fn render_environment(
    &self,
    invocation: &HelmfileInvocation,
    selectors: &Selectors,
    manifest_dir: &Path,
    token: &CancelToken,
  ) -> Result<Vec<HelmRelease>, RenderError> {
    let mut group: TaskGroup<Option<Vec<HelmRelease>>> = TaskGroup::new(token);

    for (description, group_selectors, template) in selectors.write_values_groups(manifest_dir) {
      let renderer = self.chart_renderer.clone();
      let invocation = invocation.clone();
      group.spawn(description, move |token| async move {
        renderer
          .write_values(&invocation, &group_selectors, &template, &token)
          .await
          .map(|()| None)
      });
    }

    let renderer = self.chart_renderer.clone();
    let list_invocation = invocation.clone();
    let all = selectors.all();
    group.spawn("list releases", move |token| async move {
      renderer
        .list_releases(&list_invocation, &all, &token)
        .await
        .map(Some)
    });

    let outputs = group.wait().await?;
    Ok(outputs.into_iter().flatten().next().unwrap_or_default())
  }
}

#[async_trait]
impl CommitManifestsRenderer for HelmfileManifestsRenderer {
  async fn render(&self, request: &RenderRequest, token: &CancelToken) -> Result<(), RenderError> {
    self.generate(request, token).await.map(|_| ())
  }
}

/// Runs the renderer binary shipped inside the commit's own deployment
/// artifacts, so every commit is rendered by the code it was built with.
#[derive(Debug, Clone)]
pub struct ArtifactBinaryRenderer {
  env: CommandEnv,
}

impl ArtifactBinaryRenderer {
  pub fn new(env: CommandEnv) -> Self {
    ArtifactBinaryRenderer { env }
  }

  pub fn command(&self, request: &RenderRequest) -> CommandSpec {
    let mut spec = CommandSpec::new(request.artifacts_dir.join(RENDERER_BINARY))
      .current_dir(&request.artifacts_dir)
      .env(
        self
          .env
          .with("CLUSTER_PREFIX", request.cluster_prefix.as_str())
          .with("TEST_ENVIRONMENT_ID", request.test_environment_id.as_str()),
      )
      .arg("render-manifests")
      .args(["--commit", request.commit.as_str()])
      .arg("--commit-dir")
      .arg(&request.artifacts_dir)
      .args(["--config-commit", request.config_commit.as_str()]);
    for component in &request.components {
      spec = spec.args(["--component", component.as_str()]);
    }
    spec = spec
      .args(["--default-chart-registry", request.default_chart_registry.as_str()])
      .arg("--output")
      .arg(&request.output);
    if let Some(secrets_dir) = &request.secrets_dir {
      spec = spec.arg("--secrets-dir").arg(secrets_dir);
    }
    spec.arg("--universe-config").arg(&request.universe_config_file)
  }
}

#[async_trait]
impl CommitManifestsRenderer for ArtifactBinaryRenderer {
  async fn render(&self, request: &RenderRequest, token: &CancelToken) -> Result<(), RenderError> {
    run(&self.command(request), token).await?;
    Ok(())
  }
}
