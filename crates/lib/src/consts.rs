//! Names and paths shared by every stage of the pipeline.

pub const APP_NAME: &str = "universe-deployer";

/// Symbolic commit that refers to the working tree being deployed.
pub const HEAD: &str = "HEAD";

/// Marks a directory that the renderer fully controls.
pub const OWNED_DIRECTORY_MARKER_FILE_NAME: &str = "OWNED_BY_UNIVERSE_DEPLOYER.md";
pub const OWNED_DIRECTORY_README_FILE_NAME: &str = "README.md";

/// One file per Argo CD Application.
pub const ARGO_CD_CONFIG_FILE_NAME: &str = "config.json";

pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const VERSION_LABEL: &str = "app.kubernetes.io/version";
pub const CONFIG_COMMIT_LABEL: &str = "cloud.intel.com/config-commit";

/// Longest subprocess output that is logged verbatim.
pub const MAX_OUTPUT_LEN_TO_LOG: usize = 1024;

pub const MULTI_VERSION_CACHE_SUBDIR: &str = "multi_version_manifests_generator_v1";

pub const DEFAULT_APPLICATIONS_TO_NOT_DELETE_REGEX: &str = "^app-of-apps$";

// Layout of an extracted deployment artifacts tar.
pub const HELM_BINARY: &str = "deployment/bin/helm";
pub const HELMFILE_BINARY: &str = "deployment/bin/helmfile";
pub const KUBECTL_BINARY: &str = "deployment/bin/kubectl";
pub const RENDERER_BINARY: &str = "deployment/bin/universe-deployer";
pub const HELM_CHART_VERSIONS_DIR: &str = "deployment/chart_versions";
pub const HELMFILE_CONFIG_DIR: &str = "deployment/helmfile";
pub const ARTIFACTS_CONFIG_FILE: &str = "deployment/universe_deployer/deployment_artifacts/config.yaml";

/// Directories replaced wholesale when a component uses a different config commit.
pub const CONFIG_DIRS: &[&str] = &[
  "deployment/chart_versions",
  "deployment/helmfile/environments",
  "deployment/universe_deployer/deployment_artifacts",
];

// Paths relative to the workspace of the deployer itself.
pub const ARGO_CD_INITIAL_DATA_DIR: &str = "deployment/argocd/idc-argocd-initial-data";
pub const DEPLOY_K8S_TLS_SECRETS_SCRIPT: &str = "hack/deploy-k8s-tls-secrets.sh";
pub const COLLECT_K8S_LOGS_SCRIPT: &str = "deployment/universe_deployer/collect_k8s_logs.sh";
pub const VAULT_CONFIGURE_SCRIPT: &str = "deployment/common/vault/configure.sh";
pub const VAULT_LOAD_SECRETS_SCRIPT: &str = "deployment/common/vault/load-secrets.sh";

// Build targets in the workspace being deployed.
pub const DEPLOYMENT_ARTIFACTS_TARGET: &str = "//deployment/universe_deployer/deployment_artifacts:deployment_artifacts_tar";
pub const CREATE_RELEASES_TARGET: &str = "//deployment/universe_deployer/create_releases";
pub const PUSH_CONTAINERS_AND_CHARTS_TARGET: &str = "//deployment/push:all_container_and_chart_push";
