mod deploy;
mod download_artifacts;
mod generate_manifests;
mod git_push;
mod render_manifests;
mod universe_config;

pub use deploy::{DeployArgs, cmd_deploy, cmd_undeploy};
pub use download_artifacts::{DownloadArtifactsArgs, cmd_download_artifacts};
pub use generate_manifests::{GenerateManifestsArgs, cmd_generate_manifests};
pub use git_push::{GitPushArgs, cmd_git_push};
pub use render_manifests::{RenderManifestsArgs, cmd_render_manifests};
pub use universe_config::{UniverseConfigCommand, cmd_universe_config};

use anyhow::{Context, Result};
use tokio::runtime::Runtime;
use tracing::warn;

use universe_deployer_lib::cancel::CancelToken;

/// A runtime and a token that is cancelled on Ctrl-C.
fn runtime() -> Result<(Runtime, CancelToken)> {
  let rt = Runtime::new().context("Failed to create async runtime")?;
  let token = CancelToken::new();
  let on_interrupt = token.clone();
  rt.spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, cancelling");
      on_interrupt.cancel();
    }
  });
  Ok((rt, token))
}
