mod cmd;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use universe_deployer_lib::logging;

use crate::output::print_error;

/// universe-deployer - Build, render and deploy every component version of a
/// Universe Config
#[derive(Parser)]
#[command(name = "universe-deployer")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Deploy an environment's Universe Config to its clusters
  Deploy(cmd::DeployArgs),

  /// Delete Argo CD Applications and optionally Argo CD, Gitea and Vault
  Undeploy(cmd::DeployArgs),

  /// Render manifests of every component version into one tar
  GenerateManifests(cmd::GenerateManifestsArgs),

  /// Render manifests of one commit from its deployment artifacts
  RenderManifests(cmd::RenderManifestsArgs),

  /// Download deployment artifacts and report the missing ones
  DownloadArtifacts(cmd::DownloadArtifactsArgs),

  /// Commit a manifests tar to a GitOps repository and push it
  GitPush(cmd::GitPushArgs),

  /// Inspect and maintain Universe Config files
  UniverseConfig {
    #[command(subcommand)]
    command: cmd::UniverseConfigCommand,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  if let Err(err) = logging::init(level) {
    print_error(&format!("failed to initialize logging: {}", err));
    return ExitCode::FAILURE;
  }

  match run(cli.command) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{:#}", err));
      ExitCode::FAILURE
    }
  }
}

fn run(command: Commands) -> Result<()> {
  match command {
    Commands::Deploy(args) => cmd::cmd_deploy(&args),
    Commands::Undeploy(args) => cmd::cmd_undeploy(&args),
    Commands::GenerateManifests(args) => cmd::cmd_generate_manifests(&args),
    Commands::RenderManifests(args) => cmd::cmd_render_manifests(&args),
    Commands::DownloadArtifacts(args) => cmd::cmd_download_artifacts(&args),
    Commands::GitPush(args) => cmd::cmd_git_push(&args),
    Commands::UniverseConfig { command } => cmd::cmd_universe_config(&command),
  }
}
