//! Implementation of the `universe-deployer universe-config` subcommands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};

use universe_deployer_lib::process::git::GitCli;
use universe_deployer_lib::universe_config::{ComponentCommitsMode, UniverseConfigFiles, WalkComponents, resolve_references};

use crate::output::{OutputFormat, print_json, print_success};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum CommitsMode {
  /// Distinct (component, commit, configCommit)
  #[default]
  All,
  /// Distinct (component, commit)
  Commit,
  /// Distinct (component, configCommit)
  ConfigCommit,
}

impl From<CommitsMode> for ComponentCommitsMode {
  fn from(mode: CommitsMode) -> Self {
    match mode {
      CommitsMode::All => ComponentCommitsMode::IncludeAll,
      CommitsMode::Commit => ComponentCommitsMode::IncludeComponentCommit,
      CommitsMode::ConfigCommit => ComponentCommitsMode::IncludeComponentConfigCommit,
    }
  }
}

#[derive(Debug, Subcommand)]
pub enum UniverseConfigCommand {
  /// List the distinct component versions referenced by the files
  ComponentCommits {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t)]
    mode: CommitsMode,

    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
  },

  /// Rewrite the files in canonical form
  Format {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Fail instead of rewriting when a file is not in canonical form
    #[arg(long)]
    check: bool,
  },

  /// Replace branch and tag names with the commit hashes they point to
  Resolve {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long)]
    remote: String,

    /// Git repository to run `git ls-remote` in
    #[arg(long, default_value = ".")]
    repo_dir: PathBuf,
  },
}

/// Execute a universe-config subcommand.
pub fn cmd_universe_config(command: &UniverseConfigCommand) -> Result<()> {
  match command {
    UniverseConfigCommand::ComponentCommits { files, mode, format } => {
      let mut configs = UniverseConfigFiles::read(files)?;
      configs.normalize();
      let component_commits = configs.component_commits((*mode).into());
      if format.is_json() {
        return print_json(&component_commits);
      }
      for component_commit in &component_commits {
        println!(
          "{}\t{}\t{}",
          component_commit.component, component_commit.commit, component_commit.config_commit
        );
      }
      Ok(())
    }
    UniverseConfigCommand::Format { files, check } => {
      let configs = UniverseConfigFiles::read(files)?;
      configs.validate_commits()?;
      if *check {
        configs.check_unchanged_files()?;
        print_success(&format!("{} files are formatted", files.len()));
      } else {
        configs.write_files()?;
        print_success(&format!("Formatted {} files", files.len()));
      }
      Ok(())
    }
    UniverseConfigCommand::Resolve { files, remote, repo_dir } => {
      let mut configs = UniverseConfigFiles::read(files)?;
      let git = GitCli::default();
      let (rt, token) = super::runtime()?;
      rt.block_on(resolve_references(&mut configs, &git, repo_dir, remote, &token))
        .with_context(|| format!("Failed to resolve references using {}", remote))?;
      configs.validate_commits()?;
      configs.write_files()?;
      print_success(&format!("Resolved references in {} files", files.len()));
      Ok(())
    }
  }
}
