//! Implementation of the `universe-deployer git-push` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;

use universe_deployer_lib::config::compile_regex;
use universe_deployer_lib::consts::DEFAULT_APPLICATIONS_TO_NOT_DELETE_REGEX;
use universe_deployer_lib::git_pusher::{ApplicationFilter, GitPushRequest, GitPusher};
use universe_deployer_lib::process::CommandEnv;
use universe_deployer_lib::process::git::GitCli;

use crate::output::{print_info, print_stat, print_success};

#[derive(Debug, Args)]
pub struct GitPushArgs {
  #[arg(long)]
  pub git_remote: String,

  #[arg(long, default_value = "main")]
  pub git_branch: String,

  /// Manifests tar to extract over the repository
  #[arg(long)]
  pub manifests_tar: Option<PathBuf>,

  /// Working tree to use; a temporary clone when omitted
  #[arg(long)]
  pub clone_dir: Option<PathBuf>,

  /// Use `--clone-dir` as is instead of cloning into it
  #[arg(long, requires = "clone_dir")]
  pub reuse_clone: bool,

  /// Push to a new branch named with this prefix and a timestamp
  #[arg(long)]
  pub new_branch_prefix: Option<String>,

  /// Remove directories owned by the incoming tar before extracting it
  #[arg(long)]
  pub replace_owned_directories: bool,

  /// Delete Argo CD Applications whose names match
  #[arg(long)]
  pub delete_regex: Option<String>,

  #[arg(long, default_value = DEFAULT_APPLICATIONS_TO_NOT_DELETE_REGEX)]
  pub not_delete_regex: String,

  /// Run in the working tree before committing
  #[arg(long)]
  pub patch_command: Option<PathBuf>,

  /// Relative path of the push state file; the sequence guard is off when omitted
  #[arg(long, default_value = "")]
  pub push_state_file_name: String,

  #[arg(long, default_value_t = 0)]
  pub source_sequence_number: i64,

  /// Commit message line; may be repeated
  #[arg(long = "message", short = 'm')]
  pub messages: Vec<String>,

  /// Commit locally without pushing
  #[arg(long)]
  pub dry_run: bool,
}

/// Execute the git-push command.
pub fn cmd_git_push(args: &GitPushArgs) -> Result<()> {
  if args.manifests_tar.is_none() && args.delete_regex.is_none() {
    bail!("nothing to push: give --manifests-tar or --delete-regex");
  }
  let delete_applications = match &args.delete_regex {
    Some(pattern) => Some(ApplicationFilter::new(
      compile_regex(pattern)?,
      compile_regex(&args.not_delete_regex)?,
    )),
    None => None,
  };

  let temp = tempfile::Builder::new()
    .prefix("universe-deployer-git-push-")
    .tempdir()
    .context("Failed to create temp dir")?;
  let clone_dir = args.clone_dir.clone().unwrap_or_else(|| temp.path().join("repo"));
  let commit_messages = if args.messages.is_empty() {
    vec!["Update manifests".to_string()]
  } else {
    args.messages.clone()
  };

  let request = GitPushRequest {
    git_remote: args.git_remote.clone(),
    git_branch: args.git_branch.clone(),
    clone_dir,
    reuse_clone: args.reuse_clone,
    new_branch_prefix: args.new_branch_prefix.clone(),
    manifests_tar: args.manifests_tar.clone(),
    replace_owned_directories: args.replace_owned_directories,
    delete_applications,
    patch_command: args.patch_command.clone(),
    push_state_file_name: args.push_state_file_name.clone(),
    source_sequence_number: args.source_sequence_number,
    commit_messages,
    dry_run: args.dry_run,
    env: CommandEnv::inherit(),
  };
  let pusher = GitPusher::new(Arc::new(GitCli::default()));

  let (rt, token) = super::runtime()?;
  let outcome = rt.block_on(pusher.push(&request, &token)).context("Git push failed")?;

  if !outcome.committed {
    print_info("No changes to commit");
  } else if outcome.pushed {
    print_success(&format!("Pushed to {}", args.git_remote));
  } else {
    print_success("Committed locally (dry run)");
  }
  print_stat("Branch", &outcome.branch);
  Ok(())
}
