//! universe-deployer-lib: release and deployment orchestration for IDC
//!
//! This crate provides the building blocks of Universe Deployer:
//! - `universe_config`: which commit of each component runs in each environment
//! - `multi_version`: manifests for every referenced component version, cached
//! - `git_pusher`: sequence-guarded pushes to the GitOps manifests repository
//! - `deployer`: the deploy/undeploy workflow and health verification
//! - `pool` and `cache`: build directories shared across processes, and a
//!   content-addressed file cache

pub mod artifacts;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod consts;
pub mod deployer;
pub mod git_pusher;
pub mod logging;
pub mod manifests;
pub mod multi_version;
pub mod paths;
pub mod pool;
pub mod process;
pub mod task_group;
pub mod universe_config;
pub mod util;
