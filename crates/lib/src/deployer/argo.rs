//! Argo CD Applications: selecting, deleting from the manifests repository
//! and waiting for them to disappear.

use std::time::Instant;

use tracing::info;

use super::{DeployError, Deployer};
use crate::cancel::CancelToken;
use crate::config::compile_regex;
use crate::git_pusher::{ApplicationFilter, GitPushOutcome, GitPushRequest, GitPusher};
use crate::process::kubectl::ResourceKind;
use crate::util::retry::{Backoff, retry};

impl Deployer {
  pub fn application_filter(&self) -> Result<ApplicationFilter, DeployError> {
    Ok(ApplicationFilter::new(
      compile_regex(&self.options.argo_applications_to_delete_regex)?,
      compile_regex(&self.options.argo_applications_to_not_delete_regex)?,
    ))
  }

  /// Sorted names of live Applications in the global cluster that `filter`
  /// selects.
  pub async fn get_matching_argo_application_names(
    &self,
    filter: &ApplicationFilter,
    token: &CancelToken,
  ) -> Result<Vec<String>, DeployError> {
    let kube_context = &self.options.config.global.kube_context;
    let applications = self
      .ports
      .cluster
      .list(kube_context, ResourceKind::ArgoApplication, token)
      .await
      .map_err(|source| DeployError::Cluster {
        kube_context: kube_context.clone(),
        source,
      })?;
    let mut names: Vec<String> = applications
      .into_iter()
      .map(|app| app.metadata.name)
      .filter(|name| filter.matches(name))
      .collect();
    names.sort();
    names.dedup();
    Ok(names)
  }

  /// Remove the selected Applications' directories from the manifests
  /// repository. Argo CD deletes the Applications once it syncs.
  pub async fn delete_argo_applications(
    &self,
    filter: &ApplicationFilter,
    token: &CancelToken,
  ) -> Result<GitPushOutcome, DeployError> {
    let remote = self.initialized()?.manifests_git_remote.clone();
    let request = GitPushRequest {
      delete_applications: Some(filter.clone()),
      commit_messages: vec![
        format!(
          "Delete Argo CD Applications matching {}",
          self.options.argo_applications_to_delete_regex
        ),
        format!("Excluding {}", self.options.argo_applications_to_not_delete_regex),
      ],
      ..self.git_push_request(remote)
    };
    let outcome = GitPusher::new(self.ports.git.clone()).push(&request, token).await?;
    Ok(outcome)
  }

  pub async fn wait_for_argo_applications_to_be_deleted(
    &self,
    filter: &ApplicationFilter,
    token: &CancelToken,
  ) -> Result<(), DeployError> {
    let start = Instant::now();
    let backoff = Backoff::linear(self.options.undeploy_timeout, self.options.undeploy_interval);
    let attempt = move || async move {
      let remaining = self.get_matching_argo_application_names(filter, token).await?;
      if remaining.is_empty() {
        return Ok(());
      }
      info!(remaining = ?remaining, "Waiting for Argo CD Applications to be deleted");
      Err(DeployError::ApplicationsNotDeleted { remaining })
    };
    retry(&backoff, token, |_: &DeployError| true, attempt)
      .await
      .map_err(|err| err.into_inner())?;
    info!(duration = ?start.elapsed(), "Argo CD Applications deleted");
    Ok(())
  }
}
