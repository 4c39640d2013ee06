use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::{UniverseComponent, UniverseConfig, UniverseConfigError};
use crate::consts::HEAD;
use crate::util::commit::{is_commit_or_head, is_git_commit};

/// Where a component sits in a Universe Config. Empty strings mean "not at
/// this level" (an environment-level component has no region).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentLocation {
  pub file_name: String,
  pub environment: String,
  pub region: String,
  pub availability_zone: String,
  pub component: String,
}

/// A distinct `(component, commit, configCommit)` tuple. Field order gives the
/// derived ordering: component, then commit, then config commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCommit {
  pub component: String,
  pub commit: String,
  pub config_commit: String,
}

impl std::fmt::Display for ComponentCommit {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "component {}, commit {}, configCommit {}",
      self.component, self.commit, self.config_commit
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentCommitsMode {
  /// Distinct `(component, commit, configCommit)`; used for manifest generation.
  IncludeAll,
  /// Distinct `(component, commit)`; used for artifact downloads.
  IncludeComponentCommit,
  /// Distinct `(component, configCommit)`; used for config substitution.
  IncludeComponentConfigCommit,
}

/// Components grouped by the commit they reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupedByCommit {
  pub commits: BTreeMap<String, Vec<(ComponentLocation, UniverseComponent)>>,
}

impl GroupedByCommit {
  pub fn sorted(&self) -> Vec<&str> {
    self.commits.keys().map(String::as_str).collect()
  }
}

/// Visitor over every component of one or more Universe Configs, in
/// file, environment, region, availability zone, component order.
pub trait WalkComponents {
  fn walk_components<E>(
    &self,
    f: impl FnMut(&ComponentLocation, &UniverseComponent) -> Result<(), E>,
  ) -> Result<(), E>;

  fn walk_components_mut<E>(
    &mut self,
    f: impl FnMut(&ComponentLocation, &mut UniverseComponent) -> Result<(), E>,
  ) -> Result<(), E>;

  /// Fill an empty `config_commit` from `commit`.
  fn normalize(&mut self) {
    let _ = self.walk_components_mut(|_, component| {
      if component.config_commit.is_empty() {
        component.config_commit = component.commit.clone();
      }
      Ok::<_, std::convert::Infallible>(())
    });
  }

  /// Replace every commit that is a key of `replacements`. Returns whether
  /// any leaf matched.
  fn replace_commits(&mut self, replacements: &BTreeMap<String, String>) -> bool {
    let mut replaced = false;
    let _ = self.walk_components_mut(|_, component| {
      if let Some(new) = replacements.get(&component.commit) {
        component.commit = new.clone();
        replaced = true;
      }
      Ok::<_, std::convert::Infallible>(())
    });
    replaced
  }

  fn replace_config_commits(&mut self, replacements: &BTreeMap<String, String>) -> bool {
    let mut replaced = false;
    let _ = self.walk_components_mut(|_, component| {
      if let Some(new) = replacements.get(&component.config_commit) {
        component.config_commit = new.clone();
        replaced = true;
      }
      Ok::<_, std::convert::Infallible>(())
    });
    replaced
  }

  fn has_commit(&self, commit: &str) -> bool {
    let mut found = false;
    let _ = self.walk_components(|_, component| {
      found |= component.commit == commit;
      Ok::<_, std::convert::Infallible>(())
    });
    found
  }

  fn has_config_commit(&self, commit: &str) -> bool {
    let mut found = false;
    let _ = self.walk_components(|_, component| {
      found |= component.config_commit == commit;
      Ok::<_, std::convert::Infallible>(())
    });
    found
  }

  /// Every non-empty commit and config commit must be a full Git hash or `HEAD`.
  fn validate_commits(&self) -> Result<(), UniverseConfigError> {
    self.walk_components(|_, component| {
      for commit in [&component.commit, &component.config_commit] {
        if !commit.is_empty() && !is_commit_or_head(commit) {
          return Err(UniverseConfigError::InvalidCommit { commit: commit.clone() });
        }
      }
      Ok(())
    })
  }

  /// Distinct tuples, sorted by component, commit and config commit.
  fn component_commits(&self, mode: ComponentCommitsMode) -> Vec<ComponentCommit> {
    let mut set = BTreeSet::new();
    let _ = self.walk_components(|location, component| {
      let include_commit = mode != ComponentCommitsMode::IncludeComponentConfigCommit;
      let include_config_commit = mode != ComponentCommitsMode::IncludeComponentCommit;
      set.insert(ComponentCommit {
        component: location.component.clone(),
        commit: if include_commit { component.commit.clone() } else { String::new() },
        config_commit: if include_config_commit {
          component.config_commit.clone()
        } else {
          String::new()
        },
      });
      Ok::<_, std::convert::Infallible>(())
    });
    set.into_iter().collect()
  }

  /// Group by `commit`, ignoring `config_commit`.
  fn group_by_commit(&self) -> GroupedByCommit {
    let mut grouped = GroupedByCommit::default();
    let _ = self.walk_components(|location, component| {
      grouped
        .commits
        .entry(component.commit.clone())
        .or_default()
        .push((location.clone(), component.clone()));
      Ok::<_, std::convert::Infallible>(())
    });
    grouped
  }

  /// Group by both `commit` and `config_commit`. A component appears under
  /// each distinct non-empty commit it references.
  fn group_by_commit_and_config_commit(&self) -> GroupedByCommit {
    let mut grouped = GroupedByCommit::default();
    let _ = self.walk_components(|location, component| {
      let commits: BTreeSet<&String> = [&component.commit, &component.config_commit]
        .into_iter()
        .filter(|commit| !commit.is_empty())
        .collect();
      for commit in commits {
        grouped
          .commits
          .entry(commit.clone())
          .or_default()
          .push((location.clone(), component.clone()));
      }
      Ok::<_, std::convert::Infallible>(())
    });
    grouped
  }

  /// Symbolic references (branches, tags) that must be resolved to hashes.
  fn unresolved_references(&self) -> BTreeSet<String> {
    self
      .group_by_commit_and_config_commit()
      .commits
      .into_keys()
      .filter(|commit| !is_git_commit(commit) && commit != HEAD)
      .collect()
  }
}

pub(super) fn walk_config<E>(
  file_name: &str,
  config: &UniverseConfig,
  f: &mut impl FnMut(&ComponentLocation, &UniverseComponent) -> Result<(), E>,
) -> Result<(), E> {
  let mut location = ComponentLocation {
    file_name: file_name.to_string(),
    environment: String::new(),
    region: String::new(),
    availability_zone: String::new(),
    component: String::new(),
  };
  for (env_name, env) in &config.environments {
    location.environment = env_name.clone();
    location.region.clear();
    location.availability_zone.clear();
    for (name, component) in &env.components {
      location.component = name.clone();
      f(&location, component)?;
    }
    for (region_name, region) in &env.regions {
      location.region = region_name.clone();
      location.availability_zone.clear();
      for (name, component) in &region.components {
        location.component = name.clone();
        f(&location, component)?;
      }
      for (az_name, az) in &region.availability_zones {
        location.availability_zone = az_name.clone();
        for (name, component) in &az.components {
          location.component = name.clone();
          f(&location, component)?;
        }
      }
    }
  }
  Ok(())
}

pub(super) fn walk_config_mut<E>(
  file_name: &str,
  config: &mut UniverseConfig,
  f: &mut impl FnMut(&ComponentLocation, &mut UniverseComponent) -> Result<(), E>,
) -> Result<(), E> {
  let mut location = ComponentLocation {
    file_name: file_name.to_string(),
    environment: String::new(),
    region: String::new(),
    availability_zone: String::new(),
    component: String::new(),
  };
  for (env_name, env) in &mut config.environments {
    location.environment = env_name.clone();
    location.region.clear();
    location.availability_zone.clear();
    for (name, component) in &mut env.components {
      location.component = name.clone();
      f(&location, component)?;
    }
    for (region_name, region) in &mut env.regions {
      location.region = region_name.clone();
      location.availability_zone.clear();
      for (name, component) in &mut region.components {
        location.component = name.clone();
        f(&location, component)?;
      }
      for (az_name, az) in &mut region.availability_zones {
        location.availability_zone = az_name.clone();
        for (name, component) in &mut az.components {
          location.component = name.clone();
          f(&location, component)?;
        }
      }
    }
  }
  Ok(())
}

impl WalkComponents for UniverseConfig {
  fn walk_components<E>(
    &self,
    mut f: impl FnMut(&ComponentLocation, &UniverseComponent) -> Result<(), E>,
  ) -> Result<(), E> {
    walk_config("", self, &mut f)
  }

  fn walk_components_mut<E>(
    &mut self,
    mut f: impl FnMut(&ComponentLocation, &mut UniverseComponent) -> Result<(), E>,
  ) -> Result<(), E> {
    walk_config_mut("", self, &mut f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::universe_config::tests::sample_config;
  use crate::universe_config::{UniverseEnvironment, UniverseRegion};
  use crate::util::testutil::fake_commit;

  fn single_component(env: &str, component: &str, commit: &str) -> UniverseConfig {
    let mut config = UniverseConfig::default();
    config.environments.insert(
      env.to_string(),
      UniverseEnvironment {
        components: BTreeMap::from([(component.to_string(), UniverseComponent::new(commit))]),
        ..Default::default()
      },
    );
    config
  }

  #[test]
  fn walk_visits_every_level_with_location() {
    let config = sample_config();
    let mut seen = Vec::new();
    config
      .walk_components(|location, _| {
        seen.push((
          location.environment.clone(),
          location.region.clone(),
          location.availability_zone.clone(),
          location.component.clone(),
        ));
        Ok::<_, UniverseConfigError>(())
      })
      .unwrap();
    let s = |v: &str| v.to_string();
    assert_eq!(
      seen,
      vec![
        (s("staging"), s(""), s(""), s("billing")),
        (s("staging"), s("us-staging-1"), s(""), s("compute")),
        (s("staging"), s("us-staging-1"), s("us-staging-1a"), s("compute")),
      ]
    );
  }

  #[test]
  fn walk_stops_on_first_error() {
    let config = sample_config();
    let mut visits = 0;
    let result = config.walk_components(|_, _| {
      visits += 1;
      Err("stop")
    });
    assert_eq!(result, Err("stop"));
    assert_eq!(visits, 1);
  }

  #[test]
  fn normalize_fills_config_commit_and_is_idempotent() {
    let mut config = sample_config();
    config.normalize();
    let once = config.clone();
    config.normalize();
    assert_eq!(config, once);

    let az = &config.environments["staging"].regions["us-staging-1"].availability_zones["us-staging-1a"];
    assert_eq!(az.components["compute"].config_commit, fake_commit('b'));
    // An explicit config commit is kept.
    let region = &config.environments["staging"].regions["us-staging-1"];
    assert_eq!(region.components["compute"].config_commit, fake_commit('a'));
  }

  #[test]
  fn single_environment_yields_one_component_commit() {
    let commit = "a5dde8d0d2c3f41b6d8f4a3e9b1c0d7e6f5a4b3c";
    let mut config = single_component("staging", "billing", commit);
    config.normalize();
    assert_eq!(
      config.component_commits(ComponentCommitsMode::IncludeAll),
      vec![ComponentCommit {
        component: "billing".to_string(),
        commit: commit.to_string(),
        config_commit: commit.to_string(),
      }]
    );
  }

  #[test]
  fn component_commits_are_distinct_and_sorted() {
    let mut config = sample_config();
    config.normalize();
    let all = config.component_commits(ComponentCommitsMode::IncludeAll);
    assert_eq!(
      all,
      vec![
        ComponentCommit {
          component: "billing".to_string(),
          commit: fake_commit('a'),
          config_commit: fake_commit('a'),
        },
        ComponentCommit {
          component: "compute".to_string(),
          commit: fake_commit('b'),
          config_commit: fake_commit('a'),
        },
        ComponentCommit {
          component: "compute".to_string(),
          commit: fake_commit('b'),
          config_commit: fake_commit('b'),
        },
      ]
    );

    let commits = config.component_commits(ComponentCommitsMode::IncludeComponentCommit);
    assert_eq!(commits.len(), 2);
    assert!(commits.iter().all(|cc| cc.config_commit.is_empty()));

    let config_commits = config.component_commits(ComponentCommitsMode::IncludeComponentConfigCommit);
    assert_eq!(config_commits.len(), 3);
    assert!(config_commits.iter().all(|cc| cc.commit.is_empty()));
  }

  #[test]
  fn replace_head_with_commit() {
    let new_commit = fake_commit('e');
    let mut config = single_component("dev", "compute", HEAD);
    let replacements = BTreeMap::from([(HEAD.to_string(), new_commit.clone())]);

    assert!(config.replace_commits(&replacements));
    assert!(!config.has_commit(HEAD));
    assert!(config.has_commit(&new_commit));
    // Nothing left to replace.
    assert!(!config.replace_commits(&replacements));
  }

  #[test]
  fn replace_config_commits_only_touches_config_commit() {
    let mut config = sample_config();
    let replacements = BTreeMap::from([(fake_commit('a'), fake_commit('f'))]);
    assert!(config.replace_config_commits(&replacements));
    assert!(config.has_config_commit(&fake_commit('f')));
    assert!(config.has_commit(&fake_commit('a')));
  }

  #[test]
  fn validate_commits_accepts_hashes_and_head() {
    let mut config = sample_config();
    config.normalize();
    config.validate_commits().unwrap();
    single_component("dev", "compute", HEAD).validate_commits().unwrap();
  }

  #[test]
  fn validate_commits_rejects_branch_names() {
    let config = single_component("dev", "compute", "main");
    let err = config.validate_commits().unwrap_err();
    assert_eq!(err.to_string(), "commit 'main' in Universe Config is not a valid Git hash");
  }

  #[test]
  fn group_by_commit_and_config_commit_lists_component_under_both() {
    let config = sample_config();
    let grouped = config.group_by_commit_and_config_commit();
    assert_eq!(grouped.sorted(), vec![fake_commit('a').as_str(), fake_commit('b').as_str()]);
    // The regional compute references b as commit and a as config commit.
    assert_eq!(grouped.commits[&fake_commit('a')].len(), 2);
    assert_eq!(grouped.commits[&fake_commit('b')].len(), 2);

    let by_commit = config.group_by_commit();
    assert_eq!(by_commit.commits[&fake_commit('a')].len(), 1);
  }

  #[test]
  fn unresolved_references_skip_hashes_and_head() {
    let mut config = single_component("dev", "compute", "release-1.2");
    config.environments.get_mut("dev").unwrap().regions.insert(
      "us-dev-1".to_string(),
      UniverseRegion {
        components: BTreeMap::from([
          ("billing".to_string(), UniverseComponent::new(HEAD)),
          ("storage".to_string(), UniverseComponent::new(fake_commit('c'))),
        ]),
        ..Default::default()
      },
    );
    assert_eq!(
      config.unresolved_references(),
      BTreeSet::from(["release-1.2".to_string()])
    );
  }
}
