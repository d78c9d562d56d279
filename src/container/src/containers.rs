//! The reconciliation engine.
//!
//! Holds the previously written state and the desired state, both keyed by
//! logical container name, observes reality on the hosts and executes the
//! plan converging one towards the other. The previous state is the
//! durable checkpoint: it is mutated as each sub-operation commits, so an
//! interrupted run leaves a recoverable partial state behind.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host_configured_container::{diff, ContainerError, Diff, HostConfiguredContainer};
use crate::types::{ContainerState, ContainerStatus};

/// Containers keyed by logical name. A BTreeMap keeps iteration
/// lexicographic, which makes plans reproducible.
pub type ContainersState = BTreeMap<String, HostConfiguredContainer>;

/// A failure attributed to one logical container.
#[derive(Debug)]
pub struct KeyError {
    pub key: String,
    pub error: ContainerError,
}

fn join_errors(errors: &[KeyError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.key, e.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ContainersError {
    #[error("containers configuration invalid: {0}")]
    Validation(String),

    #[error("checking current state failed: {}", join_errors(.0))]
    CheckFailed(Vec<KeyError>),

    #[error("deploying containers failed: {}", join_errors(.0))]
    DeployFailed(Vec<KeyError>),
}

/// Serializable engine configuration: what was written last time and what
/// is wanted now.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Containers {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub previous_state: ContainersState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub desired_state: ContainersState,
}

impl Containers {
    pub fn validate(&self) -> Result<(), ContainersError> {
        if self.previous_state.is_empty() && self.desired_state.is_empty() {
            return Err(ContainersError::Validation(
                "either previous or desired state must be defined".to_string(),
            ));
        }

        for (key, hcc) in self.desired_state.iter().chain(self.previous_state.iter()) {
            hcc.validate()
                .map_err(|e| ContainersError::Validation(format!("container {key:?}: {e}")))?;
        }

        Ok(())
    }

    /// Validates the configuration and builds the engine.
    pub fn new(&self) -> Result<ContainersEngine, ContainersError> {
        self.validate()?;

        Ok(ContainersEngine {
            previous_state: self.previous_state.clone(),
            desired_state: self.desired_state.clone(),
            current_state: ContainersState::new(),
        })
    }
}

/// Validated, executable engine.
pub struct ContainersEngine {
    previous_state: ContainersState,
    desired_state: ContainersState,
    current_state: ContainersState,
}

impl ContainersEngine {
    /// The authoritative record of what the engine last wrote. Callers
    /// persist this after every pass, also after failed ones.
    pub fn previous_state(&self) -> &ContainersState {
        &self.previous_state
    }

    pub fn desired_state(&self) -> &ContainersState {
        &self.desired_state
    }

    /// Observed state from the last `check_current_state` call. Only
    /// containers recorded in the previous state appear here.
    pub fn current_state(&self) -> &ContainersState {
        &self.current_state
    }

    /// Returns the serializable form of the engine, for persistence.
    pub fn to_exported(&self) -> Containers {
        Containers {
            previous_state: self.previous_state.clone(),
            desired_state: self.desired_state.clone(),
        }
    }

    /// Refreshes the observed status of every container recorded in the
    /// previous state. Hosts are queried concurrently; per-host failures
    /// abort only that host's refresh and are reported together at the
    /// end.
    pub async fn check_current_state(&mut self) -> Result<(), ContainersError> {
        let refreshes = self.previous_state.iter().map(|(key, hcc)| async move {
            (key.clone(), refresh_status(hcc).await)
        });

        let results = futures::future::join_all(refreshes).await;

        self.current_state.clear();

        let mut failures = Vec::new();

        for (key, result) in results {
            match result {
                Ok(hcc) => {
                    self.current_state.insert(key, hcc);
                }
                Err(error) => failures.push(KeyError { key, error }),
            }
        }

        if !failures.is_empty() {
            return Err(ContainersError::CheckFailed(failures));
        }

        Ok(())
    }

    /// Executes the reconciliation plan. Removals run before additions, so
    /// names and ports can be reused within one pass. Keys are processed
    /// in lexicographic order; a failing key is recorded and the remaining
    /// keys continue. The previous state reflects every sub-step committed
    /// before a failure.
    pub async fn deploy(&mut self) -> Result<(), ContainersError> {
        let mut failures = Vec::new();

        let removals: Vec<String> = self
            .previous_state
            .keys()
            .filter(|key| !self.desired_state.contains_key(*key))
            .cloned()
            .collect();

        for key in removals {
            tracing::info!("Removing container {}", key);

            if let Err(error) = self.remove(&key).await {
                tracing::warn!("Removing container {} failed: {}", key, error);
                failures.push(KeyError { key, error });
            }
        }

        let keys: Vec<String> = self.desired_state.keys().cloned().collect();

        for key in keys {
            let result = if self.previous_state.contains_key(&key) {
                self.converge(&key).await
            } else {
                tracing::info!("Deploying new container {}", key);
                self.add(&key).await
            };

            if let Err(error) = result {
                tracing::warn!("Deploying container {} failed: {}", key, error);
                failures.push(KeyError { key, error });
            }
        }

        if !failures.is_empty() {
            return Err(ContainersError::DeployFailed(failures));
        }

        Ok(())
    }

    /// Last observed status for a key, preferring the fresh observation
    /// over the recorded one.
    fn observed_status(&self, key: &str) -> ContainerStatus {
        self.current_state
            .get(key)
            .and_then(|hcc| hcc.container.status.clone())
            .or_else(|| {
                self.previous_state
                    .get(key)
                    .and_then(|hcc| hcc.container.status.clone())
            })
            .unwrap_or_default()
    }

    async fn remove(&mut self, key: &str) -> Result<(), ContainerError> {
        let status = self.observed_status(key);

        if !status.exists() {
            tracing::warn!(
                "Container {} is already gone from the runtime, dropping it from the state",
                key
            );
            self.previous_state.remove(key);

            return Ok(());
        }

        // Stop and delete through the host and runtime recorded in the
        // previous state.
        let hcc = self.previous_state[key].with_status(Some(status.clone()));

        let mut deployed = hcc.connect().await?;

        if status.running() {
            if let Err(e) = deployed.stop().await {
                deployed.close().await;
                return Err(e);
            }

            if let Some(entry) = self.previous_state.get_mut(key) {
                entry.container.status = deployed.status().cloned();
            }
        }

        let result = deployed.delete().await;
        deployed.close().await;
        result?;

        self.previous_state.remove(key);

        Ok(())
    }

    async fn add(&mut self, key: &str) -> Result<(), ContainerError> {
        let hcc = self.desired_state[key].clone();

        let mut deployed = hcc.connect().await?;

        if let Err(e) = deployed.create().await {
            deployed.close().await;
            return Err(e);
        }

        self.previous_state
            .insert(key.to_string(), hcc.with_status(deployed.status().cloned()));

        let result = deployed.start().await;
        let status = deployed.status().cloned();
        deployed.close().await;
        result?;

        self.previous_state
            .insert(key.to_string(), hcc.with_status(status));

        Ok(())
    }

    async fn converge(&mut self, key: &str) -> Result<(), ContainerError> {
        let previous = self.previous_state[key].clone();
        let desired = self.desired_state[key].clone();

        let observed = self.observed_status(key);

        if !observed.exists() {
            // Either nothing was created yet, or the runtime lost the
            // container; both plan as a fresh deployment.
            if previous
                .container
                .status
                .as_ref()
                .map(|s| !s.id.is_empty())
                .unwrap_or(false)
            {
                tracing::warn!(
                    "Container {} disappeared from the runtime, recreating it",
                    key
                );
            }

            return self.add(key).await;
        }

        match diff(&previous, &desired) {
            Diff::None => {
                if observed.running() {
                    return Ok(());
                }

                tracing::info!("Starting container {}", key);

                let hcc = previous.with_status(Some(observed));

                let mut deployed = hcc.connect().await?;
                let result = deployed.start().await;
                let status = deployed.status().cloned();
                deployed.close().await;
                result?;

                self.previous_state
                    .insert(key.to_string(), previous.with_status(status));

                Ok(())
            }
            Diff::FilesOnly => {
                tracing::info!("Updating config files of container {}", key);

                let hcc = desired.with_status(Some(observed.clone()));

                let mut deployed = hcc.connect().await?;

                if let Err(e) = deployed.configure().await {
                    deployed.close().await;
                    return Err(e);
                }

                self.previous_state
                    .insert(key.to_string(), desired.with_status(Some(observed.clone())));

                if observed.running() {
                    deployed.close().await;
                    return Ok(());
                }

                let result = deployed.start().await;
                let status = deployed.status().cloned();
                deployed.close().await;
                result?;

                self.previous_state
                    .insert(key.to_string(), desired.with_status(status));

                Ok(())
            }
            Diff::Recreate => {
                tracing::info!("Replacing container {}", key);

                // The old container is driven through the host and
                // runtime it was deployed with, which may differ from the
                // desired ones.
                let old = previous.with_status(Some(observed.clone()));

                let mut deployed = old.connect().await?;

                if observed.running() {
                    if let Err(e) = deployed.stop().await {
                        deployed.close().await;
                        return Err(e);
                    }

                    if let Some(entry) = self.previous_state.get_mut(key) {
                        entry.container.status = deployed.status().cloned();
                    }
                }

                let result = deployed.delete().await;
                deployed.close().await;
                result?;

                if let Some(entry) = self.previous_state.get_mut(key) {
                    entry.container.status = None;
                }

                self.add(key).await
            }
        }
    }
}

async fn refresh_status(
    hcc: &HostConfiguredContainer,
) -> Result<HostConfiguredContainer, ContainerError> {
    // Nothing was created yet, so there is nothing to ask the runtime
    // about.
    if hcc
        .container
        .status
        .as_ref()
        .map(|s| s.id.is_empty())
        .unwrap_or(true)
    {
        return Ok(hcc.with_status(Some(ContainerStatus {
            state: ContainerState::Missing,
            ..Default::default()
        })));
    }

    let mut deployed = hcc.connect().await?;

    let result = deployed.update_status().await;
    let status = deployed.status().cloned();
    deployed.close().await;
    result?;

    Ok(hcc.with_status(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::host_configured_container::Container;
    use crate::runtime::{fake, RuntimeConfig};
    use crate::transport::direct;
    use crate::types::{ContainerConfig, File};

    fn hcc(fake: &fake::Config, name: &str, image: &str, files: Vec<File>) -> HostConfiguredContainer {
        HostConfiguredContainer {
            host: Host {
                direct: Some(direct::Config::default()),
                ssh: None,
            },
            config_files: files,
            container: Container {
                config: ContainerConfig {
                    name: name.to_string(),
                    image: image.to_string(),
                    args: vec!["-x".to_string()],
                    ..Default::default()
                },
                runtime: RuntimeConfig {
                    docker: None,
                    fake: Some(fake.clone()),
                },
                status: None,
            },
        }
    }

    fn file(path: &str, content: &str) -> File {
        File {
            path: path.to_string(),
            mode: 0o644,
            content: content.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    async fn deploy(
        previous: ContainersState,
        desired: ContainersState,
    ) -> (Result<(), ContainersError>, ContainersState) {
        let mut engine = Containers {
            previous_state: previous,
            desired_state: desired,
        }
        .new()
        .unwrap();

        engine.check_current_state().await.unwrap();

        let result = engine.deploy().await;

        (result, engine.previous_state().clone())
    }

    #[tokio::test]
    async fn test_fresh_install_single_container() {
        let fake = fake::Config::default();

        let desired = ContainersState::from([(
            "a".to_string(),
            hcc(&fake, "a", "img:1", vec![file("/e", "1")]),
        )]);

        let (result, previous) = deploy(ContainersState::new(), desired).await;

        assert!(result.is_ok());
        assert_eq!(
            fake.take_calls(),
            vec!["create a", "copy id-1", "start id-1"]
        );

        let status = previous["a"].container.status.as_ref().unwrap();
        assert_eq!(status.id, "id-1");
        assert_eq!(status.state, ContainerState::Running);
    }

    #[tokio::test]
    async fn test_files_only_change_copies_in_place() {
        let fake = fake::Config::default();

        let initial = ContainersState::from([(
            "a".to_string(),
            hcc(&fake, "a", "img:1", vec![file("/e", "1")]),
        )]);

        let (result, previous) = deploy(ContainersState::new(), initial).await;
        assert!(result.is_ok());
        fake.take_calls();

        let desired = ContainersState::from([(
            "a".to_string(),
            hcc(&fake, "a", "img:1", vec![file("/e", "2")]),
        )]);

        let (result, previous) = deploy(previous, desired).await;

        assert!(result.is_ok());
        // One copy, no stop or start, ID unchanged.
        assert_eq!(fake.take_calls(), vec!["copy id-1"]);
        assert_eq!(previous["a"].container.status.as_ref().unwrap().id, "id-1");
        assert_eq!(previous["a"].config_files, vec![file("/e", "2")]);
    }

    #[tokio::test]
    async fn test_image_upgrade_recreates() {
        let fake = fake::Config::default();

        let initial =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:1", vec![]))]);

        let (result, previous) = deploy(ContainersState::new(), initial).await;
        assert!(result.is_ok());
        fake.take_calls();

        let desired =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:2", vec![]))]);

        let (result, previous) = deploy(previous, desired).await;

        assert!(result.is_ok());
        assert_eq!(
            fake.take_calls(),
            vec![
                "stop id-1",
                "delete id-1",
                "create a",
                "copy id-2",
                "start id-2"
            ]
        );
        assert_eq!(previous["a"].container.status.as_ref().unwrap().id, "id-2");
    }

    #[tokio::test]
    async fn test_implied_latest_tag_does_not_recreate() {
        let fake = fake::Config::default();

        let initial = ContainersState::from([("a".to_string(), hcc(&fake, "a", "img", vec![]))]);

        let (result, previous) = deploy(ContainersState::new(), initial).await;
        assert!(result.is_ok());
        fake.take_calls();

        let desired =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:latest", vec![]))]);

        let (result, _) = deploy(previous, desired).await;

        assert!(result.is_ok());
        assert!(fake.take_calls().is_empty());
    }

    #[tokio::test]
    async fn test_scale_down_removes_only_dropped_key() {
        let fake = fake::Config::default();

        let initial = ContainersState::from([
            ("a".to_string(), hcc(&fake, "a", "img:1", vec![])),
            ("b".to_string(), hcc(&fake, "b", "img:1", vec![])),
        ]);

        let (result, previous) = deploy(ContainersState::new(), initial).await;
        assert!(result.is_ok());
        fake.take_calls();

        let desired =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:1", vec![]))]);

        let (result, previous) = deploy(previous, desired).await;

        assert!(result.is_ok());
        assert_eq!(fake.take_calls(), vec!["stop id-2", "delete id-2"]);
        assert_eq!(previous.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_removals_happen_before_additions() {
        let fake = fake::Config::default();

        let initial =
            ContainersState::from([("b".to_string(), hcc(&fake, "b", "img:1", vec![]))]);

        let (result, previous) = deploy(ContainersState::new(), initial).await;
        assert!(result.is_ok());
        fake.take_calls();

        let desired =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:1", vec![]))]);

        let (result, _) = deploy(previous, desired).await;

        assert!(result.is_ok());
        assert_eq!(
            fake.take_calls(),
            vec![
                "stop id-1",
                "delete id-1",
                "create a",
                "copy id-2",
                "start id-2"
            ]
        );
    }

    #[tokio::test]
    async fn test_deploy_is_idempotent() {
        let fake = fake::Config::default();

        let desired = ContainersState::from([(
            "a".to_string(),
            hcc(&fake, "a", "img:1", vec![file("/e", "1")]),
        )]);

        let (result, previous) = deploy(ContainersState::new(), desired.clone()).await;
        assert!(result.is_ok());
        let first_pass = previous.clone();
        fake.take_calls();

        let (result, previous) = deploy(previous, desired).await;

        assert!(result.is_ok());
        assert!(fake.take_calls().is_empty());
        assert_eq!(previous, first_pass);
    }

    #[tokio::test]
    async fn test_equal_states_produce_empty_plan() {
        let fake = fake::Config::default();

        let desired =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:1", vec![]))]);

        let (result, previous) = deploy(ContainersState::new(), desired.clone()).await;
        assert!(result.is_ok());

        // previous == desired modulo observed status.
        let mut engine = Containers {
            previous_state: previous,
            desired_state: desired,
        }
        .new()
        .unwrap();

        engine.check_current_state().await.unwrap();
        fake.take_calls();

        engine.deploy().await.unwrap();
        assert!(fake.take_calls().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_committed_progress() {
        let fake = fake::Config::default();
        fake.fail_create("b");

        let desired = ContainersState::from([
            ("a".to_string(), hcc(&fake, "a", "img:1", vec![])),
            ("b".to_string(), hcc(&fake, "b", "img:1", vec![])),
        ]);

        let (result, previous) = deploy(ContainersState::new(), desired).await;

        let error = result.unwrap_err();
        assert!(error.to_string().contains("b"), "got: {error}");

        let status = previous["a"].container.status.as_ref().unwrap();
        assert_eq!(status.state, ContainerState::Running);
        assert!(!previous.contains_key("b"));
    }

    #[tokio::test]
    async fn test_failed_file_copy_leaves_no_partial_container() {
        let fake = fake::Config::default();
        fake.fail_copy("a");

        let desired = ContainersState::from([(
            "a".to_string(),
            hcc(&fake, "a", "img:1", vec![file("/e", "1")]),
        )]);

        let (result, previous) = deploy(ContainersState::new(), desired).await;

        assert!(result.is_err());
        assert!(!previous.contains_key("a"));
        // The half-created container was deleted again.
        assert_eq!(fake.take_calls(), vec!["create a", "copy id-1", "delete id-1"]);
        assert!(fake.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_resumes_after_crash_between_create_and_start() {
        let fake = fake::Config::default();

        let desired =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:1", vec![]))]);

        // Simulate a crash after the create sub-step committed: create the
        // container but record it as merely created.
        let (_, mut previous) = deploy(ContainersState::new(), desired.clone()).await;

        let runtime = fake.new();
        let id = previous["a"].container.status.as_ref().unwrap().id.clone();
        crate::runtime::Runtime::stop(&runtime, &id).await.unwrap();

        if let Some(entry) = previous.get_mut("a") {
            if let Some(status) = entry.container.status.as_mut() {
                status.state = ContainerState::Created;
            }
        }
        fake.take_calls();

        let (result, previous) = deploy(previous, desired).await;

        assert!(result.is_ok());
        assert_eq!(fake.take_calls(), vec![format!("start {id}")]);
        assert_eq!(
            previous["a"].container.status.as_ref().unwrap().state,
            ContainerState::Running
        );
    }

    #[tokio::test]
    async fn test_externally_removed_container_is_recreated() {
        let fake = fake::Config::default();

        let desired =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:1", vec![]))]);

        let (result, previous) = deploy(ContainersState::new(), desired.clone()).await;
        assert!(result.is_ok());

        fake.forget("a");
        fake.take_calls();

        let (result, previous) = deploy(previous, desired).await;

        assert!(result.is_ok());
        assert_eq!(
            fake.take_calls(),
            vec!["create a", "copy id-2", "start id-2"]
        );
        assert_eq!(previous["a"].container.status.as_ref().unwrap().id, "id-2");
    }

    #[tokio::test]
    async fn test_full_teardown() {
        let fake = fake::Config::default();

        let desired = ContainersState::from([
            ("a".to_string(), hcc(&fake, "a", "img:1", vec![])),
            ("b".to_string(), hcc(&fake, "b", "img:1", vec![])),
        ]);

        let (result, previous) = deploy(ContainersState::new(), desired).await;
        assert!(result.is_ok());
        fake.take_calls();

        let (result, previous) = deploy(previous, ContainersState::new()).await;

        assert!(result.is_ok());
        assert!(previous.is_empty());
        assert!(fake.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_current_state_only_contains_previous_keys() {
        let fake = fake::Config::default();

        let previous =
            ContainersState::from([("a".to_string(), hcc(&fake, "a", "img:1", vec![]))]);
        let desired = ContainersState::from([
            ("a".to_string(), hcc(&fake, "a", "img:1", vec![])),
            ("b".to_string(), hcc(&fake, "b", "img:1", vec![])),
        ]);

        let mut engine = Containers {
            previous_state: previous,
            desired_state: desired,
        }
        .new()
        .unwrap();

        engine.check_current_state().await.unwrap();

        assert_eq!(engine.current_state().keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_validate_rejects_empty_configuration() {
        assert!(Containers::default().validate().is_err());
    }

    #[test]
    fn test_validate_rejects_invalid_container() {
        let fake = fake::Config::default();

        let mut invalid = hcc(&fake, "a", "img:1", vec![]);
        invalid.container.config.image = String::new();

        let containers = Containers {
            previous_state: ContainersState::new(),
            desired_state: ContainersState::from([("a".to_string(), invalid)]),
        };

        let error = containers.validate().unwrap_err();
        assert!(error.to_string().contains("a"), "got: {error}");
    }
}
