//! Uniform verbs over engine-backed resources.
//!
//! A resource wraps a containers engine behind validation, state checking,
//! deployment and YAML persistence, so different resource kinds (an etcd
//! cluster, a pool of kubelets) can be driven the same way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::containers::{ContainersEngine, ContainersState};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("parsing YAML document failed: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("configuration document must be a mapping")]
    NotAMapping,
}

/// The verbs every engine-backed resource exposes.
#[async_trait]
pub trait Resource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Refreshes the observed state of all containers the resource wrote
    /// previously.
    async fn check_current_state(&mut self) -> Result<(), Self::Error>;

    /// Reconciles reality towards the desired configuration.
    async fn deploy(&mut self) -> Result<(), Self::Error>;

    /// Serializes the persistent state for the caller to store. Must be
    /// called after `deploy`, also after a failed one, so partial progress
    /// is not lost.
    fn state_to_yaml(&self) -> Result<String, Self::Error>;

    /// Access to the underlying engine.
    fn containers(&self) -> &ContainersEngine;
}

/// Persisted state document: a top-level `state` map of logical container
/// names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub state: ContainersState,
}

/// Serializes previously written state. Empty state serializes as the
/// empty document `{}`.
pub fn state_to_yaml(state: &ContainersState) -> Result<String, ResourceError> {
    Ok(serde_yaml::to_string(&StateDocument {
        state: state.clone(),
    })?)
}

/// Merges a user configuration document with a previously persisted state
/// document into one value, which resource types deserialize from.
///
/// Both documents are parsed independently and merged structurally. The
/// empty document and `{}` both normalize to an empty mapping, so a fresh
/// install with no state round-trips cleanly.
pub fn config_with_state(config: &str, state: &str) -> Result<serde_yaml::Value, ResourceError> {
    let mut config = parse_mapping(config)?;
    let state = parse_mapping(state)?;

    for (key, value) in state {
        // The state document only contributes keys the user config does
        // not define, `state` itself being the usual one.
        config.entry(key).or_insert(value);
    }

    Ok(serde_yaml::Value::Mapping(config))
}

fn parse_mapping(document: &str) -> Result<serde_yaml::Mapping, ResourceError> {
    if document.trim().is_empty() {
        return Ok(serde_yaml::Mapping::new());
    }

    match serde_yaml::from_str::<serde_yaml::Value>(document)? {
        serde_yaml::Value::Null => Ok(serde_yaml::Mapping::new()),
        serde_yaml::Value::Mapping(mapping) => Ok(mapping),
        _ => Err(ResourceError::NotAMapping),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::host_configured_container::{Container, HostConfiguredContainer};
    use crate::transport::direct;
    use crate::types::ContainerConfig;

    #[test]
    fn test_empty_state_serializes_as_empty_document() {
        assert_eq!(state_to_yaml(&ContainersState::new()).unwrap(), "{}\n");
    }

    #[test]
    fn test_empty_document_parses_as_empty_state() {
        let value = config_with_state("", "{}\n").unwrap();
        let document: StateDocument = serde_yaml::from_value(value).unwrap();
        assert!(document.state.is_empty());
    }

    #[test]
    fn test_state_round_trip() {
        let state = ContainersState::from([(
            "a".to_string(),
            HostConfiguredContainer {
                host: Host {
                    direct: Some(direct::Config::default()),
                    ssh: None,
                },
                config_files: Vec::new(),
                container: Container {
                    config: ContainerConfig {
                        name: "a".to_string(),
                        image: "img:1".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            },
        )]);

        let yaml = state_to_yaml(&state).unwrap();

        let value = config_with_state("", &yaml).unwrap();
        let document: StateDocument = serde_yaml::from_value(value).unwrap();

        assert_eq!(document.state, state);
    }

    #[test]
    fn test_config_keys_win_over_state_keys() {
        let value = config_with_state("image: img:2\n", "image: img:1\nstate: {}\n").unwrap();

        assert_eq!(
            value.get("image").and_then(|v| v.as_str()),
            Some("img:2")
        );
    }

    #[test]
    fn test_state_stanza_merges_into_config() {
        let config = "image: img:1\n";
        let state = "state:\n  a:\n    container:\n      config:\n        name: a\n        image: img:1\n";

        let value = config_with_state(config, state).unwrap();

        assert!(value.get("state").is_some());
        assert_eq!(value.get("image").and_then(|v| v.as_str()), Some("img:1"));
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        assert!(config_with_state("- a\n- b\n", "").is_err());
    }
}
