//! Runtime-agnostic container types.
//!
//! These types are kept free of dependencies on the runtime and engine
//! modules, so runtime implementations and higher-level engines can both
//! import them without cyclic dependencies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How to run a single container, independent of the runtime driving it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pid_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipc_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_policy: String,
}

/// Observed status of a container, as reported by the runtime.
///
/// Status is derived, never authoritative. It is only trusted within a
/// single reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default)]
    pub state: ContainerState,
}

impl ContainerStatus {
    /// True when the runtime knows about the container in any lifecycle
    /// state, i.e. it has an ID and has not been reported missing.
    pub fn exists(&self) -> bool {
        !self.id.is_empty() && self.state != ContainerState::Missing
    }

    /// True when the container is running or about to run again.
    pub fn running(&self) -> bool {
        matches!(
            self.state,
            ContainerState::Running | ContainerState::Restarting
        )
    }
}

/// Lifecycle state of a container.
///
/// `Restarting` and `Unknown` are transient. The reconciliation engine
/// treats them as "not running" when planning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Missing,
    Created,
    Running,
    Restarting,
    Stopped,
    Exited,
    Unknown,
}

/// Host bind mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub propagation: String,
}

/// Published container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

/// A file materialized inside a container, not on the host.
///
/// Content is arbitrary bytes, certificates and static manifests
/// included, and is carried as base64 in serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    #[serde(default = "default_file_mode")]
    pub mode: u32,
    #[serde(default = "default_file_owner")]
    pub user: String,
    #[serde(default = "default_file_owner")]
    pub group: String,
    #[serde(default, with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl Default for File {
    fn default() -> Self {
        Self {
            path: String::new(),
            mode: default_file_mode(),
            user: default_file_owner(),
            group: default_file_owner(),
            content: Vec::new(),
        }
    }
}

fn default_file_mode() -> u32 {
    0o600
}

fn default_file_owner() -> String {
    "root".to_string()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;

        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
