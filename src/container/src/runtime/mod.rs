//! Container runtime clients.
//!
//! A runtime client drives a container daemon: image presence, lifecycle,
//! status and file transfer into containers. Runtimes are variant types
//! selected by a tagged option; one concrete backend speaks to a
//! Docker-compatible daemon.

pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ContainerConfig, ContainerStatus, File};

/// Errors produced by runtime clients.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("pulling image {image:?} failed: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("container name {0:?} already taken")]
    NameConflict(String),

    #[error("container {0:?} not found")]
    NotFound(String),

    #[error("container configuration rejected: {0}")]
    InvalidSpec(String),

    #[error("runtime configuration invalid: {0}")]
    Config(String),

    #[error("reading files from container failed: {0}")]
    Read(String),

    #[error("copying files into container failed: {0}")]
    Copy(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// The capability set every runtime backend provides.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Creates the container, pulling the image first when it is not
    /// present, and returns the runtime-assigned ID.
    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stops the container. Stopping an already stopped container is
    /// treated as success.
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    /// Removes the container. Removing a container the daemon no longer
    /// knows is treated as success.
    async fn delete(&self, id: &str) -> Result<(), RuntimeError>;

    /// Returns the observed status. A container the daemon does not
    /// recognize is reported with state `Missing`, not as an error.
    async fn status(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    /// Reads the given absolute paths from the container. Absent paths are
    /// omitted from the result, never reported as errors.
    async fn read_files(&self, id: &str, paths: &[String]) -> Result<Vec<File>, RuntimeError>;

    /// Materializes the given files inside the container.
    async fn copy_files(&self, id: &str, files: &[File]) -> Result<(), RuntimeError>;
}

/// Tagged runtime selection. Exactly one backend must be configured;
/// an empty config selects the Docker backend with its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<docker::Config>,

    #[cfg(test)]
    #[serde(skip)]
    pub fake: Option<fake::Config>,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let mut selected = usize::from(self.docker.is_some());

        #[cfg(test)]
        {
            selected += usize::from(self.fake.is_some());
        }

        if selected > 1 {
            return Err(RuntimeError::Config(
                "exactly one runtime must be selected".to_string(),
            ));
        }

        Ok(())
    }

    /// Builds the configured runtime client.
    pub fn new(&self) -> Result<Box<dyn Runtime>, RuntimeError> {
        self.validate()?;

        #[cfg(test)]
        if let Some(fake) = &self.fake {
            return Ok(Box::new(fake.new()));
        }

        Ok(Box::new(self.docker.clone().unwrap_or_default().new()?))
    }

    /// Returns the daemon address the configured runtime dials.
    pub fn get_address(&self) -> String {
        #[cfg(test)]
        if self.fake.is_some() {
            return fake::ADDRESS.to_string();
        }

        self.docker.clone().unwrap_or_default().get_address()
    }

    /// Replaces the daemon address, e.g. with a local endpoint forwarded
    /// over a transport.
    pub fn set_address(&mut self, address: &str) {
        #[cfg(test)]
        if self.fake.is_some() {
            return;
        }

        self.docker.get_or_insert_with(Default::default).host = address.to_string();
    }
}
