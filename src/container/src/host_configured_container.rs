//! One container's full desired shape on one host.
//!
//! A host-configured container ties together the host to deploy on, the
//! runtime to drive there, the container specification and the config
//! files to materialize inside it. Its key in a containers map is a
//! logical name, orthogonal to the container's in-daemon name.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::Host;
use crate::runtime::docker::canonical_image_ref;
use crate::runtime::{Runtime, RuntimeConfig, RuntimeError};
use crate::transport::{Connected, TransportError};
use crate::types::{ContainerConfig, ContainerState, ContainerStatus, File};

/// Errors produced while validating or driving a single container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container configuration invalid: {0}")]
    Validation(String),

    #[error("container has no runtime ID")]
    MissingId,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Container specification together with its runtime selection and last
/// observed status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub config: ContainerConfig,
    #[serde(default, skip_serializing_if = "runtime_config_is_default")]
    pub runtime: RuntimeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ContainerStatus>,
}

fn runtime_config_is_default(config: &RuntimeConfig) -> bool {
    *config == RuntimeConfig::default()
}

/// One container fully resolved for one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfiguredContainer {
    #[serde(default)]
    pub host: Host,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_files: Vec<File>,
    pub container: Container,
}

impl HostConfiguredContainer {
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.container.config.name.is_empty() {
            return Err(ContainerError::Validation("name must be set".to_string()));
        }

        if self.container.config.image.is_empty() {
            return Err(ContainerError::Validation("image must be set".to_string()));
        }

        self.host
            .validate()
            .map_err(|e| ContainerError::Validation(e.to_string()))?;

        self.container
            .runtime
            .validate()
            .map_err(|e| ContainerError::Validation(e.to_string()))?;

        for file in &self.config_files {
            if !file.path.starts_with('/') {
                return Err(ContainerError::Validation(format!(
                    "config file path {:?} must be absolute",
                    file.path
                )));
            }
        }

        Ok(())
    }

    /// Connects to the host, tunnels the runtime daemon address when it is
    /// not directly reachable and builds the runtime client against the
    /// rewritten address.
    pub async fn connect(&self) -> Result<DeployedContainer, ContainerError> {
        self.validate()?;

        let session = self.host.connect().await?;

        let mut runtime_config = self.container.runtime.clone();

        let address = runtime_config.get_address();
        let reachable = match session.forward(&address).await {
            Ok(local) => local,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        if reachable != address {
            runtime_config.set_address(&reachable);
        }

        let runtime = match runtime_config.new() {
            Ok(runtime) => runtime,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        Ok(DeployedContainer {
            session,
            runtime,
            config: self.container.config.clone(),
            config_files: self.config_files.clone(),
            status: self.container.status.clone(),
        })
    }

    /// Returns this container with the given observed status.
    pub fn with_status(&self, status: Option<ContainerStatus>) -> HostConfiguredContainer {
        let mut hcc = self.clone();
        hcc.container.status = status;
        hcc
    }
}

/// What it takes to converge a previous container towards a desired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diff {
    /// The containers are identical.
    None,
    /// Only the config files differ; they can be copied in place.
    FilesOnly,
    /// The container must be replaced.
    Recreate,
}

/// Compares two host-configured containers occupying the same logical
/// slot. Any change to the host, the runtime selection or the container
/// spec forces a replacement; image references are canonicalized first so
/// an implied `:latest` does not.
pub fn diff(previous: &HostConfiguredContainer, desired: &HostConfiguredContainer) -> Diff {
    if previous.host != desired.host
        || previous.container.runtime != desired.container.runtime
        || !configs_equal(&previous.container.config, &desired.container.config)
    {
        return Diff::Recreate;
    }

    if !files_equal(&previous.config_files, &desired.config_files) {
        return Diff::FilesOnly;
    }

    Diff::None
}

fn configs_equal(previous: &ContainerConfig, desired: &ContainerConfig) -> bool {
    let mut previous = previous.clone();
    let mut desired = desired.clone();

    previous.image = canonical_image_ref(&previous.image);
    desired.image = canonical_image_ref(&desired.image);

    previous == desired
}

fn files_equal(previous: &[File], desired: &[File]) -> bool {
    let mut previous: Vec<&File> = previous.iter().collect();
    let mut desired: Vec<&File> = desired.iter().collect();

    previous.sort_by(|a, b| a.path.cmp(&b.path));
    desired.sort_by(|a, b| a.path.cmp(&b.path));

    previous == desired
}

/// A container reachable through an established session, ready to be
/// driven. Closing it closes the underlying transport.
pub struct DeployedContainer {
    session: Box<dyn Connected>,
    runtime: Box<dyn Runtime>,
    config: ContainerConfig,
    config_files: Vec<File>,
    status: Option<ContainerStatus>,
}

impl DeployedContainer {
    fn id(&self) -> Result<String, ContainerError> {
        self.status
            .as_ref()
            .filter(|s| !s.id.is_empty())
            .map(|s| s.id.clone())
            .ok_or(ContainerError::MissingId)
    }

    pub fn status(&self) -> Option<&ContainerStatus> {
        self.status.as_ref()
    }

    /// Creates the container and copies its config files in. When a copy
    /// fails the container is deleted again, so no partial containers are
    /// left behind.
    pub async fn create(&mut self) -> Result<String, ContainerError> {
        let id = self.runtime.create(&self.config).await?;

        tracing::info!("Created container {} ({})", self.config.name, id);

        if let Err(e) = self.runtime.copy_files(&id, &self.config_files).await {
            tracing::warn!(
                "Copying config files into {} failed, removing it again: {}",
                self.config.name,
                e
            );

            if let Err(delete_error) = self.runtime.delete(&id).await {
                tracing::warn!(
                    "Removing partially configured container {} failed: {}",
                    self.config.name,
                    delete_error
                );
            }

            return Err(e.into());
        }

        self.status = Some(ContainerStatus {
            id: id.clone(),
            name: self.config.name.clone(),
            image: canonical_image_ref(&self.config.image),
            state: ContainerState::Created,
        });

        Ok(id)
    }

    pub async fn start(&mut self) -> Result<(), ContainerError> {
        let id = self.id()?;

        self.runtime.start(&id).await?;

        tracing::info!("Started container {} ({})", self.config.name, id);

        self.update_status().await
    }

    pub async fn stop(&mut self) -> Result<(), ContainerError> {
        let id = self.id()?;

        self.runtime.stop(&id).await?;

        tracing::info!("Stopped container {} ({})", self.config.name, id);

        self.update_status().await
    }

    pub async fn delete(&mut self) -> Result<(), ContainerError> {
        let id = self.id()?;

        self.runtime.delete(&id).await?;

        tracing::info!("Removed container {} ({})", self.config.name, id);

        self.status = None;

        Ok(())
    }

    /// Refreshes the observed status. A container the runtime no longer
    /// recognizes clears the recorded ID.
    pub async fn update_status(&mut self) -> Result<(), ContainerError> {
        let id = self.id()?;

        let observed = self.runtime.status(&id).await?;

        if observed.state == ContainerState::Missing {
            tracing::warn!(
                "Container {} ({}) is no longer known to the runtime",
                self.config.name,
                id
            );
        }

        self.status = Some(observed);

        Ok(())
    }

    /// Re-copies the config files into the existing container, for changes
    /// which do not require replacing it.
    pub async fn configure(&mut self) -> Result<(), ContainerError> {
        let id = self.id()?;

        self.runtime.copy_files(&id, &self.config_files).await?;

        tracing::info!(
            "Updated {} config files in container {} ({})",
            self.config_files.len(),
            self.config.name,
            id
        );

        Ok(())
    }

    /// Reads back the config files as they exist inside the container.
    /// Absent files are omitted.
    pub async fn read_config_files(&self) -> Result<Vec<File>, ContainerError> {
        let id = self.id()?;

        let paths: Vec<String> = self.config_files.iter().map(|f| f.path.clone()).collect();

        Ok(self.runtime.read_files(&id, &paths).await?)
    }

    pub async fn close(self) {
        self.session.close().await;
    }
}
