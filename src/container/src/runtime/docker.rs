//! Docker-compatible runtime backend.

use std::collections::HashMap;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bollard::container::{
    Config as DaemonConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::types::{ContainerConfig, ContainerState, ContainerStatus, File, Mount};

use super::{Runtime, RuntimeError};

/// Timeout passed to the daemon when stopping containers, in seconds.
const STOP_TIMEOUT: i64 = 30;

/// Timeout for daemon API calls, in seconds. Image pulls stream progress,
/// so slow pulls do not trip this.
const API_TIMEOUT: u64 = 120;

/// Docker runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Daemon URL. Empty selects the standard local Unix socket.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

impl Config {
    pub fn get_address(&self) -> String {
        if self.host.is_empty() {
            return defaults::DOCKER_HOST.to_string();
        }

        self.host.clone()
    }

    /// Builds a client for the configured daemon address.
    pub fn new(&self) -> Result<DockerRuntime, RuntimeError> {
        let address = self.get_address();

        let client = if let Some(path) = address.strip_prefix("unix://") {
            Docker::connect_with_unix(path, API_TIMEOUT, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(&address, API_TIMEOUT, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| RuntimeError::Config(format!("connecting to daemon {address:?}: {e}")))?;

        Ok(DockerRuntime { client })
    }
}

/// Runtime client backed by a Docker-compatible daemon.
pub struct DockerRuntime {
    client: Docker,
}

/// Appends the default tag to image references which carry none, so
/// `image` and `image:latest` refer to the same thing when comparing
/// configurations.
pub fn canonical_image_ref(image: &str) -> String {
    // A colon after the last slash separates the tag; a digest reference
    // contains '@' and is already exact.
    let name = image.rsplit('/').next().unwrap_or(image);

    if name.contains(':') || name.contains('@') {
        return image.to_string();
    }

    format!("{image}:latest")
}

impl DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!("Pulling image {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut progress = self.client.create_image(Some(options), None, None);

        while let Some(update) = progress.next().await {
            update.map_err(|e| RuntimeError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    fn host_config(config: &ContainerConfig) -> HostConfig {
        let binds: Vec<String> = config.mounts.iter().map(mount_to_bind).collect();

        let port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> = config
            .ports
            .iter()
            .map(|p| {
                let protocol = if p.protocol.is_empty() {
                    "tcp"
                } else {
                    &p.protocol
                };

                (
                    format!("{}/{}", p.port, protocol),
                    Some(vec![bollard::models::PortBinding {
                        host_ip: Some(if p.ip.is_empty() {
                            "0.0.0.0".to_string()
                        } else {
                            p.ip.clone()
                        }),
                        host_port: Some(p.port.to_string()),
                    }]),
                )
            })
            .collect();

        let restart_policy = match config.restart_policy.as_str() {
            "" => None,
            "always" => Some(RestartPolicyNameEnum::ALWAYS),
            "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
            _ => Some(RestartPolicyNameEnum::NO),
        }
        .map(|name| RestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        });

        HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            privileged: Some(config.privileged),
            network_mode: non_empty(&config.network_mode),
            pid_mode: non_empty(&config.pid_mode),
            ipc_mode: non_empty(&config.ipc_mode),
            restart_policy,
            ..Default::default()
        }
    }

    /// Builds a TAR archive materializing the given files, rooted at `/`.
    fn files_to_tar(files: &[File]) -> Result<Vec<u8>, RuntimeError> {
        let mut builder = tar::Builder::new(Vec::new());

        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        for file in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(file.content.len() as u64);
            header.set_mode(file.mode);
            header.set_mtime(mtime);

            set_owner(&mut header, &file.user, true);
            set_owner(&mut header, &file.group, false);

            let path = file.path.trim_start_matches('/');

            builder
                .append_data(&mut header, path, file.content.as_slice())
                .map_err(|e| RuntimeError::Copy(format!("archiving {:?}: {e}", file.path)))?;
        }

        builder
            .into_inner()
            .map_err(|e| RuntimeError::Copy(e.to_string()))
    }

    /// Extracts regular file entries from a TAR stream returned by the
    /// daemon for the given requested path.
    fn tar_to_files(path: &str, archive: &[u8]) -> Result<Vec<File>, RuntimeError> {
        let mut entries = Vec::new();

        let mut archive = tar::Archive::new(archive);

        for entry in archive
            .entries()
            .map_err(|e| RuntimeError::Read(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| RuntimeError::Read(e.to_string()))?;

            if entry.header().entry_type() != tar::EntryType::Regular {
                continue;
            }

            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| RuntimeError::Read(format!("reading {path:?}: {e}")))?;

            let header = entry.header();

            let user = header
                .username()
                .ok()
                .flatten()
                .map(str::to_string)
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| header.uid().unwrap_or_default().to_string());

            let group = header
                .groupname()
                .ok()
                .flatten()
                .map(str::to_string)
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| header.gid().unwrap_or_default().to_string());

            entries.push(File {
                path: path.to_string(),
                mode: header.mode().unwrap_or_default(),
                user,
                group,
                content,
            });
        }

        Ok(entries)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn mount_to_bind(mount: &Mount) -> String {
    let mut options = Vec::new();

    if mount.read_only {
        options.push("ro".to_string());
    }

    if !mount.propagation.is_empty() {
        options.push(mount.propagation.clone());
    }

    if options.is_empty() {
        return format!("{}:{}", mount.source, mount.target);
    }

    format!("{}:{}:{}", mount.source, mount.target, options.join(","))
}

fn set_owner(header: &mut tar::Header, owner: &str, user: bool) {
    // Numeric owners go into uid/gid, names into the GNU name fields.
    match (owner.parse::<u64>(), user) {
        (Ok(id), true) => header.set_uid(id),
        (Ok(id), false) => header.set_gid(id),
        (Err(_), true) => {
            let _ = header.set_username(owner);
        }
        (Err(_), false) => {
            let _ = header.set_groupname(owner);
        }
    }
}

fn not_found(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_state(state: Option<ContainerStateStatusEnum>) -> ContainerState {
    match state {
        Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerStateStatusEnum::PAUSED) | Some(ContainerStateStatusEnum::DEAD) => {
            ContainerState::Stopped
        }
        Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
        _ => ContainerState::Unknown,
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let image = canonical_image_ref(&config.image);

        self.pull_image(&image).await?;

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let daemon_config = DaemonConfig {
            image: Some(image),
            cmd: if config.args.is_empty() {
                None
            } else {
                Some(config.args.clone())
            },
            entrypoint: if config.entrypoint.is_empty() {
                None
            } else {
                Some(config.entrypoint.clone())
            },
            env: if env.is_empty() { None } else { Some(env) },
            user: match (config.user.is_empty(), config.group.is_empty()) {
                (true, _) => None,
                (false, true) => Some(config.user.clone()),
                (false, false) => Some(format!("{}:{}", config.user, config.group)),
            },
            host_config: Some(Self::host_config(config)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), daemon_config)
            .await
            .map_err(|e| match &e {
                DockerError::DockerResponseServerError {
                    status_code: 409, ..
                } => RuntimeError::NameConflict(config.name.clone()),
                DockerError::DockerResponseServerError {
                    status_code: 400,
                    message,
                } => RuntimeError::InvalidSpec(message.clone()),
                _ => RuntimeError::Runtime(e.to_string()),
            })?;

        for warning in &response.warnings {
            tracing::warn!("Creating container {}: {}", config.name, warning);
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                if not_found(&e) {
                    RuntimeError::NotFound(id.to_string())
                } else {
                    RuntimeError::Runtime(e.to_string())
                }
            })
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: STOP_TIMEOUT };

        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304 means the container was already stopped.
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) if not_found(&e) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(RuntimeError::Runtime(e.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Runtime(e.to_string())),
        }
    }

    async fn status(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let inspect = match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if not_found(&e) => {
                return Ok(ContainerStatus {
                    state: ContainerState::Missing,
                    ..Default::default()
                });
            }
            Err(e) => return Err(RuntimeError::Runtime(e.to_string())),
        };

        let image = inspect
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .or(inspect.image)
            .unwrap_or_default();

        Ok(ContainerStatus {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image,
            state: map_state(inspect.state.and_then(|s| s.status)),
        })
    }

    async fn read_files(&self, id: &str, paths: &[String]) -> Result<Vec<File>, RuntimeError> {
        let mut files = Vec::new();

        for path in paths {
            let options = DownloadFromContainerOptions { path: path.clone() };

            let mut stream = self.client.download_from_container(id, Some(options));

            let mut archive = Vec::new();
            let mut absent = false;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => archive.extend_from_slice(&bytes),
                    // An absent path is omitted from the result, so the
                    // caller can diff against reality without special
                    // cases.
                    Err(e) if not_found(&e) => {
                        absent = true;
                        break;
                    }
                    Err(DockerError::DockerResponseServerError {
                        status_code: 500,
                        message,
                    }) if message.contains("No such container") => {
                        return Err(RuntimeError::NotFound(id.to_string()));
                    }
                    Err(e) => return Err(RuntimeError::Read(e.to_string())),
                }
            }

            if absent {
                continue;
            }

            files.extend(Self::tar_to_files(path, &archive)?);
        }

        Ok(files)
    }

    async fn copy_files(&self, id: &str, files: &[File]) -> Result<(), RuntimeError> {
        if files.is_empty() {
            return Ok(());
        }

        let archive = Self::files_to_tar(files)?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(|e| {
                if not_found(&e) {
                    RuntimeError::NotFound(id.to_string())
                } else {
                    RuntimeError::Copy(e.to_string())
                }
            })
    }
}
