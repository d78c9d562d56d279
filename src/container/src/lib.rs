//! Declarative reconciliation engine for containers on remote hosts.
//!
//! This crate compares the previously written state of a set of
//! host-configured containers against a desired configuration and
//! converges reality towards it: creating, updating, starting, stopping
//! and removing containers on each host, and transporting files
//! (certificates, configs, static manifests) into them. Remote container
//! daemons are reached directly or through an SSH tunnel, so the engine
//! can drive a fleet of hosts from anywhere with credentials.

pub mod containers;
pub mod defaults;
pub mod host;
pub mod host_configured_container;
pub mod resource;
pub mod runtime;
pub mod transport;
pub mod types;
pub mod util;

pub use containers::{Containers, ContainersEngine, ContainersState};
pub use host::Host;
pub use host_configured_container::{diff, Container, Diff, HostConfiguredContainer};
pub use resource::Resource;
pub use runtime::{Runtime, RuntimeConfig};
pub use types::{ContainerConfig, ContainerState, ContainerStatus, File, Mount, PortMap};
