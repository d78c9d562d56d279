use thiserror::Error;

use container::containers::ContainersError;
use container::host_configured_container::ContainerError;
use container::resource::ResourceError;
use container::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster configuration invalid: {0}")]
    Validation(String),

    #[error("member {name:?}: {reason}")]
    Member { name: String, reason: String },

    #[error(transparent)]
    Containers(#[from] ContainersError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    State(#[from] ResourceError),

    #[error("etcd client error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("no members defined")]
    NoMembers,
}
