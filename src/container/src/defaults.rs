//! Default values shared across the workspace.

/// Default Docker daemon address.
pub const DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Default etcd container image.
pub const ETCD_IMAGE: &str = "quay.io/coreos/etcd:v3.5.13";

/// Port etcd members serve client traffic on.
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Port etcd members use for peer communication.
pub const ETCD_PEER_PORT: u16 = 2380;

/// Default SSH port.
pub const SSH_PORT: u16 = 22;

/// Default timeout for a single transport connection attempt, in seconds.
pub const CONNECTION_TIMEOUT: u64 = 30;

/// Default window during which transport connects are retried, in seconds.
pub const RETRY_TIMEOUT: u64 = 60;

/// Default pause between transport connection attempts, in seconds.
pub const RETRY_INTERVAL: u64 = 1;
