//! Point-to-point byte streams to remote hosts.
//!
//! A transport establishes a session to a host and can forward remote
//! endpoints to locally reachable addresses, so a container daemon on the
//! other end can be spoken to as if it were local. Transports are variant
//! types with a common capability set, selected by a tagged option on the
//! host spec.

pub mod direct;
pub mod ssh;

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced while establishing or using a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection attempt timed out after {0} seconds")]
    Timeout(u64),

    #[error("forwarding {address} failed: {reason}")]
    Forward { address: String, reason: String },

    #[error("transport configuration invalid: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport which has not been connected yet.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the session. Implementations retry on transport errors
    /// within their configured retry window.
    async fn connect(&self) -> Result<Box<dyn Connected>, TransportError>;
}

/// An established session to a host.
#[async_trait]
pub trait Connected: Send + Sync {
    /// Makes the given remote address reachable locally and returns the
    /// address to use instead. Repeated calls with the same remote address
    /// return the same local address.
    ///
    /// Accepts `tcp://host:port` and `unix:///path` addresses. A transport
    /// which can reach the address directly returns it unchanged.
    async fn forward(&self, address: &str) -> Result<String, TransportError>;

    /// Tears down forwards and the session. Safe to call more than once;
    /// subsequent calls are no-ops.
    async fn close(&self);
}

/// A remote endpoint a session can forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ForwardTarget {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl ForwardTarget {
    /// Parses `tcp://host:port`, `unix:///path` and bare `host:port`
    /// addresses.
    pub(crate) fn parse(address: &str) -> Result<Self, TransportError> {
        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::Config(format!(
                    "unix address {address:?} has no path"
                )));
            }

            return Ok(ForwardTarget::Unix {
                path: path.to_string(),
            });
        }

        let hostport = address.strip_prefix("tcp://").unwrap_or(address);

        let (host, port) = hostport.rsplit_once(':').ok_or_else(|| {
            TransportError::Config(format!("address {address:?} has no port"))
        })?;

        let port = port.parse::<u16>().map_err(|_| {
            TransportError::Config(format!("address {address:?} has invalid port"))
        })?;

        if host.is_empty() {
            return Err(TransportError::Config(format!(
                "address {address:?} has no host"
            )));
        }

        Ok(ForwardTarget::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_address() {
        assert_eq!(
            ForwardTarget::parse("tcp://127.0.0.1:2375").unwrap(),
            ForwardTarget::Tcp {
                host: "127.0.0.1".to_string(),
                port: 2375,
            }
        );
    }

    #[test]
    fn test_parse_bare_hostport() {
        assert_eq!(
            ForwardTarget::parse("example.com:2379").unwrap(),
            ForwardTarget::Tcp {
                host: "example.com".to_string(),
                port: 2379,
            }
        );
    }

    #[test]
    fn test_parse_unix_address() {
        assert_eq!(
            ForwardTarget::parse("unix:///var/run/docker.sock").unwrap(),
            ForwardTarget::Unix {
                path: "/var/run/docker.sock".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!(ForwardTarget::parse("tcp://127.0.0.1").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_unix_path() {
        assert!(ForwardTarget::parse("unix://").is_err());
    }
}
