//! Host specification and transport selection.
//!
//! A host carries exactly one transport variant as a tagged option.
//! Connecting a host yields an established session which the runtime
//! client layer uses to reach the container daemon.

use serde::{Deserialize, Serialize};

use crate::transport::{direct, ssh, Connected, Transport, TransportError};

/// Where and how to reach a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<direct::Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ssh::Config>,
}

impl Host {
    pub fn validate(&self) -> Result<(), TransportError> {
        match (&self.direct, &self.ssh) {
            (Some(_), Some(_)) => Err(TransportError::Config(
                "direct and ssh transports are mutually exclusive".to_string(),
            )),
            (None, None) => Err(TransportError::Config(
                "exactly one transport must be selected".to_string(),
            )),
            (Some(direct), None) => direct.validate(),
            (None, Some(ssh)) => ssh.validate(),
        }
    }

    /// Establishes a session over the selected transport.
    pub async fn connect(&self) -> Result<Box<dyn Connected>, TransportError> {
        self.validate()?;

        if let Some(ssh) = &self.ssh {
            return ssh.connect().await;
        }

        // validate() guarantees the direct transport is set here.
        self.direct.unwrap_or_default().connect().await
    }
}

/// Merges a host spec with resource-level defaults.
///
/// A host which explicitly selected the direct transport is left alone.
/// SSH settings merge field-wise, preferring the host's own values. A host
/// with no transport at all falls back to the defaults, and finally to the
/// direct transport.
pub fn build_config(mut host: Host, defaults: Host) -> Host {
    if host.direct.is_some() {
        return host;
    }

    host.ssh = match (host.ssh.take(), defaults.ssh) {
        (Some(own), Some(inherited)) => Some(ssh::Config::build(own, inherited)),
        (own, inherited) => own.or(inherited),
    };

    if host.ssh.is_none() {
        host.direct = defaults.direct.or(Some(direct::Config::default()));
    }

    host
}
