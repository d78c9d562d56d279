//! A single etcd cluster member and its container shape.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Certificate, Client, ConnectOptions, Identity, TlsOptions};
use serde::{Deserialize, Serialize};

use container::defaults;
use container::host::Host;
use container::host_configured_container::{Container, HostConfiguredContainer};
use container::transport::Connected;
use container::types::{ContainerConfig, File, Mount};
use container::util;

use crate::error::ClusterError;

/// Timeout for dialing the etcd cluster.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where certificates and keys are materialized inside the member
/// container.
const PKI_PATH: &str = "/etc/kubernetes/etcd";

/// Host directory holding the member's data, bind-mounted into the
/// container.
const DATA_PATH: &str = "/var/lib/etcd";

/// User-supplied configuration of one etcd member. Empty fields inherit
/// from the cluster during propagation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    pub peer_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_cert_allowed_cn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initial_cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initial_cluster_token: String,
    /// Whether this member founds a new cluster rather than joining an
    /// existing one. Set during propagation from the cluster state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub new_cluster: bool,
    #[serde(default)]
    pub host: Host,
}

fn looks_like_certificate(pem: &str) -> bool {
    pem.contains("BEGIN CERTIFICATE")
}

fn looks_like_key(pem: &str) -> bool {
    pem.contains("PRIVATE KEY")
}

impl MemberConfig {
    pub fn validate(&self) -> Result<(), ClusterError> {
        let fail = |reason: &str| {
            Err(ClusterError::Member {
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };

        if self.name.is_empty() {
            return fail("name must be set");
        }

        if self.peer_address.is_empty() {
            return fail("peer address must be set");
        }

        if !looks_like_certificate(&self.ca_certificate) {
            return fail("CA certificate is not a PEM certificate");
        }

        if !looks_like_certificate(&self.peer_certificate) {
            return fail("peer certificate is not a PEM certificate");
        }

        if !looks_like_certificate(&self.server_certificate) {
            return fail("server certificate is not a PEM certificate");
        }

        if !looks_like_key(&self.peer_key) {
            return fail("peer key is not a PEM private key");
        }

        if !looks_like_key(&self.server_key) {
            return fail("server key is not a PEM private key");
        }

        if let Err(e) = self.host.validate() {
            return Err(ClusterError::Member {
                name: self.name.clone(),
                reason: e.to_string(),
            });
        }

        Ok(())
    }

    /// Validates the configuration and returns the executable member.
    pub fn new(&self) -> Result<Member, ClusterError> {
        self.validate()?;

        Ok(Member {
            config: self.clone(),
        })
    }
}

/// Validated etcd member.
#[derive(Debug, Clone)]
pub struct Member {
    config: MemberConfig,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn peer_address(&self) -> &str {
        &self.config.peer_address
    }

    /// The URL peers reach this member on.
    pub fn peer_url(&self) -> String {
        format!(
            "https://{}:{}",
            self.config.peer_address,
            defaults::ETCD_PEER_PORT
        )
    }

    fn server_address(&self) -> &str {
        util::pick_string(&[&self.config.server_address, &self.config.peer_address])
    }

    /// Lowers the member to its container shape: the etcd container with
    /// TLS material injected as config files and the data directory
    /// bind-mounted from the host.
    pub fn to_host_configured_container(&self) -> Result<HostConfiguredContainer, ClusterError> {
        let c = &self.config;

        let initial_cluster_state = if c.new_cluster { "new" } else { "existing" };

        let mut args = vec![
            format!("--name={}", c.name),
            format!("--data-dir={DATA_PATH}/{}", c.name),
            format!("--listen-client-urls=https://{}:2379", self.server_address()),
            format!("--advertise-client-urls=https://{}:2379", self.server_address()),
            format!("--listen-peer-urls=https://{}:2380", c.peer_address),
            format!("--initial-advertise-peer-urls={}", self.peer_url()),
            format!("--initial-cluster={}", c.initial_cluster),
            format!("--initial-cluster-state={initial_cluster_state}"),
            format!("--initial-cluster-token={}", c.initial_cluster_token),
            format!("--trusted-ca-file={PKI_PATH}/ca.crt"),
            format!("--cert-file={PKI_PATH}/server.crt"),
            format!("--key-file={PKI_PATH}/server.key"),
            "--client-cert-auth=true".to_string(),
            format!("--peer-trusted-ca-file={PKI_PATH}/ca.crt"),
            format!("--peer-cert-file={PKI_PATH}/peer.crt"),
            format!("--peer-key-file={PKI_PATH}/peer.key"),
            "--peer-client-cert-auth=true".to_string(),
        ];

        if !c.peer_cert_allowed_cn.is_empty() {
            args.push(format!("--peer-cert-allowed-cn={}", c.peer_cert_allowed_cn));
        }

        let config_files = vec![
            pki_file("ca.crt", &c.ca_certificate),
            pki_file("server.crt", &c.server_certificate),
            pki_file("server.key", &c.server_key),
            pki_file("peer.crt", &c.peer_certificate),
            pki_file("peer.key", &c.peer_key),
        ];

        let hcc = HostConfiguredContainer {
            host: c.host.clone(),
            config_files,
            container: Container {
                config: ContainerConfig {
                    name: c.name.clone(),
                    image: util::pick_string(&[&c.image, defaults::ETCD_IMAGE]).to_string(),
                    args,
                    mounts: vec![Mount {
                        source: DATA_PATH.to_string(),
                        target: DATA_PATH.to_string(),
                        ..Default::default()
                    }],
                    network_mode: "host".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        };

        hcc.validate()?;

        Ok(hcc)
    }

    /// Connects to the member's host and forwards the given client
    /// endpoints, returning the locally reachable endpoint URLs together
    /// with the session keeping them alive.
    pub async fn forward_endpoints(
        &self,
        endpoints: &[String],
    ) -> Result<(Vec<String>, Box<dyn Connected>), ClusterError> {
        let session = self.config.host.connect().await?;

        let mut forwarded = Vec::new();

        for endpoint in endpoints {
            match session.forward(endpoint).await {
                Ok(local) => {
                    forwarded.push(format!("https://{}", local.trim_start_matches("tcp://")));
                }
                Err(e) => {
                    session.close().await;
                    return Err(e.into());
                }
            }
        }

        Ok((forwarded, session))
    }

    /// Builds an etcd v3 client against the given endpoints, using the
    /// cluster CA and this member's peer certificate as client identity.
    pub async fn etcd_client(&self, endpoints: Vec<String>) -> Result<Client, ClusterError> {
        let tls = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(self.config.ca_certificate.clone()))
            .identity(Identity::from_pem(
                self.config.peer_certificate.clone(),
                self.config.peer_key.clone(),
            ));

        let options = ConnectOptions::new()
            .with_tls(tls)
            .with_connect_timeout(DIAL_TIMEOUT);

        Ok(Client::connect(endpoints, Some(options)).await?)
    }

    /// Adds this member to the cluster. A member already present with the
    /// same peer URL is left alone.
    pub async fn add(&self, membership: &mut dyn Membership) -> Result<(), ClusterError> {
        let peer_url = self.peer_url();

        let members = membership.list().await?;

        if members.iter().any(|m| m.peer_urls.contains(&peer_url)) {
            tracing::info!("Member {} is already part of the cluster", self.config.name);
            return Ok(());
        }

        tracing::info!("Adding member {} ({})", self.config.name, peer_url);

        membership.add(vec![peer_url]).await
    }
}

/// Removes the member with the given name from the cluster. Removed
/// members no longer carry configuration, so only the name identifies
/// them. A name the cluster does not know is treated as already removed.
pub async fn remove_member(
    membership: &mut dyn Membership,
    name: &str,
) -> Result<(), ClusterError> {
    let members = membership.list().await?;

    let Some(member) = members.iter().find(|m| m.name == name) else {
        tracing::info!("Member {} is already gone from the cluster", name);
        return Ok(());
    };

    tracing::info!("Removing member {} ({})", name, member.id);

    membership.remove(member.id).await
}

/// One member as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
}

/// The membership operations the cluster wrapper needs from an etcd
/// client.
#[async_trait]
pub trait Membership: Send {
    async fn list(&mut self) -> Result<Vec<MemberInfo>, ClusterError>;

    async fn add(&mut self, peer_urls: Vec<String>) -> Result<(), ClusterError>;

    async fn remove(&mut self, id: u64) -> Result<(), ClusterError>;
}

#[async_trait]
impl Membership for Client {
    async fn list(&mut self) -> Result<Vec<MemberInfo>, ClusterError> {
        let response = self.member_list().await?;

        Ok(response
            .members()
            .iter()
            .map(|m| MemberInfo {
                id: m.id(),
                name: m.name().to_string(),
                peer_urls: m.peer_urls().to_vec(),
            })
            .collect())
    }

    async fn add(&mut self, peer_urls: Vec<String>) -> Result<(), ClusterError> {
        self.member_add(peer_urls, None).await?;

        Ok(())
    }

    async fn remove(&mut self, id: u64) -> Result<(), ClusterError> {
        self.member_remove(id).await?;

        Ok(())
    }
}

fn pki_file(name: &str, content: &str) -> File {
    File {
        path: format!("{PKI_PATH}/{name}"),
        mode: 0o600,
        content: content.as_bytes().to_vec(),
        ..Default::default()
    }
}
