//! SSH transport.
//!
//! Authenticates with a private key or a password and forwards remote TCP
//! endpoints and Unix sockets to loopback ephemeral ports over the session.
//! Host key checking is disabled; the operator supplies the credentials and
//! the address, which is the trust anchor here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::defaults;
use crate::util;

use super::{Connected, ForwardTarget, Transport, TransportError};

/// Interval between keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Number of unanswered keepalive probes after which the session is
/// dropped.
const KEEPALIVE_MAX: usize = 3;

/// SSH transport configuration.
///
/// Zero values mean "unset" so configs can be merged field-wise with
/// resource-level defaults before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Timeout for a single connection attempt, in seconds.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub connection_timeout: u64,
    /// Window during which failed connects are retried, in seconds.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub retry_timeout: u64,
    /// Pause between connection attempts, in seconds.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub retry_interval: u64,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

impl Config {
    /// Merges `config` with `defaults`, preferring values set in `config`.
    pub fn build(config: Config, defaults: Config) -> Config {
        Config {
            address: util::pick_string(&[&config.address, &defaults.address]).to_string(),
            port: util::pick_u16(&[config.port, defaults.port]),
            user: util::pick_string(&[&config.user, &defaults.user]).to_string(),
            password: config.password.or(defaults.password),
            private_key: config.private_key.or(defaults.private_key),
            connection_timeout: util::pick_u64(&[
                config.connection_timeout,
                defaults.connection_timeout,
            ]),
            retry_timeout: util::pick_u64(&[config.retry_timeout, defaults.retry_timeout]),
            retry_interval: util::pick_u64(&[config.retry_interval, defaults.retry_interval]),
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.address.is_empty() {
            return Err(TransportError::Config("address must be set".to_string()));
        }

        match (&self.private_key, &self.password) {
            (None, None) => Err(TransportError::Config(
                "either private key or password must be set".to_string(),
            )),
            (Some(_), Some(_)) => Err(TransportError::Config(
                "private key and password are mutually exclusive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn port(&self) -> u16 {
        util::pick_u16(&[self.port, defaults::SSH_PORT])
    }

    pub fn user(&self) -> String {
        if !self.user.is_empty() {
            return self.user.clone();
        }

        std::env::var("USER").unwrap_or_else(|_| "root".to_string())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(util::pick_u64(&[
            self.connection_timeout,
            defaults::CONNECTION_TIMEOUT,
        ]))
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(util::pick_u64(&[self.retry_timeout, defaults::RETRY_TIMEOUT]))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(util::pick_u64(&[
            self.retry_interval,
            defaults::RETRY_INTERVAL,
        ]))
    }

    async fn connect_once(&self) -> Result<client::Handle<Handler>, TransportError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let mut session =
            client::connect(config, (self.address.as_str(), self.port()), Handler {})
                .await
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let user = self.user();

        let authenticated = if let Some(key) = &self.private_key {
            let key = russh_keys::decode_secret_key(key, None)
                .map_err(|e| TransportError::Config(format!("parsing private key: {e}")))?;

            session
                .authenticate_publickey(&user, Arc::new(key))
                .await
                .map_err(|e| TransportError::Protocol(e.to_string()))?
        } else if let Some(password) = &self.password {
            session
                .authenticate_password(&user, password)
                .await
                .map_err(|e| TransportError::Protocol(e.to_string()))?
        } else {
            false
        };

        if !authenticated {
            return Err(TransportError::AuthFailed(format!(
                "user {user:?} rejected by {}",
                self.address
            )));
        }

        Ok(session)
    }
}

#[async_trait]
impl Transport for Config {
    /// Connects to the host, retrying transport errors every retry
    /// interval until the retry window elapses. Authentication failures
    /// are surfaced immediately.
    async fn connect(&self) -> Result<Box<dyn Connected>, TransportError> {
        self.validate()?;

        let deadline = Instant::now() + self.retry_timeout();

        loop {
            let attempt = timeout(self.connection_timeout(), self.connect_once()).await;

            let error = match attempt {
                Ok(Ok(session)) => {
                    return Ok(Box::new(Session {
                        handle: Arc::new(session),
                        forwards: Mutex::new(HashMap::new()),
                        listeners: Mutex::new(Vec::new()),
                        closed: AtomicBool::new(false),
                    }));
                }
                Ok(Err(e @ TransportError::AuthFailed(_))) => return Err(e),
                Ok(Err(e @ TransportError::Config(_))) => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(self.connection_timeout().as_secs()),
            };

            if Instant::now() + self.retry_interval() >= deadline {
                return Err(error);
            }

            tracing::warn!(
                "Connecting to {}:{} failed, retrying: {}",
                self.address,
                self.port(),
                error
            );

            sleep(self.retry_interval()).await;
        }
    }
}

struct Handler {}

#[async_trait]
impl client::Handler for Handler {
    type Error = russh::Error;

    // The operator supplies the host address and credentials, known-hosts
    // checks are intentionally not performed.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An established SSH session. Multiple forwards multiplex over the one
/// session.
struct Session {
    handle: Arc<client::Handle<Handler>>,
    /// remote address -> local address, so repeated forwards of the same
    /// endpoint reuse the existing listener.
    forwards: Mutex<HashMap<String, String>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Connected for Session {
    async fn forward(&self, address: &str) -> Result<String, TransportError> {
        let target = ForwardTarget::parse(address)?;

        let mut forwards = self.forwards.lock().await;

        if let Some(local) = forwards.get(address) {
            return Ok(local.clone());
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TransportError::Forward {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let local_address = listener
            .local_addr()
            .map_err(|e| TransportError::Forward {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let local = format!("tcp://{local_address}");

        tracing::debug!("Forwarding {} to {}", address, local);

        let handle = self.handle.clone();

        let accept_loop = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };

                let handle = handle.clone();
                let target = target.clone();

                tokio::spawn(async move {
                    if let Err(e) = proxy(handle, target.clone(), socket).await {
                        tracing::warn!("Proxying connection to {:?} failed: {}", target, e);
                    }
                });
            }
        });

        self.listeners.lock().await.push(accept_loop);
        forwards.insert(address.to_string(), local.clone());

        Ok(local)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for listener in self.listeners.lock().await.drain(..) {
            listener.abort();
        }

        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
        {
            tracing::debug!("Disconnecting SSH session: {}", e);
        }
    }
}

/// Proxies one accepted connection to the remote target over a dedicated
/// channel of the shared session.
async fn proxy(
    handle: Arc<client::Handle<Handler>>,
    target: ForwardTarget,
    mut socket: tokio::net::TcpStream,
) -> Result<(), TransportError> {
    let channel = match &target {
        ForwardTarget::Tcp { host, port } => handle
            .channel_open_direct_tcpip(host.as_str(), u32::from(*port), "127.0.0.1", 0)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?,
        ForwardTarget::Unix { path } => handle
            .channel_open_direct_streamlocal(path.as_str())
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?,
    };

    let mut stream = channel.into_stream();

    tokio::io::copy_bidirectional(&mut socket, &mut stream).await?;

    Ok(())
}
