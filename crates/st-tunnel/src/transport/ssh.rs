//! SSH transport
//!
//! Dials the target, verifies the server's host key against the
//! [`TrustStore`], authenticates with a public key and opens one exec
//! channel per device.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Disconnect, Sig};
use russh_keys::key::{KeyPair, PublicKey};
use thiserror::Error;
use tokio::net::TcpStream;

use st_core::config::ClientConfig;
use st_core::error::{ChannelError, ConnectError, TrustError};
use st_core::traits::{Connector, RemoteEvent, RemoteInput, RemoteSession, Transport};
use st_core::types::Target;

use crate::auth::TrustStore;

/// Errors surfaced by the client handler during the handshake
#[derive(Debug, Error)]
enum HandlerError {
    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// SSH client handler: host key verification only, channel traffic is read
/// through each [`Channel`]
struct ClientHandler {
    trust: Arc<TrustStore>,
    dialed: String,
    observed: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = HandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Server host key for {} ({}): {}",
            self.dialed,
            self.observed,
            server_public_key.fingerprint()
        );
        self.trust
            .verify(&self.dialed, &self.observed, server_public_key)?;
        Ok(true)
    }
}

/// Establishes authenticated SSH connections
pub struct SshConnector {
    config: ClientConfig,
    trust: Arc<TrustStore>,
    key: Arc<KeyPair>,
}

impl SshConnector {
    /// Create a connector, loading the identity selected by `config`
    pub fn new(config: ClientConfig) -> Result<Self, ConnectError> {
        let identity = config.resolve_identity().ok_or_else(|| {
            ConnectError::KeyNotFound("no identity file configured or found in ~/.ssh".to_string())
        })?;

        if !identity.exists() {
            return Err(ConnectError::KeyNotFound(format!(
                "{} does not exist",
                identity.display()
            )));
        }

        let key = russh_keys::load_secret_key(&identity, None).map_err(|e| {
            ConnectError::KeyNotFound(format!("failed to load {}: {}", identity.display(), e))
        })?;
        tracing::debug!("Loaded identity {:?}", identity);

        let trust = Arc::new(TrustStore::new(
            config.known_hosts_path(),
            config.accept_new_hosts,
        ));

        Ok(Self {
            config,
            trust,
            key: Arc::new(key),
        })
    }

    fn ssh_config(&self) -> Config {
        Config {
            keepalive_interval: self.config.keepalive(),
            ..Config::default()
        }
    }

    async fn dial(&self, target: &Target) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let address = target.address();

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&address)
            .await
            .map_err(|source| ConnectError::Resolve {
                target: address.clone(),
                source,
            })?
            .collect();

        let stream = TcpStream::connect(&addrs[..])
            .await
            .map_err(|source| ConnectError::Io {
                target: address.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let peer = stream.peer_addr().map_err(|source| ConnectError::Io {
            target: address.clone(),
            source,
        })?;

        Ok((stream, peer))
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Transport = SshTransport;

    async fn connect(&self, target: &Target) -> Result<SshTransport, ConnectError> {
        let address = target.address();
        let timeout = self.config.connect_timeout;

        tracing::debug!("Connecting to {}", address);
        let (stream, peer) = tokio::time::timeout(timeout, self.dial(target))
            .await
            .map_err(|_| ConnectError::Timeout {
                target: address.clone(),
            })??;
        tracing::debug!("TCP connection to {} established ({})", address, peer);

        let handler = ClientHandler {
            trust: Arc::clone(&self.trust),
            dialed: address.clone(),
            observed: peer.to_string(),
        };

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect_stream(Arc::new(self.ssh_config()), stream, handler),
        )
        .await
        .map_err(|_| ConnectError::Timeout {
            target: address.clone(),
        })?
        .map_err(|e| handshake_error(&address, e))?;

        tracing::debug!("Authenticating as user '{}'", self.config.username);
        let authenticated = handle
            .authenticate_publickey(&self.config.username, Arc::clone(&self.key))
            .await
            .map_err(|e| ConnectError::Ssh(format!("authentication error: {}", e)))?;

        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(ConnectError::AuthRejected {
                user: self.config.username.clone(),
            });
        }

        tracing::info!("Connected to {} as {}", address, self.config.username);
        Ok(SshTransport {
            handle: Arc::new(handle),
        })
    }
}

fn handshake_error(address: &str, error: HandlerError) -> ConnectError {
    match error {
        HandlerError::Trust(e) => ConnectError::Trust(e),
        HandlerError::Ssh(e) => {
            ConnectError::Ssh(format!("handshake with {} failed: {}", address, e))
        }
    }
}

/// An authenticated SSH connection
pub struct SshTransport {
    handle: Arc<Handle<ClientHandler>>,
}

#[async_trait]
impl Transport for SshTransport {
    type Session = SshSession;

    async fn open_session(&self) -> Result<SshSession, ChannelError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ChannelError::new(format!("failed to open session channel: {}", e)))?;

        Ok(SshSession {
            channel,
            handle: Arc::clone(&self.handle),
        })
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Disconnect failed: {}", e);
        }
    }
}

/// One exec channel
///
/// Reads go through the channel; writes go through the connection handle
/// so the uplink never contends with a pending `wait`.
pub struct SshSession {
    channel: Channel<Msg>,
    handle: Arc<Handle<ClientHandler>>,
}

#[async_trait]
impl RemoteSession for SshSession {
    type Input = SshInput;

    async fn exec(&mut self, command: &str) -> Result<SshInput, ChannelError> {
        self.channel
            .exec(true, command)
            .await
            .map_err(|e| ChannelError::new(format!("exec failed: {}", e)))?;

        Ok(SshInput {
            handle: Arc::clone(&self.handle),
            id: self.channel.id(),
        })
    }

    async fn recv(&mut self) -> Option<RemoteEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => RemoteEvent::Data(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    RemoteEvent::Stderr(Bytes::copy_from_slice(&data))
                }
                ChannelMsg::ExitStatus { exit_status } => RemoteEvent::Exit(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    RemoteEvent::Signaled(format!("{:?}", signal_name))
                }
                ChannelMsg::Eof => RemoteEvent::Eof,
                ChannelMsg::Close => RemoteEvent::Closed,
                ChannelMsg::Failure => {
                    tracing::warn!("Server rejected exec request on channel {}", self.channel.id());
                    RemoteEvent::Closed
                }
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn interrupt(&mut self) {
        let id = self.channel.id();
        if let Err(e) = self.channel.signal(Sig::INT).await {
            tracing::debug!("Failed to signal channel {}: {}", id, e);
        }
        if let Err(e) = self.channel.close().await {
            tracing::debug!("Failed to close channel {}: {}", id, e);
        }
    }
}

/// Stdin side of an [`SshSession`]
pub struct SshInput {
    handle: Arc<Handle<ClientHandler>>,
    id: ChannelId,
}

#[async_trait]
impl RemoteInput for SshInput {
    async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ChannelError::new("failed to send data to channel"))
    }

    async fn eof(&self) -> Result<(), ChannelError> {
        self.handle
            .eof(self.id)
            .await
            .map_err(|_| ChannelError::new("failed to send eof to channel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn connector(dir: &TempDir, connect_timeout: Duration) -> SshConnector {
        let config = ClientConfig {
            known_hosts: dir.path().join("known_hosts"),
            connect_timeout,
            ..ClientConfig::default()
        };
        let trust = Arc::new(TrustStore::new(config.known_hosts_path(), false));
        let key = KeyPair::generate_ed25519().unwrap();
        SshConnector {
            config,
            trust,
            key: Arc::new(key),
        }
    }

    #[test]
    fn test_missing_identity_file() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            identity_file: Some(dir.path().join("id_ed25519")),
            ..ClientConfig::default()
        };
        match SshConnector::new(config) {
            Err(ConnectError::KeyNotFound(message)) => assert!(message.contains("does not exist")),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("connector built without an identity"),
        }
    }

    #[test]
    fn test_unreadable_identity_file() {
        let dir = TempDir::new().unwrap();
        let identity = dir.path().join("id_ed25519");
        std::fs::write(&identity, "not a private key\n").unwrap();

        let config = ClientConfig {
            identity_file: Some(identity),
            ..ClientConfig::default()
        };
        assert!(matches!(
            SshConnector::new(config),
            Err(ConnectError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accept and hold the connection without ever sending a banner
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let connector = connector(&dir, Duration::from_millis(200));
        let target = Target::new("127.0.0.1", port);
        let result = tokio::time::timeout(Duration::from_secs(5), connector.connect(&target))
            .await
            .unwrap();
        assert!(matches!(result, Err(ConnectError::Timeout { .. })));
        server.abort();
    }

    #[tokio::test]
    async fn test_refused_connection_is_io_error() {
        let dir = TempDir::new().unwrap();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector = connector(&dir, Duration::from_secs(5));
        let result = connector.connect(&Target::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ConnectError::Io { .. })));
    }

    #[test]
    fn test_handshake_trust_failure_stays_trust_error() {
        let err = handshake_error(
            "example.com:22",
            HandlerError::Trust(TrustError::UnknownHost {
                host: "example.com".into(),
            }),
        );
        assert!(matches!(err, ConnectError::Trust(TrustError::UnknownHost { .. })));

        let err = handshake_error("example.com:22", HandlerError::Ssh(russh::Error::Disconnect));
        match err {
            ConnectError::Ssh(message) => assert!(message.contains("example.com:22")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
