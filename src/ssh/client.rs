//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::{HashAlg, PublicKey};
use russh::Channel;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::error::SshError;
use crate::forwarding::bridge_channel;

/// Parameters for one SSH connection
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Connection (handshake + auth) timeout in seconds
    pub timeout_secs: u64,
    /// Where connections arriving on a remote forward are sent (host, port)
    pub remote_forward_target: Option<(String, u16)>,
}

pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// russh settings. Keepalive is left to the handle owner task, which
    /// turns missed pings into a disconnect notification.
    fn russh_config() -> client::Config {
        client::Config {
            inactivity_timeout: None,
            keepalive_interval: None,
            ..Default::default()
        }
    }

    /// Connect and authenticate with the configured password
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to SSH server at {}", addr);

        let ssh_config = Self::russh_config();

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.remote_forward_target.clone(),
        );

        let timeout = Duration::from_secs(self.config.timeout_secs);

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(
                Arc::new(ssh_config),
                (self.config.host.as_str(), self.config.port),
                handler,
            ),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed with {}", addr);

        let authenticated = tokio::time::timeout(
            timeout,
            handle.authenticate_password(&self.config.username, &self.config.password),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Authentication to {} timed out", addr)))?
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "Authentication rejected by server for {}@{}",
                self.config.username, addr
            )));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);
        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Accepts the server key (logging its fingerprint) and serves
/// forwarded-tcpip channels for the remote forward of this session.
pub struct ClientHandler {
    host: String,
    port: u16,
    remote_forward_target: Option<(String, u16)>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, remote_forward_target: Option<(String, u16)>) -> Self {
        Self {
            host,
            port,
            remote_forward_target,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting host key for {}:{} ({})",
            self.host,
            self.port,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some((target_host, target_port)) = self.remote_forward_target.clone() else {
            warn!(
                "Unexpected forwarded-tcpip channel {}:{} from {}:{}, no remote forward registered",
                connected_address, connected_port, originator_address, originator_port
            );
            return Ok(());
        };

        debug!(
            "Forwarded connection {}:{} from {}:{} -> {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port,
            target_host,
            target_port
        );

        // Called from the SSH event loop, never block here
        tokio::spawn(async move {
            match TcpStream::connect((target_host.as_str(), target_port)).await {
                Ok(stream) => {
                    if let Err(e) = bridge_channel(stream, channel).await {
                        debug!("Remote forward connection ended: {}", e);
                    }
                }
                Err(e) => warn!(
                    "Remote forward could not reach {}:{}: {}",
                    target_host, target_port, e
                ),
            }
        });

        Ok(())
    }
}
