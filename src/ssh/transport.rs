//! Session Transport
//!
//! The bridge registry only starts, stops, and watches sessions through the
//! `SessionTransport` / `SessionControl` traits. `RusshTransport` is the
//! production implementation: password login plus at most one port forward.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::client::{SshClient, SshConfig};
use super::config::{Credentials, HostIdentity, PortForwarding};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use crate::config::SshSettings;
use crate::forwarding::{start_local_forward, LocalForward, LocalForwardHandle};

/// Bind address requested for remote forwards
const REMOTE_FORWARD_BIND: &str = "localhost";

/// One live session as seen by the registry
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Transport-level session id (for logs)
    fn id(&self) -> &str;

    fn is_alive(&self) -> bool;

    /// Receiver that yields once when the session ends for any reason
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    /// Close the session. The disconnect notification fires afterwards.
    async fn close(&self);
}

pub type SessionHandle = Arc<dyn SessionControl>;

/// Opens sessions for the bridge registry
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn open(
        &self,
        identity: &HostIdentity,
        credentials: &Credentials,
        forwarding: Option<&PortForwarding>,
    ) -> Result<SessionHandle, SshError>;
}

/// Forward applied to a russh session
enum ActiveForward {
    Local(LocalForwardHandle),
    Remote { address: String, port: u32 },
}

/// A russh connection owned by a Handle Owner Task
pub struct RusshSession {
    id: String,
    controller: HandleController,
    forward: Mutex<Option<ActiveForward>>,
}

#[async_trait]
impl SessionControl for RusshSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.controller.is_connected()
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    async fn close(&self) {
        if let Some(forward) = self.forward.lock().await.take() {
            match forward {
                ActiveForward::Local(handle) => handle.stop().await,
                ActiveForward::Remote { address, port } => {
                    if let Err(e) = self.controller.cancel_tcpip_forward(&address, port).await {
                        debug!("Cancel remote forward {}:{} failed: {}", address, port, e);
                    }
                }
            }
        }
        self.controller.disconnect().await;
    }
}

/// Session transport backed by russh
pub struct RusshTransport {
    settings: SshSettings,
}

impl RusshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    async fn apply_forward(
        controller: &HandleController,
        forwarding: &PortForwarding,
    ) -> Result<ActiveForward, SshError> {
        if forwarding.is_remote {
            let bound = controller
                .tcpip_forward(REMOTE_FORWARD_BIND, forwarding.source_port as u32)
                .await?;
            info!(
                "Remote forward '{}' active: server port {} -> {}:{}",
                forwarding.nickname, bound, forwarding.destination_host, forwarding.destination_port
            );
            Ok(ActiveForward::Remote {
                address: REMOTE_FORWARD_BIND.to_string(),
                port: bound,
            })
        } else {
            let handle = start_local_forward(
                controller.clone(),
                LocalForward::new(
                    format!("127.0.0.1:{}", forwarding.source_port),
                    forwarding.destination_host.clone(),
                    forwarding.destination_port,
                ),
            )
            .await?;
            Ok(ActiveForward::Local(handle))
        }
    }
}

#[async_trait]
impl SessionTransport for RusshTransport {
    async fn open(
        &self,
        identity: &HostIdentity,
        credentials: &Credentials,
        forwarding: Option<&PortForwarding>,
    ) -> Result<SessionHandle, SshError> {
        let session_id = uuid::Uuid::new_v4().to_string();

        info!(
            "Opening session {} for {} -> {}",
            session_id,
            identity,
            credentials.target()
        );

        let remote_forward_target = forwarding
            .filter(|f| f.is_remote)
            .map(|f| (f.destination_host.clone(), f.destination_port));

        let client = SshClient::new(SshConfig {
            host: credentials.host.clone(),
            port: credentials.port,
            username: credentials.user.clone(),
            password: credentials.pass.clone(),
            timeout_secs: self.settings.connect_timeout_secs,
            remote_forward_target,
        });
        let handle = client.connect().await?;

        let controller = spawn_handle_owner_task(
            handle,
            session_id.clone(),
            Duration::from_secs(self.settings.keepalive_interval_secs.max(1)),
            self.settings.keepalive_max.max(1),
        );

        let forward = match forwarding {
            Some(rule) => match Self::apply_forward(&controller, rule).await {
                Ok(forward) => Some(forward),
                Err(e) => {
                    warn!(
                        "Forwarding '{}' ({}) failed for {}: {}",
                        rule.nickname,
                        rule.describe(),
                        identity,
                        e
                    );
                    controller.disconnect().await;
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Arc::new(RusshSession {
            id: session_id,
            controller,
            forward: Mutex::new(forward),
        }))
    }
}
