//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a cloneable `HandleController` that sends commands over an mpsc
//! channel. The owner task also runs the keepalive check; when the link is
//! gone (explicit disconnect, keepalive failure, or every controller dropped)
//! it broadcasts on the disconnect channel and exits.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Result of a single keepalive round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingResult {
    Ok,
    /// No reply in time, may be transient
    Timeout,
    /// Transport is gone
    IoError,
}

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Create a controller around an existing command sender
    #[cfg(test)]
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receiver that yields once the SSH connection is closed
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel (for local forward)
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Request remote port forward, returns the port bound on the server
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardingFailed(e.to_string()))
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardingFailed(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, taking ownership of `handle`
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
    keepalive_interval: Duration,
    keepalive_max: usize,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        let mut keepalive = tokio::time::interval(keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        keepalive.tick().await;
        let mut failures = 0usize;

        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for session {}", session_id);
                        break;
                    };
                    match cmd {
                        HandleCommand::ChannelOpenDirectTcpip {
                            host,
                            port,
                            originator_host,
                            originator_port,
                            reply_tx,
                        } => {
                            let result = handle
                                .channel_open_direct_tcpip(
                                    &host,
                                    port,
                                    &originator_host,
                                    originator_port,
                                )
                                .await;
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        }

                        HandleCommand::TcpipForward {
                            address,
                            port,
                            reply_tx,
                        } => {
                            let result = handle.tcpip_forward(&address, port).await;
                            match result {
                                Ok(bound_port) => {
                                    if reply_tx.send(Ok(bound_port)).is_err() {
                                        // Nobody owns this forward anymore
                                        warn!(
                                            "Caller dropped after tcpip_forward succeeded, cancelling {}:{}",
                                            address, bound_port
                                        );
                                        let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                                    }
                                }
                                Err(e) => {
                                    let _ = reply_tx.send(Err(e));
                                }
                            }
                        }

                        HandleCommand::CancelTcpipForward {
                            address,
                            port,
                            reply_tx,
                        } => {
                            let result = handle.cancel_tcpip_forward(&address, port).await;
                            let _ = reply_tx.send(result);
                        }

                        HandleCommand::Disconnect => {
                            info!("Disconnect requested for session {}", session_id);
                            break;
                        }
                    }
                }

                _ = keepalive.tick() => {
                    match ping(&handle).await {
                        PingResult::Ok => {
                            failures = 0;
                            debug!("Keepalive OK for session {}", session_id);
                        }
                        PingResult::Timeout => {
                            failures += 1;
                            warn!(
                                "Keepalive timeout for session {} ({}/{})",
                                session_id, failures, keepalive_max
                            );
                            if failures >= keepalive_max {
                                warn!("Session {} unresponsive, closing", session_id);
                                break;
                            }
                        }
                        PingResult::IoError => {
                            warn!("Session {} transport lost", session_id);
                            break;
                        }
                    }
                }
            }
        }

        // Close the command channel first: once the broadcast fires,
        // `is_connected()` must already report false.
        drain_pending_commands(&mut cmd_rx);

        let _ = disconnect_tx_clone.send(());

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

async fn ping(handle: &Handle<ClientHandler>) -> PingResult {
    match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await {
        Ok(Ok(())) => PingResult::Ok,
        Ok(Err(e)) => {
            let error_str = format!("{:?}", e);
            if error_str.contains("Disconnect") || error_str.contains("SendError") {
                PingResult::IoError
            } else {
                debug!("Keepalive error treated as soft failure: {:?}", e);
                PingResult::Timeout
            }
        }
        Err(_) => PingResult::Timeout,
    }
}

/// Drain all pending commands, returning Disconnected to each caller
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
