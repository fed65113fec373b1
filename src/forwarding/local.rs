//! Local Port Forwarding
//!
//! Forwards connections from a local port to a host:port reachable from the
//! SSH server. Example: local 8080 -> localhost:80 on the remote side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::bridge_channel;
use crate::ssh::{HandleController, SshError};

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1:8080")
    pub local_addr: String,
    pub remote_host: String,
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        local_addr: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    pub config: LocalForward,
    /// Actual bound address (differs from requested if port was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    connection_count: Arc<AtomicU64>,
}

impl LocalForwardHandle {
    pub async fn stop(&self) {
        info!("Stopping local port forward on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total connections accepted so far
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

/// Start local port forwarding
///
/// Spawns a task that accepts on the local address and, per connection, opens
/// a direct-tcpip channel through the Handle Owner Task. The task exits on
/// `stop()` or when the SSH connection goes away.
pub async fn start_local_forward(
    handle_controller: HandleController,
    config: LocalForward,
) -> Result<LocalForwardHandle, SshError> {
    let mut disconnect_rx = handle_controller.subscribe_disconnect();

    let listener = TcpListener::bind(&config.local_addr)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => SshError::ForwardingFailed(format!(
                "Port already in use: {}",
                config.local_addr
            )),
            std::io::ErrorKind::PermissionDenied => SshError::ForwardingFailed(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                config.local_addr
            )),
            _ => SshError::ForwardingFailed(format!(
                "Failed to bind to {}: {}",
                config.local_addr, e
            )),
        })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ForwardingFailed(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let connection_count = Arc::new(AtomicU64::new(0));
    let count_clone = connection_count.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let remote_host = config.remote_host.clone();
    let remote_port = config.remote_port;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("Local port forward on {} stopped: SSH disconnected", bound_addr);
                    break;
                }

                _ = stop_rx.recv() => {
                    info!("Local port forward on {} stopped by request", bound_addr);
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {} on {}", peer_addr, bound_addr);
                            count_clone.fetch_add(1, Ordering::Relaxed);

                            let controller = handle_controller.clone();
                            let remote_host = remote_host.clone();

                            tokio::spawn(async move {
                                let channel = match controller
                                    .open_direct_tcpip(
                                        &remote_host,
                                        remote_port as u32,
                                        &peer_addr.ip().to_string(),
                                        peer_addr.port() as u32,
                                    )
                                    .await
                                {
                                    Ok(channel) => channel,
                                    Err(e) => {
                                        warn!(
                                            "Failed to open channel to {}:{}: {}",
                                            remote_host, remote_port, e
                                        );
                                        return;
                                    }
                                };

                                match bridge_channel(stream, channel).await {
                                    Ok((sent, received)) => debug!(
                                        "Forward connection from {} closed ({} bytes out, {} bytes in)",
                                        peer_addr, sent, received
                                    ),
                                    Err(e) => debug!("Forward connection error: {}", e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error on {}: {}", bound_addr, e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_clone.store(false, Ordering::SeqCst);
    });

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        running,
        stop_tx,
        connection_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_local_forward_binds_and_stops() {
        let (tx, _rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);

        let handle = start_local_forward(controller, LocalForward::new("127.0.0.1:0", "localhost", 80))
            .await
            .unwrap();
        assert!(handle.is_running());
        assert_ne!(handle.bound_addr.port(), 0);
        assert_eq!(handle.connection_count(), 0);

        handle.stop().await;
        for _ in 0..50 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_local_forward_port_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);

        let result = start_local_forward(
            controller,
            LocalForward::new(addr.to_string(), "localhost", 80),
        )
        .await;
        assert!(matches!(result, Err(SshError::ForwardingFailed(_))));
    }
}
