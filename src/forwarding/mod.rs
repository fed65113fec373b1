//! Port Forwarding Module
//!
//! Applies the single forwarding rule of a bridge session:
//! - Local forward (-L): `local::start_local_forward`
//! - Remote forward (-R): `tcpip-forward` request, connections are served by
//!   `ssh::ClientHandler`

pub mod local;

use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;

pub use local::{start_local_forward, LocalForward, LocalForwardHandle};

use crate::ssh::SshError;

/// Pump bytes between a TCP socket and an SSH channel until either side closes.
/// Returns (bytes sent to channel, bytes received from channel).
pub async fn bridge_channel(
    mut stream: TcpStream,
    channel: Channel<Msg>,
) -> Result<(u64, u64), SshError> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let mut channel_stream = Box::pin(channel.into_stream());
    let counts = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await?;
    Ok(counts)
}
