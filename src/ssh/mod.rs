//! SSH module - credential model and the russh-backed session transport
//!
//! # Features
//! - Password-authenticated SSH connections
//! - One local (-L) or remote (-R) port forward per session
//! - Keepalive-driven disconnect detection (see `handle_owner`)

mod client;
pub mod config;
mod error;
mod handle_owner;
pub mod transport;

pub use client::{ClientHandler, SshClient, SshConfig};
pub use config::{Credentials, HostIdentity, PortForwarding, DEFAULT_SSH_PORT};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use transport::{RusshSession, RusshTransport, SessionControl, SessionHandle, SessionTransport};
