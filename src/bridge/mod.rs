//! Bridge Connection Manager
//!
//! Maps a `HostIdentity` to at most one live SSH session.
//!
//! ```text
//! ensure_open(id) ──► DashMap entry ──► absent ──► Connecting placeholder
//!                          │                            │ (map lock released)
//!                          │                            ▼
//!                          │                  SessionTransport::open
//!                          │                     │              │
//!                          ▼                     ▼              ▼
//!                 existing entry            Connected      rolled back
//!              (wait while Connecting)          │
//!                                               ▼
//!                              disconnect watcher ──► remove ──► listeners
//! ```

mod error;
pub mod registry;

pub use error::BridgeError;
pub use registry::{
    BridgeEntry, BridgeInfo, BridgeRegistry, BridgeState, DisconnectListener, OpenRequest,
};
