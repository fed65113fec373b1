//! External Directory Service
//!
//! Remote HTTP API used for reachability checks, credential provisioning and
//! error reports. Failures here never reach the bridge registry.

pub mod client;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::DirectoryClient;
pub use types::{DirectoryError, ErrorReport};
