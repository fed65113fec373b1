//! Bridge registry errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("No matching host: {0}")]
    NotFound(String),

    #[error("Failed to open bridge '{identity}': {reason}")]
    OpenFailure { identity: String, reason: String },

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}
