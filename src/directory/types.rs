//! Directory service payloads and errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Directory service returned HTTP {0}")]
    Status(u16),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Invalid directory URL: {0}")]
    InvalidUrl(String),
}

/// Body of `POST log_error2`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub email: String,
    pub identity: String,
    pub target: String,
    pub message: String,
    /// RFC 3339
    pub timestamp: String,
}

impl ErrorReport {
    pub fn new(
        email: impl Into<String>,
        identity: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            identity: identity.into(),
            target: target.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
