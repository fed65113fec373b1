//! Directory service HTTP client
//!
//! One `reqwest::Client` shared by the prober and the error reporter. Paths
//! are resolved against an injected base URL:
//!
//! - `GET  proxy_test/{port}`                      -> integer
//! - `GET  get_settings/0.1/1/{username}/{password}` -> `[Credentials]`
//! - `POST log_error2`                             -> integer ack

use std::time::Duration;

use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{DirectoryError, ErrorReport};
use crate::config::DirectorySettings;
use crate::ssh::Credentials;

/// API version segments of the settings endpoint
const SETTINGS_VERSION: [&str; 2] = ["0.1", "1"];

#[derive(Clone)]
pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: Url,
}

impl DirectoryClient {
    pub fn new(settings: &DirectorySettings) -> Result<Self, DirectoryError> {
        Self::with_base_url(&settings.base_url, Duration::from_secs(settings.timeout_secs))
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| DirectoryError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DirectoryError::InvalidUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append percent-encoded path segments to the base URL
    fn endpoint(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, DirectoryError> {
        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        serde_json::from_slice::<T>(&body).map_err(|e| {
            DirectoryError::Malformed(format!(
                "{} (body: {:?})",
                e,
                String::from_utf8_lossy(&body[..body.len().min(64)])
            ))
        })
    }

    /// Reachability check for `port`
    pub async fn proxy_test(&self, port: u16) -> Result<i32, DirectoryError> {
        let url = self.endpoint(&["proxy_test", &port.to_string()])?;
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        Self::parse(response).await
    }

    /// Credentials provisioned for an account
    pub async fn get_settings(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Vec<Credentials>, DirectoryError> {
        let url = self.endpoint(&[
            "get_settings",
            SETTINGS_VERSION[0],
            SETTINGS_VERSION[1],
            username,
            password,
        ])?;
        debug!("GET {}/get_settings/.../{}/***", self.base_url, username);
        let response = self.client.get(url).send().await?;
        Self::parse(response).await
    }

    pub async fn log_error(&self, report: &ErrorReport) -> Result<i32, DirectoryError> {
        let url = self.endpoint(&["log_error2"])?;
        debug!("POST {}", url);
        let response = self.client.post(url).json(report).send().await?;
        Self::parse(response).await
    }

    /// Send an error report, logging instead of failing
    pub async fn report(&self, report: &ErrorReport) {
        match self.log_error(report).await {
            Ok(ack) => debug!("Error report for {} sent (ack {})", report.identity, ack),
            Err(e) => warn!("Error report for {} not sent: {}", report.identity, e),
        }
    }
}
