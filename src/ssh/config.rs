//! Credential & Forwarding Model
//!
//! Immutable value objects handed to the bridge registry and the session
//! transport. The JSON shape matches what the directory service returns
//! (`portForwarding`, `isRemote`, `sourcePort`, ...).

use std::fmt;

use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Key identifying a logical host, derived from the host URI fragment (nickname)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostIdentity(String);

impl HostIdentity {
    /// Build an identity from a nickname. Blank nicknames have no identity.
    pub fn from_nickname(nickname: impl Into<String>) -> Option<Self> {
        let nickname = nickname.into();
        if nickname.trim().is_empty() {
            None
        } else {
            Some(Self(nickname))
        }
    }

    /// Derive the identity from a host URI such as `ssh://alice@10.0.0.5:22/#box1`.
    /// The fragment is percent-decoded, so `#my%20box` and the nickname
    /// `my box` name the same host.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let url = Url::parse(uri).ok()?;
        let fragment = percent_decode_str(url.fragment()?).decode_utf8().ok()?;
        Self::from_nickname(fragment.into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single port forwarding rule attached to a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwarding {
    pub nickname: String,
    /// true = remote forward (-R), false = local forward (-L)
    pub is_remote: bool,
    pub source_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
}

impl PortForwarding {
    pub fn local(
        nickname: impl Into<String>,
        source_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            is_remote: false,
            source_port,
            destination_host: destination_host.into(),
            destination_port,
        }
    }

    pub fn remote(
        nickname: impl Into<String>,
        source_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
    ) -> Self {
        Self {
            is_remote: true,
            ..Self::local(nickname, source_port, destination_host, destination_port)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.source_port == 0 || self.destination_port == 0 {
            return Err(format!(
                "forwarding '{}' has an invalid port ({} -> {})",
                self.nickname, self.source_port, self.destination_port
            ));
        }
        if self.destination_host.trim().is_empty() {
            return Err(format!("forwarding '{}' has no destination host", self.nickname));
        }
        Ok(())
    }

    /// `L 8080 -> localhost:80` style summary for logs
    pub fn describe(&self) -> String {
        format!(
            "{} {} -> {}:{}",
            if self.is_remote { "R" } else { "L" },
            self.source_port,
            self.destination_host,
            self.destination_port
        )
    }
}

/// Login material for one host
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub user: String,
    pub pass: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(rename = "portForwarding", alias = "portForwardings", default)]
    pub port_forwardings: Vec<PortForwarding>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        pass: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            pass: pass.into(),
            port,
            port_forwardings: Vec::new(),
        }
    }

    pub fn with_forwardings(mut self, forwardings: Vec<PortForwarding>) -> Self {
        self.port_forwardings = forwardings;
        self
    }

    /// First forwarding rule on record; the only one applied when opening a session
    pub fn first_forwarding(&self) -> Option<&PortForwarding> {
        self.port_forwardings.first()
    }

    /// `user@host:port`
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host is empty".to_string());
        }
        if self.port == 0 {
            return Err(format!("invalid port 0 for {}", self.host));
        }
        self.port_forwardings.iter().try_for_each(PortForwarding::validate)
    }
}

// Keep passwords out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("pass", &"***")
            .field("port", &self.port)
            .field("port_forwardings", &self.port_forwardings)
            .finish()
    }
}
