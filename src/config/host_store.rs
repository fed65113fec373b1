//! Host Store
//!
//! Read interface over stored host records and their forwarding rules, plus
//! a JSON-file implementation (`hosts.json`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::storage::{hosts_file, load_json, save_json, StorageError};
use crate::ssh::{Credentials, HostIdentity, PortForwarding, DEFAULT_SSH_PORT};

/// Current hosts file version
pub const HOSTS_VERSION: u32 = 1;

/// `last_connect` value of a host that never connected
pub const NEVER_CONNECTED: i64 = -1;

fn default_protocol() -> String {
    "ssh".to_string()
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn never_connected() -> i64 {
    NEVER_CONNECTED
}

fn hosts_version() -> u32 {
    HOSTS_VERSION
}

/// A stored host
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    pub nickname: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub username: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    /// Account the host was provisioned for; only used in error reports
    #[serde(default)]
    pub email: String,
    /// Unix seconds of the last successful connection, -1 = never
    #[serde(default = "never_connected")]
    pub last_connect: i64,
}

impl HostRecord {
    pub fn new(
        nickname: impl Into<String>,
        username: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            protocol: default_protocol(),
            username: username.into(),
            hostname: hostname.into(),
            port,
            password: String::new(),
            email: String::new(),
            last_connect: NEVER_CONNECTED,
        }
    }

    /// `ssh://user@host:port/#nickname`
    pub fn uri(&self) -> Option<Url> {
        let mut url =
            Url::parse(&format!("{}://{}:{}/", self.protocol, self.hostname, self.port)).ok()?;
        if !self.username.is_empty() {
            url.set_username(&self.username).ok()?;
        }
        url.set_fragment(Some(&self.nickname));
        Some(url)
    }

    /// Identity of the host: the nickname, which is also what the URI
    /// fragment decodes to. Records without a valid URI have none.
    pub fn identity(&self) -> Option<HostIdentity> {
        self.uri()?;
        HostIdentity::from_nickname(self.nickname.as_str())
    }

    /// `user@host`, with `:port` when it isn't the SSH default
    pub fn display_name(&self) -> String {
        if self.username.is_empty() || self.hostname.is_empty() {
            return String::new();
        }
        if self.port == DEFAULT_SSH_PORT {
            format!("{}@{}", self.username, self.hostname)
        } else {
            format!("{}@{}:{}", self.username, self.hostname, self.port)
        }
    }

    pub fn has_connected(&self) -> bool {
        self.last_connect >= 0
    }

    pub fn credentials(&self, forwardings: Vec<PortForwarding>) -> Credentials {
        Credentials::new(&self.hostname, &self.username, &self.password, self.port)
            .with_forwardings(forwardings)
    }
}

impl std::fmt::Debug for HostRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRecord")
            .field("nickname", &self.nickname)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("email", &self.email)
            .field("last_connect", &self.last_connect)
            .finish()
    }
}

/// Turn the first credential set returned by the directory into a host
/// record for `account`, keeping only its first forwarding rule
pub fn provision_host(credentials: &Credentials, account: &str) -> (HostRecord, Vec<PortForwarding>) {
    let mut record = HostRecord::new(
        String::new(),
        &credentials.user,
        &credentials.host,
        credentials.port,
    );
    record.nickname = record.display_name();
    record.password = credentials.pass.clone();
    record.email = account.to_string();

    let forwardings = credentials.first_forwarding().cloned().into_iter().collect();
    (record, forwardings)
}

/// Read-only view of stored hosts
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Hosts ordered by nickname. `only_connected` keeps hosts that
    /// connected at least once.
    async fn get_hosts(&self, only_connected: bool) -> Result<Vec<HostRecord>, StorageError>;

    async fn get_port_forwardings(
        &self,
        host: &HostRecord,
    ) -> Result<Vec<PortForwarding>, StorageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredHost {
    #[serde(flatten)]
    record: HostRecord,
    #[serde(default)]
    port_forwardings: Vec<PortForwarding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HostsFile {
    #[serde(default = "hosts_version")]
    version: u32,
    #[serde(default)]
    hosts: Vec<StoredHost>,
}

impl Default for HostsFile {
    fn default() -> Self {
        Self {
            version: HOSTS_VERSION,
            hosts: Vec::new(),
        }
    }
}

/// `hosts.json` backed host store
pub struct JsonHostStore {
    path: PathBuf,
    /// Held across the load-modify-save of `upsert`
    write_lock: Mutex<()>,
}

impl JsonHostStore {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(hosts_file()?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HostsFile, StorageError> {
        let file = load_json::<HostsFile>(&self.path).await?.unwrap_or_default();
        if file.version > HOSTS_VERSION {
            return Err(StorageError::VersionTooNew {
                found: file.version,
                supported: HOSTS_VERSION,
            });
        }
        Ok(file)
    }

    /// Insert or replace (by nickname) a host and its forwarding rules
    pub async fn upsert(
        &self,
        record: HostRecord,
        forwardings: Vec<PortForwarding>,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        let stored = StoredHost {
            record,
            port_forwardings: forwardings,
        };

        match file
            .hosts
            .iter_mut()
            .find(|h| h.record.nickname == stored.record.nickname)
        {
            Some(existing) => {
                debug!("Replacing host {}", stored.record.nickname);
                *existing = stored;
            }
            None => {
                info!("Adding host {}", stored.record.nickname);
                file.hosts.push(stored);
            }
        }

        save_json(&self.path, &file).await
    }
}

#[async_trait]
impl HostStore for JsonHostStore {
    async fn get_hosts(&self, only_connected: bool) -> Result<Vec<HostRecord>, StorageError> {
        let mut hosts: Vec<HostRecord> = self
            .load()
            .await?
            .hosts
            .into_iter()
            .map(|h| h.record)
            .filter(|r| !only_connected || r.has_connected())
            .collect();
        hosts.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        Ok(hosts)
    }

    async fn get_port_forwardings(
        &self,
        host: &HostRecord,
    ) -> Result<Vec<PortForwarding>, StorageError> {
        Ok(self
            .load()
            .await?
            .hosts
            .into_iter()
            .find(|h| h.record.nickname == host.nickname)
            .map(|h| h.port_forwardings)
            .unwrap_or_default())
    }
}
