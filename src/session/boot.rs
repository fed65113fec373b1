//! Boot Reconnect Flow
//!
//! Run once per external trigger (service start). Restores the bridge of the
//! default host, the first host in the store, without user interaction.
//! Failures are logged and optionally reported; nothing is retried.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bridge::{BridgeEntry, BridgeRegistry, OpenRequest};
use crate::config::{HostRecord, HostStore};
use crate::directory::{DirectoryClient, ErrorReport};
use crate::ssh::HostIdentity;

/// What a boot run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// Store has no hosts
    NoHosts,
    /// Default host has no usable nickname
    Skipped { nickname: String },
    /// Bridge already existed
    Reused(HostIdentity),
    Opened(HostIdentity),
    Failed {
        identity: Option<HostIdentity>,
        reason: String,
    },
}

pub struct BootReconnectFlow {
    store: Arc<dyn HostStore>,
    registry: Arc<BridgeRegistry>,
    reporter: Option<DirectoryClient>,
}

impl BootReconnectFlow {
    pub fn new(store: Arc<dyn HostStore>, registry: Arc<BridgeRegistry>) -> Self {
        Self {
            store,
            registry,
            reporter: None,
        }
    }

    /// Send failed reconnects to the directory service error sink
    pub fn with_reporter(mut self, reporter: DirectoryClient) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub async fn run(&self) -> BootOutcome {
        let hosts = match self.store.get_hosts(false).await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!("Boot reconnect: failed to read host store: {}", e);
                return BootOutcome::Failed {
                    identity: None,
                    reason: e.to_string(),
                };
            }
        };

        let Some(host) = hosts.into_iter().next() else {
            info!("Boot reconnect: no hosts stored, nothing to do");
            return BootOutcome::NoHosts;
        };

        let Some(identity) = host.identity() else {
            warn!(
                "Boot reconnect: default host {:?} has no usable nickname, skipping",
                host.nickname
            );
            return BootOutcome::Skipped {
                nickname: host.nickname,
            };
        };

        let existing = self.registry.find_by_identity(&identity);
        if existing.as_ref().is_some_and(|e| e.is_connected()) {
            info!("Boot reconnect: bridge {} already connected", identity);
            return BootOutcome::Reused(identity);
        }

        match self.open(&host, &identity).await {
            Ok(entry) => {
                if existing.is_some_and(|e| Arc::ptr_eq(&e, &entry)) {
                    BootOutcome::Reused(identity)
                } else {
                    info!("Boot reconnect: bridge {} opened", identity);
                    BootOutcome::Opened(identity)
                }
            }
            Err(reason) => {
                let target = format!("{}@{}:{}", host.username, host.hostname, host.port);
                error!(
                    "Boot reconnect failed for {} ({}): {}",
                    identity, target, reason
                );
                if let Some(reporter) = &self.reporter {
                    let report = ErrorReport::new(&host.email, identity.as_str(), target, &reason);
                    reporter.report(&report).await;
                }
                BootOutcome::Failed {
                    identity: Some(identity),
                    reason,
                }
            }
        }
    }

    async fn open(
        &self,
        host: &HostRecord,
        identity: &HostIdentity,
    ) -> Result<Arc<BridgeEntry>, String> {
        let forwardings = self
            .store
            .get_port_forwardings(host)
            .await
            .map_err(|e| format!("failed to read forwarding rules: {}", e))?;

        let request = OpenRequest::from_credentials(host.credentials(forwardings));
        self.registry
            .ensure_open(identity, Some(request))
            .await
            .map_err(|e| e.to_string())
    }
}
