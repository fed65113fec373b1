//! Supervisor
//!
//! Plays the external scheduler: runs the boot reconnect once, keeps the
//! connectivity prober on its period, and tears everything down on shutdown.
//! Also hosts the `provision` command that fetches credentials from the
//! directory service into the host store.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bridge::{BridgeEntry, BridgeRegistry};
use crate::config::{
    provision_host, AppConfig, ConfigStorage, HostRecord, HostStore, JsonHostStore, StorageError,
};
use crate::directory::{DirectoryClient, DirectoryError};
use crate::session::{
    BootOutcome, BootReconnectFlow, ConnectivityProber, ProbeResult, ProbeSchedule, ProbeTarget,
};
use crate::ssh::{RusshTransport, SessionTransport};

pub const USAGE: &str = "\
Usage:
  connbridge                                 restore the default bridge and probe connectivity
  connbridge provision <account> <password>  fetch credentials into the host store
  connbridge --version";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("No credentials provisioned for {0}")]
    NoCredentials(String),

    #[error("Invalid credentials from directory: {0}")]
    InvalidCredentials(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Provision { account: String, password: String },
    Version,
}

impl Command {
    /// Parse arguments (without the program name)
    pub fn parse<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();
        match args.first().map(String::as_str) {
            None => Ok(Self::Run),
            Some("--version") | Some("-V") => Ok(Self::Version),
            Some("provision") => match &args[1..] {
                [account, password] => Ok(Self::Provision {
                    account: account.clone(),
                    password: password.clone(),
                }),
                _ => Err("provision expects <account> <password>".to_string()),
            },
            Some(other) => Err(format!("Unknown command: {}", other)),
        }
    }
}

pub async fn execute(command: Command) -> Result<(), AppError> {
    let config = ConfigStorage::new()?.load().await?;

    match command {
        Command::Run => {
            let store = Arc::new(JsonHostStore::new()?);
            let transport = Arc::new(RusshTransport::new(config.ssh.clone()));
            supervise(&config, store, transport, shutdown_signal()).await
        }
        Command::Provision { account, password } => {
            let client = DirectoryClient::new(&config.directory)?;
            let store = JsonHostStore::new()?;
            let record = provision(&client, &store, &account, &password).await?;
            println!("Provisioned {} ({})", record.nickname, store.path().display());
            Ok(())
        }
        Command::Version => Ok(()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}

/// Run until `shutdown` resolves
pub async fn supervise(
    config: &AppConfig,
    store: Arc<dyn HostStore>,
    transport: Arc<dyn SessionTransport>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), AppError> {
    let directory = DirectoryClient::new(&config.directory)?;
    let registry = Arc::new(BridgeRegistry::new(transport));
    registry.add_disconnect_listener(Arc::new(|entry: &BridgeEntry| {
        warn!("Bridge {} ({}) disconnected", entry.identity, entry.target);
    }));

    let outcome = BootReconnectFlow::new(store.clone(), registry.clone())
        .with_reporter(directory.clone())
        .run()
        .await;
    match &outcome {
        BootOutcome::Opened(identity) | BootOutcome::Reused(identity) => {
            info!("Default bridge {} is up", identity)
        }
        BootOutcome::NoHosts => info!("No hosts stored yet, run `connbridge provision` first"),
        other => warn!("Boot reconnect did not restore a bridge: {:?}", other),
    }

    let target = probe_target(store.as_ref(), config.probe.default_port).await;
    let prober = ConnectivityProber::new(directory, target, ProbeSchedule::from(&config.probe))
        .spawn(Arc::new(move |result: ProbeResult| {
            if result.is_reachable() {
                info!("Port {} reachable (status {})", target.port, result.code());
            } else {
                warn!("Port {} unreachable", target.port);
            }
        }));

    shutdown.await;
    info!("Shutting down");

    prober.join().await;
    registry.disconnect_all().await;
    Ok(())
}

/// Probe port of the default host's first forwarding rule
pub async fn probe_target(store: &dyn HostStore, default_port: u16) -> ProbeTarget {
    let host = match store.get_hosts(false).await {
        Ok(hosts) => hosts.into_iter().next(),
        Err(e) => {
            warn!("Failed to read hosts for probe target: {}", e);
            None
        }
    };

    let rule = match &host {
        Some(host) => match store.get_port_forwardings(host).await {
            Ok(rules) => rules.into_iter().next(),
            Err(e) => {
                warn!("Failed to read forwarding rules for probe target: {}", e);
                None
            }
        },
        None => None,
    };

    rule.map(|r| ProbeTarget::from_forwarding(&r, default_port))
        .unwrap_or_else(|| ProbeTarget::new(default_port))
}

/// Fetch the account's credentials and store the first set as a host
pub async fn provision(
    client: &DirectoryClient,
    store: &JsonHostStore,
    account: &str,
    password: &str,
) -> Result<HostRecord, AppError> {
    let credentials = client.get_settings(account, password).await?;
    let first = credentials
        .first()
        .ok_or_else(|| AppError::NoCredentials(account.to_string()))?;
    first.validate().map_err(AppError::InvalidCredentials)?;

    let (record, forwardings) = provision_host(first, account);
    store.upsert(record.clone(), forwardings).await?;
    info!("Provisioned host {} for {}", record.nickname, account);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry::tests::MockTransport;
    use crate::directory::test_support::StubServer;
    use crate::ssh::PortForwarding;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::tempdir;

    const SETTINGS_BODY: &str = r#"[{
        "host": "10.0.0.5", "user": "alice", "pass": "secret", "port": 22,
        "portForwarding": [{"nickname": "2022", "isRemote": true, "sourcePort": 2022,
                            "destinationHost": "localhost", "destinationPort": 22}]
    }]"#;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(args(&[])).unwrap(), Command::Run);
        assert_eq!(Command::parse(args(&["-V"])).unwrap(), Command::Version);
        assert_eq!(
            Command::parse(args(&["provision", "alice@example.com", "pw"])).unwrap(),
            Command::Provision {
                account: "alice@example.com".to_string(),
                password: "pw".to_string()
            }
        );
        assert!(Command::parse(args(&["provision", "alice"])).is_err());
        assert!(Command::parse(args(&["serve"])).is_err());
    }

    #[tokio::test]
    async fn test_provision_writes_first_credentials() {
        let stub = StubServer::start(200, SETTINGS_BODY).await;
        let client = DirectoryClient::with_base_url(&stub.base_url, Duration::from_secs(2)).unwrap();
        let temp = tempdir().unwrap();
        let store = JsonHostStore::with_path(temp.path().join("hosts.json"));

        let record = provision(&client, &store, "alice@example.com", "pw").await.unwrap();
        assert_eq!(record.nickname, "alice@10.0.0.5");
        assert_eq!(record.email, "alice@example.com");

        let hosts = store.get_hosts(false).await.unwrap();
        assert_eq!(hosts, vec![record]);
        assert_eq!(
            store.get_port_forwardings(&hosts[0]).await.unwrap(),
            vec![PortForwarding::remote("2022", 2022, "localhost", 22)]
        );
        assert_eq!(probe_target(&store, 1022).await, ProbeTarget::new(2022));
    }

    #[tokio::test]
    async fn test_provision_without_credentials() {
        let stub = StubServer::start(200, "[]").await;
        let client = DirectoryClient::with_base_url(&stub.base_url, Duration::from_secs(2)).unwrap();
        let temp = tempdir().unwrap();
        let store = JsonHostStore::with_path(temp.path().join("hosts.json"));

        let err = provision(&client, &store, "nobody", "pw").await.unwrap_err();
        assert!(matches!(err, AppError::NoCredentials(ref a) if a == "nobody"));
        assert!(store.get_hosts(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probe_target_defaults_without_hosts() {
        let temp = tempdir().unwrap();
        let store = JsonHostStore::with_path(temp.path().join("hosts.json"));
        assert_eq!(probe_target(&store, 1022).await, ProbeTarget::new(1022));
    }

    #[tokio::test]
    async fn test_supervise_restores_and_tears_down() {
        let stub = StubServer::start(200, "200").await;
        let temp = tempdir().unwrap();
        let store = Arc::new(JsonHostStore::with_path(temp.path().join("hosts.json")));
        let mut host = HostRecord::new("box1", "alice", "10.0.0.5", 22);
        host.password = "secret".to_string();
        store
            .upsert(host, vec![PortForwarding::local("web", 8080, "localhost", 80)])
            .await
            .unwrap();

        let mut config = AppConfig::default();
        config.directory.base_url = stub.base_url.clone();
        config.probe.initial_delay_ms = 0;

        let transport = Arc::new(MockTransport::default());
        supervise(
            &config,
            store,
            transport.clone(),
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await
        .unwrap();

        assert_eq!(transport.opens(), 1);
        // One probe cycle within the default 30s period
        assert_eq!(stub.hits(), 1);
        let sessions = transport.sessions.lock();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].closes.load(Ordering::SeqCst), 1);
    }
}
