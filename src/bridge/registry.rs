//! Bridge Registry
//!
//! One `BridgeEntry` per `HostIdentity`. Lookups and inserts go through the
//! DashMap entry API, so two concurrent `ensure_open` calls for the same
//! identity can never both see "absent". The map lock is never held while the
//! transport performs its handshake.
//!
//! # Entry lifecycle
//!
//! - `Connecting`: placeholder inserted by the caller that found no entry
//! - `Connected`: transport confirmed the session, a disconnect watcher runs
//! - `Disconnected`: open failed (entry rolled back) or the session ended
//!   (entry removed, listeners notified)

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::error::BridgeError;
use crate::ssh::{Credentials, HostIdentity, PortForwarding, SessionHandle, SessionTransport};

/// Bridge state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Connecting,
    Connected,
    Disconnected,
}

/// Bridge snapshot for status output
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    pub identity: String,
    pub target: String,
    pub state: BridgeState,
    pub forwarding: Option<String>,
    pub session_id: Option<String>,
    pub created_at: String,
}

/// What to open when no bridge exists yet
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub credentials: Credentials,
    /// Only this rule is applied, other rules on the host are ignored
    pub forwarding: Option<PortForwarding>,
}

impl OpenRequest {
    pub fn new(credentials: Credentials, forwarding: Option<PortForwarding>) -> Self {
        Self {
            credentials,
            forwarding,
        }
    }

    /// Use the first forwarding rule attached to the credentials
    pub fn from_credentials(credentials: Credentials) -> Self {
        let forwarding = credentials.first_forwarding().cloned();
        Self::new(credentials, forwarding)
    }

    fn validate(&self) -> Result<(), BridgeError> {
        self.credentials
            .validate()
            .map_err(BridgeError::InvalidCredentials)?;
        if let Some(rule) = &self.forwarding {
            rule.validate().map_err(BridgeError::InvalidCredentials)?;
        }
        Ok(())
    }
}

/// Called once per removed bridge
pub trait DisconnectListener: Send + Sync {
    fn on_disconnect(&self, entry: &BridgeEntry);
}

impl<F> DisconnectListener for F
where
    F: Fn(&BridgeEntry) + Send + Sync,
{
    fn on_disconnect(&self, entry: &BridgeEntry) {
        self(entry)
    }
}

/// A single bridge
pub struct BridgeEntry {
    pub identity: HostIdentity,

    /// `user@host:port`
    pub target: String,

    /// Forwarding rule applied when the session was opened
    pub forwarding: Option<PortForwarding>,

    pub created_at: DateTime<Utc>,

    /// Set once, on the `Connecting -> Connected` transition
    session: RwLock<Option<SessionHandle>>,

    /// Why the open failed (waiters report the same reason)
    failure: Mutex<Option<String>>,

    state_tx: watch::Sender<BridgeState>,
}

impl BridgeEntry {
    fn connecting(identity: HostIdentity, request: &OpenRequest) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::Connecting);
        Self {
            identity,
            target: request.credentials.target(),
            forwarding: request.forwarding.clone(),
            created_at: Utc::now(),
            session: RwLock::new(None),
            failure: Mutex::new(None),
            state_tx,
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.session.read().clone()
    }

    /// `Connected` and the transport still reports the session alive
    pub fn is_connected(&self) -> bool {
        self.state() == BridgeState::Connected
            && self.session.read().as_ref().is_some_and(|s| s.is_alive())
    }

    /// Wait until the entry leaves `Connecting`
    pub async fn wait_settled(&self) -> BridgeState {
        let mut rx = self.state_tx.subscribe();
        let settled = match rx.wait_for(|state| *state != BridgeState::Connecting).await {
            Ok(state) => *state,
            Err(_) => BridgeState::Disconnected,
        };
        settled
    }

    pub fn to_info(&self) -> BridgeInfo {
        BridgeInfo {
            identity: self.identity.to_string(),
            target: self.target.clone(),
            state: self.state(),
            forwarding: self.forwarding.as_ref().map(|f| f.nickname.clone()),
            session_id: self.session.read().as_ref().map(|s| s.id().to_string()),
            created_at: self.created_at.to_rfc3339(),
        }
    }

    fn attach(&self, session: SessionHandle) {
        *self.session.write() = Some(session);
        self.state_tx.send_replace(BridgeState::Connected);
    }

    fn fail(&self, reason: String) {
        *self.failure.lock() = Some(reason);
        self.state_tx.send_replace(BridgeState::Disconnected);
    }

    fn mark_disconnected(&self) {
        self.state_tx.send_replace(BridgeState::Disconnected);
    }

    fn open_failure(&self) -> BridgeError {
        BridgeError::OpenFailure {
            identity: self.identity.to_string(),
            reason: self
                .failure
                .lock()
                .clone()
                .unwrap_or_else(|| "session closed".to_string()),
        }
    }
}

impl fmt::Debug for BridgeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeEntry")
            .field("identity", &self.identity)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

enum Slot<'r> {
    Existing(Arc<BridgeEntry>),
    Inserted(Arc<BridgeEntry>, &'r OpenRequest),
}

/// Rolls the placeholder back if `ensure_open` is dropped mid-handshake
struct PlaceholderGuard<'a> {
    registry: &'a BridgeRegistry,
    entry: &'a Arc<BridgeEntry>,
    armed: bool,
}

impl<'a> PlaceholderGuard<'a> {
    fn new(registry: &'a BridgeRegistry, entry: &'a Arc<BridgeEntry>) -> Self {
        Self {
            registry,
            entry,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PlaceholderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Open of bridge {} cancelled, rolling back", self.entry.identity);
            self.registry
                .rollback(self.entry, "open cancelled".to_string());
        }
    }
}

/// Bridge registry
pub struct BridgeRegistry {
    transport: Arc<dyn SessionTransport>,
    bridges: DashMap<HostIdentity, Arc<BridgeEntry>>,
    listeners: RwLock<Vec<Arc<dyn DisconnectListener>>>,
}

impl BridgeRegistry {
    pub fn new(transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            transport,
            bridges: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) {
        self.listeners.write().push(listener);
    }

    pub fn find_by_identity(&self, identity: &HostIdentity) -> Option<Arc<BridgeEntry>> {
        self.bridges.get(identity).map(|e| e.value().clone())
    }

    /// Return the bridge for `identity`, opening it from `request` if absent.
    ///
    /// Callers that find a `Connecting` entry wait for that open to settle
    /// and observe its outcome. Without a request, an absent identity fails
    /// with `NotFound`.
    pub async fn ensure_open(
        self: &Arc<Self>,
        identity: &HostIdentity,
        request: Option<OpenRequest>,
    ) -> Result<Arc<BridgeEntry>, BridgeError> {
        loop {
            let slot = match self.bridges.entry(identity.clone()) {
                Entry::Occupied(occupied) => Slot::Existing(occupied.get().clone()),
                Entry::Vacant(vacant) => {
                    let Some(request) = request.as_ref() else {
                        return Err(BridgeError::NotFound(identity.to_string()));
                    };
                    request.validate()?;
                    let entry = Arc::new(BridgeEntry::connecting(identity.clone(), request));
                    vacant.insert(entry.clone());
                    Slot::Inserted(entry, request)
                }
            };

            let entry = match slot {
                Slot::Inserted(entry, request) => return self.open_entry(entry, request).await,
                Slot::Existing(entry) => entry,
            };

            match entry.state() {
                BridgeState::Connected if entry.is_connected() => {
                    debug!("Reusing bridge {}", identity);
                    return Ok(entry);
                }
                BridgeState::Connected => {
                    // Session died before its watcher got to it
                    self.remove_entry(&entry);
                }
                BridgeState::Connecting => {
                    debug!("Bridge {} is connecting, waiting", identity);
                    return match entry.wait_settled().await {
                        BridgeState::Connected => Ok(entry),
                        _ => Err(entry.open_failure()),
                    };
                }
                BridgeState::Disconnected => {
                    self.bridges
                        .remove_if(identity, |_, current| Arc::ptr_eq(current, &entry));
                }
            }
        }
    }

    async fn open_entry(
        self: &Arc<Self>,
        entry: Arc<BridgeEntry>,
        request: &OpenRequest,
    ) -> Result<Arc<BridgeEntry>, BridgeError> {
        info!(
            "Opening bridge {} -> {} (forwarding: {})",
            entry.identity,
            entry.target,
            request
                .forwarding
                .as_ref()
                .map(|f| f.describe())
                .unwrap_or_else(|| "none".to_string())
        );

        let guard = PlaceholderGuard::new(self, &entry);
        let result = self
            .transport
            .open(
                &entry.identity,
                &request.credentials,
                request.forwarding.as_ref(),
            )
            .await;
        guard.disarm();

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!("Bridge {} failed to open: {}", entry.identity, e);
                self.rollback(&entry, e.to_string());
                return Err(entry.open_failure());
            }
        };

        // Subscribe before publishing so an early disconnect is not missed
        let disconnect_rx = session.subscribe_disconnect();

        // Commit under the map guard so a concurrent `remove` either sees
        // the Connected entry or the open sees the removal
        let committed = match self.bridges.get(&entry.identity) {
            Some(current) if Arc::ptr_eq(current.value(), &entry) => {
                entry.attach(session.clone());
                true
            }
            _ => false,
        };

        if !committed {
            warn!(
                "Bridge {} was removed while connecting, closing session {}",
                entry.identity,
                session.id()
            );
            entry.fail("removed while connecting".to_string());
            session.close().await;
            return Err(entry.open_failure());
        }

        info!(
            "Bridge {} connected (session {})",
            entry.identity,
            session.id()
        );
        self.watch_disconnect(entry.clone(), session, disconnect_rx);
        Ok(entry)
    }

    /// Remove a placeholder that never connected. Listeners are not notified.
    fn rollback(&self, entry: &Arc<BridgeEntry>, reason: String) {
        self.bridges
            .remove_if(&entry.identity, |_, current| Arc::ptr_eq(current, entry));
        entry.fail(reason);
    }

    fn watch_disconnect(
        self: &Arc<Self>,
        entry: Arc<BridgeEntry>,
        session: SessionHandle,
        mut disconnect_rx: broadcast::Receiver<()>,
    ) {
        let registry: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            if session.is_alive() {
                // A message, lag, or a closed channel all mean the session is over
                let _ = disconnect_rx.recv().await;
            }
            debug!("Session {} for bridge {} ended", session.id(), entry.identity);

            if let Some(registry) = registry.upgrade() {
                registry.remove_entry(&entry);
            }
        });
    }

    /// Remove exactly this entry (not a newer one under the same identity)
    fn remove_entry(&self, entry: &Arc<BridgeEntry>) -> bool {
        let removed = self
            .bridges
            .remove_if(&entry.identity, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if removed {
            info!("Bridge {} disconnected and removed", entry.identity);
            self.finish_removal(entry);
        }
        removed
    }

    fn finish_removal(&self, entry: &BridgeEntry) {
        entry.mark_disconnected();

        let listeners: Vec<Arc<dyn DisconnectListener>> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_disconnect(entry);
        }
    }

    /// Remove the bridge for `identity` and notify listeners.
    /// A session that is still alive is closed.
    pub async fn remove(&self, identity: &HostIdentity) -> Option<Arc<BridgeEntry>> {
        let (_, entry) = self.bridges.remove(identity)?;
        info!("Bridge {} removed", identity);
        self.finish_removal(&entry);

        if let Some(session) = entry.session() {
            if session.is_alive() {
                session.close().await;
            }
        }
        Some(entry)
    }

    /// Close the bridge for `identity`, waiting for an in-flight open first
    pub async fn disconnect(&self, identity: &HostIdentity) -> Result<(), BridgeError> {
        let entry = self
            .find_by_identity(identity)
            .ok_or_else(|| BridgeError::NotFound(identity.to_string()))?;

        if entry.state() == BridgeState::Connecting {
            entry.wait_settled().await;
        }

        self.remove_entry(&entry);
        if let Some(session) = entry.session() {
            session.close().await;
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let identities: Vec<HostIdentity> = self.bridges.iter().map(|e| e.key().clone()).collect();
        if identities.is_empty() {
            return;
        }

        info!("Disconnecting {} bridge(s)", identities.len());
        for identity in identities {
            self.remove(&identity).await;
        }
    }

    pub fn list(&self) -> Vec<BridgeInfo> {
        self.bridges.iter().map(|e| e.value().to_info()).collect()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::HostRecord;
    use crate::ssh::{SessionControl, SshError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) struct MockSession {
        id: String,
        alive: AtomicBool,
        disconnect_tx: broadcast::Sender<()>,
        pub closes: AtomicUsize,
    }

    impl MockSession {
        fn new(id: String) -> Self {
            let (disconnect_tx, _) = broadcast::channel(1);
            Self {
                id,
                alive: AtomicBool::new(true),
                disconnect_tx,
                closes: AtomicUsize::new(0),
            }
        }

        /// Simulate the link dropping
        pub(crate) fn drop_link(&self) {
            self.alive.store(false, Ordering::SeqCst);
            let _ = self.disconnect_tx.send(());
        }
    }

    #[async_trait]
    impl SessionControl for MockSession {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
            self.disconnect_tx.subscribe()
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.drop_link();
        }
    }

    /// Records every open call; fails while `fail` is set
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub opens: AtomicUsize,
        pub fail: AtomicBool,
        pub delay_ms: u64,
        pub sessions: Mutex<Vec<Arc<MockSession>>>,
        pub forwardings: Mutex<Vec<Option<String>>>,
    }

    impl MockTransport {
        pub(crate) fn with_delay(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                ..Default::default()
            }
        }

        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionTransport for MockTransport {
        async fn open(
            &self,
            _identity: &HostIdentity,
            _credentials: &Credentials,
            forwarding: Option<&PortForwarding>,
        ) -> Result<SessionHandle, SshError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            self.forwardings
                .lock()
                .push(forwarding.map(|f| f.nickname.clone()));
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SshError::ConnectionFailed("connection refused".to_string()));
            }
            let session = Arc::new(MockSession::new(format!("session-{}", n)));
            self.sessions.lock().push(session.clone());
            Ok(session)
        }
    }

    pub(crate) fn box1_credentials() -> Credentials {
        Credentials::new("10.0.0.5", "alice", "secret", 22).with_forwardings(vec![
            PortForwarding::local("web", 8080, "localhost", 80),
            PortForwarding::local("db", 5432, "localhost", 5432),
        ])
    }

    fn id(name: &str) -> HostIdentity {
        HostIdentity::from_nickname(name).unwrap()
    }

    fn registry(transport: &Arc<MockTransport>) -> Arc<BridgeRegistry> {
        Arc::new(BridgeRegistry::new(transport.clone()))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrent_ensure_open_opens_once() {
        let transport = Arc::new(MockTransport::with_delay(50));
        let registry = registry(&transport);
        let identity = id("box1");

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            let identity = identity.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
                    .await
            }));
        }

        let mut entries = Vec::new();
        for task in tasks {
            entries.push(task.await.unwrap().unwrap());
        }

        assert_eq!(transport.opens(), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(entries[0].state(), BridgeState::Connected);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_settled_follows_in_flight_open() {
        let transport = Arc::new(MockTransport::with_delay(50));
        let registry = registry(&transport);
        let identity = id("box1");

        let opener = {
            let registry = registry.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                registry
                    .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
                    .await
            })
        };

        wait_until(|| registry.find_by_identity(&identity).is_some()).await;
        let entry = registry.find_by_identity(&identity).unwrap();
        assert_eq!(entry.wait_settled().await, BridgeState::Connected);
        // Already settled entries return immediately
        assert_eq!(entry.wait_settled().await, BridgeState::Connected);

        let opened = opener.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&opened, &entry));
    }

    #[tokio::test]
    async fn test_nickname_with_space_resolves_to_one_bridge() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);
        let mut host = HostRecord::new("my box", "alice", "10.0.0.5", 22);
        host.password = "secret".to_string();
        let from_record = host.identity().unwrap();
        assert_eq!(from_record, id("my box"));

        let opened = registry
            .ensure_open(
                &from_record,
                Some(OpenRequest::from_credentials(host.credentials(Vec::new()))),
            )
            .await
            .unwrap();

        let found = registry.find_by_identity(&id("my box")).unwrap();
        assert!(Arc::ptr_eq(&opened, &found));
        let again = registry.ensure_open(&id("my box"), None).await.unwrap();
        assert!(Arc::ptr_eq(&opened, &again));
        assert_eq!(transport.opens(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reuse_connected_entry() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);
        let identity = id("box1");

        let first = registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();
        // No request needed once the bridge exists
        let second = registry.ensure_open(&identity, None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.opens(), 1);
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn test_failed_open_rolls_back() {
        let transport = Arc::new(MockTransport::default());
        transport.fail.store(true, Ordering::SeqCst);
        let registry = registry(&transport);
        let identity = id("box1");

        let err = registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::OpenFailure { ref identity, .. } if identity == "box1"));
        assert!(registry.find_by_identity(&identity).is_none());
        assert!(registry.is_empty());

        // Not retried by the registry, but a later call may open again
        transport.fail.store(false, Ordering::SeqCst);
        registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_waiters_share_open_failure() {
        let transport = Arc::new(MockTransport::with_delay(50));
        transport.fail.store(true, Ordering::SeqCst);
        let registry = registry(&transport);
        let identity = id("box1");

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let identity = identity.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
                    .await
            }));
        }

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(
                matches!(err, BridgeError::OpenFailure { ref reason, .. } if reason.contains("connection refused"))
            );
        }
        assert_eq!(transport.opens(), 1);
        assert!(registry.find_by_identity(&identity).is_none());
    }

    #[tokio::test]
    async fn test_unknown_identity_without_request() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);

        let err = registry.ensure_open(&id("ghost"), None).await.unwrap_err();
        assert_eq!(err, BridgeError::NotFound("ghost".to_string()));
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn test_invalid_credentials_rejected_before_open() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);

        let request = OpenRequest::new(Credentials::new("10.0.0.5", "alice", "secret", 0), None);
        let err = registry.ensure_open(&id("box1"), Some(request)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCredentials(_)));
        assert_eq!(transport.opens(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_only_first_forwarding_applied() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);

        let entry = registry
            .ensure_open(&id("box1"), Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();

        assert_eq!(*transport.forwardings.lock(), vec![Some("web".to_string())]);
        assert_eq!(entry.to_info().forwarding.as_deref(), Some("web"));
        assert_eq!(entry.target, "alice@10.0.0.5:22");
    }

    #[tokio::test]
    async fn test_transport_disconnect_removes_and_notifies_once() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);
        let identity = id("box1");

        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let (a, b) = (calls_a.clone(), calls_b.clone());
        registry.add_disconnect_listener(Arc::new(move |entry: &BridgeEntry| {
            assert_eq!(entry.identity.as_str(), "box1");
            assert_eq!(entry.state(), BridgeState::Disconnected);
            a.fetch_add(1, Ordering::SeqCst);
        }));
        registry.add_disconnect_listener(Arc::new(move |_: &BridgeEntry| {
            b.fetch_add(1, Ordering::SeqCst);
        }));

        registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();

        let session = transport.sessions.lock()[0].clone();
        session.drop_link();

        wait_until(|| registry.find_by_identity(&identity).is_none()).await;
        wait_until(|| calls_a.load(Ordering::SeqCst) == 1 && calls_b.load(Ordering::SeqCst) == 1).await;

        // A second signal for the same session changes nothing
        session.drop_link();
        assert!(registry.remove(&identity).await.is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_closes_session() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);
        let identity = id("box1");

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry.add_disconnect_listener(Arc::new(move |_: &BridgeEntry| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].state, BridgeState::Connected);

        registry.disconnect(&identity).await.unwrap();
        assert!(registry.find_by_identity(&identity).is_none());

        let session = transport.sessions.lock()[0].clone();
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);

        // Give the watcher a chance to run; it must not notify again
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            registry.disconnect(&identity).await.unwrap_err(),
            BridgeError::NotFound("box1".to_string())
        );
    }

    #[tokio::test]
    async fn test_remove_notifies_listeners_and_closes() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);
        let identity = id("box1");

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry.add_disconnect_listener(Arc::new(move |entry: &BridgeEntry| {
            assert_eq!(entry.state(), BridgeState::Disconnected);
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let opened = registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();
        let removed = registry.remove(&identity).await.unwrap();
        assert!(Arc::ptr_eq(&opened, &removed));
        assert!(registry.is_empty());

        let session = transport.sessions.lock()[0].clone();
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);
        let identity = id("box1");

        let first = registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();
        transport.sessions.lock()[0].drop_link();
        wait_until(|| registry.find_by_identity(&identity).is_none()).await;

        let second = registry
            .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), BridgeState::Disconnected);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_open_leaves_no_placeholder() {
        let transport = Arc::new(MockTransport::with_delay(500));
        let registry = registry(&transport);
        let identity = id("box1");

        let task = {
            let registry = registry.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                registry
                    .ensure_open(&identity, Some(OpenRequest::from_credentials(box1_credentials())))
                    .await
            })
        };

        wait_until(|| registry.find_by_identity(&identity).is_some()).await;
        task.abort();
        let _ = task.await;

        assert!(registry.find_by_identity(&identity).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let transport = Arc::new(MockTransport::default());
        let registry = registry(&transport);

        for name in ["box1", "box2", "box3"] {
            registry
                .ensure_open(&id(name), Some(OpenRequest::from_credentials(box1_credentials())))
                .await
                .unwrap();
        }
        assert_eq!(registry.len(), 3);

        registry.disconnect_all().await;
        assert!(registry.is_empty());
        assert!(transport
            .sessions
            .lock()
            .iter()
            .all(|s| s.closes.load(Ordering::SeqCst) == 1));
    }
}
