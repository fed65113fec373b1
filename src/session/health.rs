//! Connectivity Prober
//!
//! Periodically asks the directory service whether a port is reachable and
//! hands the status code to an observer.
//!
//! # Cycle
//!
//! ```text
//! Idle ──tick──► Probing ──result──► Idle
//!                                      │ (watch, single slot)
//!                                      ▼
//!                           delivery task ──► ProbeObserver
//! ```
//!
//! - Exactly one scheduler task per prober, so cycles never overlap
//! - Any failure (transport, non-2xx, bad body, timeout) reports `0`
//! - Delivery runs on its own task; a newer result replaces an undelivered one
//! - `stop()` is observed between cycles; an in-flight probe completes

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ProbeSettings;
use crate::directory::DirectoryClient;
use crate::ssh::PortForwarding;

/// Status code of one probe cycle; 0 = unreachable or unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeResult(pub i32);

impl ProbeResult {
    pub const UNREACHABLE: Self = Self(0);

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn is_reachable(&self) -> bool {
        self.0 != 0
    }
}

/// Port checked by the prober
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTarget {
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// The probe port is carried in the forwarding rule's nickname;
    /// anything that isn't a port number falls back to `default_port`
    pub fn from_forwarding(rule: &PortForwarding, default_port: u16) -> Self {
        let port = rule
            .nickname
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(default_port);
        Self { port }
    }
}

/// Receives probe results, one call per delivered cycle
pub trait ProbeObserver: Send + Sync + 'static {
    fn on_probe_result(&self, result: ProbeResult);
}

impl<F> ProbeObserver for F
where
    F: Fn(ProbeResult) + Send + Sync + 'static,
{
    fn on_probe_result(&self, result: ProbeResult) {
        self(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSchedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl From<&ProbeSettings> for ProbeSchedule {
    fn from(settings: &ProbeSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            period: Duration::from_secs(settings.period_secs.max(1)),
        }
    }
}

pub struct ConnectivityProber {
    client: DirectoryClient,
    target: ProbeTarget,
    schedule: ProbeSchedule,
}

impl ConnectivityProber {
    pub fn new(client: DirectoryClient, target: ProbeTarget, schedule: ProbeSchedule) -> Self {
        Self {
            client,
            target,
            schedule,
        }
    }

    pub fn target(&self) -> ProbeTarget {
        self.target
    }

    /// One reachability check. Never fails: every error becomes `0`.
    pub async fn probe(&self) -> ProbeResult {
        match self.client.proxy_test(self.target.port).await {
            Ok(code) => {
                debug!("Probe of port {} returned {}", self.target.port, code);
                ProbeResult(code)
            }
            Err(e) => {
                debug!("Probe of port {} failed: {}", self.target.port, e);
                ProbeResult::UNREACHABLE
            }
        }
    }

    /// Start the periodic schedule
    pub fn spawn(self, observer: Arc<dyn ProbeObserver>) -> ProberHandle {
        let cancel = CancellationToken::new();
        let (result_tx, mut result_rx) = watch::channel::<Option<ProbeResult>>(None);
        let latest = result_tx.subscribe();

        let delivery = tokio::spawn(async move {
            // Ends once the scheduler drops the sender and the last value was seen
            while result_rx.changed().await.is_ok() {
                let result = *result_rx.borrow_and_update();
                if let Some(result) = result {
                    observer.on_probe_result(result);
                }
            }
        });

        let token = cancel.clone();
        let scheduler = tokio::spawn(async move {
            let ProbeSchedule {
                initial_delay,
                period,
            } = self.schedule;
            info!(
                "Connectivity prober started for port {} (every {:?})",
                self.target.port, period
            );

            let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cycles = 0u64;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = self.probe().await;
                cycles += 1;
                result_tx.send_replace(Some(result));
            }

            info!(
                "Connectivity prober for port {} stopped after {} cycle(s)",
                self.target.port, cycles
            );
        });

        ProberHandle {
            cancel,
            latest,
            scheduler,
            delivery,
        }
    }
}

/// Handle to a running prober
pub struct ProberHandle {
    cancel: CancellationToken,
    latest: watch::Receiver<Option<ProbeResult>>,
    scheduler: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl ProberHandle {
    /// Stop at the next cycle boundary
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Most recent published result
    pub fn latest(&self) -> Option<ProbeResult> {
        *self.latest.borrow()
    }

    /// Stop and wait for the in-flight cycle and its delivery to finish
    pub async fn join(self) {
        self.stop();
        let _ = self.scheduler.await;
        let _ = self.delivery.await;
    }
}
