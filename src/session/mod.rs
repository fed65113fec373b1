//! Session Supervision Module
//!
//! Unattended flows that run next to the bridge registry:
//! - **Boot reconnect**: one-shot restore of the default host's bridge
//! - **Connectivity prober**: periodic reachability check with observer delivery

pub mod boot;
pub mod health;

pub use boot::{BootOutcome, BootReconnectFlow};
pub use health::{
    ConnectivityProber, ProbeObserver, ProbeResult, ProbeSchedule, ProbeTarget, ProberHandle,
};
