//! ConnBridge - SSH bridge connection manager
//!
//! Keeps at most one SSH session per stored host, restores the default host's
//! session at startup, and probes connectivity through a directory service.

pub mod app;
pub mod bridge;
pub mod config;
pub mod directory;
pub mod forwarding;
pub mod session;
pub mod ssh;

use std::fs::OpenOptions;
use std::io::Write;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use app::Command;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Write startup log to file (useful when the process runs unattended)
fn write_startup_log(message: &str) {
    if let Ok(log_dir) = config::storage::log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);

        let log_file = log_dir.join("startup.log");
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_file) {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "[{}] {}", timestamp, message);
        }
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub fn run() {
    let command = match Command::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("{}\n\n{}", msg, app::USAGE);
            std::process::exit(2);
        }
    };

    if command == Command::Version {
        println!("connbridge {}", VERSION);
        return;
    }

    write_startup_log("ConnBridge starting...");

    init_logging();

    tracing::info!("Starting ConnBridge {}...", VERSION);
    write_startup_log("Logging initialized");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let msg = format!("Failed to start async runtime: {}", e);
            tracing::error!("{}", msg);
            write_startup_log(&msg);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(app::execute(command)) {
        let msg = format!("ConnBridge failed: {}", e);
        tracing::error!("{}", msg);
        write_startup_log(&msg);
        std::process::exit(1);
    }

    write_startup_log("ConnBridge stopped");
}
