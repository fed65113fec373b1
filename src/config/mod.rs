//! Configuration Management Module
//!
//! Application settings (`config.json`) and the host store (`hosts.json`).

pub mod host_store;
pub mod storage;
pub mod types;

pub use host_store::{provision_host, HostRecord, HostStore, JsonHostStore, NEVER_CONNECTED};
pub use storage::{config_dir, config_file, hosts_file, log_dir, ConfigStorage, StorageError};
pub use types::{
    AppConfig, DirectorySettings, ProbeSettings, SshSettings, CONFIG_VERSION,
    DEFAULT_DIRECTORY_URL, DEFAULT_PROBE_PORT,
};
