//! # Supervisor configuration.
//!
//! [`Config`] centralizes runtime tunables: data root, intervals, console
//! fabric sizing, stop grace, API bind address, and server defaults. It is
//! constructed explicitly at startup and injected into each component; there
//! are no ambient singletons, and tests build fresh instances per case.
//!
//! Loaded from `config.json` in the data root when present; absent or broken
//! files fall back to defaults with a warning.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::console::FabricConfig;
use crate::error::Result;
use crate::platform::paths;

/// Global configuration for the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the database, server directories, and backups.
    pub data_root: PathBuf,
    /// Bind address of the HTTP/WebSocket API.
    pub bind: SocketAddr,
    /// Default heap size for new servers.
    pub default_memory: String,
    /// Default TCP port for new servers.
    pub default_port: u16,
    /// Seconds granted to each phase of the two-stage stop.
    pub stop_grace_seconds: u64,
    /// Reconciler period in seconds.
    pub reconcile_interval_seconds: u64,
    /// Dead-console sweep period in seconds.
    pub sweep_interval_seconds: u64,
    /// Lines of console history retained per server.
    pub console_ring_capacity: usize,
    /// Frames queued per console subscriber before it counts as lagging.
    pub sink_queue_capacity: usize,
    /// Console heartbeat interval in seconds.
    pub heartbeat_interval_seconds: u64,
    /// Idle minutes before a dead child's console ring is freed.
    pub dead_console_ttl_minutes: u64,
}

impl Default for Config {
    /// Defaults:
    /// - `stop_grace_seconds = 30`
    /// - `reconcile_interval_seconds = 10`
    /// - `sweep_interval_seconds = 30`
    /// - `console_ring_capacity = 2000`
    /// - `heartbeat_interval_seconds = 20`
    /// - `dead_console_ttl_minutes = 10`
    fn default() -> Self {
        Self {
            data_root: paths::data_root(),
            bind: ([127, 0, 0, 1], 5000).into(),
            default_memory: "2G".to_string(),
            default_port: 25565,
            stop_grace_seconds: 30,
            reconcile_interval_seconds: 10,
            sweep_interval_seconds: 30,
            console_ring_capacity: 2000,
            sink_queue_capacity: 256,
            heartbeat_interval_seconds: 20,
            dead_console_ttl_minutes: 10,
        }
    }
}

impl Config {
    /// Loads `config.json` from the default data root, or defaults when the
    /// file is absent.
    pub fn load() -> Self {
        let root = paths::data_root();
        Self::load_from(&paths::config_path(&root))
    }

    /// Loads a specific config file; parse failures fall back to defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(cfg) => {
                    debug!(path = %path.display(), "configuration loaded");
                    cfg
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "invalid config file, using defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// Writes the configuration back to its data-root location.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_root)?;
        let path = paths::config_path(&self.data_root);
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::Resource(format!("encode config: {e}")))?;
        std::fs::write(&path, text)?;
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Fabric tunables derived from this configuration.
    pub fn fabric(&self) -> FabricConfig {
        FabricConfig {
            ring_capacity: self.console_ring_capacity,
            sink_queue_capacity: self.sink_queue_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            sweep_ttl: Duration::from_secs(self.dead_console_ttl_minutes * 60),
        }
    }

    /// Database path under the data root.
    pub fn database_path(&self) -> PathBuf {
        paths::database_path(&self.data_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = Config::default();
        assert_eq!(cfg.stop_grace_seconds, 30);
        assert_eq!(cfg.reconcile_interval_seconds, 10);
        assert_eq!(cfg.console_ring_capacity, 2000);
        assert_eq!(cfg.heartbeat_interval_seconds, 20);
        assert_eq!(cfg.dead_console_ttl_minutes, 10);
        assert_eq!(cfg.default_port, 25565);
    }

    #[test]
    fn partial_file_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_memory": "4G"}"#).unwrap();
        let cfg = Config::load_from(&path);
        assert_eq!(cfg.default_memory, "4G");
        assert_eq!(cfg.default_port, 25565);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let cfg = Config::load_from(&path);
        assert_eq!(cfg.default_memory, "2G");
    }
}
