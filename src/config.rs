//! Engine configuration: loading, persistence and defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config at {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
}

/// Durability mode of the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WalMode {
    /// No disk I/O at all; LSNs are still assigned and the writer clock
    /// still advances.
    None,
    /// Buffered writes, the OS decides when data hits the platter.
    #[default]
    Write,
    /// Every flush is synced before the batch is acknowledged.
    Fsync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding the log segments.
    pub wal_dir: PathBuf,
    pub wal_mode: WalMode,
    /// Segment rotation threshold in bytes. Zero rotates on every batch.
    pub wal_max_size: u64,
    /// Heartbeat interval; the ack-reader deadline is four times this.
    pub replication_timeout_ms: u64,
    /// Identity stamped into segment headers.
    pub instance_uuid: Uuid,
    pub replicaset_uuid: Uuid,
    /// Retention bounds of the in-memory row ring.
    pub ring_max_rows: usize,
    pub ring_max_bytes: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("wal"),
            wal_mode: WalMode::default(),
            wal_max_size: 256 * 1024 * 1024,
            replication_timeout_ms: 1_000,
            instance_uuid: Uuid::new_v4(),
            replicaset_uuid: Uuid::new_v4(),
            ring_max_rows: 16 * 1024,
            ring_max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl WalConfig {
    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    /// Ack-reader read deadline.
    pub fn replication_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms.saturating_mul(4))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = WalConfig::default();
        assert_eq!(cfg.wal_mode, WalMode::Write);
        assert!(cfg.wal_max_size > 0);
        assert_eq!(
            cfg.replication_disconnect_timeout(),
            cfg.replication_timeout() * 4
        );
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walrelay.toml");
        let mut cfg = WalConfig::default();
        cfg.wal_mode = WalMode::Fsync;
        cfg.wal_max_size = 1024;
        cfg.save(&path).unwrap();

        let loaded = WalConfig::load(&path).unwrap();
        assert_eq!(loaded.wal_mode, WalMode::Fsync);
        assert_eq!(loaded.wal_max_size, 1024);
        assert_eq!(loaded.instance_uuid, cfg.instance_uuid);
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walrelay.toml");
        fs::write(&path, "wal_mode = \"none\"\n").unwrap();
        let loaded = WalConfig::load(&path).unwrap();
        assert_eq!(loaded.wal_mode, WalMode::None);
        assert_eq!(loaded.ring_max_rows, WalConfig::default().ring_max_rows);
    }
}
