use serde::Deserialize;
use std::path::Path;

use crate::error::{DbError, DbResult};

/// Server configuration, loaded from a TOML file.
///
/// Every field has a default so a missing file or a partial file both work;
/// CLI flags override the basics on top of whatever was loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Data directory. Shards live in `<work_dir>/shard-<i>`, the binlog in
    /// `<work_dir>/binlog/`.
    pub work_dir: String,

    /// Number of RocksDB shards.
    pub shard_count: usize,

    /// Fsync every storage write (slow, durable).
    pub sync_writes: bool,

    /// Port the replication sync listener binds on.
    pub sync_port: u16,

    pub binlog: BinlogConfig,

    /// Present on a slave: where the master is and how often to pull.
    pub master: Option<MasterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BinlogConfig {
    pub enabled: bool,

    /// Rotation threshold for one segment, in bytes.
    pub max_segment_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,

    /// Pause between sync rounds.
    pub sync_interval_ms: u64,

    /// Flat delay between reconnect attempts.
    pub reconnect_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: "./data".to_string(),
            shard_count: 4,
            sync_writes: false,
            sync_port: 6380,
            binlog: BinlogConfig::default(),
            master: None,
        }
    }
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_segment_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6380,
            sync_interval_ms: 5000,
            reconnect_interval_ms: 5000,
        }
    }
}

impl Config {
    /// Parse a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|e| DbError::ConfigError(e.to_string()))
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => toml::from_str(&text).map_err(|e| DbError::ConfigError(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.shard_count == 0 {
            return Err(DbError::ConfigError("shard_count must be >= 1".to_string()));
        }
        if self.binlog.max_segment_bytes == 0 {
            return Err(DbError::ConfigError(
                "binlog.max_segment_bytes must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
