//! Engine configuration

use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Default weight gap left between neighbouring records.
pub const DEFAULT_SPACING: u64 = 8;

/// Default number of records assigned between two scheduler checkpoints
/// during a rebalance.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 10_000;

/// Settings shared by every method in a run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of buckets each method is partitioned into.
    ///
    /// Default: 1
    pub buckets: usize,

    /// Weight distance between records after a rebalance.
    ///
    /// Default: 8
    pub spacing: u64,

    /// Records assigned between two cancellation checkpoints in a rebalance.
    pub checkpoint_interval: usize,

    /// Whether a rebalance also indexes records flagged as deleted.
    pub include_deleted: bool,

    /// `980__%` values that flag a record as deleted.
    pub deleted_markers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buckets: 1,
            spacing: DEFAULT_SPACING,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            include_deleted: false,
            deleted_markers: vec!["DELETED".to_string()],
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BIBSORT_BUCKETS`, `BIBSORT_WEIGHT_SPACING` and
    /// `BIBSORT_CHECKPOINT_INTERVAL` when they are set.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("BIBSORT_BUCKETS") {
            self.buckets = parse_setting("BIBSORT_BUCKETS", &v)?;
        }
        if let Some(v) = lookup("BIBSORT_WEIGHT_SPACING") {
            self.spacing = parse_setting("BIBSORT_WEIGHT_SPACING", &v)?;
        }
        if let Some(v) = lookup("BIBSORT_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = parse_setting("BIBSORT_CHECKPOINT_INTERVAL", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buckets == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "buckets",
                reason: "must be at least 1".into(),
            });
        }
        if self.buckets > u32::MAX as usize {
            return Err(ConfigError::InvalidSetting {
                key: "buckets",
                reason: "too many buckets".into(),
            });
        }
        // a spacing of 1 leaves no room to halve a gap
        if self.spacing < 2 {
            return Err(ConfigError::InvalidSetting {
                key: "spacing",
                reason: "must be at least 2".into(),
            });
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "checkpoint_interval",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn parse_setting<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidSetting { key, reason: e.to_string() })
}
