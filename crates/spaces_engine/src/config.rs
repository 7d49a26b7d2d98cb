use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine tuning, loaded from `~/.spaces/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Coalescing window for non-critical mutations
    pub debounce_ms: u64,

    /// Coalescing window for surface notifications
    pub broadcast_debounce_ms: u64,

    /// Lifetime of a cache entry that nothing invalidates
    pub cache_ttl_secs: u64,

    /// Batching delay before a scheduled durable write
    pub flush_delay_ms: u64,

    /// Closed spaces older than this are dropped
    pub closed_retention_days: u64,

    /// Safety-net reconciliation period
    pub reconcile_interval_secs: u64,

    /// Delay before the first reconciliation after startup
    pub startup_settle_ms: u64,

    /// Bound on mailbox admission and reply waits
    pub admission_timeout_ms: u64,

    /// Longest accepted space name, in characters
    pub max_name_len: usize,

    /// Consecutive failed flushes before reporting degraded mode
    pub degraded_after_failures: u32,

    /// Engine mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            broadcast_debounce_ms: 100,
            cache_ttl_secs: 300,
            flush_delay_ms: 250,
            closed_retention_days: 30,
            reconcile_interval_secs: 5,
            startup_settle_ms: 1000,
            admission_timeout_ms: 5000,
            max_name_len: 100,
            degraded_after_failures: 3,
            mailbox_capacity: 256,
        }
    }
}

/// Upper bound for any configured delay, so deadlines stay representable.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms).min(MAX_DELAY)
}

fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs).min(MAX_DELAY)
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        millis(self.debounce_ms)
    }

    pub fn broadcast_debounce(&self) -> Duration {
        millis(self.broadcast_debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        secs(self.cache_ttl_secs)
    }

    pub fn flush_delay(&self) -> Duration {
        millis(self.flush_delay_ms)
    }

    pub fn closed_retention(&self) -> Duration {
        Duration::from_secs(self.closed_retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn reconcile_interval(&self) -> Duration {
        secs(self.reconcile_interval_secs.max(1))
    }

    pub fn startup_settle(&self) -> Duration {
        millis(self.startup_settle_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        millis(self.admission_timeout_ms)
    }

    /// Loads a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Default location of the config file (`~/.spaces/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new("/").to_path_buf())
        .join(".spaces")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::load(&temp.path().join("config.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.closed_retention(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "debounce_ms = 40\nmax_name_len = 12\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.debounce_ms, 40);
        assert_eq!(config.max_name_len, 12);
        assert_eq!(config.flush_delay_ms, 250, "unset keys must keep defaults");
    }

    #[test]
    fn test_invalid_file_reports_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "debounce_ms = \"fast\"").unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_huge_values_saturate_instead_of_overflowing() {
        let config = EngineConfig {
            closed_retention_days: u64::MAX,
            startup_settle_ms: u64::MAX,
            reconcile_interval_secs: u64::MAX,
            ..EngineConfig::default()
        };
        assert_eq!(config.closed_retention(), Duration::from_secs(u64::MAX));
        assert_eq!(config.startup_settle(), MAX_DELAY);
        assert_eq!(config.reconcile_interval(), MAX_DELAY);

        let now = tokio::time::Instant::now();
        assert!(now + config.startup_settle() > now, "deadlines must stay representable");
    }
}
