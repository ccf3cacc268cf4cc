//! Engine configuration
//!
//! All values are plain millisecond counts so any configuration source can
//! feed them. `LockConfig::load` layers an optional file and `HASP_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Lock engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Store key prefix
    pub namespace: String,
    /// Node identity; generated from the host name when absent
    pub node_id: Option<String>,
    /// Lease TTL used when callers do not pass one
    pub default_lease_ttl_ms: u64,
    /// Leases with a TTL at or below this get a renewal watchdog
    pub renewal_threshold_ms: u64,
    pub sync_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub detection_interval_ms: u64,
    /// Nodes whose heartbeat is older than this are excised from detection
    pub node_timeout_ms: u64,
    /// Background state is torn down after this much inactivity
    pub idle_reap_threshold_ms: u64,
    pub idle_check_interval_ms: u64,
    /// Waits longer than this count as slow acquisitions
    pub slow_lock_threshold_ms: u64,
    pub monitor_report_interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts per store operation before surfacing `LockUnavailable`
    pub store_retry_attempts: u32,
    /// Block new readers once a writer is waiting
    pub writer_priority: bool,
    pub distributed_detection_enabled: bool,
    /// Lifetime of a fair-queue entry, counted from the waiter's latest poll.
    /// Must exceed `max_backoff_ms` or a live waiter ages out between polls.
    pub fair_queue_entry_grace_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
            node_id: None,
            default_lease_ttl_ms: 30_000,
            renewal_threshold_ms: 60_000,
            sync_interval_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            detection_interval_ms: 10_000,
            node_timeout_ms: 15_000,
            idle_reap_threshold_ms: 300_000,
            idle_check_interval_ms: 30_000,
            slow_lock_threshold_ms: 1_000,
            monitor_report_interval_ms: 60_000,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
            store_retry_attempts: 3,
            writer_priority: true,
            distributed_detection_enabled: true,
            fair_queue_entry_grace_ms: 5_000,
        }
    }
}

impl LockConfig {
    /// Load configuration from an optional file plus `HASP_` environment variables.
    ///
    /// Environment variables override the file, e.g. `HASP_NODE_TIMEOUT_MS=20000`.
    pub fn load(path: Option<&Path>) -> Result<Self, LockError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("HASP").try_parsing(true));

        let config: LockConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LockError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the background schedulers cannot run with
    pub fn validate(&self) -> Result<(), LockError> {
        let intervals = [
            ("default_lease_ttl_ms", self.default_lease_ttl_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("detection_interval_ms", self.detection_interval_ms),
            ("node_timeout_ms", self.node_timeout_ms),
            ("idle_check_interval_ms", self.idle_check_interval_ms),
            ("monitor_report_interval_ms", self.monitor_report_interval_ms),
            ("initial_backoff_ms", self.initial_backoff_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(LockError::Config(format!("{} must be positive", name)));
            }
        }
        if self.node_timeout_ms <= self.heartbeat_interval_ms {
            return Err(LockError::Config(
                "node_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(LockError::Config(
                "max_backoff_ms must not be below initial_backoff_ms".to_string(),
            ));
        }
        if self.fair_queue_entry_grace_ms <= self.max_backoff_ms {
            return Err(LockError::Config(
                "fair_queue_entry_grace_ms must exceed max_backoff_ms".to_string(),
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(LockError::Config(
                "store_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(LockError::Config(format!(
                "invalid namespace '{}'",
                self.namespace
            )));
        }
        Ok(())
    }

    pub fn default_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.default_lease_ttl_ms)
    }

    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_millis(self.renewal_threshold_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn idle_reap_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_reap_threshold_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn slow_lock_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_lock_threshold_ms)
    }

    pub fn monitor_report_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_report_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn fair_queue_entry_grace(&self) -> Duration {
        Duration::from_millis(self.fair_queue_entry_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = LockConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_lease_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_short_node_timeout() {
        let config = LockConfig {
            node_timeout_ms: 1_000,
            heartbeat_interval_ms: 2_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = LockConfig {
            sync_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_queue_grace_within_backoff() {
        let config = LockConfig {
            max_backoff_ms: 500,
            fair_queue_entry_grace_ms: 500,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::Config(_))));

        let config = LockConfig {
            fair_queue_entry_grace_ms: 501,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "namespace = \"orders\"\nnode_id = \"node-a\"\nsync_interval_ms = 1500"
        )
        .unwrap();

        let config = LockConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.namespace, "orders");
        assert_eq!(config.node_id.as_deref(), Some("node-a"));
        assert_eq!(config.sync_interval_ms, 1500);
        // untouched fields keep their defaults
        assert_eq!(config.node_timeout_ms, 15_000);
    }
}
