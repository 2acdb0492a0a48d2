//! Configuration types for the sync engine and the REST remote.

use std::path::PathBuf;
use std::time::Duration;

use crate::sync::retry::RetryPolicy;

/// Top-level sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path of the local redb database file.
    pub database_path: PathBuf,
    /// Upper bound on waiting for plus holding a table lock.
    pub lock_timeout: Duration,
    /// Backoff of pending-mutation flush retries.
    pub retry: RetryPolicy,
    /// Backoff of failed catch-up fetches.
    pub catch_up_retry: RetryPolicy,
    /// Pause before resubscribing a lost change channel.
    pub reconnect_delay: Duration,
    /// How long a sent row is remembered for echo detection.
    pub echo_window: Duration,
    /// When reconciliation trouble forces a full resync.
    pub drift: DriftConfig,
    /// Capacity of the incoming event queue.
    pub event_buffer: usize,
    /// Interval at which idle tables are checked for unsent mutations.
    pub tick_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("replica.redb"),
            lock_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            catch_up_retry: RetryPolicy::default(),
            reconnect_delay: Duration::from_secs(5),
            echo_window: Duration::from_secs(10),
            drift: DriftConfig::default(),
            event_buffer: 256,
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Thresholds of the drift detector.
#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// Trouble occurrences within `window` that trigger a resync.
    pub threshold: usize,
    pub window: Duration,
    /// An event waiting longer than this for the apply lock counts as trouble.
    pub max_lock_wait: Duration,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(10),
            max_lock_wait: Duration::from_secs(2),
        }
    }
}

/// Connection settings of [`crate::remote::RestRemote`].
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL; tables are resources directly under it.
    pub base_url: String,
    /// Sent as both the `apikey` header and a bearer token.
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.database_path, PathBuf::from("replica.redb"));
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.echo_window, Duration::from_secs(10));
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn drift_config_defaults() {
        let config = DriftConfig::default();
        assert_eq!(config.threshold, 5);
        assert_eq!(config.window, Duration::from_secs(10));
        assert_eq!(config.max_lock_wait, Duration::from_secs(2));
    }

    #[test]
    fn rest_config_defaults() {
        let config = RestConfig::default();
        assert_eq!(config.base_url, "http://localhost:3000");
        assert!(config.api_key.is_none());
        assert_eq!(config.timeout, Duration::from_secs(30));
    }
}
