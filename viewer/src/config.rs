use crate::errors::{Error, Result};
use std::time::Duration;

pub const DEFAULT_OFFLINE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_ALERT_CAPACITY: usize = 3;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// Tunables of one viewer session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Silence longer than this marks the device offline.
    pub offline_timeout: Duration,
    /// Period of the staleness re-check.
    pub tick_interval: Duration,
    /// Number of most recent alerts kept in the view.
    pub alert_capacity: usize,
    /// Upper bound on a single command call.
    pub command_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_millis(DEFAULT_OFFLINE_TIMEOUT_MS),
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.alert_capacity == 0 {
            return Err(Error::Config("alert capacity must be at least 1".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be non-zero".to_string()));
        }
        if self.tick_interval > self.offline_timeout {
            return Err(Error::Config(format!(
                "tick interval {:?} is longer than the offline timeout {:?}",
                self.tick_interval, self.offline_timeout
            )));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::Config("command timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}
