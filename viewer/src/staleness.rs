use std::time::Duration;
use tokio::time::Instant;

/// Decides whether the device should be treated as offline.
///
/// Silence carries the signal, so the predicate is evaluated against the
/// current time on every tick, not only when a message arrives.
#[derive(Debug, Clone, Copy)]
pub struct StalenessDetector {
    timeout: Duration,
}

impl StalenessDetector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `interrupted` is set while the channel has dropped and no fresh
    /// message has arrived since.
    pub fn is_offline(&self, last_seen: Option<Instant>, interrupted: bool, now: Instant) -> bool {
        if interrupted {
            return true;
        }
        match last_seen {
            None => true,
            Some(seen) => now.saturating_duration_since(seen) > self.timeout,
        }
    }
}
