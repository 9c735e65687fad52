//! ClockSync: relay-sourced wall clock with uptime interpolation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::relay::{bounded, Relay, DEFAULT_RELAY_TIMEOUT};

use super::{Epoch, SECONDS_PER_HOUR};

/// How often the relay is asked for the time once a sync has succeeded.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Monotonic time since the device started.
pub trait Uptime: Send + Sync {
    fn uptime(&self) -> Duration;
}

/// Uptime measured on the tokio clock, so paused-time tests can drive it.
#[derive(Debug, Clone)]
pub struct MonotonicUptime {
    started: Instant,
}

impl MonotonicUptime {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicUptime {
    fn default() -> Self {
        Self::new()
    }
}

impl Uptime for MonotonicUptime {
    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncPoint {
    epoch: Epoch,
    uptime: Duration,
}

/// Wall-clock epoch acquired from the relay on a slow cadence.
pub struct ClockSync {
    relay: Arc<dyn Relay>,
    uptime: Arc<dyn Uptime>,
    sync_interval: Duration,
    request_timeout: Duration,
    synced: Option<SyncPoint>,
}

impl ClockSync {
    pub fn new(relay: Arc<dyn Relay>, uptime: Arc<dyn Uptime>, sync_interval: Duration) -> Self {
        Self {
            relay,
            uptime,
            sync_interval,
            request_timeout: DEFAULT_RELAY_TIMEOUT,
            synced: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Ask the relay for the time if a sync is due.
    ///
    /// A sync is due when `force` is set, when no sync has ever succeeded,
    /// or when the sync interval has elapsed. Failures are silent: the
    /// previous sync point (if any) stays in use. Returns whether a new
    /// sync point was recorded.
    pub async fn ensure_synced(&mut self, force: bool) -> bool {
        if !force {
            if let Some(point) = self.synced {
                let since = self.uptime.uptime().saturating_sub(point.uptime);
                if since < self.sync_interval {
                    return false;
                }
            }
        }

        match bounded(self.request_timeout, self.relay.time()).await {
            Ok(epoch) if epoch.is_known() => {
                self.synced = Some(SyncPoint {
                    epoch,
                    uptime: self.uptime.uptime(),
                });
                log::debug!("Clock synced to {}", epoch);
                true
            }
            Ok(epoch) => {
                log::debug!("Relay returned unusable time {}", epoch.0);
                false
            }
            Err(e) => {
                log::debug!("Time sync failed: {}", e);
                false
            }
        }
    }

    /// Current epoch, or [`Epoch::UNKNOWN`] if the clock has never synced.
    pub fn current_epoch(&self) -> Epoch {
        match self.synced {
            None => Epoch::UNKNOWN,
            Some(point) => {
                let elapsed = self.uptime.uptime().saturating_sub(point.uptime);
                point.epoch.plus_secs(elapsed.as_secs() as i64)
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.is_some()
    }

    /// Epoch reported by the relay at the last successful sync.
    pub fn last_sync(&self) -> Option<Epoch> {
        self.synced.map(|p| p.epoch)
    }
}

/// Whole hours of uptime, the fallback clock while the epoch is unknown.
///
/// Only the control loop advances it (via [`HourTicks::observe_uptime`]);
/// everything else reads it.
#[derive(Debug, Default)]
pub struct HourTicks {
    hours: AtomicU64,
}

impl HourTicks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the number of whole hours in `uptime`. Never goes backwards.
    pub fn observe_uptime(&self, uptime: Duration) -> u64 {
        let hours = uptime.as_secs() / SECONDS_PER_HOUR as u64;
        let previous = self.hours.fetch_max(hours, Ordering::SeqCst);
        previous.max(hours)
    }

    pub fn hours(&self) -> u64 {
        self.hours.load(Ordering::SeqCst)
    }
}
