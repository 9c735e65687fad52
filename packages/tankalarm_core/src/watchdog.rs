//! Watchdog: the control loop kicks it every iteration
//!
//! [`SoftWatchdog`] stands in for a hardware watchdog. A monitor thread
//! fires the expiry callback once if no kick arrives within the timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Watchdog: Send + Sync {
    fn kick(&self);
}

/// Watchdog for tests and hosts without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn kick(&self) {}
}

struct Shared {
    last_kick: Mutex<Instant>,
    expired: AtomicBool,
    stopped: AtomicBool,
}

pub struct SoftWatchdog {
    shared: Arc<Shared>,
    timeout: Duration,
    monitor: Option<JoinHandle<()>>,
}

impl SoftWatchdog {
    /// Start monitoring. `on_expire` runs on the monitor thread, at most once.
    pub fn start<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            last_kick: Mutex::new(Instant::now()),
            expired: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        let poll = (timeout / 4).max(Duration::from_millis(1));

        let monitor = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut on_expire = Some(on_expire);
                while !shared.stopped.load(Ordering::SeqCst) {
                    thread::sleep(poll);
                    let since = match shared.last_kick.lock() {
                        Ok(last) => last.elapsed(),
                        Err(poisoned) => poisoned.into_inner().elapsed(),
                    };
                    if since > timeout {
                        shared.expired.store(true, Ordering::SeqCst);
                        log::error!("Watchdog expired after {:?} without a kick", since);
                        if let Some(callback) = on_expire.take() {
                            callback();
                        }
                        break;
                    }
                }
            })
        };

        Self {
            shared,
            timeout,
            monitor: Some(monitor),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_expired(&self) -> bool {
        self.shared.expired.load(Ordering::SeqCst)
    }
}

impl Watchdog for SoftWatchdog {
    fn kick(&self) {
        match self.shared.last_kick.lock() {
            Ok(mut last) => *last = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }
}

impl Drop for SoftWatchdog {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_kicked_watchdog_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let watchdog = SoftWatchdog::start(Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(20));
            watchdog.kick();
        }
        assert!(!watchdog.has_expired());
        drop(watchdog);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_starved_watchdog_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let watchdog = SoftWatchdog::start(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(200));
        assert!(watchdog.has_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
