//! Viewer: read-only consumer of the coordinator's fleet summaries

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::queue::{MessageQueue, QueueError, VIEWER_SUMMARY_IN};
use crate::report::FleetSummary;
use crate::watchdog::Watchdog;

use super::ControlLoop;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Viewer {
    queue: MessageQueue,
    watchdog: Arc<dyn Watchdog>,
    poll_interval: Duration,
    latest: Option<FleetSummary>,
}

impl Viewer {
    pub fn new(queue: MessageQueue, watchdog: Arc<dyn Watchdog>) -> Self {
        Self {
            queue,
            watchdog,
            poll_interval: DEFAULT_POLL_INTERVAL,
            latest: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn latest(&self) -> Option<&FleetSummary> {
        self.latest.as_ref()
    }

    /// Drain `viewer_summary.i`, keeping the newest summary by `generated`.
    /// Returns whether the held summary changed.
    pub async fn poll(&mut self) -> Result<bool, QueueError> {
        let drained = self.queue.drain::<FleetSummary>(VIEWER_SUMMARY_IN).await?;
        if let Some(e) = &drained.interrupted {
            log::debug!("Summary drain cut short: {}", e);
        }

        let mut changed = false;
        for summary in drained.bodies() {
            let newer = self
                .latest
                .as_ref()
                .map_or(true, |held| summary.generated > held.generated);
            if newer {
                log::info!(
                    "Fleet summary from {} ({} tanks)",
                    summary.generated,
                    summary.tanks.len()
                );
                self.latest = Some(summary);
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl ControlLoop for Viewer {
    async fn step(&mut self) -> usize {
        self.watchdog.kick();
        match self.poll().await {
            Ok(changed) => usize::from(changed),
            Err(e) => {
                log::debug!("Summary poll failed: {}", e);
                0
            }
        }
    }

    fn next_delay(&self, max: Duration) -> Duration {
        self.poll_interval.min(max)
    }

    async fn stop(&mut self) {
        log::info!("Viewer stopped");
    }
}
