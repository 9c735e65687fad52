//! Control loops for the three kinds of node
//!
//! Each node is a single struct driven by one cooperative loop: run the due
//! tasks, then sleep until the next one is due or something wakes the loop.

pub mod coordinator;
pub mod device;
pub mod records;
pub mod viewer;

pub use coordinator::{Coordinator, CoordinatorError, CoordinatorTask, DrainSummary};
pub use device::{Device, DeviceError, DeviceEvent, DeviceState, DeviceTask, TankAlarm, TankSensor, TankState};
pub use records::{FleetRecords, DEFAULT_MAX_RECORDS};
pub use viewer::Viewer;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

/// Longest the loop sleeps without re-checking, so clock syncs and the
/// watchdog kick keep happening while nothing is scheduled.
pub const MAX_IDLE: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ControlLoop: Send {
    /// Run whatever is due. Returns the number of tasks run.
    async fn step(&mut self) -> usize;

    /// Time until the next due task, capped at `max`.
    fn next_delay(&self, max: Duration) -> Duration;

    /// Flush state and record a clean shutdown.
    async fn stop(&mut self);
}

/// Drive `node` until `shutdown` resolves. `wake` cuts a sleep short.
pub async fn run_loop<L, F>(node: &mut L, wake: Arc<Notify>, shutdown: F)
where
    L: ControlLoop,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        node.step().await;
        let delay = node.next_delay(MAX_IDLE);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {
                log::debug!("Control loop woken early");
            }
            _ = &mut shutdown => {
                log::info!("Shutdown requested");
                break;
            }
        }
    }
    node.stop().await;
}
