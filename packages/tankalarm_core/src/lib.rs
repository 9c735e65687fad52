// TankAlarm - fleet sync core for relay-connected tank monitors

pub mod api;
pub mod command;
pub mod config;
pub mod fleet;
pub mod identity;
pub mod queue;
pub mod recovery;
pub mod relay;
pub mod report;
pub mod storage;
pub mod time;
pub mod watchdog;

pub use config::{DeviceConfig, NodeSettings};
pub use fleet::{Coordinator, Device, Viewer};
pub use identity::DeviceId;
pub use queue::MessageQueue;
pub use storage::AtomicStore;
pub use time::Epoch;
