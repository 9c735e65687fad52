//! Relay abstraction for the cellular message service
//!
//! The relay is an opaque, eventually-delivering channel: it accepts notes
//! on a device's outbound queues, hands out notes from its inbound queues
//! and reports the network time. Ordering and freshness are not guaranteed.

pub mod notecard;
pub mod simulated;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueName;
use crate::time::Epoch;

/// Upper bound on a single relay round-trip.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay unreachable: {0}")]
    Unreachable(String),

    #[error("Relay request timed out")]
    Timeout,

    #[error("Relay rejected request: {0}")]
    Rejected(String),

    #[error("Malformed relay response: {0}")]
    Malformed(String),
}

/// A note as held by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNote {
    pub body: serde_json::Value,
    /// Time the relay accepted the note.
    pub epoch: Epoch,
}

/// One device's connection to the relay.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Hand a note to the relay on an outbound queue. Once this returns
    /// `Ok`, delivery is the relay's responsibility.
    async fn add_note(&self, queue: &QueueName, body: serde_json::Value) -> Result<(), RelayError>;

    /// Pop the oldest available note on an inbound queue, deleting it on
    /// the relay. `Ok(None)` means the queue is empty.
    async fn take_note(&self, queue: &QueueName) -> Result<Option<RelayNote>, RelayError>;

    /// Current network time.
    async fn time(&self) -> Result<Epoch, RelayError>;
}

/// Run a relay call with a timeout.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout),
    }
}
