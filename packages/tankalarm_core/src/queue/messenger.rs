//! MessageQueue: typed enqueue and drain over the relay
//!
//! Enqueue is fire-and-forget: once the relay accepts a note, redelivery
//! and ordering are the relay's problem. Drain pops every available note,
//! deleting each on the relay as it goes, so a crash between the delete and
//! the local apply can replay a message. Handlers must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::relay::{bounded, Relay, RelayError, DEFAULT_RELAY_TIMEOUT};
use crate::time::Epoch;

use super::{Direction, QueueError, QueueName};

/// Upper bound on notes taken by one drain, so a busy queue cannot starve
/// the rest of the control loop.
pub const DEFAULT_DRAIN_LIMIT: usize = 128;

/// A decoded note.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    pub queue: QueueName,
    pub body: T,
    /// When the relay accepted the note.
    pub enqueued: Epoch,
}

impl<T> Message<T> {
    pub fn direction(&self) -> Direction {
        self.queue.direction()
    }
}

/// Result of a drain.
#[derive(Debug)]
pub struct Drained<T> {
    pub messages: Vec<Message<T>>,
    /// Notes consumed but dropped because they failed to decode.
    pub rejected: usize,
    /// Relay failure that cut the drain short, after some notes were consumed.
    pub interrupted: Option<RelayError>,
}

impl<T> Drained<T> {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn bodies(self) -> impl Iterator<Item = T> {
        self.messages.into_iter().map(|m| m.body)
    }
}

/// Typed access to the relay's queues.
#[derive(Clone)]
pub struct MessageQueue {
    relay: Arc<dyn Relay>,
    timeout: Duration,
    drain_limit: usize,
}

impl MessageQueue {
    pub fn new(relay: Arc<dyn Relay>) -> Self {
        Self {
            relay,
            timeout: DEFAULT_RELAY_TIMEOUT,
            drain_limit: DEFAULT_DRAIN_LIMIT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_drain_limit(mut self, limit: usize) -> Self {
        self.drain_limit = limit.max(1);
        self
    }

    pub fn relay(&self) -> Arc<dyn Relay> {
        Arc::clone(&self.relay)
    }

    /// Append `body` to an outbound queue. No retry on failure.
    pub async fn enqueue<T: Serialize>(&self, queue: QueueName, body: &T) -> Result<(), QueueError> {
        if !queue.is_outbound() {
            return Err(QueueError::NotOutbound(queue));
        }
        let value = serde_json::to_value(body)
            .map_err(|e| QueueError::SerializationError(e.to_string()))?;
        bounded(self.timeout, self.relay.add_note(&queue, value)).await?;
        Ok(())
    }

    /// Pop and decode every available note on an inbound queue.
    ///
    /// Undecodable notes are logged and dropped. A relay failure before
    /// anything was consumed is returned as an error; after that, the drain
    /// stops and reports the failure alongside what it already consumed.
    pub async fn drain<T: DeserializeOwned>(&self, queue: QueueName) -> Result<Drained<T>, QueueError> {
        if queue.is_outbound() {
            return Err(QueueError::NotInbound(queue));
        }

        let mut drained = Drained {
            messages: Vec::new(),
            rejected: 0,
            interrupted: None,
        };

        while drained.messages.len() + drained.rejected < self.drain_limit {
            let note = match bounded(self.timeout, self.relay.take_note(&queue)).await {
                Ok(Some(note)) => note,
                Ok(None) => break,
                Err(e) if drained.messages.is_empty() && drained.rejected == 0 => {
                    return Err(e.into());
                }
                Err(e) => {
                    log::warn!("Drain of {} interrupted: {}", queue, e);
                    drained.interrupted = Some(e);
                    break;
                }
            };

            match serde_json::from_value::<T>(note.body) {
                Ok(body) => drained.messages.push(Message {
                    queue,
                    body,
                    enqueued: note.epoch,
                }),
                Err(e) => {
                    log::warn!("Dropping malformed note on {}: {}", queue, e);
                    drained.rejected += 1;
                }
            }
        }

        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceId;
    use crate::queue::{ALARM_IN, TELEMETRY_IN, TELEMETRY_OUT};
    use crate::relay::simulated::{EndpointRole, SimRelayNetwork};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        tank: u8,
        level: f64,
    }

    fn make_pair(network: &Arc<SimRelayNetwork>) -> (MessageQueue, MessageQueue) {
        let device = network.attach(DeviceId::new("dev:1"), EndpointRole::Device);
        let server = network.attach(DeviceId::new("dev:server"), EndpointRole::Coordinator);
        (
            MessageQueue::new(Arc::new(device)),
            MessageQueue::new(Arc::new(server)),
        )
    }

    #[tokio::test]
    async fn test_enqueue_then_drain() {
        let network = SimRelayNetwork::new();
        network.set_time(Epoch(1_700_000_000));
        let (device, server) = make_pair(&network);

        device
            .enqueue(TELEMETRY_OUT, &Reading { tank: 1, level: 42.5 })
            .await
            .unwrap();
        network.sync();

        let drained = server.drain::<Reading>(TELEMETRY_IN).await.unwrap();
        assert_eq!(drained.len(), 1);
        let message = &drained.messages[0];
        assert_eq!(message.body, Reading { tank: 1, level: 42.5 });
        assert_eq!(message.enqueued, Epoch(1_700_000_000));
        assert_eq!(message.direction(), Direction::Inbound);

        // Consumed at most once.
        assert!(server.drain::<Reading>(TELEMETRY_IN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_direction_is_enforced() {
        let network = SimRelayNetwork::new();
        let (device, _server) = make_pair(&network);
        assert!(matches!(
            device.enqueue(TELEMETRY_IN, &json!({})).await,
            Err(QueueError::NotOutbound(_))
        ));
        assert!(matches!(
            device.drain::<Reading>(TELEMETRY_OUT).await,
            Err(QueueError::NotInbound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_notes_are_dropped() {
        let network = SimRelayNetwork::new();
        let (_device, server) = make_pair(&network);
        let server_id = DeviceId::new("dev:server");
        network.inject(&server_id, ALARM_IN, json!({"tank": 1, "level": 3.0}));
        network.inject(&server_id, ALARM_IN, json!({"tank": "one"}));
        network.inject(&server_id, ALARM_IN, json!({"tank": 2, "level": 4.0}));

        let drained = server.drain::<Reading>(ALARM_IN).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained.rejected, 1);
        assert_eq!(network.inbound_len(&server_id, ALARM_IN), 0);
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_enqueue_without_retry() {
        let network = SimRelayNetwork::new();
        let (device, server) = make_pair(&network);
        network.set_online(false);

        let result = device.enqueue(TELEMETRY_OUT, &Reading { tank: 1, level: 1.0 }).await;
        assert!(matches!(result, Err(QueueError::Relay(RelayError::Unreachable(_)))));
        assert!(server.drain::<Reading>(TELEMETRY_IN).await.is_err());

        network.set_online(true);
        network.sync();
        assert!(server.drain::<Reading>(TELEMETRY_IN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_limit() {
        let network = SimRelayNetwork::new();
        let (_device, server) = make_pair(&network);
        let server = server.with_drain_limit(2);
        let server_id = DeviceId::new("dev:server");
        for tank in 0..3 {
            network.inject(&server_id, TELEMETRY_IN, json!({"tank": tank, "level": 1.0}));
        }
        assert_eq!(server.drain::<Reading>(TELEMETRY_IN).await.unwrap().len(), 2);
        assert_eq!(server.drain::<Reading>(TELEMETRY_IN).await.unwrap().len(), 1);
    }
}
