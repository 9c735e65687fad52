//! In-process relay simulator
//!
//! Provides a simulated relay service where a coordinator, field devices and
//! viewers exchange notes entirely in-process. Outbound notes sit in the
//! sender's outbox until [`SimRelayNetwork::sync`] runs the operator routing
//! table, which is how tests model "deliver when possible".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::identity::DeviceId;
use crate::queue::{
    QueueName, ALARM_IN, ALARM_OUT, COMMAND_OUT, CONFIG_ACK_IN, CONFIG_ACK_OUT, CONFIG_IN,
    DAILY_IN, DAILY_OUT, TELEMETRY_IN, TELEMETRY_OUT, VIEWER_SUMMARY_IN, VIEWER_SUMMARY_OUT,
};
use crate::time::Epoch;

use super::{Relay, RelayError, RelayNote};

/// What an endpoint is in the fleet; routes address roles, not devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    Coordinator,
    Device,
    Viewer,
}

/// One operator-configured route: notes written to `from` by any endpoint
/// are delivered to `to` on every endpoint with role `audience`.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub from: QueueName,
    pub to: QueueName,
    pub audience: EndpointRole,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, from: QueueName, to: QueueName, audience: EndpointRole) -> Self {
        self.routes.push(Route { from, to, audience });
        self
    }

    /// The fleet's standard routes.
    pub fn standard() -> Self {
        Self::new()
            .route(TELEMETRY_OUT, TELEMETRY_IN, EndpointRole::Coordinator)
            .route(ALARM_OUT, ALARM_IN, EndpointRole::Coordinator)
            .route(DAILY_OUT, DAILY_IN, EndpointRole::Coordinator)
            .route(COMMAND_OUT, CONFIG_IN, EndpointRole::Device)
            .route(CONFIG_ACK_OUT, CONFIG_ACK_IN, EndpointRole::Coordinator)
            .route(VIEWER_SUMMARY_OUT, VIEWER_SUMMARY_IN, EndpointRole::Viewer)
    }

    fn routes_from<'a>(&'a self, from: &'a QueueName) -> impl Iterator<Item = &'a Route> + 'a {
        self.routes.iter().filter(move |r| &r.from == from)
    }
}

#[derive(Debug)]
struct Endpoint {
    role: EndpointRole,
    outbox: VecDeque<(QueueName, RelayNote)>,
    inboxes: HashMap<QueueName, VecDeque<RelayNote>>,
}

/// The simulated relay service shared by all endpoints.
pub struct SimRelayNetwork {
    routing: RoutingTable,
    clock: AtomicI64,
    online: AtomicBool,
    reverse_delivery: AtomicBool,
    endpoints: Mutex<HashMap<DeviceId, Endpoint>>,
}

impl SimRelayNetwork {
    /// Create a network with the standard routing table.
    pub fn new() -> Arc<Self> {
        Self::with_routing(RoutingTable::standard())
    }

    pub fn with_routing(routing: RoutingTable) -> Arc<Self> {
        Arc::new(Self {
            routing,
            clock: AtomicI64::new(0),
            online: AtomicBool::new(true),
            reverse_delivery: AtomicBool::new(false),
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Register an endpoint and return its relay handle.
    pub fn attach(self: &Arc<Self>, id: DeviceId, role: EndpointRole) -> SimRelay {
        self.lock().entry(id.clone()).or_insert_with(|| Endpoint {
            role,
            outbox: VecDeque::new(),
            inboxes: HashMap::new(),
        });
        SimRelay {
            id,
            network: Arc::clone(self),
        }
    }

    /// Set the network time. Zero means the relay has no time yet.
    pub fn set_time(&self, epoch: Epoch) {
        self.clock.store(epoch.0, Ordering::SeqCst);
    }

    pub fn advance_time(&self, secs: i64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn time(&self) -> Epoch {
        Epoch(self.clock.load(Ordering::SeqCst))
    }

    /// Take the network down or bring it back. While offline every
    /// request fails with [`RelayError::Unreachable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Deliver each sync batch newest-first, to exercise out-of-order handling.
    pub fn set_reverse_delivery(&self, reverse: bool) {
        self.reverse_delivery.store(reverse, Ordering::SeqCst);
    }

    /// Route every pending outbound note. Returns the number of inbound
    /// notes created.
    pub fn sync(&self) -> usize {
        let mut endpoints = self.lock();

        let mut pending: Vec<(DeviceId, QueueName, RelayNote)> = Vec::new();
        for (id, endpoint) in endpoints.iter_mut() {
            pending.extend(endpoint.outbox.drain(..).map(|(q, n)| (id.clone(), q, n)));
        }
        pending.sort_by_key(|(_, _, note)| note.epoch);
        if self.reverse_delivery.load(Ordering::SeqCst) {
            pending.reverse();
        }

        let mut delivered = 0;
        for (sender, queue, note) in pending {
            let mut routed = false;
            for route in self.routing.routes_from(&queue) {
                routed = true;
                for (id, endpoint) in endpoints.iter_mut() {
                    if *id == sender || endpoint.role != route.audience {
                        continue;
                    }
                    endpoint
                        .inboxes
                        .entry(route.to)
                        .or_default()
                        .push_back(note.clone());
                    delivered += 1;
                }
            }
            if !routed {
                log::warn!("No route for {} from {}, dropping note", queue, sender);
            }
        }
        delivered
    }

    /// Place a raw note directly into an endpoint's inbound queue.
    pub fn inject(&self, id: &DeviceId, queue: QueueName, body: serde_json::Value) {
        let epoch = self.time();
        if let Some(endpoint) = self.lock().get_mut(id) {
            endpoint
                .inboxes
                .entry(queue)
                .or_default()
                .push_back(RelayNote { body, epoch });
        }
    }

    /// Notes written by `id` and not yet routed.
    pub fn pending_outbound(&self, id: &DeviceId, queue: QueueName) -> Vec<serde_json::Value> {
        self.lock()
            .get(id)
            .map(|e| {
                e.outbox
                    .iter()
                    .filter(|(q, _)| *q == queue)
                    .map(|(_, n)| n.body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Notes waiting on one of `id`'s inbound queues.
    pub fn inbound_len(&self, id: &DeviceId, queue: QueueName) -> usize {
        self.lock()
            .get(id)
            .and_then(|e| e.inboxes.get(&queue))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, Endpoint>> {
        match self.endpoints.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_online(&self) -> Result<(), RelayError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unreachable("no cellular signal".to_string()))
        }
    }
}

/// One endpoint's handle on a [`SimRelayNetwork`].
#[derive(Clone)]
pub struct SimRelay {
    id: DeviceId,
    network: Arc<SimRelayNetwork>,
}

impl SimRelay {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }
}

#[async_trait]
impl Relay for SimRelay {
    async fn add_note(&self, queue: &QueueName, body: serde_json::Value) -> Result<(), RelayError> {
        self.network.check_online()?;
        if !queue.is_outbound() {
            return Err(RelayError::Rejected(format!("{} is not writable", queue)));
        }
        let epoch = self.network.time();
        let mut endpoints = self.network.lock();
        let endpoint = endpoints
            .get_mut(&self.id)
            .ok_or_else(|| RelayError::Rejected(format!("unknown endpoint {}", self.id)))?;
        endpoint.outbox.push_back((*queue, RelayNote { body, epoch }));
        Ok(())
    }

    async fn take_note(&self, queue: &QueueName) -> Result<Option<RelayNote>, RelayError> {
        self.network.check_online()?;
        let mut endpoints = self.network.lock();
        Ok(endpoints
            .get_mut(&self.id)
            .and_then(|e| e.inboxes.get_mut(queue))
            .and_then(|q| q.pop_front()))
    }

    async fn time(&self) -> Result<Epoch, RelayError> {
        self.network.check_online()?;
        let now = self.network.time();
        if now.is_known() {
            Ok(now)
        } else {
            Err(RelayError::Rejected("time is not yet set".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_fleet() -> (Arc<SimRelayNetwork>, SimRelay, SimRelay, SimRelay) {
        let network = SimRelayNetwork::new();
        network.set_time(Epoch(1_700_000_000));
        let server = network.attach(DeviceId::new("dev:server"), EndpointRole::Coordinator);
        let a = network.attach(DeviceId::new("dev:a"), EndpointRole::Device);
        let b = network.attach(DeviceId::new("dev:b"), EndpointRole::Device);
        (network, server, a, b)
    }

    #[tokio::test]
    async fn test_notes_wait_for_sync() {
        let (network, server, a, _b) = make_fleet();
        a.add_note(&TELEMETRY_OUT, json!({"tank": 1})).await.unwrap();

        assert!(server.take_note(&TELEMETRY_IN).await.unwrap().is_none());
        assert_eq!(network.pending_outbound(a.id(), TELEMETRY_OUT).len(), 1);

        assert_eq!(network.sync(), 1);
        let note = server.take_note(&TELEMETRY_IN).await.unwrap().unwrap();
        assert_eq!(note.body, json!({"tank": 1}));
        assert_eq!(note.epoch, Epoch(1_700_000_000));
        assert!(server.take_note(&TELEMETRY_IN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commands_fan_out_to_all_devices() {
        let (network, server, a, b) = make_fleet();
        server.add_note(&COMMAND_OUT, json!({"target": "dev:a"})).await.unwrap();
        assert_eq!(network.sync(), 2);

        assert!(a.take_note(&CONFIG_IN).await.unwrap().is_some());
        assert!(b.take_note(&CONFIG_IN).await.unwrap().is_some());
        assert_eq!(network.inbound_len(server.id(), CONFIG_IN), 0);
    }

    #[tokio::test]
    async fn test_offline_requests_fail() {
        let (network, _server, a, _b) = make_fleet();
        network.set_online(false);
        assert!(matches!(
            a.add_note(&TELEMETRY_OUT, json!({})).await,
            Err(RelayError::Unreachable(_))
        ));
        assert!(a.time().await.is_err());
        network.set_online(true);
        assert_eq!(a.time().await.unwrap(), Epoch(1_700_000_000));
    }

    #[tokio::test]
    async fn test_inbound_queues_are_not_writable() {
        let (_network, _server, a, _b) = make_fleet();
        assert!(matches!(
            a.add_note(&CONFIG_IN, json!({})).await,
            Err(RelayError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_reverse_delivery() {
        let (network, server, a, _b) = make_fleet();
        a.add_note(&TELEMETRY_OUT, json!({"n": 1})).await.unwrap();
        network.advance_time(60);
        a.add_note(&TELEMETRY_OUT, json!({"n": 2})).await.unwrap();
        network.set_reverse_delivery(true);
        network.sync();

        let first = server.take_note(&TELEMETRY_IN).await.unwrap().unwrap();
        assert_eq!(first.body, json!({"n": 2}));
    }
}
