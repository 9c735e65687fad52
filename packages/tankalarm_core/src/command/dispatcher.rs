//! CommandDispatcher: coordinator-side send, retry and acknowledgment

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::DeviceId;
use crate::queue::{MessageQueue, COMMAND_OUT};
use crate::storage::{files, AtomicStore, StoreError};
use crate::time::Epoch;

use super::{AckRecord, AckStatus, Command, CommandError, CommandKind, CommandType};

pub const DEFAULT_RETRY_SECS: i64 = 60 * 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A command sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub command: Command,
    pub first_sent: Epoch,
    pub last_sent: Epoch,
    pub attempts: u32,
    /// Digest of a pushed config, echoed back in the ack.
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendSummary {
    pub resent: usize,
    /// Dropped after the last attempt.
    pub abandoned: usize,
    /// Re-sends the relay refused; left for the next pass.
    pub failed: usize,
}

pub struct CommandDispatcher {
    queue: MessageQueue,
    store: AtomicStore,
    pending: Vec<PendingCommand>,
    retry_secs: i64,
    max_attempts: u32,
}

impl CommandDispatcher {
    pub fn new(queue: MessageQueue, store: AtomicStore) -> Self {
        Self {
            queue,
            store,
            pending: Vec::new(),
            retry_secs: DEFAULT_RETRY_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_retry(mut self, retry_secs: i64, max_attempts: u32) -> Self {
        self.retry_secs = retry_secs;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Load the persisted pending table, skipping entries that fail to decode.
    pub fn load(&mut self) -> Result<usize, StoreError> {
        let Some(raw) = self
            .store
            .load_json::<Vec<serde_json::Value>>(files::PENDING_COMMANDS)?
        else {
            return Ok(0);
        };
        self.pending = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<PendingCommand>(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("Skipping pending command entry: {}", e);
                    None
                }
            })
            .collect();
        log::info!("Loaded {} pending commands", self.pending.len());
        Ok(self.pending.len())
    }

    /// Wrap `kind` for `target` and enqueue it on `command.o`.
    ///
    /// Nothing is recorded if the enqueue fails. A config push replaces any
    /// older unacknowledged config push to the same target.
    pub async fn send_command(
        &mut self,
        target: DeviceId,
        kind: CommandKind,
        now: Epoch,
    ) -> Result<Uuid, CommandError> {
        let digest = match &kind {
            CommandKind::ConfigPush(config) => {
                config.validate().map_err(|e| CommandError::Rejected(e.to_string()))?;
                Some(config.digest().map_err(|e| CommandError::SerializationError(e.to_string()))?)
            }
            _ => None,
        };
        let command = Command::new(target, &kind, now)?;
        self.queue.enqueue(COMMAND_OUT, &command).await?;
        log::info!(
            "Sent {} command {} to {}",
            command.command_type,
            command.id,
            command.target
        );

        if kind.command_type() == CommandType::ConfigPush {
            let before = self.pending.len();
            self.pending.retain(|p| {
                !(p.command.target == command.target
                    && p.command.known_type() == Some(CommandType::ConfigPush))
            });
            if self.pending.len() < before {
                log::info!("Superseded {} pending config pushes to {}", before - self.pending.len(), command.target);
            }
        }

        let id = command.id;
        self.pending.push(PendingCommand {
            command,
            first_sent: now,
            last_sent: now,
            attempts: 1,
            digest,
        });
        self.persist();
        Ok(id)
    }

    /// Settle the pending command an ack refers to. Returns it, or `None`
    /// for a duplicate or unknown ack.
    pub fn acknowledge(&mut self, ack: &AckRecord) -> Option<PendingCommand> {
        let index = self
            .pending
            .iter()
            .position(|p| p.command.id == ack.command_id && p.command.target == ack.target)?;
        let entry = self.pending.remove(index);

        match ack.status {
            AckStatus::Applied => {
                if entry.digest.is_some() && entry.digest != ack.detail {
                    log::warn!(
                        "Config digest mismatch from {} for command {}",
                        ack.target,
                        ack.command_id
                    );
                }
                log::info!("{} acknowledged command {}", ack.target, ack.command_id);
            }
            AckStatus::Rejected => log::warn!(
                "{} rejected command {}: {}",
                ack.target,
                ack.command_id,
                ack.detail.as_deref().unwrap_or("no reason given")
            ),
        }
        self.persist();
        Some(entry)
    }

    /// Re-enqueue commands unacknowledged for longer than the retry
    /// interval, under the same id. Stops at the first relay failure.
    pub async fn resend_due(&mut self, now: Epoch) -> ResendSummary {
        let mut summary = ResendSummary::default();
        if !now.is_known() {
            return summary;
        }

        let mut keep = Vec::with_capacity(self.pending.len());
        let mut relay_down = false;
        for mut entry in std::mem::take(&mut self.pending) {
            let due = now.secs_since(entry.last_sent) >= self.retry_secs;
            if relay_down || !due {
                keep.push(entry);
                continue;
            }
            if entry.attempts >= self.max_attempts {
                log::warn!(
                    "Giving up on {} command {} to {} after {} attempts",
                    entry.command.command_type,
                    entry.command.id,
                    entry.command.target,
                    entry.attempts
                );
                summary.abandoned += 1;
                continue;
            }
            match self.queue.enqueue(COMMAND_OUT, &entry.command).await {
                Ok(()) => {
                    entry.attempts += 1;
                    entry.last_sent = now;
                    summary.resent += 1;
                }
                Err(e) => {
                    log::debug!("Re-send of {} failed: {}", entry.command.id, e);
                    summary.failed += 1;
                    relay_down = true;
                }
            }
            keep.push(entry);
        }
        self.pending = keep;

        if summary.resent > 0 || summary.abandoned > 0 {
            self.persist();
        }
        summary
    }

    pub fn pending(&self) -> &[PendingCommand] {
        &self.pending
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.pending.iter().any(|p| &p.command.id == id)
    }

    fn persist(&self) {
        if let Err(e) = self.store.write_json(files::PENDING_COMMANDS, &self.pending) {
            log::warn!("Could not persist pending commands: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{RelaySet, RelayState};
    use crate::config::DeviceConfig;
    use crate::queue::CONFIG_IN;
    use crate::relay::simulated::{EndpointRole, SimRelayNetwork};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const NOW: Epoch = Epoch(1_700_000_000);

    struct Fixture {
        _dir: TempDir,
        network: Arc<SimRelayNetwork>,
        store: AtomicStore,
        dispatcher: CommandDispatcher,
        device: MessageQueue,
    }

    fn make_fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = AtomicStore::open(dir.path()).unwrap();
        let network = SimRelayNetwork::new();
        network.set_time(NOW);
        let server = MessageQueue::new(Arc::new(
            network.attach(DeviceId::new("dev:server"), EndpointRole::Coordinator),
        ));
        let device = MessageQueue::new(Arc::new(
            network.attach(DeviceId::new("dev:1"), EndpointRole::Device),
        ));
        Fixture {
            _dir: dir,
            network,
            dispatcher: CommandDispatcher::new(server, store.clone()),
            store,
            device,
        }
    }

    fn relay_on() -> CommandKind {
        CommandKind::RelaySet(RelaySet {
            output: 1,
            state: RelayState::On,
        })
    }

    fn ack_for(id: Uuid, status: AckStatus, detail: Option<String>) -> AckRecord {
        AckRecord {
            command_id: id,
            target: DeviceId::new("dev:1"),
            command_type: "relay_set".to_string(),
            applied: NOW,
            status,
            detail,
        }
    }

    #[tokio::test]
    async fn test_send_and_acknowledge() {
        let mut fx = make_fixture();
        let id = fx
            .dispatcher
            .send_command(DeviceId::new("dev:1"), relay_on(), NOW)
            .await
            .unwrap();
        assert!(fx.dispatcher.is_pending(&id));

        fx.network.sync();
        let delivered = fx.device.drain::<Command>(CONFIG_IN).await.unwrap();
        assert_eq!(delivered.messages[0].body.id, id);

        let settled = fx.dispatcher.acknowledge(&ack_for(id, AckStatus::Applied, None));
        assert!(settled.is_some());
        assert!(fx.dispatcher.pending().is_empty());
        // Duplicate ack is harmless.
        assert!(fx.dispatcher.acknowledge(&ack_for(id, AckStatus::Applied, None)).is_none());
    }

    #[tokio::test]
    async fn test_failed_enqueue_records_nothing() {
        let mut fx = make_fixture();
        fx.network.set_online(false);
        let result = fx
            .dispatcher
            .send_command(DeviceId::new("dev:1"), relay_on(), NOW)
            .await;
        assert!(matches!(result, Err(CommandError::Queue(_))));
        assert!(fx.dispatcher.pending().is_empty());
    }

    #[tokio::test]
    async fn test_resend_keeps_id_and_gives_up() {
        let mut fx = make_fixture();
        fx.dispatcher = CommandDispatcher::new(fx.dispatcher.queue.clone(), fx.store.clone())
            .with_retry(3_600, 3);
        let id = fx
            .dispatcher
            .send_command(DeviceId::new("dev:1"), relay_on(), NOW)
            .await
            .unwrap();

        assert_eq!(fx.dispatcher.resend_due(NOW.plus_secs(60)).await.resent, 0);
        assert_eq!(fx.dispatcher.resend_due(NOW.plus_secs(3_600)).await.resent, 1);
        assert_eq!(fx.dispatcher.resend_due(NOW.plus_secs(7_200)).await.resent, 1);
        assert_eq!(fx.dispatcher.pending()[0].attempts, 3);

        fx.network.sync();
        let delivered = fx.device.drain::<Command>(CONFIG_IN).await.unwrap();
        assert_eq!(delivered.len(), 3);
        assert!(delivered.messages.iter().all(|m| m.body.id == id));

        let summary = fx.dispatcher.resend_due(NOW.plus_secs(10_800)).await;
        assert_eq!(summary.abandoned, 1);
        assert!(fx.dispatcher.pending().is_empty());
    }

    #[tokio::test]
    async fn test_config_push_supersedes_older_push() {
        let mut fx = make_fixture();
        let first = DeviceConfig {
            updated: NOW,
            ..DeviceConfig::default()
        };
        let second = DeviceConfig {
            updated: NOW.plus_secs(10),
            level_change_threshold: 1.5,
            ..DeviceConfig::default()
        };
        let old = fx
            .dispatcher
            .send_command(DeviceId::new("dev:1"), CommandKind::ConfigPush(first), NOW)
            .await
            .unwrap();
        fx.dispatcher
            .send_command(DeviceId::new("dev:1"), relay_on(), NOW)
            .await
            .unwrap();
        let new = fx
            .dispatcher
            .send_command(DeviceId::new("dev:1"), CommandKind::ConfigPush(second.clone()), NOW)
            .await
            .unwrap();

        assert!(!fx.dispatcher.is_pending(&old));
        assert!(fx.dispatcher.is_pending(&new));
        assert_eq!(fx.dispatcher.pending().len(), 2);
        let entry = fx.dispatcher.pending().iter().find(|p| p.command.id == new).unwrap();
        assert_eq!(entry.digest, Some(second.digest().unwrap()));
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_sent() {
        let mut fx = make_fixture();
        let bad = DeviceConfig {
            report_hour: 25,
            ..DeviceConfig::default()
        };
        let result = fx
            .dispatcher
            .send_command(DeviceId::new("dev:1"), CommandKind::ConfigPush(bad), NOW)
            .await;
        assert!(matches!(result, Err(CommandError::Rejected(_))));
        assert!(fx.network.pending_outbound(&DeviceId::new("dev:server"), COMMAND_OUT).is_empty());
    }

    #[tokio::test]
    async fn test_pending_table_survives_restart() {
        let mut fx = make_fixture();
        let id = fx
            .dispatcher
            .send_command(DeviceId::new("dev:1"), relay_on(), NOW)
            .await
            .unwrap();

        let mut restarted = CommandDispatcher::new(fx.dispatcher.queue.clone(), fx.store.clone());
        assert_eq!(restarted.load().unwrap(), 1);
        assert!(restarted.is_pending(&id));
        assert!(restarted
            .acknowledge(&ack_for(id, AckStatus::Rejected, Some("busy".to_string())))
            .is_some());

        let mut again = CommandDispatcher::new(fx.dispatcher.queue.clone(), fx.store.clone());
        assert_eq!(again.load().unwrap(), 0);
    }
}
