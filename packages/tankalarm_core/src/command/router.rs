//! CommandRouter: device-side demultiplexing of commands by type

use std::collections::HashMap;

use crate::identity::DeviceId;
use crate::queue::{MessageQueue, QueueError, CONFIG_ACK_OUT, CONFIG_IN};
use crate::time::Epoch;

use super::{AckRecord, AckStatus, Command, CommandError, CommandKind, CommandType};

/// Applies one decoded command to the device context. The returned string
/// goes into the ack's `detail`.
pub type CommandHandler<C> = fn(&mut C, &CommandKind, Epoch) -> Result<Option<String>, CommandError>;

/// Counts from one drain of `config.i`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub applied: usize,
    pub rejected: usize,
    /// Not addressed to this device, or of a type it does not handle.
    pub ignored: usize,
    /// Acks the relay would not take.
    pub unacked: usize,
}

/// Handler table keyed by command type, bound to one device identity.
pub struct CommandRouter<C> {
    device: DeviceId,
    handlers: HashMap<CommandType, CommandHandler<C>>,
}

impl<C> CommandRouter<C> {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, ty: CommandType, handler: CommandHandler<C>) -> &mut Self {
        self.handlers.insert(ty, handler);
        self
    }

    pub fn handles(&self, ty: CommandType) -> bool {
        self.handlers.contains_key(&ty)
    }

    /// Apply one command. `None` means it was dropped without an ack.
    pub fn apply(&self, ctx: &mut C, command: &Command, now: Epoch) -> Option<AckRecord> {
        if command.target != self.device {
            log::debug!("Ignoring command {} for {}", command.id, command.target);
            return None;
        }
        let Some(handler) = command.known_type().and_then(|ty| self.handlers.get(&ty)) else {
            log::debug!("Ignoring command {} of unhandled type {}", command.id, command.command_type);
            return None;
        };

        let result = command
            .kind()
            .and_then(|kind| kind.ok_or_else(|| CommandError::Rejected("unknown type".to_string())))
            .and_then(|kind| handler(ctx, &kind, now));

        let (status, detail) = match result {
            Ok(detail) => {
                log::info!("Applied {} command {}", command.command_type, command.id);
                (AckStatus::Applied, detail)
            }
            Err(e) => {
                log::warn!("Rejected {} command {}: {}", command.command_type, command.id, e);
                (AckStatus::Rejected, Some(e.to_string()))
            }
        };

        Some(AckRecord {
            command_id: command.id,
            target: self.device.clone(),
            command_type: command.command_type.clone(),
            applied: now,
            status,
            detail,
        })
    }

    /// Drain `config.i`, apply each command and acknowledge it on
    /// `config_ack.o`. A lost ack is left to the coordinator's re-send.
    pub async fn process(
        &self,
        ctx: &mut C,
        queue: &MessageQueue,
        now: Epoch,
    ) -> Result<ProcessSummary, QueueError> {
        let drained = queue.drain::<Command>(CONFIG_IN).await?;
        let mut summary = ProcessSummary {
            ignored: drained.rejected,
            ..ProcessSummary::default()
        };

        for message in drained.messages {
            let Some(ack) = self.apply(ctx, &message.body, now) else {
                summary.ignored += 1;
                continue;
            };
            match ack.status {
                AckStatus::Applied => summary.applied += 1,
                AckStatus::Rejected => summary.rejected += 1,
            }
            if let Err(e) = queue.enqueue(CONFIG_ACK_OUT, &ack).await {
                log::warn!("Could not acknowledge command {}: {}", ack.command_id, e);
                summary.unacked += 1;
            }
        }
        Ok(summary)
    }
}
