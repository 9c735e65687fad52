//! Coordinator-to-device commands and their acknowledgments
//!
//! Every command travels on the single `command.o` queue and arrives on
//! each device's `config.i`. Devices act only on commands addressed to
//! them and answer on `config_ack.o`. Command ids are UUID v4 and survive
//! re-sends, so an ack for any attempt settles the command.

pub mod dispatcher;
pub mod router;

pub use dispatcher::{CommandDispatcher, PendingCommand, ResendSummary};
pub use router::{CommandHandler, CommandRouter, ProcessSummary};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::identity::DeviceId;
use crate::queue::QueueError;
use crate::storage::StoreError;
use crate::time::Epoch;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Invalid payload for {0}: {1}")]
    InvalidPayload(CommandType, String),

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    ConfigPush,
    RelaySet,
    LogPull,
    LocationRequest,
}

impl CommandType {
    pub const ALL: [CommandType; 4] = [
        CommandType::ConfigPush,
        CommandType::RelaySet,
        CommandType::LogPull,
        CommandType::LocationRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::ConfigPush => "config_push",
            CommandType::RelaySet => "relay_set",
            CommandType::LogPull => "log_pull",
            CommandType::LocationRequest => "location_request",
        }
    }

    /// `None` for a type this build does not know.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay outputs are driven to an explicit state, never toggled, so a
/// replayed command lands on the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySet {
    pub output: u8,
    pub state: RelayState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPull {
    /// Only entries at or after this epoch.
    #[serde(default)]
    pub since: Epoch,
}

/// A decoded command payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    ConfigPush(DeviceConfig),
    RelaySet(RelaySet),
    LogPull(LogPull),
    LocationRequest,
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandKind::ConfigPush(_) => CommandType::ConfigPush,
            CommandKind::RelaySet(_) => CommandType::RelaySet,
            CommandKind::LogPull(_) => CommandType::LogPull,
            CommandKind::LocationRequest => CommandType::LocationRequest,
        }
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            CommandKind::ConfigPush(config) => serde_json::to_value(config),
            CommandKind::RelaySet(set) => serde_json::to_value(set),
            CommandKind::LogPull(pull) => serde_json::to_value(pull),
            CommandKind::LocationRequest => Ok(serde_json::json!({})),
        }
    }

    fn decode(ty: CommandType, payload: &serde_json::Value) -> Result<Self, CommandError> {
        let invalid = |e: serde_json::Error| CommandError::InvalidPayload(ty, e.to_string());
        Ok(match ty {
            CommandType::ConfigPush => {
                CommandKind::ConfigPush(DeviceConfig::deserialize(payload).map_err(invalid)?)
            }
            CommandType::RelaySet => {
                CommandKind::RelaySet(RelaySet::deserialize(payload).map_err(invalid)?)
            }
            CommandType::LogPull => {
                CommandKind::LogPull(LogPull::deserialize(payload).map_err(invalid)?)
            }
            CommandType::LocationRequest => CommandKind::LocationRequest,
        })
    }
}

/// The wire form of a command. `type` is kept as a string so that types
/// unknown to a device still decode and can be dropped quietly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub target: DeviceId,
    pub issued: Epoch,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new(target: DeviceId, kind: &CommandKind, issued: Epoch) -> Result<Self, CommandError> {
        let payload = kind
            .payload()
            .map_err(|e| CommandError::SerializationError(e.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            target,
            issued,
            command_type: kind.command_type().as_str().to_string(),
            payload,
        })
    }

    pub fn known_type(&self) -> Option<CommandType> {
        CommandType::parse(&self.command_type)
    }

    /// Decode the payload. `Ok(None)` for an unknown type.
    pub fn kind(&self) -> Result<Option<CommandKind>, CommandError> {
        match self.known_type() {
            None => Ok(None),
            Some(ty) => CommandKind::decode(ty, &self.payload).map(Some),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Applied,
    Rejected,
}

/// A device's answer to one command, sent on `config_ack.o`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRecord {
    pub command_id: Uuid,
    pub target: DeviceId,
    #[serde(rename = "type")]
    pub command_type: String,
    pub applied: Epoch,
    pub status: AckStatus,
    /// Rejection reason, config digest or handler reply.
    #[serde(default)]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format() {
        let kind = CommandKind::RelaySet(RelaySet {
            output: 2,
            state: RelayState::On,
        });
        let command = Command::new(DeviceId::new("dev:1"), &kind, Epoch(100)).unwrap();
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["type"], "relay_set");
        assert_eq!(value["target"], "dev:1");
        assert_eq!(value["payload"], json!({"output": 2, "state": "on"}));
        assert_eq!(command.kind().unwrap(), Some(kind));
    }

    #[test]
    fn test_unknown_type_decodes_to_none() {
        let command: Command = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "target": "dev:1",
            "issued": 5,
            "type": "firmware_update",
            "payload": {"url": "http://example.invalid"}
        }))
        .unwrap();
        assert_eq!(command.known_type(), None);
        assert!(command.kind().unwrap().is_none());
    }

    #[test]
    fn test_bad_payload_is_an_error() {
        let command = Command {
            id: Uuid::new_v4(),
            target: DeviceId::new("dev:1"),
            issued: Epoch(5),
            command_type: "relay_set".to_string(),
            payload: json!({"output": "two"}),
        };
        assert!(matches!(
            command.kind(),
            Err(CommandError::InvalidPayload(CommandType::RelaySet, _))
        ));
    }

    #[test]
    fn test_location_request_ignores_payload() {
        let command = Command {
            id: Uuid::new_v4(),
            target: DeviceId::new("dev:1"),
            issued: Epoch(5),
            command_type: "location_request".to_string(),
            payload: serde_json::Value::Null,
        };
        assert_eq!(command.kind().unwrap(), Some(CommandKind::LocationRequest));
    }
}
