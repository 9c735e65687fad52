//! Named, directional message queues
//!
//! Queue names encode a message kind and a direction as the local end sees
//! it: `telemetry.o` is written by a client and drained by the relay,
//! `telemetry.i` is filled by the relay and drained by the coordinator.
//! Names never carry peer identity; that travels in the body.

pub mod messenger;

pub use messenger::{Drained, Message, MessageQueue, DEFAULT_DRAIN_LIMIT};

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::relay::RelayError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue {0} is not an outbound queue")]
    NotOutbound(QueueName),

    #[error("Queue {0} is not an inbound queue")]
    NotInbound(QueueName),

    #[error("Unknown queue name: {0}")]
    UnknownQueue(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Which end of the relay a queue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn suffix(self) -> &'static str {
        match self {
            Direction::Outbound => "o",
            Direction::Inbound => "i",
        }
    }
}

/// Message kinds with a fixed queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NoteKind {
    Telemetry,
    Alarm,
    Daily,
    /// Typed commands written by the coordinator.
    Command,
    /// Commands as delivered to a client after routing.
    Config,
    ConfigAck,
    ViewerSummary,
}

impl NoteKind {
    pub const ALL: [NoteKind; 7] = [
        NoteKind::Telemetry,
        NoteKind::Alarm,
        NoteKind::Daily,
        NoteKind::Command,
        NoteKind::Config,
        NoteKind::ConfigAck,
        NoteKind::ViewerSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NoteKind::Telemetry => "telemetry",
            NoteKind::Alarm => "alarm",
            NoteKind::Daily => "daily",
            NoteKind::Command => "command",
            NoteKind::Config => "config",
            NoteKind::ConfigAck => "config_ack",
            NoteKind::ViewerSummary => "viewer_summary",
        }
    }
}

/// An immutable queue identifier: kind plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName {
    kind: NoteKind,
    direction: Direction,
}

impl QueueName {
    pub const fn new(kind: NoteKind, direction: Direction) -> Self {
        Self { kind, direction }
    }

    pub const fn outbound(kind: NoteKind) -> Self {
        Self::new(kind, Direction::Outbound)
    }

    pub const fn inbound(kind: NoteKind) -> Self {
        Self::new(kind, Direction::Inbound)
    }

    pub fn kind(&self) -> NoteKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.direction.suffix())
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, suffix) = s
            .rsplit_once('.')
            .ok_or_else(|| QueueError::UnknownQueue(s.to_string()))?;
        let direction = match suffix {
            "o" => Direction::Outbound,
            "i" => Direction::Inbound,
            _ => return Err(QueueError::UnknownQueue(s.to_string())),
        };
        let kind = NoteKind::ALL
            .into_iter()
            .find(|k| k.as_str() == kind)
            .ok_or_else(|| QueueError::UnknownQueue(s.to_string()))?;
        Ok(Self::new(kind, direction))
    }
}

pub const TELEMETRY_OUT: QueueName = QueueName::outbound(NoteKind::Telemetry);
pub const TELEMETRY_IN: QueueName = QueueName::inbound(NoteKind::Telemetry);
pub const ALARM_OUT: QueueName = QueueName::outbound(NoteKind::Alarm);
pub const ALARM_IN: QueueName = QueueName::inbound(NoteKind::Alarm);
pub const DAILY_OUT: QueueName = QueueName::outbound(NoteKind::Daily);
pub const DAILY_IN: QueueName = QueueName::inbound(NoteKind::Daily);
pub const COMMAND_OUT: QueueName = QueueName::outbound(NoteKind::Command);
pub const CONFIG_IN: QueueName = QueueName::inbound(NoteKind::Config);
pub const CONFIG_ACK_OUT: QueueName = QueueName::outbound(NoteKind::ConfigAck);
pub const CONFIG_ACK_IN: QueueName = QueueName::inbound(NoteKind::ConfigAck);
pub const VIEWER_SUMMARY_OUT: QueueName = QueueName::outbound(NoteKind::ViewerSummary);
pub const VIEWER_SUMMARY_IN: QueueName = QueueName::inbound(NoteKind::ViewerSummary);
