//! Message and subscription types for the change bus.

use crate::error::SyncError;
use crate::types::{ChangeEvent, ClientId, TableChange};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Named broadcast channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Record mutations.
    #[serde(rename = "rn_channel")]
    Records,
    /// Whole-table snapshots.
    #[serde(rename = "table_updates")]
    Tables,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Records, Topic::Tables];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Records => "rn_channel",
            Topic::Tables => "table_updates",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rn_channel" => Ok(Topic::Records),
            "table_updates" => Ok(Topic::Tables),
            other => Err(SyncError::Deserialization(format!("unknown channel: {}", other))),
        }
    }
}

/// Messages delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// A record was created, updated, renamed or deleted.
    RecordChanged { event: ChangeEvent },

    /// A table snapshot was saved.
    TableChanged { change: TableChange },

    /// The subscription was closed; nothing follows.
    Dropped { reason: DropReason },
}

impl BusMessage {
    /// Channel the message was published on. Lifecycle messages have none.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            BusMessage::RecordChanged { .. } => Some(Topic::Records),
            BusMessage::TableChanged { .. } => Some(Topic::Tables),
            BusMessage::Dropped { .. } => None,
        }
    }

    /// Client whose request produced the message.
    pub fn origin(&self) -> Option<ClientId> {
        match self {
            BusMessage::RecordChanged { event } => Some(event.actor_client_id),
            BusMessage::TableChanged { change } => change.client_id,
            BusMessage::Dropped { .. } => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// Not polled within the idle timeout.
    IdleTimeout,
}

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered messages before the subscriber is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    /// Channels to listen on. Default: all.
    pub topics: Vec<Topic>,

    /// Skip messages originating from this client.
    pub exclude_client: Option<ClientId>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            topics: Topic::ALL.to_vec(),
            exclude_client: None,
        }
    }
}

impl SubscriptionConfig {
    pub fn topics(topics: impl Into<Vec<Topic>>) -> Self {
        Self {
            topics: topics.into(),
            ..Default::default()
        }
    }

    pub fn excluding(mut self, client: ClientId) -> Self {
        self.exclude_client = Some(client);
        self
    }

    pub(super) fn wants(&self, message: &BusMessage) -> bool {
        let on_topic = message
            .topic()
            .is_some_and(|topic| self.topics.contains(&topic));
        let own = self.exclude_client.is_some() && message.origin() == self.exclude_client;
        on_topic && !own
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving end of one subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive messages.
    pub receiver: crossbeam_channel::Receiver<BusMessage>,
}

impl SubscriptionHandle {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> Result<BusMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Result<BusMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<BusMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything already buffered, without blocking.
    pub fn drain(&self) -> Vec<BusMessage> {
        self.receiver.try_iter().collect()
    }
}
