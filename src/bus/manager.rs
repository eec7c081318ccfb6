//! Change bus: fans committed mutations out to subscribers.

use crate::types::{ChangeEvent, TableChange};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{BusMessage, DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId};

/// Internal subscription state.
///
/// The channel holds one slot beyond `config.buffer_size`, kept free for the
/// final `Dropped` notice.
struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<BusMessage>,
}

impl Subscription {
    /// Try to send a message. Returns false if the buffer is full or the
    /// receiver is gone; either way the subscriber gets dropped.
    fn try_send(&self, message: BusMessage) -> bool {
        if self.sender.len() >= self.config.buffer_size.max(1) {
            return false;
        }
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }
}

/// In-process publish/subscribe hub.
///
/// Publishing never blocks and never fails. There is no backlog: a
/// subscriber only sees messages published while it is registered.
pub struct ChangeBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::with_buffer_size(SubscriptionConfig::default().buffer_size)
    }

    /// Bus whose [`ChangeBus::default_config`] uses `buffer_size`.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Subscription config for all topics with this bus's buffer size.
    pub fn default_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            buffer_size: self.buffer_size,
            ..Default::default()
        }
    }

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1) + 1);

        tracing::debug!(subscription = id.0, topics = ?config.topics, "subscribed");
        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    /// Remove a subscription. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.remove(id, DropReason::Unsubscribed)
    }

    /// Remove a subscription and send it a best-effort `Dropped` notice.
    pub fn remove(&self, id: SubscriptionId, reason: DropReason) -> bool {
        let removed = self.subscriptions.write().remove(&id);
        match removed {
            Some(sub) => {
                let _ = sub.sender.try_send(BusMessage::Dropped { reason });
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // --- Publishing ---

    /// Publish on `rn_channel`.
    pub fn publish_record(&self, event: ChangeEvent) {
        self.broadcast(BusMessage::RecordChanged { event });
    }

    /// Publish on `table_updates`.
    pub fn publish_table(&self, change: TableChange) {
        self.broadcast(BusMessage::TableChanged { change });
    }

    /// Deliver to every interested subscriber, dropping those that cannot
    /// keep up.
    fn broadcast(&self, message: BusMessage) {
        let mut to_remove = Vec::new();
        let mut delivered = 0usize;

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if !sub.config.wants(&message) {
                    continue;
                }
                if sub.try_send(message.clone()) {
                    delivered += 1;
                } else {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    tracing::warn!(subscription = id.0, "dropping slow subscriber");
                    let _ = sub.sender.try_send(BusMessage::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }

        tracing::debug!(topic = ?message.topic(), delivered, "published");
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
