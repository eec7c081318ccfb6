//! Long-poll bridge from HTTP clients to the in-process change bus.
//!
//! A remote client opens a subscription, then repeatedly polls it. Each poll
//! blocks until at least one message is buffered or the timeout passes.
//! Subscriptions that stop polling are reaped after the idle timeout.

use crate::bus::{
    BusMessage, ChangeBus, DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    Topic,
};
use crate::error::{Result, SyncError};
use crate::types::ClientId;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct RemoteEntry {
    handle: SubscriptionHandle,
    last_seen: Mutex<Instant>,
}

impl RemoteEntry {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }
}

/// Registry of subscriptions owned by HTTP clients.
pub struct SubscriptionRegistry {
    bus: Arc<ChangeBus>,
    entries: Mutex<HashMap<SubscriptionId, Arc<RemoteEntry>>>,
    idle_timeout: Duration,
    max_poll: Duration,
}

impl SubscriptionRegistry {
    pub fn new(bus: Arc<ChangeBus>, idle_timeout: Duration, max_poll: Duration) -> Self {
        Self {
            bus,
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
            max_poll,
        }
    }

    pub fn max_poll(&self) -> Duration {
        self.max_poll
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Register a bus subscription on `topics`, skipping messages from
    /// `exclude`.
    pub fn open(&self, topics: Vec<Topic>, exclude: Option<ClientId>) -> SubscriptionId {
        let config = SubscriptionConfig {
            topics,
            exclude_client: exclude,
            ..self.bus.default_config()
        };

        let handle = self.bus.subscribe(config);
        let id = handle.id;
        let entry = Arc::new(RemoteEntry {
            handle,
            last_seen: Mutex::new(Instant::now()),
        });
        self.entries.lock().insert(id, entry);
        tracing::info!(subscription = id.0, "remote subscription opened");
        id
    }

    /// Wait up to `timeout` (capped at the configured maximum) for messages.
    ///
    /// Returns everything buffered once the first message arrives. An empty
    /// result means the timeout passed. A subscription that the bus dropped
    /// is removed here after its final messages are handed out.
    pub fn poll(&self, id: SubscriptionId, timeout: Duration) -> Result<Vec<BusMessage>> {
        let entry = self
            .entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or(SyncError::SubscriptionNotFound(id.0))?;
        entry.touch();

        let timeout = timeout.min(self.max_poll);
        let mut messages = Vec::new();
        let mut closed = false;

        match entry.handle.recv_timeout(timeout) {
            Ok(first) => {
                messages.push(first);
                messages.extend(entry.handle.drain());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => closed = true,
        }
        entry.touch();

        closed |= messages
            .iter()
            .any(|m| matches!(m, BusMessage::Dropped { .. }));
        if closed {
            self.entries.lock().remove(&id);
            tracing::info!(subscription = id.0, "remote subscription closed by bus");
            if messages.is_empty() {
                messages.push(BusMessage::Dropped {
                    reason: DropReason::BufferOverflow,
                });
            }
        }
        Ok(messages)
    }

    /// Close a subscription. Returns whether it existed.
    pub fn close(&self, id: SubscriptionId) -> bool {
        let removed = self.entries.lock().remove(&id).is_some();
        if removed {
            self.bus.unsubscribe(id);
            tracing::info!(subscription = id.0, "remote subscription closed");
        }
        removed
    }

    /// Drop subscriptions that have not polled within the idle timeout.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<SubscriptionId> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.idle_for(now) > self.idle_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.entries.lock().remove(id);
            self.bus.remove(*id, DropReason::IdleTimeout);
            tracing::warn!(subscription = id.0, "reaped idle remote subscription");
        }
        stale.len()
    }

    /// Run [`SubscriptionRegistry::reap_idle`] periodically on the current
    /// tokio runtime.
    pub fn spawn_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = (self.idle_timeout / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.reap_idle();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableChange;

    fn registry(idle: Duration) -> (Arc<ChangeBus>, SubscriptionRegistry) {
        let bus = Arc::new(ChangeBus::new());
        let registry = SubscriptionRegistry::new(Arc::clone(&bus), idle, Duration::from_secs(1));
        (bus, registry)
    }

    fn table_change(client: Option<ClientId>) -> TableChange {
        TableChange {
            table_name: "kpi".into(),
            client_id: client,
            message: "saved".into(),
        }
    }

    #[test]
    fn test_poll_returns_buffered_messages() {
        let (bus, registry) = registry(Duration::from_secs(30));
        let id = registry.open(Topic::ALL.to_vec(), None);

        bus.publish_table(table_change(None));
        bus.publish_table(table_change(None));

        let messages = registry.poll(id, Duration::from_millis(200)).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(registry
            .poll(id, Duration::from_millis(20))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_poll_excludes_own_messages() {
        let (bus, registry) = registry(Duration::from_secs(30));
        let me = ClientId::random();
        let id = registry.open(vec![Topic::Tables], Some(me));

        bus.publish_table(table_change(Some(me)));
        assert!(registry
            .poll(id, Duration::from_millis(20))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_close_and_unknown_id() {
        let (bus, registry) = registry(Duration::from_secs(30));
        let id = registry.open(Topic::ALL.to_vec(), None);
        assert_eq!(bus.subscription_count(), 1);

        assert!(registry.close(id));
        assert!(!registry.close(id));
        assert_eq!(bus.subscription_count(), 0);
        assert!(matches!(
            registry.poll(id, Duration::from_millis(1)),
            Err(SyncError::SubscriptionNotFound(_))
        ));
    }

    #[test]
    fn test_idle_subscriptions_reaped() {
        let (bus, registry) = registry(Duration::from_millis(20));
        let _id = registry.open(Topic::ALL.to_vec(), None);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.reap_idle(), 1);
        assert!(registry.is_empty());
        assert_eq!(bus.subscription_count(), 0);
    }
}
