//! Background thread that drains a subscription and hands messages off.

use crate::bus::{BusMessage, DropReason, SubscriptionHandle};
use crate::error::{Result, SyncError};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Something that yields bus messages in batches.
pub trait EventSource: Send + 'static {
    /// Wait up to `timeout` for messages. An empty batch means none arrived.
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<BusMessage>>;

    /// Release the subscription. Called once when the listener exits.
    fn close(&mut self) {}
}

impl EventSource for SubscriptionHandle {
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<BusMessage>> {
        match self.recv_timeout(timeout) {
            Ok(first) => {
                let mut batch = vec![first];
                batch.extend(self.drain());
                Ok(batch)
            }
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::SubscriptionNotFound(self.id.0)),
        }
    }
}

/// Cancellable listener thread.
///
/// The thread exits on its own once the source reports its subscription is
/// gone, after handing out a `Dropped` notice if none was delivered.
/// `stop` (or drop) signals the thread and joins it. Because every wait is
/// bounded by the poll timeout, shutdown completes within about one poll
/// timeout, and no callback runs after `stop` returns.
pub struct BroadcastListener {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl BroadcastListener {
    /// Start draining `source`, calling `on_message` for each message on the
    /// listener thread.
    pub fn spawn<S, F>(mut source: S, poll_timeout: Duration, mut on_message: F) -> Result<Self>
    where
        S: EventSource,
        F: FnMut(BusMessage) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("rnsync-listener".to_string())
            .spawn(move || {
                let mut saw_dropped = false;
                while !stop_requested(&stop_rx) {
                    match source.next_batch(poll_timeout) {
                        Ok(batch) => {
                            for message in batch {
                                if stop_requested(&stop_rx) {
                                    break;
                                }
                                saw_dropped |= matches!(message, BusMessage::Dropped { .. });
                                on_message(message);
                            }
                        }
                        Err(SyncError::SubscriptionNotFound(id)) => {
                            // the bus let go of the subscription; nothing more will arrive
                            tracing::info!(subscription = id, "subscription closed, listener exiting");
                            if !saw_dropped {
                                on_message(BusMessage::Dropped {
                                    reason: DropReason::BufferOverflow,
                                });
                            }
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "listener poll failed");
                            // back off, waking early on stop
                            match stop_rx.recv_timeout(poll_timeout) {
                                Err(RecvTimeoutError::Timeout) => {}
                                _ => break,
                            }
                        }
                    }
                }
                source.close();
                tracing::debug!("listener stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Start a listener that forwards messages into a channel, for a UI
    /// thread to drain at its own pace.
    pub fn spawn_channel<S>(source: S, poll_timeout: Duration) -> Result<(Self, Receiver<BusMessage>)>
    where
        S: EventSource,
    {
        let (tx, rx) = unbounded();
        let listener = Self::spawn(source, poll_timeout, move |message| {
            let _ = tx.send(message);
        })?;
        Ok((listener, rx))
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("listener thread panicked");
            }
        }
    }
}

impl Drop for BroadcastListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}
