// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::message::EventLogMessage;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

pub type SubscriberTx = mpsc::Sender<Arc<EventLogMessage>>;
pub type SubscriberRx = mpsc::Receiver<Arc<EventLogMessage>>;

/// Kind-specific contents of a barrel. `reset` must leave it as fresh as
/// `Default` while keeping allocations around for reuse.
pub trait BarrelState: Default + Send + 'static {
    fn reset(&mut self);
}

impl BarrelState for () {
    fn reset(&mut self) {}
}

/// Per-key buffering and fan-out unit.
///
/// Lock order is `flush`, then `state`, then `pending`, then `subscribers`.
/// No lock is held across an await point, and subscriber sends never block.
/// Only `flush` may be held during file I/O, and only off the async executor.
pub struct Barrel<S> {
    key: String,
    flush: Mutex<()>,
    state: Mutex<S>,
    pending: Mutex<Vec<EventLogMessage>>,
    subscribers: Mutex<HashMap<String, SubscriberTx>>,
    updated_at: Mutex<Instant>,
}

impl<S: BarrelState> Barrel<S> {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            flush: Mutex::new(()),
            state: Mutex::new(S::default()),
            pending: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            updated_at: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> MutexGuard<'_, S> {
        self.state.lock()
    }

    /// Messages waiting for the persistence worker.
    pub fn pending(&self) -> MutexGuard<'_, Vec<EventLogMessage>> {
        self.pending.lock()
    }

    /// Takes the pending page for writing. The returned guard keeps pages of
    /// this barrel reaching the file in the order they were taken.
    pub fn take_page(&self) -> (MutexGuard<'_, ()>, Vec<EventLogMessage>) {
        let order = self.flush_order();
        let page = std::mem::take(&mut *self.pending.lock());
        (order, page)
    }

    /// Holds off page writes of this barrel while the guard lives.
    pub fn flush_order(&self) -> MutexGuard<'_, ()> {
        self.flush.lock()
    }

    pub fn touch(&self) {
        *self.updated_at.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.updated_at.lock())
    }

    /// Registers a subscriber, queueing `backlog` ahead of any live message.
    /// An existing subscription with the same ID is replaced and its receiver closes.
    pub fn subscribe(
        &self,
        sub_id: &str,
        capacity: usize,
        backlog: Vec<Arc<EventLogMessage>>,
    ) -> SubscriberRx {
        let (tx, rx) = mpsc::channel(capacity.max(1) + backlog.len());
        for message in backlog {
            // Capacity covers the whole backlog.
            let _ = tx.try_send(message);
        }
        self.subscribers.lock().insert(sub_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, sub_id: &str) -> bool {
        self.subscribers.lock().remove(sub_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Best-effort fan-out. Full subscribers miss the message and closed ones
    /// are dropped. Returns how many subscribers missed it.
    pub fn broadcast(&self, message: &Arc<EventLogMessage>) -> usize {
        let mut missed = 0;
        self.subscribers.lock().retain(|sub_id, tx| {
            match tx.try_send(Arc::clone(message)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    missed += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("subscriber {} of {} went away", sub_id, self.key);
                    missed += 1;
                    false
                }
            }
        });
        missed
    }

    /// Returns the barrel to its empty state under a new key. Dropping the
    /// subscriber senders closes every outstanding receiver.
    pub(crate) fn reset(&mut self, key: &str) {
        self.key.clear();
        self.key.push_str(key);
        self.state.get_mut().reset();
        self.pending.get_mut().clear();
        self.subscribers.get_mut().clear();
        *self.updated_at.get_mut() = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> Arc<EventLogMessage> {
        Arc::new(EventLogMessage {
            message: text.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_backlog_precedes_live_messages() {
        let barrel: Barrel<()> = Barrel::new("E1");
        let mut rx = barrel.subscribe("s1", 2, vec![message("h1"), message("h2"), message("h3")]);
        assert_eq!(barrel.broadcast(&message("live")), 0);

        let texts: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.message.clone())
            .collect();
        assert_eq!(texts, vec!["h1", "h2", "h3", "live"]);
    }

    #[test]
    fn test_full_subscriber_misses_without_blocking() {
        let barrel: Barrel<()> = Barrel::new("E1");
        let _rx = barrel.subscribe("s1", 1, Vec::new());
        assert_eq!(barrel.broadcast(&message("a")), 0);
        assert_eq!(barrel.broadcast(&message("b")), 1);
        assert_eq!(barrel.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_subscriber_is_pruned() {
        let barrel: Barrel<()> = Barrel::new("E1");
        drop(barrel.subscribe("s1", 1, Vec::new()));
        barrel.broadcast(&message("a"));
        assert_eq!(barrel.subscriber_count(), 0);
    }

    #[test]
    fn test_take_page_leaves_pending_usable() {
        let barrel: Barrel<()> = Barrel::new("E1");
        barrel.pending().push(message("a").as_ref().clone());
        let (order, page) = barrel.take_page();
        // Inserts only need the pending lock while a page is being written.
        barrel.pending().push(message("b").as_ref().clone());
        drop(order);
        assert_eq!(page.len(), 1);
        assert_eq!(barrel.pending().len(), 1);
    }

    #[test]
    fn test_reset_closes_receivers() {
        let mut barrel: Barrel<()> = Barrel::new("E1");
        let mut rx = barrel.subscribe("s1", 1, Vec::new());
        barrel.pending().push(EventLogMessage::default());
        barrel.reset("E2");
        assert_eq!(barrel.key(), "E2");
        assert!(barrel.pending().is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
