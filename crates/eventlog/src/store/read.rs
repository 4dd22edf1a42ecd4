// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live operation-log fan-out backed by a per-operation replay file.

use super::barrel::{Barrel, BarrelState, SubscriberRx};
use super::garbage::GarbageSink;
use super::keyed_buffer::{BufferPolicy, KeyedBuffer};
use super::pool::PoolStats;
use super::{
    barrel_events, run_blocking, spawn_gc_loop, BarrelEvent, BarrelEventReceiver,
    BarrelEventSender, MessageStore, StoreKind,
};
use crate::constants::{READ_BARREL_IDLE, READ_HISTORY_LENGTH, READ_SUBSCRIBER_CAPACITY};
use crate::errors::StoreError;
use crate::file_store::FileStore;
use crate::message::{EventLogMessage, MonitorData};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// The most recent messages of one operation, oldest first.
///
/// A barrel may be recreated after eviction, so until `seeded` is set
/// `recent` only holds what this barrel saw. `written` counts those of its
/// messages already appended to the replay file.
#[derive(Debug, Default)]
pub struct ReadState {
    recent: VecDeque<Arc<EventLogMessage>>,
    seeded: bool,
    written: usize,
}

impl BarrelState for ReadState {
    fn reset(&mut self) {
        self.recent.clear();
        self.seeded = false;
        self.written = 0;
    }
}

pub struct ReadPolicy {
    files: Arc<FileStore>,
    garbage: Arc<GarbageSink>,
    events: BarrelEventSender,
    history_length: usize,
}

impl ReadPolicy {
    fn flush_pending(&self, barrel: &Barrel<ReadState>) {
        let (_order, page) = barrel.take_page();
        if page.is_empty() {
            return;
        }
        match self.files.append_replay(barrel.key(), &page) {
            Ok(()) => barrel.state().written += page.len(),
            Err(e) => {
                error!(event_id = barrel.key(), "failed to append replay log: {}", e);
                self.garbage.extend(page);
            }
        }
    }

    /// Last `length` persisted messages of `key`. Blocking.
    fn replay_tail(&self, key: &str, length: usize) -> Vec<EventLogMessage> {
        self.files.read_replay_tail(key, length).unwrap_or_else(|e| {
            warn!(event_id = key, "failed to read replay log: {}", e);
            Vec::new()
        })
    }

    /// Puts the replay-file history from before this barrel ahead of its
    /// own messages, once. Blocking the first time.
    fn seed(&self, barrel: &Barrel<ReadState>) {
        if barrel.state().seeded {
            return;
        }
        let earlier = {
            let _order = barrel.flush_order();
            let written = barrel.state().written;
            let mut tail = self.replay_tail(barrel.key(), self.history_length + written);
            tail.truncate(tail.len().saturating_sub(written));
            tail
        };
        let mut state = barrel.state();
        if state.seeded {
            return;
        }
        state.seeded = true;
        let room = self.history_length.saturating_sub(state.recent.len());
        let skip = earlier.len().saturating_sub(room);
        for message in earlier.into_iter().skip(skip).rev() {
            state.recent.push_front(Arc::new(message));
        }
    }
}

impl BufferPolicy for ReadPolicy {
    type State = ReadState;
    type Item = EventLogMessage;

    fn idle_threshold(&self) -> Duration {
        READ_BARREL_IDLE
    }

    fn subscriber_capacity(&self) -> usize {
        READ_SUBSCRIBER_CAPACITY
    }

    // The state lock orders the history snapshot against the broadcast, so a
    // subscriber sees each message either in its history or live, never both.
    fn insert(&self, barrel: &Barrel<ReadState>, message: EventLogMessage) -> Result<(), StoreError> {
        let message = Arc::new(message);
        let mut state = barrel.state();
        barrel.touch();
        state.recent.push_back(Arc::clone(&message));
        if state.recent.len() > self.history_length {
            state.recent.pop_front();
        }
        barrel.pending().push(message.as_ref().clone());
        barrel.broadcast(&message);
        drop(state);

        // Requests may be dropped when the queue is full, so every insert asks
        // again. The worker takes the whole page and skips empty ones.
        self.events.request_persist(barrel.key());
        Ok(())
    }

    fn subscribe(&self, barrel: &Barrel<ReadState>, sub_id: &str) -> SubscriberRx {
        self.seed(barrel);
        let state = barrel.state();
        let history = state.recent.iter().cloned().collect();
        barrel.subscribe(sub_id, self.subscriber_capacity(), history)
    }

    fn evict(&self, barrel: &Barrel<ReadState>) {
        self.flush_pending(barrel);
    }
}

pub struct ReadMessageStore {
    buffer: KeyedBuffer<ReadPolicy>,
    events: Mutex<Option<BarrelEventReceiver>>,
}

impl ReadMessageStore {
    pub fn new(files: Arc<FileStore>, garbage: Arc<GarbageSink>) -> Self {
        let (sender, receiver) = barrel_events();
        Self {
            buffer: KeyedBuffer::new(ReadPolicy {
                files,
                garbage,
                events: sender,
                history_length: READ_HISTORY_LENGTH,
            }),
            events: Mutex::new(Some(receiver)),
        }
    }

    pub fn take_events(&self) -> Option<BarrelEventReceiver> {
        self.events.lock().take()
    }

    fn has_pending(&self, key: &str) -> bool {
        self.buffer
            .get(key)
            .is_some_and(|barrel| !barrel.pending().is_empty())
    }

    /// Writes the pending replay page of `key`. Blocking.
    pub fn persist(&self, key: &str) {
        if let Some(barrel) = self.buffer.get(key) {
            self.buffer.policy().flush_pending(&barrel);
        }
    }
}

impl MessageStore for ReadMessageStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Read
    }

    fn insert_message(&self, message: EventLogMessage) -> Result<(), StoreError> {
        let key = message.event_id.clone();
        self.buffer.insert(&key, message)
    }

    /// History starts from the replay file tail, so late subscribers still
    /// see it after eviction. Blocking while the barrel is unseeded.
    fn sub_chan(&self, key: &str, sub_id: &str) -> Option<SubscriberRx> {
        // Seeding outside the map lock keeps file reads off the insert path.
        self.buffer.policy().seed(&self.buffer.get_or_create(key));
        Some(self.buffer.subscribe(key, sub_id))
    }

    fn release_sub_chan(&self, key: &str, sub_id: &str) {
        self.buffer.unsubscribe(key, sub_id);
    }

    fn subscriber_count(&self, key: &str) -> usize {
        self.buffer.subscriber_count(key)
    }

    /// Served from memory while the barrel is live, from the replay file
    /// (blocking) once it has been evicted.
    fn history_message(&self, key: &str, length: usize) -> Vec<String> {
        let policy = self.buffer.policy();
        if let Some(barrel) = self.buffer.get(key) {
            policy.seed(&barrel);
            let state = barrel.state();
            let skip = state.recent.len().saturating_sub(length);
            return state
                .recent
                .iter()
                .skip(skip)
                .map(|message| message.message.clone())
                .collect();
        }
        let history = policy.replay_tail(key, length.min(policy.history_length));
        let skip = history.len().saturating_sub(length);
        history.into_iter().skip(skip).map(|m| m.message).collect()
    }

    fn monitor_data(&self) -> MonitorData {
        self.buffer.monitor_data()
    }

    fn barrel_count(&self) -> usize {
        self.buffer.barrel_count()
    }

    fn pool_stats(&self) -> PoolStats {
        self.buffer.pool_stats()
    }

    fn gc(&self) -> usize {
        self.buffer.gc(Instant::now()).len()
    }

    fn run(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![spawn_gc_loop(self.clone(), cancel.clone())];
        let Some(mut receiver) = self.take_events() else {
            warn!("read store barrel events already consumed");
            return tasks;
        };
        tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = receiver.recv() => event,
                    _ = cancel.cancelled() => break,
                };
                match event {
                    Some(BarrelEvent::Persist { key }) if !self.has_pending(&key) => {}
                    Some(BarrelEvent::Persist { key }) => {
                        let store = Arc::clone(&self);
                        run_blocking(StoreKind::Read, move || store.persist(&key)).await;
                    }
                    Some(other) => debug!("read store ignores {:?}", other),
                    None => break,
                }
            }
        }));
        tasks
    }

    fn stop(&self) {
        let policy = self.buffer.policy();
        self.buffer.for_each(|barrel| policy.evict(barrel));
    }
}
