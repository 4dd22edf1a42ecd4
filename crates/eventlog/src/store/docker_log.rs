// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container stdout fan-out, paged into each service's rotating log file.

use super::barrel::{Barrel, BarrelState, SubscriberRx};
use super::garbage::GarbageSink;
use super::keyed_buffer::{BufferPolicy, KeyedBuffer};
use super::pool::PoolStats;
use super::{
    barrel_events, run_blocking, spawn_gc_loop, BarrelEvent, BarrelEventReceiver, BarrelEventSender,
    MessageStore, StoreKind,
};
use crate::constants::{DOCKER_BARREL_IDLE, DOCKER_SUBSCRIBER_CAPACITY};
use crate::errors::StoreError;
use crate::file_store::FileStore;
use crate::message::{EventLogMessage, MonitorData};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub struct DockerState {
    buffer: Vec<EventLogMessage>,
}

impl BarrelState for DockerState {
    fn reset(&mut self) {
        self.buffer.clear();
    }
}

pub struct DockerLogPolicy {
    cache_number: usize,
    events: BarrelEventSender,
    files: Arc<FileStore>,
    garbage: Arc<GarbageSink>,
}

impl DockerLogPolicy {
    fn flush_pending(&self, barrel: &Barrel<DockerState>) {
        let (_order, page) = barrel.take_page();
        if page.is_empty() {
            return;
        }
        if let Err(e) = self.files.append_service_log(barrel.key(), &page) {
            error!(service_id = barrel.key(), "failed to persist service log: {}", e);
            self.garbage.extend(page);
        }
    }
}

impl BufferPolicy for DockerLogPolicy {
    type State = DockerState;
    type Item = EventLogMessage;

    fn idle_threshold(&self) -> Duration {
        DOCKER_BARREL_IDLE
    }

    fn subscriber_capacity(&self) -> usize {
        DOCKER_SUBSCRIBER_CAPACITY
    }

    fn insert(&self, barrel: &Barrel<DockerState>, message: EventLogMessage) -> Result<(), StoreError> {
        let message = Arc::new(message);
        barrel.touch();
        barrel.broadcast(&message);

        let mut state = barrel.state();
        state.buffer.push(Arc::unwrap_or_clone(message));
        let flush = state.buffer.len() >= self.cache_number;
        if flush {
            barrel.pending().append(&mut state.buffer);
        }
        drop(state);

        if flush {
            self.events.request_persist(barrel.key());
        }
        Ok(())
    }

    fn evict(&self, barrel: &Barrel<DockerState>) {
        let mut state = barrel.state();
        barrel.pending().append(&mut state.buffer);
        drop(state);
        self.flush_pending(barrel);
    }
}

pub struct DockerLogMessageStore {
    buffer: KeyedBuffer<DockerLogPolicy>,
    events: Mutex<Option<BarrelEventReceiver>>,
}

impl DockerLogMessageStore {
    pub fn new(files: Arc<FileStore>, garbage: Arc<GarbageSink>, cache_number: usize) -> Self {
        let (sender, receiver) = barrel_events();
        Self {
            buffer: KeyedBuffer::new(DockerLogPolicy {
                cache_number: cache_number.max(1),
                events: sender,
                files,
                garbage,
            }),
            events: Mutex::new(Some(receiver)),
        }
    }

    pub fn take_events(&self) -> Option<BarrelEventReceiver> {
        self.events.lock().take()
    }

    /// Writes the pending page of `key`. Blocking.
    pub fn persist(&self, key: &str) {
        if let Some(barrel) = self.buffer.get(key) {
            self.buffer.policy().flush_pending(&barrel);
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: BarrelEvent) {
        match event {
            BarrelEvent::Persist { key } => {
                let store = Arc::clone(self);
                run_blocking(StoreKind::DockerLog, move || store.persist(&key)).await;
            }
            other => debug!("docker log store ignores {:?}", other),
        }
    }
}

impl MessageStore for DockerLogMessageStore {
    fn kind(&self) -> StoreKind {
        StoreKind::DockerLog
    }

    fn insert_message(&self, message: EventLogMessage) -> Result<(), StoreError> {
        let key = message.event_id.clone();
        self.buffer.insert(&key, message)
    }

    fn sub_chan(&self, key: &str, sub_id: &str) -> Option<SubscriberRx> {
        Some(self.buffer.subscribe(key, sub_id))
    }

    fn release_sub_chan(&self, key: &str, sub_id: &str) {
        self.buffer.unsubscribe(key, sub_id);
    }

    fn subscriber_count(&self, key: &str) -> usize {
        self.buffer.subscriber_count(key)
    }

    /// File tail followed by lines not yet written.
    fn history_message(&self, key: &str, length: usize) -> Vec<String> {
        let mut lines = match self.buffer.policy().files.read_service_tail(key, length) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(service_id = key, "failed to read service log: {}", e);
                Vec::new()
            }
        };
        if let Some(barrel) = self.buffer.get(key) {
            let state = barrel.state();
            let pending = barrel.pending();
            lines.extend(
                pending
                    .iter()
                    .chain(state.buffer.iter())
                    .map(|message| message.message.clone()),
            );
        }
        let skip = lines.len().saturating_sub(length);
        lines.split_off(skip)
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
            warn!("docker log store barrel events already consumed");
            return tasks;
        };
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = receiver.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
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
