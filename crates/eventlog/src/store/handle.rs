// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operation-log store: pages messages to the event log file and reports
//! each operation's outcome to the metadata store.

use super::barrel::{Barrel, BarrelState};
use super::garbage::GarbageSink;
use super::keyed_buffer::{BufferPolicy, KeyedBuffer};
use super::pool::PoolStats;
use super::{
    barrel_events, run_blocking, spawn_gc_loop, BarrelEvent, BarrelEventReceiver, BarrelEventSender,
    MessageStore, StoreKind,
};
use crate::constants::{BARREL_EVENT_WORKERS, HANDLE_BARREL_IDLE, HANDLE_SUBSCRIBER_CAPACITY};
use crate::errors::StoreError;
use crate::file_store::FileStore;
use crate::message::{EventLogMessage, MonitorData, Step};
use crate::metadata::EventRecordStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub struct HandleState {
    buffer: Vec<EventLogMessage>,
    size: u64,
}

impl BarrelState for HandleState {
    fn reset(&mut self) {
        self.buffer.clear();
        self.size = 0;
    }
}

pub struct HandlePolicy {
    max_number: u64,
    cache_number: usize,
    events: BarrelEventSender,
    files: Arc<FileStore>,
    garbage: Arc<GarbageSink>,
}

impl HandlePolicy {
    /// Writes the barrel's pending page. On failure the page goes to the
    /// garbage sink instead of being retried.
    fn flush_pending(&self, barrel: &Barrel<HandleState>) {
        let (_order, page) = barrel.take_page();
        if page.is_empty() {
            return;
        }
        if let Err(e) = self.files.append_event_log(barrel.key(), &page) {
            error!(event_id = barrel.key(), "failed to persist event log: {}", e);
            self.garbage.extend(page);
        }
    }
}

impl BufferPolicy for HandlePolicy {
    type State = HandleState;
    type Item = EventLogMessage;

    fn idle_threshold(&self) -> Duration {
        HANDLE_BARREL_IDLE
    }

    fn subscriber_capacity(&self) -> usize {
        HANDLE_SUBSCRIBER_CAPACITY
    }

    fn insert(&self, barrel: &Barrel<HandleState>, message: EventLogMessage) -> Result<(), StoreError> {
        let step = message.step_kind();
        let mut state = barrel.state();
        if state.size >= self.max_number {
            return Err(StoreError::Overflow {
                event_id: barrel.key().to_string(),
                max: self.max_number,
            });
        }
        if step == Step::Progress {
            return Ok(());
        }

        let notification = match step {
            Step::Last | Step::Callback => Some(BarrelEvent::Callback {
                event_id: message.event_id.clone(),
                status: message.status.clone(),
                message: message.message.clone(),
            }),
            Step::CodeVersion => Some(BarrelEvent::CodeVersion {
                event_id: message.event_id.clone(),
                version: message.message.clone(),
            }),
            Step::Progress | Step::Other => None,
        };

        state.buffer.push(message);
        state.size += 1;
        barrel.touch();
        let flush = state.buffer.len() >= self.cache_number || step.is_terminal();
        if flush {
            barrel.pending().append(&mut state.buffer);
        }
        drop(state);

        if flush {
            self.events.request_persist(barrel.key());
        }
        if let Some(event) = notification {
            self.events.notify(event);
        }
        Ok(())
    }

    fn evict(&self, barrel: &Barrel<HandleState>) {
        let mut state = barrel.state();
        barrel.pending().append(&mut state.buffer);
        drop(state);
        self.flush_pending(barrel);
    }
}

pub struct HandleMessageStore {
    buffer: KeyedBuffer<HandlePolicy>,
    metadata: Arc<dyn EventRecordStore>,
    events: Mutex<Option<BarrelEventReceiver>>,
}

impl HandleMessageStore {
    pub fn new(
        files: Arc<FileStore>,
        garbage: Arc<GarbageSink>,
        metadata: Arc<dyn EventRecordStore>,
        max_number: u64,
        cache_number: usize,
    ) -> Self {
        let (sender, receiver) = barrel_events();
        let policy = HandlePolicy {
            max_number,
            cache_number: cache_number.max(1),
            events: sender,
            files,
            garbage,
        };
        Self {
            buffer: KeyedBuffer::new(policy),
            metadata,
            events: Mutex::new(Some(receiver)),
        }
    }

    /// Hands out the barrel-event receiver. Only the first caller gets it.
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
                run_blocking(StoreKind::Handle, move || store.persist(&key)).await;
            }
            BarrelEvent::Callback {
                event_id,
                status,
                message,
            } => self.complete_event(&event_id, status, message).await,
            BarrelEvent::CodeVersion { event_id, version } => {
                self.record_code_version(&event_id, version).await
            }
        }
    }

    async fn complete_event(&self, event_id: &str, status: String, message: String) {
        let mut record = match self.metadata.get(event_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(event_id, "event record not found, callback skipped");
                return;
            }
            Err(e) => {
                error!(event_id, "failed to load event record: {}", e);
                return;
            }
        };
        record.final_status = if status.contains("empty") {
            "empty complete".to_string()
        } else {
            "complete".to_string()
        };
        record.status = status;
        record.message = message;
        record.end_time = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        if let Err(e) = self.metadata.update(record).await {
            error!(event_id, "failed to update event record: {}", e);
        }
    }

    async fn record_code_version(&self, event_id: &str, version: String) {
        let mut record = match self.metadata.get(event_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(event_id, "event record not found, code version skipped");
                return;
            }
            Err(e) => {
                error!(event_id, "failed to load event record: {}", e);
                return;
            }
        };
        record.code_version = Some(version);
        if let Err(e) = self.metadata.update(record).await {
            error!(event_id, "failed to update event record: {}", e);
        }
    }
}

impl MessageStore for HandleMessageStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Handle
    }

    fn insert_message(&self, message: EventLogMessage) -> Result<(), StoreError> {
        let key = message.event_id.clone();
        self.buffer.insert(&key, message)
    }

    fn history_message(&self, key: &str, length: usize) -> Vec<String> {
        let Some(barrel) = self.buffer.get(key) else {
            return Vec::new();
        };
        let state = barrel.state();
        let pending = barrel.pending();
        let lines: Vec<String> = pending
            .iter()
            .chain(state.buffer.iter())
            .map(|message| message.message.clone())
            .collect();
        let skip = lines.len().saturating_sub(length);
        lines.into_iter().skip(skip).collect()
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
        let Some(receiver) = self.take_events() else {
            warn!("handle store barrel events already consumed");
            return tasks;
        };
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for _ in 0..BARREL_EVENT_WORKERS {
            let store = Arc::clone(&self);
            let receiver = Arc::clone(&receiver);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let event = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            event = receiver.recv() => event,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    match event {
                        Some(event) => store.handle_event(event).await,
                        None => break,
                    }
                }
                debug!("handle store barrel event worker stopped");
            }));
        }
        tasks
    }

    fn stop(&self) {
        let policy = self.buffer.policy();
        self.buffer.for_each(|barrel| policy.evict(barrel));
    }
}
