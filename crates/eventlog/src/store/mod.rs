// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-kind message stores and the manager that feeds them.
//!
//! Every store is a [`keyed_buffer::KeyedBuffer`] with a kind-specific
//! policy. Stores never block ingestion: fan-out is best effort and
//! persistence runs on background workers driven by [`BarrelEvent`]s.

pub mod barrel;
pub mod docker_log;
pub mod garbage;
pub mod handle;
pub mod keyed_buffer;
pub mod manager;
pub mod monitor;
pub mod pool;
pub mod read;

use crate::constants::{BARREL_EVENT_CHAN_SIZE, STORE_GC_INTERVAL};
use crate::errors::StoreError;
use crate::message::{EventLogMessage, MonitorData};
use barrel::SubscriberRx;
use pool::PoolStats;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Handle,
    Read,
    DockerLog,
    Monitor,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Handle => "handle",
            StoreKind::Read => "read",
            StoreKind::DockerLog => "docker_log",
            StoreKind::Monitor => "monitor",
        }
    }

    /// Maps a subscription mode to the store that serves it.
    /// `event` streams come from the read store, never the handle store.
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode {
            "event" => Some(StoreKind::Read),
            "docker" => Some(StoreKind::DockerLog),
            "monitor" | "newmonitor" => Some(StoreKind::Monitor),
            _ => None,
        }
    }
}

/// Commands barrels hand to their store's background workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrelEvent {
    Persist {
        key: String,
    },
    Callback {
        event_id: String,
        status: String,
        message: String,
    },
    CodeVersion {
        event_id: String,
        version: String,
    },
}

/// Sending side of a store's barrel-event queue.
///
/// Persist requests share a small bounded queue and are dropped when it is
/// full, since pending messages stay in the barrel until the next request or
/// eviction. Callback and code-version events are queued unbounded so an
/// operation's final status is never lost.
#[derive(Debug, Clone)]
pub struct BarrelEventSender {
    persist: mpsc::Sender<BarrelEvent>,
    notify: mpsc::UnboundedSender<BarrelEvent>,
}

pub struct BarrelEventReceiver {
    persist: mpsc::Receiver<BarrelEvent>,
    notify: mpsc::UnboundedReceiver<BarrelEvent>,
}

pub fn barrel_events() -> (BarrelEventSender, BarrelEventReceiver) {
    let (persist_tx, persist_rx) = mpsc::channel(BARREL_EVENT_CHAN_SIZE);
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    (
        BarrelEventSender {
            persist: persist_tx,
            notify: notify_tx,
        },
        BarrelEventReceiver {
            persist: persist_rx,
            notify: notify_rx,
        },
    )
}

impl BarrelEventSender {
    pub fn request_persist(&self, key: &str) {
        match self.persist.try_send(BarrelEvent::Persist {
            key: key.to_string(),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("barrel event queue full, persist of {} deferred", key);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("barrel event queue closed, persist of {} skipped", key);
            }
        }
    }

    pub fn notify(&self, event: BarrelEvent) {
        if self.notify.send(event).is_err() {
            debug!("barrel event queue closed, notification dropped");
        }
    }
}

impl BarrelEventReceiver {
    /// Next event, notifications first. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<BarrelEvent> {
        tokio::select! {
            biased;
            Some(event) = self.notify.recv() => Some(event),
            Some(event) = self.persist.recv() => Some(event),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<BarrelEvent> {
        self.notify
            .try_recv()
            .or_else(|_| self.persist.try_recv())
            .ok()
    }
}

/// Operations common to every store kind.
pub trait MessageStore: Send + Sync + 'static {
    fn kind(&self) -> StoreKind;

    fn insert_message(&self, message: EventLogMessage) -> Result<(), StoreError>;

    /// Subscriber channel for `key`, or `None` when the kind has no live fan-out.
    fn sub_chan(&self, _key: &str, _sub_id: &str) -> Option<SubscriberRx> {
        None
    }

    fn release_sub_chan(&self, _key: &str, _sub_id: &str) {}

    fn subscriber_count(&self, _key: &str) -> usize {
        0
    }

    /// Most recent `length` lines held for `key`, oldest first.
    fn history_message(&self, key: &str, length: usize) -> Vec<String>;

    fn monitor_data(&self) -> MonitorData;

    fn barrel_count(&self) -> usize;

    fn pool_stats(&self) -> PoolStats;

    /// Evicts idle barrels now, returning how many went.
    fn gc(&self) -> usize;

    /// Spawns the store's background tasks. They stop when `cancel` fires.
    fn run(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>>;

    /// Synchronously persists everything still buffered.
    fn stop(&self);
}

/// Runs file work on the blocking pool and waits for it.
pub(crate) async fn run_blocking<T, F>(store: StoreKind, work: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(value) => Some(value),
        Err(e) => {
            error!(store = store.as_str(), "blocking store task failed: {}", e);
            None
        }
    }
}

/// Runs `store.gc()` every [`STORE_GC_INTERVAL`] until cancelled. Eviction
/// flushes pages, so it runs on the blocking pool.
pub(crate) fn spawn_gc_loop(
    store: Arc<dyn MessageStore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STORE_GC_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let gc_store = Arc::clone(&store);
                    let evicted = run_blocking(store.kind(), move || gc_store.gc())
                        .await
                        .unwrap_or_default();
                    if evicted > 0 {
                        debug!(store = store.kind().as_str(), evicted, "store gc");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_kind_from_mode() {
        assert_eq!(StoreKind::from_mode("event"), Some(StoreKind::Read));
        assert_eq!(StoreKind::from_mode("docker"), Some(StoreKind::DockerLog));
        assert_eq!(StoreKind::from_mode("newmonitor"), Some(StoreKind::Monitor));
        assert_eq!(StoreKind::from_mode("handle"), None);
    }

    #[tokio::test]
    async fn test_persist_requests_drop_when_full() {
        let (tx, mut rx) = barrel_events();
        for _ in 0..BARREL_EVENT_CHAN_SIZE + 5 {
            tx.request_persist("E1");
        }
        tx.notify(BarrelEvent::Callback {
            event_id: "E1".to_string(),
            status: "success".to_string(),
            message: "done".to_string(),
        });
        drop(tx);

        let mut persists = 0;
        let mut first = None;
        while let Some(event) = rx.recv().await {
            if first.is_none() {
                first = Some(event.clone());
            }
            if matches!(event, BarrelEvent::Persist { .. }) {
                persists += 1;
            }
        }
        assert_eq!(persists, BARREL_EVENT_CHAN_SIZE);
        assert!(matches!(first, Some(BarrelEvent::Callback { .. })));
    }
}
