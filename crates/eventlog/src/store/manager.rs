// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion channels, their worker pools and the stores they feed.
//!
//! Producers push raw payloads with the non-blocking `push_*` methods. A full
//! channel drops the payload, counts it and shows up in [`StoreManager::health_check`].

use super::barrel::SubscriberRx;
use super::docker_log::DockerLogMessageStore;
use super::garbage::GarbageSink;
use super::handle::HandleMessageStore;
use super::monitor::MonitorMessageStore;
use super::read::ReadMessageStore;
use super::{run_blocking, MessageStore, StoreKind};
use crate::constants::{
    CLEANUP_INTERVAL, DOCKER_LOG_CHAN_SIZE, EVENT_RECORD_RETENTION_DAYS, MONITOR_CHAN_SIZE,
    PUB_CHAN_SIZE, RECEIVE_CHAN_SIZE, SUB_CHAN_SIZE,
};
use crate::errors::StoreError;
use crate::file_store::{EventLogLine, FileStore};
use crate::message::{parse_message, ClusterMessage, EventLogMessage, MessageMode, MonitorData};
use crate::metadata::EventRecordStore;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StoreManagerConfig {
    pub message_max_number: u64,
    pub message_cache_number: usize,
    pub docker_cache_number: usize,
    pub handle_message_workers: usize,
    pub handle_sub_workers: usize,
    pub handle_docker_workers: usize,
    pub event_retention_days: i64,
    pub service_retention_days: i64,
    pub cluster_mode: bool,
}

impl Default for StoreManagerConfig {
    fn default() -> Self {
        Self {
            message_max_number: 100_000,
            message_cache_number: 256,
            docker_cache_number: 512,
            handle_message_workers: 2,
            handle_sub_workers: 3,
            handle_docker_workers: 2,
            event_retention_days: 3,
            service_retention_days: 7,
            cluster_mode: false,
        }
    }
}

/// Payloads dropped at each ingestion point since start.
#[derive(Debug, Default)]
pub struct DropCounters {
    pub event: AtomicU64,
    pub docker: AtomicU64,
    pub monitor: AtomicU64,
    /// Monitor packets that were unreadable or named no service.
    pub invalid_monitor: AtomicU64,
    pub publish: AtomicU64,
}

impl DropCounters {
    pub fn snapshot(&self) -> [(&'static str, u64); 5] {
        [
            ("event", self.event.load(Ordering::Relaxed)),
            ("docker", self.docker.load(Ordering::Relaxed)),
            ("monitor", self.monitor.load(Ordering::Relaxed)),
            ("invalid_monitor", self.invalid_monitor.load(Ordering::Relaxed)),
            ("publish", self.publish.load(Ordering::Relaxed)),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub info: &'static str,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "health"
    }
}

struct Receivers {
    receive: mpsc::Receiver<Bytes>,
    sub: mpsc::Receiver<ClusterMessage>,
    docker: mpsc::Receiver<Bytes>,
    monitor: mpsc::Receiver<Bytes>,
}

pub struct StoreManager {
    config: StoreManagerConfig,
    files: Arc<FileStore>,
    garbage: Arc<GarbageSink>,
    metadata: Arc<dyn EventRecordStore>,
    handle: Arc<HandleMessageStore>,
    read: Arc<ReadMessageStore>,
    docker: Arc<DockerLogMessageStore>,
    monitor: Arc<MonitorMessageStore>,
    receive_tx: mpsc::Sender<Bytes>,
    sub_tx: mpsc::Sender<ClusterMessage>,
    pub_tx: mpsc::Sender<ClusterMessage>,
    docker_tx: mpsc::Sender<Bytes>,
    monitor_tx: mpsc::Sender<Bytes>,
    receivers: Mutex<Option<Receivers>>,
    pub_rx: Mutex<Option<mpsc::Receiver<ClusterMessage>>>,
    dropped: DropCounters,
}

impl StoreManager {
    pub fn new(
        config: StoreManagerConfig,
        files: Arc<FileStore>,
        garbage: Arc<GarbageSink>,
        metadata: Arc<dyn EventRecordStore>,
    ) -> Self {
        let handle = Arc::new(HandleMessageStore::new(
            Arc::clone(&files),
            Arc::clone(&garbage),
            Arc::clone(&metadata),
            config.message_max_number,
            config.message_cache_number,
        ));
        let read = Arc::new(ReadMessageStore::new(
            Arc::clone(&files),
            Arc::clone(&garbage),
        ));
        let docker = Arc::new(DockerLogMessageStore::new(
            Arc::clone(&files),
            Arc::clone(&garbage),
            config.docker_cache_number,
        ));
        let monitor = Arc::new(MonitorMessageStore::new());

        let (receive_tx, receive) = mpsc::channel(RECEIVE_CHAN_SIZE);
        let (sub_tx, sub) = mpsc::channel(SUB_CHAN_SIZE);
        let (pub_tx, pub_rx) = mpsc::channel(PUB_CHAN_SIZE);
        let (docker_tx, docker_rx) = mpsc::channel(DOCKER_LOG_CHAN_SIZE);
        let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_CHAN_SIZE);

        Self {
            config,
            files,
            garbage,
            metadata,
            handle,
            read,
            docker,
            monitor,
            receive_tx,
            sub_tx,
            pub_tx,
            docker_tx,
            monitor_tx,
            receivers: Mutex::new(Some(Receivers {
                receive,
                sub,
                docker: docker_rx,
                monitor: monitor_rx,
            })),
            pub_rx: Mutex::new(Some(pub_rx)),
            dropped: DropCounters::default(),
        }
    }

    pub fn config(&self) -> &StoreManagerConfig {
        &self.config
    }

    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    pub fn garbage(&self) -> &Arc<GarbageSink> {
        &self.garbage
    }

    pub fn dropped(&self) -> &DropCounters {
        &self.dropped
    }

    pub fn handle_store(&self) -> &Arc<HandleMessageStore> {
        &self.handle
    }

    pub fn read_store(&self) -> &Arc<ReadMessageStore> {
        &self.read
    }

    pub fn docker_store(&self) -> &Arc<DockerLogMessageStore> {
        &self.docker
    }

    pub fn monitor_store(&self) -> &Arc<MonitorMessageStore> {
        &self.monitor
    }

    fn store(&self, kind: StoreKind) -> &dyn MessageStore {
        match kind {
            StoreKind::Handle => self.handle.as_ref(),
            StoreKind::Read => self.read.as_ref(),
            StoreKind::DockerLog => self.docker.as_ref(),
            StoreKind::Monitor => self.monitor.as_ref(),
        }
    }

    fn shared_store(&self, kind: StoreKind) -> Arc<dyn MessageStore> {
        match kind {
            StoreKind::Handle => self.handle.clone(),
            StoreKind::Read => self.read.clone(),
            StoreKind::DockerLog => self.docker.clone(),
            StoreKind::Monitor => self.monitor.clone(),
        }
    }

    pub fn stores(&self) -> [&dyn MessageStore; 4] {
        [
            self.handle.as_ref(),
            self.read.as_ref(),
            self.docker.as_ref(),
            self.monitor.as_ref(),
        ]
    }

    /// Queues a raw operation-log payload. Returns false when it was dropped.
    pub fn push_event(&self, raw: Bytes) -> bool {
        match self.receive_tx.try_send(raw) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.event.fetch_add(1, Ordering::Relaxed);
                warn!("event message chan is full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn push_docker_log(&self, frame: Bytes) -> bool {
        match self.docker_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.docker.fetch_add(1, Ordering::Relaxed);
                warn!("docker log chan is full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn push_monitor(&self, packet: Bytes) -> bool {
        match self.monitor_tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.monitor.fetch_add(1, Ordering::Relaxed);
                warn!("monitor message chan is full, dropping packet");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queues a message replicated from a peer.
    pub fn push_sub(&self, message: ClusterMessage) -> bool {
        match self.sub_tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("sub message chan is full, dropping replicated message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn publish(&self, message: ClusterMessage) {
        if let Err(TrySendError::Full(_)) = self.pub_tx.try_send(message) {
            self.dropped.publish.fetch_add(1, Ordering::Relaxed);
            debug!("pub message chan is full, message not replicated");
        }
    }

    /// Messages to replicate to peers. Only the first caller gets it.
    pub fn take_pub_receiver(&self) -> Option<mpsc::Receiver<ClusterMessage>> {
        self.pub_rx.lock().take()
    }

    pub fn channel_usage(&self) -> [(&'static str, usize); 5] {
        fn used<T>(tx: &mpsc::Sender<T>) -> usize {
            tx.max_capacity() - tx.capacity()
        }
        [
            ("event_message", used(&self.receive_tx)),
            ("sub_message", used(&self.sub_tx)),
            ("pub_message", used(&self.pub_tx)),
            ("container_log", used(&self.docker_tx)),
            ("monitor_message", used(&self.monitor_tx)),
        ]
    }

    pub fn health_check(&self) -> HealthStatus {
        let blocked = self.receive_tx.capacity() == 0
            || self.sub_tx.capacity() == 0
            || self.pub_tx.capacity() == 0
            || self.docker_tx.capacity() == 0
            || self.monitor_tx.capacity() == 0;
        if blocked {
            HealthStatus {
                status: "unusual",
                info: "channel blockage",
            }
        } else {
            HealthStatus {
                status: "health",
                info: "eventlog service health",
            }
        }
    }

    /// Subscribes to a live stream. `mode` is `event`, `docker`, `monitor` or `newmonitor`.
    ///
    /// Runs on the blocking pool since a new barrel may load history from disk.
    pub async fn websocket_message_chan(
        &self,
        mode: &str,
        key: &str,
        sub_id: &str,
    ) -> Option<SubscriberRx> {
        let kind = StoreKind::from_mode(mode)?;
        if key.is_empty() {
            return None;
        }
        let store = self.shared_store(kind);
        let (key, sub_id) = (key.to_string(), sub_id.to_string());
        run_blocking(kind, move || store.sub_chan(&key, &sub_id))
            .await
            .flatten()
    }

    pub fn release_websocket_message_chan(&self, mode: &str, key: &str, sub_id: &str) {
        if let Some(kind) = StoreKind::from_mode(mode) {
            self.store(kind).release_sub_chan(key, sub_id);
        }
    }

    pub fn subscriber_count(&self, mode: &str, key: &str) -> usize {
        StoreKind::from_mode(mode).map_or(0, |kind| self.store(kind).subscriber_count(key))
    }

    /// This node's load across the stores that own long-lived barrels.
    pub fn monitor(&self) -> MonitorData {
        let mut data = self.docker.monitor_data();
        data.merge(&self.monitor.monitor_data());
        data.merge(&self.handle.monitor_data());
        data
    }

    pub fn docker_logs(&self, service_id: &str, length: usize) -> Vec<String> {
        self.docker.history_message(service_id, length)
    }

    pub fn event_logs(&self, event_id: &str, level: &str) -> io::Result<Vec<EventLogLine>> {
        self.files.read_event_log(event_id, level, 0)
    }

    fn handle_receive(&self, raw: Bytes) {
        let message = match parse_message(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("failed to decode event message: {}", e);
                if let Some(garbage) = e.into_garbage() {
                    self.garbage.insert(garbage);
                }
                return;
            }
        };
        if self.config.cluster_mode {
            self.publish(ClusterMessage::new(MessageMode::Event, raw));
        }
        self.insert(self.handle.as_ref(), message.clone());
        self.insert(self.read.as_ref(), message);
    }

    fn handle_sub(&self, message: ClusterMessage) {
        match message.mode {
            MessageMode::Event => match parse_message(&message.payload) {
                Ok(parsed) => self.insert(self.read.as_ref(), parsed),
                Err(e) => warn!("failed to decode replicated event message: {}", e),
            },
            MessageMode::NewMonitor => self.insert(
                self.monitor.as_ref(),
                EventLogMessage::monitor(message.payload.to_vec()),
            ),
            MessageMode::MonitorData => {
                debug!("monitor data is not routed through the sub channel")
            }
        }
    }

    fn handle_docker(&self, frame: Bytes) {
        match EventLogMessage::from_docker_frame(&frame) {
            Some(message) => self.insert(self.docker.as_ref(), message),
            None => debug!("ignoring short docker log frame of {} bytes", frame.len()),
        }
    }

    fn handle_monitor(&self, packet: Bytes) {
        if self.config.cluster_mode {
            self.publish(ClusterMessage::new(MessageMode::NewMonitor, packet.clone()));
        }
        self.insert(
            self.monitor.as_ref(),
            EventLogMessage::monitor(packet.to_vec()),
        );
    }

    fn insert(&self, store: &dyn MessageStore, message: EventLogMessage) {
        match store.insert_message(message) {
            Ok(()) => {}
            Err(e @ StoreError::Overflow { .. }) => debug!("{}", e),
            Err(e @ (StoreError::MissingKey | StoreError::UnreadableSamples(_)))
                if store.kind() == StoreKind::Monitor =>
            {
                self.dropped.invalid_monitor.fetch_add(1, Ordering::Relaxed);
                debug!("dropping monitor packet: {}", e);
            }
            Err(e) => warn!(store = store.kind().as_str(), "insert failed: {}", e),
        }
    }

    /// Starts every worker pool, the stores' background tasks and the daily cleanup.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(receivers) = self.receivers.lock().take() else {
            warn!("store manager is already running");
            return Vec::new();
        };
        let mut tasks = Vec::new();

        let manager = Arc::clone(&self);
        tasks.extend(spawn_workers(
            "event message",
            self.config.handle_message_workers,
            receivers.receive,
            &cancel,
            move |raw| manager.handle_receive(raw),
        ));
        let manager = Arc::clone(&self);
        tasks.extend(spawn_workers(
            "sub message",
            self.config.handle_sub_workers,
            receivers.sub,
            &cancel,
            move |message| manager.handle_sub(message),
        ));
        let manager = Arc::clone(&self);
        tasks.extend(spawn_workers(
            "docker log",
            self.config.handle_docker_workers,
            receivers.docker,
            &cancel,
            move |frame| manager.handle_docker(frame),
        ));
        let manager = Arc::clone(&self);
        tasks.extend(spawn_workers(
            "monitor message",
            1,
            receivers.monitor,
            &cancel,
            move |packet| manager.handle_monitor(packet),
        ));

        tasks.extend(Arc::clone(&self.handle).run(cancel.clone()));
        tasks.extend(Arc::clone(&self.read).run(cancel.clone()));
        tasks.extend(Arc::clone(&self.docker).run(cancel.clone()));
        tasks.extend(Arc::clone(&self.monitor).run(cancel.clone()));
        tasks.push(Arc::clone(&self.garbage).run(cancel.clone()));
        tasks.push(self.spawn_cleanup(cancel));
        info!("store manager started");
        tasks
    }

    fn spawn_cleanup(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.cleanup().await,
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Removes expired log files and event records.
    pub async fn cleanup(&self) {
        let now = OffsetDateTime::now_utc();
        let files = Arc::clone(&self.files);
        let (event_days, service_days) = (
            self.config.event_retention_days,
            self.config.service_retention_days,
        );
        match tokio::task::spawn_blocking(move || files.clean_expired(now, event_days, service_days))
            .await
        {
            Ok(Ok(report)) => info!(
                "log cleanup removed {} service files and {} event files",
                report.service_files, report.event_files
            ),
            Ok(Err(e)) => error!("log cleanup failed: {}", e),
            Err(e) => error!("log cleanup task failed: {}", e),
        }

        let cutoff = now - time::Duration::days(EVENT_RECORD_RETENTION_DAYS);
        match self.metadata.delete_before(cutoff).await {
            Ok(removed) => debug!("removed {} expired event records", removed),
            Err(e) => error!("failed to remove expired event records: {}", e),
        }
    }

    /// Flushes buffered messages of every store and the garbage sink.
    pub fn stop(&self) {
        for store in self.stores() {
            store.stop();
        }
        self.garbage.flush_logged();
        info!("store manager stopped");
    }
}

fn spawn_workers<T, F>(
    name: &'static str,
    count: usize,
    receiver: mpsc::Receiver<T>,
    cancel: &CancellationToken,
    handler: F,
) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    let handler = Arc::new(handler);
    (0..count.max(1))
        .map(|_| {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            next = receiver.recv() => next,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    match next {
                        Some(item) => handler(item),
                        None => break,
                    }
                }
                debug!("{} worker stopped", name);
            })
        })
        .collect()
}
