// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-side client for the operation-log ingestion port.
//!
//! A [`LogClientManager`] is built once per process and handed to every
//! component that reports operation progress. It keeps one connection task per
//! server, each fed by a bounded cache channel, and hands out [`Logger`]s keyed
//! by event id. Sends never block: when a cache is full the line is dropped.

use crate::constants::{
    CLIENT_CACHE_SIZE, CLIENT_GC_INTERVAL, CLIENT_LOGGER_TTL, CLIENT_RECONNECT_INTERVAL,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event id used when a caller has none.
pub const SYSTEM_EVENT_ID: &str = "system";

const ACK_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LogClientConfig {
    /// `host:port` of every event-log ingestion endpoint.
    pub servers: Vec<String>,
    pub cache_size: usize,
    pub reconnect_interval: Duration,
    pub logger_ttl: Duration,
    pub gc_interval: Duration,
}

impl LogClientConfig {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            cache_size: CLIENT_CACHE_SIZE,
            reconnect_interval: CLIENT_RECONNECT_INTERVAL,
            logger_ttl: CLIENT_LOGGER_TTL,
            gc_interval: CLIENT_GC_INTERVAL,
        }
    }
}

struct Server {
    index: usize,
    address: String,
    cache: mpsc::Sender<Bytes>,
    abnormal: AtomicBool,
}

struct LoggerEntry {
    server: usize,
    last_used: Instant,
}

struct Inner {
    config: LogClientConfig,
    servers: Vec<Arc<Server>>,
    loggers: Mutex<HashMap<String, LoggerEntry>>,
    next: AtomicUsize,
}

impl Inner {
    fn pick_server(&self, excluding: Option<usize>) -> Option<usize> {
        let count = self.servers.len();
        if count == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let healthy = (0..count).map(|offset| (start + offset) % count).find(|&index| {
            Some(index) != excluding && !self.servers[index].abnormal.load(Ordering::Relaxed)
        });
        healthy.or(Some(start % count))
    }

    fn route(&self, event_id: &str) -> Option<Arc<Server>> {
        let mut loggers = self.loggers.lock();
        let index = match loggers.get_mut(event_id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                entry.server
            }
            None => {
                let server = self.pick_server(None)?;
                loggers.insert(
                    event_id.to_string(),
                    LoggerEntry {
                        server,
                        last_used: Instant::now(),
                    },
                );
                server
            }
        };
        self.servers.get(index).cloned()
    }

    fn send(&self, event_id: &str, line: Bytes) {
        let Some(server) = self.route(event_id) else {
            debug!(event_id, "no event log server configured, dropping line");
            return;
        };
        match server.cache.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(event_id, server = server.address.as_str(), "log client cache is full, dropping line");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(event_id, "log client is stopped, dropping line");
            }
        }
    }

    /// Moves every logger bound to a failed server onto a healthy one.
    fn reassign(&self, failed: usize) -> usize {
        let mut moved = 0;
        let mut loggers = self.loggers.lock();
        for entry in loggers.values_mut().filter(|entry| entry.server == failed) {
            if let Some(server) = self.pick_server(Some(failed)) {
                if server != failed {
                    entry.server = server;
                    moved += 1;
                }
            }
        }
        moved
    }

    fn gc(&self, now: Instant) -> usize {
        let ttl = self.config.logger_ttl;
        let mut loggers = self.loggers.lock();
        let before = loggers.len();
        loggers.retain(|_, entry| now.saturating_duration_since(entry.last_used) < ttl);
        before - loggers.len()
    }
}

pub struct LogClientManager {
    inner: Arc<Inner>,
    receivers: Mutex<Vec<mpsc::Receiver<Bytes>>>,
    cancel: CancellationToken,
}

impl LogClientManager {
    pub fn new(config: LogClientConfig) -> Self {
        let mut servers = Vec::with_capacity(config.servers.len());
        let mut receivers = Vec::with_capacity(config.servers.len());
        for (index, address) in config.servers.iter().enumerate() {
            let (cache, rx) = mpsc::channel(config.cache_size.max(1));
            servers.push(Arc::new(Server {
                index,
                address: address.clone(),
                cache,
                abnormal: AtomicBool::new(false),
            }));
            receivers.push(rx);
        }
        Self {
            inner: Arc::new(Inner {
                config,
                servers,
                loggers: Mutex::new(HashMap::new()),
                next: AtomicUsize::new(0),
            }),
            receivers: Mutex::new(receivers),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the connection tasks and the logger sweep. Later calls spawn nothing.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let receivers: Vec<_> = self.receivers.lock().drain(..).collect();
        if receivers.is_empty() {
            return Vec::new();
        }
        let (failures, mut failed) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(receivers.len() + 2);
        for (server, rx) in self.inner.servers.iter().zip(receivers) {
            handles.push(tokio::spawn(run_connection(
                Arc::clone(server),
                rx,
                self.inner.config.reconnect_interval,
                failures.clone(),
                self.cancel.clone(),
            )));
        }

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let index = tokio::select! {
                    index = failed.recv() => index,
                    _ = cancel.cancelled() => break,
                };
                let Some(index) = index else { break };
                let moved = inner.reassign(index);
                if moved > 0 {
                    info!("moved {} loggers off event log server {}", moved, inner.servers[index].address);
                }
            }
        }));

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            let period = inner.config.gc_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let released = inner.gc(Instant::now());
                        if released > 0 {
                            debug!("released {} idle loggers", released);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));
        handles
    }

    pub fn get_logger(&self, event_id: &str) -> Logger {
        let event_id = if event_id.is_empty() {
            SYSTEM_EVENT_ID
        } else {
            event_id
        };
        self.inner.route(event_id);
        Logger {
            event_id: event_id.to_string(),
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn release_logger(&self, logger: &Logger) {
        self.inner.loggers.lock().remove(&logger.event_id);
    }

    pub fn logger_count(&self) -> usize {
        self.inner.loggers.lock().len()
    }

    /// Address of the server the event id is currently bound to.
    pub fn logger_server(&self, event_id: &str) -> Option<String> {
        let index = self.inner.loggers.lock().get(event_id)?.server;
        self.inner.servers.get(index).map(|server| server.address.clone())
    }

    /// Closes every connection after flushing what is already queued.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    server: Arc<Server>,
    mut cache: mpsc::Receiver<Bytes>,
    reconnect_interval: Duration,
    failures: mpsc::UnboundedSender<usize>,
    cancel: CancellationToken,
) {
    let mut pending: Option<Bytes> = None;
    loop {
        let connected = tokio::select! {
            connected = TcpStream::connect(&server.address) => connected,
            _ = cancel.cancelled() => return,
        };
        match connected {
            Ok(stream) => {
                server.abnormal.store(false, Ordering::Relaxed);
                debug!(server = server.address.as_str(), "connected to event log server");
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                if let Some(line) = pending.take() {
                    if let Err(e) = framed.send(line.clone()).await {
                        warn!(server = server.address.as_str(), "event log write failed: {}", e);
                        pending = Some(line);
                    }
                }
                if pending.is_none() {
                    match forward(&mut framed, &mut cache, &cancel).await {
                        Forwarded::Closed => {
                            finish(framed, &server.address).await;
                            return;
                        }
                        Forwarded::Failed(line, e) => {
                            warn!(server = server.address.as_str(), "event log write failed: {}", e);
                            pending = Some(line);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(server = server.address.as_str(), "failed to connect to event log server: {}", e);
            }
        }
        server.abnormal.store(true, Ordering::Relaxed);
        let _ = failures.send(server.index);
        tokio::select! {
            _ = tokio::time::sleep(reconnect_interval) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

enum Forwarded {
    Closed,
    Failed(Bytes, io::Error),
}

async fn forward(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    cache: &mut mpsc::Receiver<Bytes>,
    cancel: &CancellationToken,
) -> Forwarded {
    loop {
        let line = tokio::select! {
            line = cache.recv() => line,
            _ = cancel.cancelled() => None,
        };
        let Some(line) = line else {
            while let Ok(line) = cache.try_recv() {
                if let Err(e) = framed.send(line.clone()).await {
                    return Forwarded::Failed(line, e);
                }
            }
            return Forwarded::Closed;
        };
        if let Err(e) = framed.send(line.clone()).await {
            return Forwarded::Failed(line, e);
        }
    }
}

/// Half-closes the stream and waits briefly for the server's ack.
async fn finish(mut framed: Framed<TcpStream, LengthDelimitedCodec>, address: &str) {
    if let Err(e) = SinkExt::<Bytes>::close(&mut framed).await {
        debug!(server = address, "failed to close event log stream: {}", e);
        return;
    }
    match tokio::time::timeout(ACK_WAIT, framed.next()).await {
        Ok(Some(Ok(ack))) => debug!(server = address, "event log stream acked: {:?}", ack),
        _ => debug!(server = address, "event log stream closed without ack"),
    }
}

/// Operation-progress reporter bound to one event id.
#[derive(Clone)]
pub struct Logger {
    event_id: String,
    inner: Arc<Inner>,
}

impl Logger {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn info(&self, message: &str, fields: &[(&str, &str)]) {
        self.send("info", message, fields);
    }

    pub fn error(&self, message: &str, fields: &[(&str, &str)]) {
        self.send("error", message, fields);
    }

    pub fn debug(&self, message: &str, fields: &[(&str, &str)]) {
        self.send("debug", message, fields);
    }

    /// An `io::Write` sink that reports every write as one `step` line.
    pub fn writer(&self, step: &str, level: &str) -> LoggerWriter {
        LoggerWriter {
            logger: self.clone(),
            step: step.to_string(),
            level: level.to_string(),
        }
    }

    fn send(&self, level: &str, message: &str, fields: &[(&str, &str)]) {
        let line = encode_line(&self.event_id, level, message, fields);
        self.inner.send(&self.event_id, line);
    }
}

fn encode_line(event_id: &str, level: &str, message: &str, fields: &[(&str, &str)]) -> Bytes {
    let mut record = Map::new();
    for (key, value) in fields {
        record.insert((*key).to_string(), Value::String((*value).to_string()));
    }
    record.insert("event_id".to_string(), Value::String(event_id.to_string()));
    record.insert("message".to_string(), Value::String(message.to_string()));
    record.insert("level".to_string(), Value::String(level.to_string()));
    let time = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    record.insert("time".to_string(), Value::String(time));
    Bytes::from(Value::Object(record).to_string())
}

pub struct LoggerWriter {
    logger: Logger,
    step: String,
    level: String,
}

impl io::Write for LoggerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text: String = String::from_utf8_lossy(buf)
            .chars()
            .filter(|c| !matches!(c, '\r' | '\n' | '\0' | '"'))
            .collect();
        if !text.is_empty() {
            self.logger
                .send(&self.level, &text, &[("step", self.step.as_str())]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    async fn next_record(frames: &mut FramedRead<TcpStream, LengthDelimitedCodec>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("frame in time")
            .expect("open stream")
            .expect("valid frame");
        serde_json::from_slice(&frame).expect("json")
    }

    fn config(servers: Vec<String>) -> LogClientConfig {
        LogClientConfig {
            reconnect_interval: Duration::from_millis(20),
            ..LogClientConfig::new(servers)
        }
    }

    #[tokio::test]
    async fn test_logger_sends_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let manager = LogClientManager::new(config(vec![address]));
        let handles = manager.start();

        let logger = manager.get_logger("E1");
        logger.info("pulling image", &[("step", "progress")]);
        let mut writer = logger.writer("build", "debug");
        writer.write_all(b"line \"one\"\r\n").expect("write");

        let (stream, _) = listener.accept().await.expect("accept");
        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
        let first = next_record(&mut frames).await;
        assert_eq!(first["event_id"], "E1");
        assert_eq!(first["message"], "pulling image");
        assert_eq!(first["level"], "info");
        assert_eq!(first["step"], "progress");
        assert!(first["time"].as_str().is_some_and(|t| !t.is_empty()));

        let second = next_record(&mut frames).await;
        assert_eq!(second["message"], "line one");
        assert_eq!(second["level"], "debug");
        assert_eq!(second["step"], "build");

        manager.stop();
        for handle in handles {
            handle.await.expect("task");
        }
    }

    #[tokio::test]
    async fn test_empty_event_id_maps_to_system() {
        let manager = LogClientManager::new(config(vec!["127.0.0.1:1".to_string()]));
        let logger = manager.get_logger("");
        assert_eq!(logger.event_id(), SYSTEM_EVENT_ID);
        assert_eq!(manager.logger_count(), 1);
        manager.release_logger(&logger);
        assert_eq!(manager.logger_count(), 0);
    }

    #[tokio::test]
    async fn test_loggers_round_robin_and_expire() {
        let manager = LogClientManager::new(config(vec![
            "127.0.0.1:1".to_string(),
            "127.0.0.1:2".to_string(),
        ]));
        manager.get_logger("a");
        manager.get_logger("b");
        assert_ne!(manager.logger_server("a"), manager.logger_server("b"));

        let later = Instant::now() + CLIENT_LOGGER_TTL;
        assert_eq!(manager.inner.gc(later), 2);
        assert_eq!(manager.logger_count(), 0);
    }

    #[tokio::test]
    async fn test_loggers_move_off_failed_server() {
        let dead = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let dead_address = dead.local_addr().expect("addr").to_string();
        drop(dead);
        let live = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let live_address = live.local_addr().expect("addr").to_string();

        let manager = LogClientManager::new(config(vec![dead_address.clone(), live_address.clone()]));
        let logger = manager.get_logger("E9");
        assert_eq!(manager.logger_server("E9"), Some(dead_address));
        let handles = manager.start();

        let mut moved = false;
        for _ in 0..100 {
            if manager.logger_server("E9").as_deref() == Some(live_address.as_str()) {
                moved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(moved, "logger stayed on the failed server");

        logger.error("boom", &[]);
        let (stream, _) = live.accept().await.expect("accept");
        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
        let record = next_record(&mut frames).await;
        assert_eq!(record["message"], "boom");
        assert_eq!(record["level"], "error");

        manager.stop();
        for handle in handles {
            handle.await.expect("task");
        }
    }
}
