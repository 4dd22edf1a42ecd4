// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::GARBAGE_FLUSH_INTERVAL;
use crate::message::EventLogMessage;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Collects messages that could not be decoded or persisted and appends them
/// to a single forensic file.
#[derive(Debug)]
pub struct GarbageSink {
    path: PathBuf,
    buffer: Mutex<Vec<EventLogMessage>>,
}

impl GarbageSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&self, message: EventLogMessage) {
        self.buffer.lock().push(message);
    }

    pub fn extend(&self, messages: impl IntoIterator<Item = EventLogMessage>) {
        self.buffer.lock().extend(messages);
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Appends everything buffered to the garbage file.
    pub fn flush(&self) -> io::Result<usize> {
        let messages = std::mem::take(&mut *self.buffer.lock());
        if messages.is_empty() {
            return Ok(0);
        }
        let mut out = String::new();
        for message in &messages {
            out.push_str(&format_line(message));
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(out.as_bytes())?;
        Ok(messages.len())
    }

    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GARBAGE_FLUSH_INTERVAL);
            ticker.tick().await;
            loop {
                let stopping = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = cancel.cancelled() => true,
                };
                let sink = Arc::clone(&self);
                if let Err(e) = tokio::task::spawn_blocking(move || sink.flush_logged()).await {
                    error!("garbage flush task failed: {}", e);
                }
                if stopping {
                    break;
                }
            }
        })
    }

    pub(crate) fn flush_logged(&self) {
        match self.flush() {
            Ok(0) => {}
            Ok(written) => debug!("wrote {} garbage messages", written),
            Err(e) => error!("failed to write garbage file {}: {}", self.path.display(), e),
        }
    }
}

fn format_line(message: &EventLogMessage) -> String {
    let text = if message.message.is_empty() {
        String::from_utf8_lossy(&message.content).into_owned()
    } else {
        message.message.clone()
    };
    format!(
        "({}-{}) {}: {}\n",
        message.step,
        message.level,
        message.time,
        text.trim_end_matches('\n')
    )
}
