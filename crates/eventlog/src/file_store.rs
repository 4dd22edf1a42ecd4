// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only, file-backed persistence.
//!
//! Layout under the log home:
//!
//! ```text
//! eventlog/<event_id>.log      operation log, "<flag> <unix> <message>" per line
//! eventlog/<event_id>.replay   raw JSON records, one per line
//! <service_id>/stdout.log      live container log
//! <service_id>/Y-M-D.N.log.zst rotated, compressed container log
//! ```
//!
//! Writers for one key are serialised by the owning barrel, so every file has
//! a single writer at a time and lines keep their insertion order.

use crate::constants::{SERVICE_LOG_FILE, SERVICE_LOG_MAX_FILE_SIZE};
use crate::message::EventLogMessage;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::{Date, Duration, Month, OffsetDateTime};
use tracing::{debug, warn};

const EVENT_LOG_DIR: &str = "eventlog";
const TAIL_CHUNK: u64 = 8192;
const ZSTD_LEVEL: i32 = 3;

/// One line of a persisted operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLogLine {
    pub message: String,
    pub time: String,
    #[serde(rename = "utime")]
    pub unix_time: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub service_files: usize,
    pub event_files: usize,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    home: PathBuf,
    max_service_file_size: u64,
}

impl FileStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            max_service_file_size: SERVICE_LOG_MAX_FILE_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_service_file_size(mut self, size: u64) -> Self {
        self.max_service_file_size = size;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn event_log_path(&self, event_id: &str) -> io::Result<PathBuf> {
        Ok(self
            .home
            .join(EVENT_LOG_DIR)
            .join(format!("{}.log", checked_key(event_id)?)))
    }

    pub fn replay_path(&self, event_id: &str) -> io::Result<PathBuf> {
        Ok(self
            .home
            .join(EVENT_LOG_DIR)
            .join(format!("{}.replay", checked_key(event_id)?)))
    }

    pub fn service_log_path(&self, service_id: &str) -> io::Result<PathBuf> {
        Ok(self
            .home
            .join(checked_key(service_id)?)
            .join(SERVICE_LOG_FILE))
    }

    /// Appends operation-log lines. A message whose time does not parse
    /// reuses the last good timestamp of the batch.
    pub fn append_event_log(&self, event_id: &str, messages: &[EventLogMessage]) -> io::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = self.event_log_path(event_id)?;
        let mut out = String::new();
        let mut last_time = 0;
        for message in messages {
            if let Some(parsed) = message.unix_time() {
                last_time = parsed;
            }
            out.push_str(level_flag(&message.level));
            out.push(' ');
            out.push_str(&last_time.to_string());
            out.push(' ');
            out.push_str(&message.message);
            out.push('\n');
        }
        append(&path, out.as_bytes())
    }

    /// Reads an operation log, keeping lines visible at `level`.
    /// `length == 0` means no limit.
    pub fn read_event_log(
        &self,
        event_id: &str,
        level: &str,
        length: usize,
    ) -> io::Result<Vec<EventLogLine>> {
        let path = self.event_log_path(event_id)?;
        let mut raw = String::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_string(&mut raw)?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        let mut lines = Vec::new();
        for line in raw.lines() {
            let mut parts = line.splitn(3, ' ');
            let (Some(flag), Some(unix), Some(message)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if !check_level(flag, level) {
                continue;
            }
            let unix_time = unix.parse::<i64>().unwrap_or_default();
            let time = OffsetDateTime::from_unix_timestamp(unix_time)
                .ok()
                .and_then(|t| t.format(&Rfc3339).ok())
                .unwrap_or_default();
            lines.push(EventLogLine {
                message: message.to_string(),
                time,
                unix_time,
            });
            if length != 0 && lines.len() >= length {
                break;
            }
        }
        Ok(lines)
    }

    /// Appends one replay record per message.
    pub fn append_replay(&self, event_id: &str, messages: &[EventLogMessage]) -> io::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = self.replay_path(event_id)?;
        let mut out = Vec::new();
        for message in messages {
            if message.content.is_empty() || message.content.contains(&b'\n') {
                out.extend(serde_json::to_vec(message)?);
            } else {
                out.extend_from_slice(&message.content);
            }
            out.push(b'\n');
        }
        append(&path, &out)
    }

    /// Last `length` replay records in insertion order. Unreadable lines are skipped.
    pub fn read_replay_tail(&self, event_id: &str, length: usize) -> io::Result<Vec<EventLogMessage>> {
        let path = self.replay_path(event_id)?;
        let lines = read_last_lines(&path, length)?;
        Ok(lines
            .into_iter()
            .filter_map(|line| {
                let mut message: EventLogMessage = serde_json::from_str(&line).ok()?;
                message.content = line.into_bytes();
                Some(message)
            })
            .collect())
    }

    /// Appends container lines, rotating the live file first when it belongs
    /// to a past day or has reached the size cap.
    pub fn append_service_log(
        &self,
        service_id: &str,
        messages: &[EventLogMessage],
    ) -> io::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = self.service_log_path(service_id)?;
        self.rotate_if_needed(&path, OffsetDateTime::now_utc().date())?;
        let mut out = Vec::new();
        for message in messages {
            out.extend_from_slice(message.message.as_bytes());
            if !message.message.ends_with('\n') {
                out.push(b'\n');
            }
        }
        append(&path, &out)
    }

    pub fn read_service_tail(&self, service_id: &str, length: usize) -> io::Result<Vec<String>> {
        read_last_lines(&self.service_log_path(service_id)?, length)
    }

    fn rotate_if_needed(&self, path: &Path, today: Date) -> io::Result<()> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        let written = OffsetDateTime::from(metadata.modified()?).date();
        if written == today && metadata.len() < self.max_service_file_size {
            return Ok(());
        }
        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let mut index = 1;
        let target = loop {
            let candidate = dir.join(format!("{}.{}.log.zst", dated_name(written), index));
            if !candidate.exists() {
                break candidate;
            }
            index += 1;
        };
        let input = File::open(path)?;
        let output = File::create(&target)?;
        zstd::stream::copy_encode(input, output, ZSTD_LEVEL)?;
        fs::remove_file(path)?;
        debug!("rotated service log {} to {}", path.display(), target.display());
        Ok(())
    }

    /// Removes dated service archives and operation logs past their retention.
    pub fn clean_expired(
        &self,
        now: OffsetDateTime,
        event_retention_days: i64,
        service_retention_days: i64,
    ) -> io::Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let entries = match fs::read_dir(&self.home) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err),
        };

        let service_cutoff = now.date() - Duration::days(service_retention_days);
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || entry.file_name() == EVENT_LOG_DIR {
                continue;
            }
            for file in fs::read_dir(&dir)?.flatten() {
                let name = file.file_name().to_string_lossy().into_owned();
                if name == SERVICE_LOG_FILE {
                    continue;
                }
                let Some(date) = parse_dated_name(&name) else {
                    continue;
                };
                if date < service_cutoff {
                    match fs::remove_file(file.path()) {
                        Ok(()) => report.service_files += 1,
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(err) => warn!("delete service log {} failed: {}", name, err),
                    }
                }
            }
        }

        let event_cutoff = now - Duration::days(event_retention_days);
        if let Ok(entries) = fs::read_dir(self.home.join(EVENT_LOG_DIR)) {
            for entry in entries.flatten() {
                let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };
                if OffsetDateTime::from(modified) < event_cutoff {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => report.event_files += 1,
                        Err(err) => warn!(
                            "delete event log {} failed: {}",
                            entry.path().display(),
                            err
                        ),
                    }
                }
            }
        }
        Ok(report)
    }
}

/// `0` is error, `1` info, `2` debug; anything else is treated as an error line.
pub fn level_flag(level: &str) -> &'static str {
    match level {
        "info" => "1",
        "debug" => "2",
        _ => "0",
    }
}

pub fn check_level(flag: &str, level: &str) -> bool {
    match flag {
        "0" => true,
        "1" => level != "error",
        "2" => level == "debug",
        _ => false,
    }
}

fn dated_name(date: Date) -> String {
    format!("{}-{}-{}", date.year(), u8::from(date.month()), date.day())
}

fn parse_dated_name(name: &str) -> Option<Date> {
    let stem = name.split('.').next()?;
    let mut parts = stem.split('-');
    let year = parts.next()?.parse::<i32>().ok()?;
    let month = Month::try_from(parts.next()?.parse::<u8>().ok()?).ok()?;
    let day = parts.next()?.parse::<u8>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Date::from_calendar_date(year, month, day).ok()
}

/// Keys become file names, so anything that could escape the log home is refused.
fn checked_key(key: &str) -> io::Result<&str> {
    if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid log key {:?}", key),
        ));
    }
    Ok(key)
}

fn append(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)
}

/// Reads backwards in fixed chunks until `length` full lines are available.
fn read_last_lines(path: &Path, length: usize) -> io::Result<Vec<String>> {
    if length == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut pos = file.metadata()?.len();
    let mut tail: Vec<u8> = Vec::new();
    let mut newlines = 0;
    while pos > 0 && newlines <= length {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|b| **b == b'\n').count();
        chunk.extend_from_slice(&tail);
        tail = chunk;
    }
    let text = String::from_utf8_lossy(&tail);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(length);
    Ok(lines[skip..].iter().map(|line| (*line).to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn message(level: &str, text: &str, time: &str) -> EventLogMessage {
        EventLogMessage {
            event_id: "E1".to_string(),
            level: level.to_string(),
            message: text.to_string(),
            time: time.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_log_format_and_level_filter() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        store
            .append_event_log(
                "E1",
                &[
                    message("error", "boom", "2024-01-02T03:04:05+00:00"),
                    message("info", "working", "not a time"),
                    message("debug", "detail", "2024-01-02T03:04:06"),
                ],
            )
            .expect("append");

        let raw = fs::read_to_string(store.event_log_path("E1").expect("path")).expect("read");
        assert_eq!(
            raw,
            "0 1704164645 boom\n1 1704164645 working\n2 1704164646 detail\n"
        );

        let errors = store.read_event_log("E1", "error", 0).expect("read");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");

        let info = store.read_event_log("E1", "info", 0).expect("read");
        assert_eq!(info.len(), 2);

        let debug = store.read_event_log("E1", "debug", 0).expect("read");
        assert_eq!(debug.len(), 3);
        assert_eq!(debug[2].unix_time, 1_704_164_646);
        assert_eq!(debug[2].time, "2024-01-02T03:04:06Z");

        assert_eq!(store.read_event_log("E1", "debug", 2).expect("read").len(), 2);
        assert!(store.read_event_log("missing", "debug", 0).expect("read").is_empty());
    }

    #[test]
    fn test_replay_tail_keeps_order() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let page: Vec<_> = (0..50)
            .map(|i| {
                let raw = format!(r#"{{"event_id":"E1","message":"m{}"}}"#, i);
                let mut m = message("info", &format!("m{}", i), "");
                m.content = raw.into_bytes();
                m
            })
            .collect();
        store.append_replay("E1", &page[..20]).expect("append");
        store.append_replay("E1", &page[20..]).expect("append");
        let tail = store.read_replay_tail("E1", 5).expect("tail");
        let texts: Vec<_> = tail.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["m45", "m46", "m47", "m48", "m49"]);
        assert_eq!(store.read_replay_tail("E1", 500).expect("tail").len(), 50);
    }

    #[test]
    fn test_tail_spans_chunks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("big.log");
        let line = "x".repeat(1000);
        let mut content = String::new();
        for i in 0..40 {
            content.push_str(&format!("{} {}\n", i, line));
        }
        fs::write(&path, content).expect("write");
        let tail = read_last_lines(&path, 20).expect("tail");
        assert_eq!(tail.len(), 20);
        assert!(tail[0].starts_with("20 "));
        assert!(tail[19].starts_with("39 "));
    }

    #[test]
    fn test_service_log_rotates_on_size() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).with_max_service_file_size(10);
        let line = EventLogMessage {
            message: "abcdef0123:first line".to_string(),
            ..Default::default()
        };
        store.append_service_log("svc", &[line.clone()]).expect("append");
        store.append_service_log("svc", &[line]).expect("append");

        let archives: Vec<_> = fs::read_dir(dir.path().join("svc"))
            .expect("dir")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".log.zst"))
            .collect();
        assert_eq!(archives.len(), 1);
        assert!(archives[0].ends_with(".1.log.zst"));

        let archived = fs::read(dir.path().join("svc").join(&archives[0])).expect("read");
        let decoded = zstd::stream::decode_all(&archived[..]).expect("decode");
        assert_eq!(decoded, b"abcdef0123:first line\n".to_vec());
        assert_eq!(
            store.read_service_tail("svc", 10).expect("tail"),
            vec!["abcdef0123:first line".to_string()]
        );
    }

    #[test]
    fn test_clean_expired_keeps_live_file() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let service_dir = dir.path().join("svc");
        fs::create_dir_all(&service_dir).expect("dir");
        fs::write(service_dir.join("2020-1-2.1.log.zst"), b"old").expect("write");
        fs::write(service_dir.join(SERVICE_LOG_FILE), b"live").expect("write");
        let today = OffsetDateTime::now_utc();
        fs::write(
            service_dir.join(format!("{}.1.log.zst", dated_name(today.date()))),
            b"fresh",
        )
        .expect("write");
        store
            .append_event_log("E1", &[message("info", "x", "")])
            .expect("append");

        let report = store.clean_expired(today, 3, 7).expect("clean");
        assert_eq!(report.service_files, 1);
        assert_eq!(report.event_files, 0);
        assert!(service_dir.join(SERVICE_LOG_FILE).exists());
        assert!(!service_dir.join("2020-1-2.1.log.zst").exists());

        let later = today + Duration::days(4);
        let report = store.clean_expired(later, 3, 7).expect("clean");
        assert_eq!(report.event_files, 1);
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let store = FileStore::new("/tmp/logs");
        assert!(store.event_log_path("../etc").is_err());
        assert!(store.service_log_path("a/b").is_err());
        assert!(store.replay_path("").is_err());
    }

    #[test]
    fn test_dated_names() {
        let date = Date::from_calendar_date(2024, Month::March, 5).expect("date");
        assert_eq!(dated_name(date), "2024-3-5");
        assert_eq!(parse_dated_name("2024-3-5.2.log.zst"), Some(date));
        assert_eq!(parse_dated_name("stdout.log"), None);
    }
}
