// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical message model shared by every ingestion path and store.
//!
//! Operation logs arrive as JSON objects and keep their raw bytes in
//! [`EventLogMessage::content`] so they can be replayed verbatim. Monitor
//! samples carry a JSON array of [`MonitorMessage`] in
//! [`EventLogMessage::monitor_data`] instead.

use crate::constants::MAX_MESSAGE_SIZE;
use crate::errors::DecodeError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

const CONTAINER_ID_LEN: usize = 12;
const SERVICE_ID_START: usize = 13;
const SERVICE_ID_END: usize = 45;
const MIN_DOCKER_FRAME_LEN: usize = 47;

/// Platform components whose container logs are grouped under a fixed name.
const PLATFORM_SERVICES: [&str; 4] = ["rbd-api", "rbd-worker", "rbd-gateway", "rbd-chaos"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLogMessage {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub time: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    #[serde(skip)]
    pub monitor_data: Vec<u8>,
}

/// Well-known values of [`EventLogMessage::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Progress,
    Last,
    Callback,
    CodeVersion,
    Other,
}

impl Step {
    pub fn parse(step: &str) -> Self {
        match step {
            "progress" => Step::Progress,
            "last" => Step::Last,
            "callback" => Step::Callback,
            "code-version" => Step::CodeVersion,
            _ => Step::Other,
        }
    }

    /// `last` and `callback` close an operation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Last | Step::Callback)
    }
}

impl EventLogMessage {
    /// Wraps bytes that could not be decoded so they can still be inspected.
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self {
            content: raw,
            ..Default::default()
        }
    }

    pub fn monitor(payload: Vec<u8>) -> Self {
        Self {
            monitor_data: payload,
            ..Default::default()
        }
    }

    pub fn step_kind(&self) -> Step {
        Step::parse(&self.step)
    }

    /// Bytes pushed to subscribers: monitor data when present, raw content otherwise.
    pub fn payload(&self) -> &[u8] {
        if self.monitor_data.is_empty() {
            &self.content
        } else {
            &self.monitor_data
        }
    }

    /// Parses [`EventLogMessage::time`], falling back to a zone-less layout read as UTC.
    pub fn unix_time(&self) -> Option<i64> {
        parse_unix_time(&self.time)
    }

    /// Builds a container-log message from a docker frame.
    ///
    /// Layout: 12 bytes container ID, one separator, then the service ID and
    /// the line. Frames shorter than 47 bytes carry no line and are ignored.
    pub fn from_docker_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < MIN_DOCKER_FRAME_LEN {
            return None;
        }
        let container_id = String::from_utf8_lossy(&frame[..CONTAINER_ID_LEN]);
        let service_id =
            normalize_service_id(&String::from_utf8_lossy(&frame[SERVICE_ID_START..SERVICE_ID_END]));
        let line = frame
            .get(SERVICE_ID_START + service_id.len()..)
            .unwrap_or_default();
        let text = format!("{}:{}", container_id, String::from_utf8_lossy(line));
        Some(Self {
            event_id: service_id,
            content: text.as_bytes().to_vec(),
            message: text,
            ..Default::default()
        })
    }
}

/// Decodes one operation-log payload.
///
/// Oversized and empty payloads are refused outright; anything that fails
/// later keeps its raw bytes so the caller can divert it to the garbage sink.
pub fn parse_message(raw: &[u8]) -> Result<EventLogMessage, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(DecodeError::TooLarge(raw.len()));
    }
    let mut message: EventLogMessage = match serde_json::from_slice(raw) {
        Ok(message) => message,
        Err(source) => {
            return Err(DecodeError::Malformed {
                source,
                garbage: Box::new(EventLogMessage::from_raw(raw.to_vec())),
            })
        }
    };
    message.content = raw.to_vec();
    if message.event_id.is_empty() {
        return Err(DecodeError::MissingEventId(Box::new(message)));
    }
    Ok(message)
}

fn normalize_service_id(raw: &str) -> String {
    PLATFORM_SERVICES
        .iter()
        .find(|name| raw.contains(*name))
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| raw.to_string())
}

pub fn parse_unix_time(value: &str) -> Option<i64> {
    if let Ok(parsed) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some(parsed.unix_timestamp());
    }
    let layout = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let seconds = value.split('.').next().unwrap_or(value);
    PrimitiveDateTime::parse(seconds, &layout)
        .ok()
        .map(|parsed| parsed.assume_utc().unix_timestamp())
}

/// Tag carried in front of every cluster pub/sub frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMode {
    /// Raw operation-log JSON, fanned out through the read store.
    Event,
    /// Raw monitor sample array, fanned out through the monitor store.
    NewMonitor,
    /// A peer's [`MonitorData`] load snapshot.
    MonitorData,
}

impl MessageMode {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageMode::Event => 1,
            MessageMode::NewMonitor => 2,
            MessageMode::MonitorData => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageMode::Event),
            2 => Some(MessageMode::NewMonitor),
            3 => Some(MessageMode::MonitorData),
            _ => None,
        }
    }
}

/// A payload travelling between nodes, tagged with how to route it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMessage {
    pub mode: MessageMode,
    pub payload: Bytes,
}

impl ClusterMessage {
    pub fn new(mode: MessageMode, payload: impl Into<Bytes>) -> Self {
        Self {
            mode,
            payload: payload.into(),
        }
    }

    /// One tag byte followed by the payload.
    pub fn to_frame(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(self.payload.len() + 1);
        frame.put_u8(self.mode.as_byte());
        frame.extend_from_slice(&self.payload);
        frame.freeze()
    }

    pub fn from_frame(mut frame: Bytes) -> Option<Self> {
        if frame.is_empty() {
            return None;
        }
        let mode = MessageMode::from_byte(frame[0])?;
        let payload = frame.split_off(1);
        Some(Self { mode, payload })
    }
}

/// Per-node load snapshot used by the distribution component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorData {
    #[serde(default)]
    pub instance_id: String,
    pub service_size: u64,
    pub log_size_peer_m: u64,
}

impl MonitorData {
    pub fn merge(&mut self, other: &MonitorData) {
        self.service_size += other.service_size;
        self.log_size_peer_m += other.log_size_peer_m;
    }
}

/// One performance sample reported by a service's sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorMessage {
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub cumulative_time: f64,
    #[serde(default)]
    pub average_time: f64,
    #[serde(default)]
    pub max_time: f64,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub abnormal_count: u64,
}

/// Rounds half up to `places` decimals, truncating the remainder.
pub fn round(value: f64, places: i32) -> f64 {
    let pow = 10f64.powi(places);
    ((value + 0.5 / pow) * pow).trunc() / pow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message() {
        let raw = br#"{"event_id":"E1","step":"last","status":"success","message":"done","level":"info","time":"2024-01-02T03:04:05+00:00"}"#;
        let message = parse_message(raw).expect("valid message");
        assert_eq!(message.event_id, "E1");
        assert_eq!(message.step_kind(), Step::Last);
        assert_eq!(message.content, raw.to_vec());
        assert_eq!(message.unix_time(), Some(1_704_164_645));
    }

    #[test]
    fn test_parse_message_rejects_oversized_payload() {
        let raw = vec![b' '; MAX_MESSAGE_SIZE + 1];
        let err = parse_message(&raw).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge(n) if n == MAX_MESSAGE_SIZE + 1));
        assert!(err.into_garbage().is_none());
    }

    #[test]
    fn test_parse_message_diverts_malformed_and_anonymous_payloads() {
        let err = parse_message(b"not json").unwrap_err();
        let garbage = err.into_garbage().expect("garbage kept");
        assert_eq!(garbage.content, b"not json".to_vec());

        let err = parse_message(br#"{"message":"orphan","step":"build"}"#).unwrap_err();
        let garbage = err.into_garbage().expect("garbage kept");
        assert_eq!(garbage.message, "orphan");
        assert_eq!(garbage.step, "build");
    }

    #[test]
    fn test_unix_time_without_zone() {
        assert_eq!(parse_unix_time("2024-01-02T03:04:05"), Some(1_704_164_645));
        assert_eq!(parse_unix_time("2024-01-02T03:04:05.123"), Some(1_704_164_645));
        assert_eq!(parse_unix_time("yesterday"), None);
    }

    #[test]
    fn test_docker_frame() {
        let service_id = "a".repeat(32);
        let frame = format!("0123456789ab {} hello world", service_id);
        let message = EventLogMessage::from_docker_frame(frame.as_bytes()).expect("valid frame");
        assert_eq!(message.event_id, service_id);
        assert_eq!(message.message, "0123456789ab: hello world");
        assert_eq!(message.content, message.message.as_bytes().to_vec());
    }

    #[test]
    fn test_docker_frame_too_short() {
        assert!(EventLogMessage::from_docker_frame(&[b'x'; 46]).is_none());
    }

    #[test]
    fn test_docker_frame_platform_service() {
        let frame = format!("0123456789ab rbd-api{}", "-".repeat(30));
        let message = EventLogMessage::from_docker_frame(frame.as_bytes()).expect("valid frame");
        assert_eq!(message.event_id, "rbd-api");
        assert_eq!(message.message, format!("0123456789ab:{}", "-".repeat(30)));
    }

    #[test]
    fn test_monitor_message_wire_names() {
        let raw = r#"[{"ServiceID":"svc","Port":"80","HostName":"h1","MessageType":"http","Key":"/","CumulativeTime":1.5,"AverageTime":0.5,"MaxTime":1.0,"Count":3,"AbnormalCount":1}]"#;
        let samples: Vec<MonitorMessage> = serde_json::from_str(raw).expect("valid samples");
        assert_eq!(samples[0].service_id, "svc");
        assert_eq!(samples[0].host_name, "h1");
        assert_eq!(samples[0].abnormal_count, 1);
    }

    #[test]
    fn test_round() {
        assert_eq!(round(0.125, 2), 0.13);
        assert_eq!(round(2.5, 0), 3.0);
        assert_eq!(round(1.0, 2), 1.0);
    }

    #[test]
    fn test_message_mode_tags() {
        for mode in [
            MessageMode::Event,
            MessageMode::NewMonitor,
            MessageMode::MonitorData,
        ] {
            assert_eq!(MessageMode::from_byte(mode.as_byte()), Some(mode));
        }
        assert_eq!(MessageMode::from_byte(0), None);
    }

    #[test]
    fn test_cluster_frame_layout() {
        let message = ClusterMessage::new(MessageMode::NewMonitor, b"[]".to_vec());
        let frame = message.to_frame();
        assert_eq!(&frame[..], b"\x02[]");
        assert_eq!(ClusterMessage::from_frame(frame), Some(message));
        assert_eq!(ClusterMessage::from_frame(Bytes::from_static(b"\x09x")), None);
        assert_eq!(ClusterMessage::from_frame(Bytes::new()), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_message_keeps_raw_content(raw in proptest::collection::vec(any::<u8>(), 0..512)) {
                match parse_message(&raw) {
                    Ok(message) => {
                        prop_assert!(!message.event_id.is_empty());
                        prop_assert_eq!(message.content, raw);
                    }
                    Err(DecodeError::Malformed { garbage, .. }) => prop_assert_eq!(garbage.content, raw),
                    Err(_) => {}
                }
            }

            #[test]
            fn prop_docker_frame_splits_ids(
                container_id in "[0-9a-f]{12}",
                service_id in "[0-9a-f]{32}",
                line in "[ -~]{2,80}",
            ) {
                let frame = format!("{} {}{}", container_id, service_id, line);
                let message = EventLogMessage::from_docker_frame(frame.as_bytes()).expect("long enough");
                prop_assert_eq!(&message.event_id, &service_id);
                prop_assert_eq!(message.message, format!("{}:{}", container_id, line));
            }
        }
    }
}
