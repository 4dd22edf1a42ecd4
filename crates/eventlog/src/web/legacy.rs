// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-stream WebSocket endpoints.
//!
//! The client's first text frame is `<field>=<value>`; the value selects the
//! barrel to follow. The server answers `ok`, then pushes one text frame per
//! message until either side goes away or the keepalive deadline passes.

use super::{send_with_timeout, AppState, SubscriptionGuard};
use crate::message::EventLogMessage;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_CLIENT_FRAME: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyStream {
    Event,
    Docker,
    Monitor,
    NewMonitor,
}

impl LegacyStream {
    pub fn mode(self) -> &'static str {
        match self {
            LegacyStream::Event => "event",
            LegacyStream::Docker => "docker",
            LegacyStream::Monitor => "monitor",
            LegacyStream::NewMonitor => "newmonitor",
        }
    }

    /// Operation-log clients get their `ok` before the subscription is checked.
    fn acks_before_subscribe(self) -> bool {
        matches!(self, LegacyStream::Event)
    }

    fn payload(self, message: &EventLogMessage) -> String {
        let raw = match self {
            LegacyStream::Event | LegacyStream::Docker => &message.content,
            LegacyStream::Monitor | LegacyStream::NewMonitor => &message.monitor_data,
        };
        String::from_utf8_lossy(raw).into_owned()
    }
}

pub(super) async fn event_log(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, LegacyStream::Event)
}

pub(super) async fn docker_log(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, LegacyStream::Docker)
}

pub(super) async fn monitor_message(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, LegacyStream::Monitor)
}

pub(super) async fn new_monitor_message(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, LegacyStream::NewMonitor)
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, stream: LegacyStream) -> Response {
    ws.max_message_size(MAX_CLIENT_FRAME)
        .on_upgrade(move |socket| serve(socket, state, stream))
}

/// Extracts the value of a `<field>=<value>` subscription frame.
pub fn parse_subscription(frame: &str) -> Option<&str> {
    let mut parts = frame.split('=');
    let (Some(_), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    (!value.is_empty()).then_some(value)
}

fn ok_frame() -> Message {
    Message::Text(Utf8Bytes::from_static("ok"))
}

async fn next_text(source: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
            Ok(Message::Binary(data)) => return Some(String::from_utf8_lossy(&data).into_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn serve(socket: WebSocket, state: AppState, stream: LegacyStream) {
    let mode = stream.mode();
    let (mut sink, mut source) = socket.split();

    let deadline = Instant::now() + state.handshake_timeout;
    let first = match timeout_at(deadline, next_text(&mut source)).await {
        Ok(Some(first)) => first,
        Ok(None) => {
            debug!(mode, "client left before subscribing");
            return;
        }
        Err(_) => {
            debug!(mode, "no subscription frame before the deadline");
            return;
        }
    };

    if stream.acks_before_subscribe() && !send_with_timeout(&mut sink, ok_frame()).await {
        return;
    }
    let Some(key) = parse_subscription(&first) else {
        warn!(mode, "invalid subscription frame: {}", first);
        return;
    };
    let sub_id = Uuid::new_v4().to_string();
    let Some(mut messages) = state
        .manager
        .websocket_message_chan(mode, key, &sub_id)
        .await
    else {
        warn!(mode, key, "no store accepts the subscription");
        return;
    };
    let _subscription = SubscriptionGuard::new(Arc::clone(&state.manager), mode, key, &sub_id);
    if !stream.acks_before_subscribe() && !send_with_timeout(&mut sink, ok_frame()).await {
        return;
    }
    debug!(mode, key, "websocket subscribed");

    let closed = CancellationToken::new();
    let reader = tokio::spawn(read_until_deadline(
        source,
        Instant::now() + state.handshake_timeout,
        state.timeout,
        closed.clone(),
    ));
    let ping_period = state.ping_period();
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = state.cancel.cancelled() => {
                let _ = send_with_timeout(&mut sink, Message::Close(None)).await;
                break;
            }
            _ = ping.tick() => {
                if !send_with_timeout(&mut sink, Message::Ping(Default::default())).await {
                    break;
                }
            }
            message = messages.recv() => {
                let Some(message) = message else {
                    let _ = send_with_timeout(&mut sink, Message::Close(None)).await;
                    break;
                };
                let payload = stream.payload(&message);
                if !send_with_timeout(&mut sink, Message::Text(payload.into())).await {
                    break;
                }
                if stream == LegacyStream::Event && message.step_kind().is_terminal() {
                    let _ = send_with_timeout(&mut sink, Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    reader.abort();
    debug!(mode, key, "websocket closed");
}

/// Drains client frames. Only pongs push the deadline out.
async fn read_until_deadline(
    mut source: SplitStream<WebSocket>,
    mut deadline: Instant,
    keepalive: Duration,
    closed: CancellationToken,
) {
    loop {
        match timeout_at(deadline, source.next()).await {
            Ok(Some(Ok(Message::Pong(_)))) => deadline = Instant::now() + keepalive,
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Err(_) => {
                debug!("websocket keepalive deadline passed");
                break;
            }
        }
    }
    closed.cancel();
}
