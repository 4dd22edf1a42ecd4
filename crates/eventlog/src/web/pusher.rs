// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multiplexed push protocol served on `/pubsub`.
//!
//! Every frame is a JSON envelope `{"event", "data", "channel"}`. A client
//! sends `pusher:subscribe` with `data.channel` set to `s-<service_id>` (container
//! logs plus monitor samples) or `e-<event_id>` (operation log). Each accepted
//! channel gets its own forwarding task; all of them write through one bounded
//! send queue drained by a single writer. The connection closes once its last
//! channel ends, or when the client misses the pong deadline.

use super::{send_with_timeout, AppState, SubscriptionGuard};
use crate::constants::{PUSHER_PING_INTERVAL, PUSHER_SEND_QUEUE_SIZE};
use crate::message::{EventLogMessage, Step};
use crate::store::barrel::SubscriberRx;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use std::time::Duration;
use tokio::time::{interval_at, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_SUCCEEDED: &str = "pusher:succeeded";
pub const EVENT_CLOSE: &str = "pusher:close";
pub const EVENT_ERROR: &str = "error";
pub const INVALID_MESSAGE: &str = "Invalid message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
}

impl WebsocketMessage {
    pub fn new(event: &str, data: Value, channel: &str) -> Self {
        Self {
            event: event.to_string(),
            data,
            channel: channel.to_string(),
        }
    }

    fn invalid() -> Self {
        Self::new(EVENT_ERROR, Value::String(INVALID_MESSAGE.to_string()), "")
    }

    fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                warn!("failed to encode pusher message: {}", e);
                None
            }
        }
    }
}

/// Store modes served for a channel prefix.
pub fn channel_modes(prefix: &str) -> Option<&'static [&'static str]> {
    match prefix {
        "s" => Some(&["docker", "newmonitor"]),
        "e" => Some(&["event"]),
        _ => None,
    }
}

/// Name of the envelope event used to forward a mode's messages.
pub fn message_event(mode: &str) -> &'static str {
    match mode {
        "docker" => "service:log",
        "newmonitor" => "monitor",
        _ => "event:log",
    }
}

/// Envelopes for one store message. Terminal operation steps end the channel.
pub fn render(mode: &str, channel: &str, message: &EventLogMessage) -> (Vec<WebsocketMessage>, bool) {
    match message.step_kind() {
        Step::Last => (
            vec![
                WebsocketMessage::new("event:success", Value::String(message.message.clone()), channel),
                WebsocketMessage::new(EVENT_CLOSE, Value::String(message.message.clone()), channel),
            ],
            true,
        ),
        Step::Callback => (
            vec![
                WebsocketMessage::new("event:failure", Value::String(message.message.clone()), channel),
                WebsocketMessage::new(EVENT_CLOSE, Value::String(message.message.clone()), channel),
            ],
            true,
        ),
        _ => {
            let raw = if mode == "newmonitor" {
                &message.monitor_data
            } else {
                &message.content
            };
            let data = Value::String(String::from_utf8_lossy(raw).into_owned());
            (
                vec![WebsocketMessage::new(message_event(mode), data, channel)],
                false,
            )
        }
    }
}

pub(super) async fn pubsub(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state))
}

/// One client connection and the channels it follows.
struct PubContext {
    id: String,
    state: AppState,
    queue: mpsc::Sender<Message>,
    channels: Mutex<HashMap<String, SubscriptionGuard>>,
    closed: CancellationToken,
}

impl PubContext {
    async fn send(&self, message: &WebsocketMessage) -> bool {
        let Some(frame) = message.to_frame() else {
            return true;
        };
        tokio::select! {
            sent = self.queue.send(frame) => sent.is_ok(),
            _ = self.closed.cancelled() => false,
        }
    }

    async fn handle(self: &Arc<Self>, text: &str) {
        let request: WebsocketMessage = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(id = self.id.as_str(), "undecodable pusher frame: {}", e);
                self.send(&WebsocketMessage::invalid()).await;
                return;
            }
        };
        match request.event.as_str() {
            EVENT_SUBSCRIBE => self.subscribe(&request.data).await,
            other => {
                debug!(id = self.id.as_str(), "unsupported pusher event {}", other);
                self.send(&WebsocketMessage::invalid()).await;
            }
        }
    }

    async fn subscribe(self: &Arc<Self>, data: &Value) {
        let channel = data.get("channel").and_then(Value::as_str).unwrap_or_default();
        let parsed = channel
            .split_once('-')
            .filter(|(_, id)| !id.is_empty())
            .and_then(|(prefix, id)| channel_modes(prefix).map(|modes| (modes, id)));
        let Some((modes, id)) = parsed else {
            self.send(&WebsocketMessage::invalid()).await;
            return;
        };
        for mode in modes {
            self.create_channel(mode, id).await;
        }
    }

    async fn create_channel(self: &Arc<Self>, mode: &'static str, id: &str) {
        let channel = format!("{}-{}", mode, id);
        if self.channels.lock().contains_key(&channel) {
            self.send(&WebsocketMessage::new(EVENT_SUCCEEDED, Value::Null, &channel))
                .await;
            return;
        }
        let sub_id = Uuid::new_v4().to_string();
        let Some(messages) = self
            .state
            .manager
            .websocket_message_chan(mode, id, &sub_id)
            .await
        else {
            self.send(&WebsocketMessage::invalid()).await;
            return;
        };
        let guard = SubscriptionGuard::new(Arc::clone(&self.state.manager), mode, id, &sub_id);
        self.channels.lock().insert(channel.clone(), guard);
        self.send(&WebsocketMessage::new(EVENT_SUCCEEDED, Value::Null, &channel))
            .await;
        debug!(id = self.id.as_str(), channel = channel.as_str(), "channel created");
        tokio::spawn(Arc::clone(self).forward(mode, channel, messages));
    }

    async fn forward(self: Arc<Self>, mode: &'static str, channel: String, mut messages: SubscriberRx) {
        loop {
            let message = tokio::select! {
                message = messages.recv() => message,
                _ = self.closed.cancelled() => break,
            };
            let Some(message) = message else {
                let close = WebsocketMessage::new(EVENT_CLOSE, Value::String("{}".to_string()), &channel);
                if self.send(&close).await {
                    let _ = self.queue.send(Message::Close(None)).await;
                }
                break;
            };
            let (envelopes, done) = render(mode, &channel, &message);
            let mut delivered = true;
            for envelope in &envelopes {
                if !self.send(envelope).await {
                    delivered = false;
                    break;
                }
            }
            if done || !delivered {
                break;
            }
        }
        self.remove_channel(&channel);
    }

    fn remove_channel(&self, channel: &str) {
        let remaining = {
            let mut channels = self.channels.lock();
            channels.remove(channel);
            channels.len()
        };
        if remaining == 0 {
            debug!(id = self.id.as_str(), "last channel removed, closing");
            self.closed.cancel();
        }
    }

    /// Drops every subscription. Called once the connection is gone.
    fn release_all(&self) {
        self.closed.cancel();
        let released: Vec<SubscriptionGuard> = self.channels.lock().drain().map(|(_, g)| g).collect();
        drop(released);
    }
}

async fn serve(socket: WebSocket, state: AppState) {
    let (sink, source) = socket.split();
    let (queue, outgoing) = mpsc::channel(PUSHER_SEND_QUEUE_SIZE);
    let context = Arc::new(PubContext {
        id: Uuid::new_v4().to_string(),
        state,
        queue,
        channels: Mutex::new(HashMap::new()),
        closed: CancellationToken::new(),
    });
    info!(id = context.id.as_str(), "pusher connection opened");

    let ping_period = context.state.ping_period().min(PUSHER_PING_INTERVAL);
    let writer = tokio::spawn(write_loop(sink, outgoing, ping_period, context.closed.clone()));
    read_loop(source, &context).await;

    context.release_all();
    let _ = writer.await;
    info!(id = context.id.as_str(), "pusher connection closed");
}

/// Reads client frames until the connection ends. Only pongs push the
/// deadline out; the first one is due within the handshake timeout.
async fn read_loop(mut source: SplitStream<WebSocket>, context: &Arc<PubContext>) {
    let keepalive = context.state.timeout;
    let mut deadline = Instant::now() + context.state.handshake_timeout;
    loop {
        let frame = tokio::select! {
            frame = timeout_at(deadline, source.next()) => frame,
            _ = context.closed.cancelled() => return,
            _ = context.state.cancel.cancelled() => return,
        };
        let Ok(frame) = frame else {
            debug!(id = context.id.as_str(), "pusher keepalive deadline passed");
            return;
        };
        match frame {
            Some(Ok(Message::Text(text))) => context.handle(text.as_str()).await,
            Some(Ok(Message::Binary(data))) => {
                context.handle(&String::from_utf8_lossy(&data)).await
            }
            Some(Ok(Message::Pong(_))) => deadline = Instant::now() + keepalive,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outgoing: mpsc::Receiver<Message>,
    ping_period: Duration,
    closed: CancellationToken,
) {
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    loop {
        let frame = tokio::select! {
            frame = outgoing.recv() => frame,
            _ = ping.tick() => Some(Message::Ping(Default::default())),
            _ = closed.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        let is_close = matches!(frame, Message::Close(_));
        if !send_with_timeout(&mut sink, frame).await || is_close {
            break;
        }
    }
    // Flush what the channel tasks queued before the connection went away.
    while let Ok(frame) = outgoing.try_recv() {
        if !send_with_timeout(&mut sink, frame).await {
            break;
        }
    }
    closed.cancel();
}
