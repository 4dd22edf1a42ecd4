// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP and WebSocket surface: live streams, the control plane and metrics.

pub mod legacy;
pub mod pusher;

use crate::cluster::Cluster;
use crate::constants::WEBSOCKET_WRITE_TIMEOUT;
use crate::errors::WebError;
use crate::metrics::Metrics;
use crate::store::manager::StoreManager;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Sink, SinkExt};
use serde::Deserialize;
use serde_json::json;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DEFAULT_DOCKER_HISTORY_LENGTH: usize = 100;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_ip: String,
    pub port: u16,
    pub metrics_path: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            port: 6363,
            metrics_path: "/metrics".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StoreManager>,
    pub cluster: Arc<Cluster>,
    pub metrics: Arc<Metrics>,
    /// Keepalive deadline, pushed out by every pong.
    pub timeout: Duration,
    /// Deadline for a client's first frame and first pong.
    pub handshake_timeout: Duration,
    /// Cancelled on shutdown; every open stream ends with it.
    pub cancel: CancellationToken,
}

impl AppState {
    /// Pings go out before the keepalive deadline can pass.
    pub fn ping_period(&self) -> Duration {
        self.timeout.mul_f64(0.8).max(Duration::from_millis(10))
    }
}

pub fn make_router(state: AppState, metrics_path: &str) -> Router {
    Router::new()
        .route("/event_log", get(legacy::event_log))
        .route("/docker_log", get(legacy::docker_log))
        .route("/monitor_message", get(legacy::monitor_message))
        .route("/new_monitor_message", get(legacy::new_monitor_message))
        .route("/pubsub", get(pusher::pubsub))
        .route("/docker-instance", get(docker_instance))
        .route("/event_push", post(event_push))
        .route("/health", get(health))
        .route("/monitor", get(monitor))
        .route("/event_log/history", get(event_log_history))
        .route("/docker_log/history", get(docker_log_history))
        .route(metrics_path, get(metrics))
        .with_state(state)
}

/// The bound HTTP listener, served once the shared state exists.
pub struct WebServer {
    config: WebConfig,
    listener: TcpListener,
}

impl WebServer {
    pub async fn bind(config: WebConfig) -> Result<Self, WebError> {
        let address = format!("{}:{}", config.bind_ip, config.port);
        let listener = TcpListener::bind(&address).await.map_err(WebError::Bind)?;
        info!("web server listening on {}", address);
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn serve(self, state: AppState) -> JoinHandle<Result<(), WebError>> {
        let router = make_router(state.clone(), &self.config.metrics_path);
        let cancel = state.cancel.clone();
        let listener = self.listener;
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                    debug!("web server shutting down");
                })
                .await
                .map_err(WebError::Serve)
        })
    }
}

/// Releases a store subscription when dropped, whichever way a stream ends.
pub(crate) struct SubscriptionGuard {
    manager: Arc<StoreManager>,
    mode: &'static str,
    key: String,
    sub_id: String,
}

impl SubscriptionGuard {
    pub(crate) fn new(manager: Arc<StoreManager>, mode: &'static str, key: &str, sub_id: &str) -> Self {
        Self {
            manager,
            mode,
            key: key.to_string(),
            sub_id: sub_id.to_string(),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.manager
            .release_websocket_message_chan(self.mode, &self.key, &self.sub_id);
        debug!(mode = self.mode, key = self.key.as_str(), "subscription released");
    }
}

/// Sends one frame, giving up after the write timeout.
pub(crate) async fn send_with_timeout<S, M>(sink: &mut S, message: M) -> bool
where
    S: Sink<M> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(WEBSOCKET_WRITE_TIMEOUT, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("websocket write failed: {}", e);
            false
        }
        Err(_) => {
            debug!("websocket write timed out");
            false
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    #[serde(default)]
    service_id: String,
    length: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    level: String,
}

fn failure(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"message": message, "status": "failure"})),
    )
        .into_response()
}

async fn docker_instance(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> Response {
    if query.service_id.is_empty() {
        return failure(StatusCode::PRECONDITION_FAILED, "service id can not be empty.");
    }
    let instance = state.cluster.get_suitable_instance(&query.service_id).await;
    if let Err(e) = state.cluster.save_pin(&query.service_id, &instance).await {
        error!(service_id = query.service_id.as_str(), "failed to save instance pin: {}", e);
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Save docker service and instance id to etcd error.",
        );
    }
    info!(
        service_id = query.service_id.as_str(),
        "docker logs routed to instance {}",
        instance.key()
    );
    Json(json!({"host": instance.docker_log_url(), "status": "success"})).into_response()
}

async fn event_push(State(state): State<AppState>, body: Bytes) -> Response {
    if state.manager.push_event(body) {
        Json(json!({"status": "success"})).into_response()
    } else {
        failure(StatusCode::INTERNAL_SERVER_ERROR, "event message chan is block")
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let health = state.manager.health_check();
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(health)).into_response()
}

async fn monitor() -> &'static str {
    "ok"
}

async fn event_log_history(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Response {
    if query.event_id.is_empty() {
        return failure(StatusCode::PRECONDITION_FAILED, "event id can not be empty.");
    }
    let manager = Arc::clone(&state.manager);
    let lines = tokio::task::spawn_blocking(move || manager.event_logs(&query.event_id, &query.level)).await;
    match lines {
        Ok(Ok(lines)) => Json(lines).into_response(),
        Ok(Err(e)) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn docker_log_history(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> Response {
    if query.service_id.is_empty() {
        return failure(StatusCode::PRECONDITION_FAILED, "service id can not be empty.");
    }
    let length = query.length.unwrap_or(DEFAULT_DOCKER_HISTORY_LENGTH);
    let manager = Arc::clone(&state.manager);
    match tokio::task::spawn_blocking(move || manager.docker_logs(&query.service_id, length)).await {
        Ok(lines) => Json(lines).into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    state
        .metrics
        .refresh(&state.manager, &state.cluster.instances());
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
