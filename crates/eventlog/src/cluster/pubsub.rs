// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Node-to-node replication.
//!
//! Every node runs a [`PubServer`] that fans locally ingested messages out to
//! any connected peer, and a [`SubClient`] holding one listener per known
//! peer. Frames are length-delimited [`ClusterMessage`]s; delivery is best
//! effort and a lagging peer simply misses frames.

use super::distribution::Distribution;
use super::instance::Instance;
use crate::constants::{PEER_HEALTH_SWEEP_INTERVAL, PEER_RECONNECT_INTERVAL, PUB_BROADCAST_CAPACITY};
use crate::errors::ClusterError;
use crate::message::{ClusterMessage, MessageMode, MonitorData};
use crate::store::manager::StoreManager;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct PubServer {
    radio: broadcast::Sender<Bytes>,
}

impl Default for PubServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PubServer {
    pub fn new() -> Self {
        let (radio, _) = broadcast::channel(PUB_BROADCAST_CAPACITY);
        Self { radio }
    }

    /// Sends a message to every connected peer. Returns how many got it.
    pub fn publish(&self, message: &ClusterMessage) -> usize {
        self.radio.send(message.to_frame()).unwrap_or(0)
    }

    pub fn peer_count(&self) -> usize {
        self.radio.receiver_count()
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, ClusterError> {
        let listener = TcpListener::bind(addr).await?;
        info!("cluster pub server listening on {}", addr);
        Ok(listener)
    }

    /// Accepts peer connections until cancelled.
    pub fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let frames = self.radio.subscribe();
                            tokio::spawn(stream_to_peer(stream, peer, frames, cancel.clone()));
                        }
                        Err(e) => warn!("cluster pub accept error: {}", e),
                    },
                }
            }
            debug!("cluster pub server stopped");
        })
    }

    /// Forwards the store manager's replication queue onto the radio.
    pub fn forward(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<ClusterMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = messages.recv() => match message {
                        Some(message) => {
                            self.publish(&message);
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

async fn stream_to_peer(
    stream: TcpStream,
    peer: SocketAddr,
    mut frames: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    info!(peer = %peer, "cluster peer subscribed");
    let mut sink = FramedWrite::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = cancel.cancelled() => break,
        };
        match frame {
            Ok(frame) => {
                if let Err(e) = sink.send(frame).await {
                    debug!(peer = %peer, "cluster peer went away: {}", e);
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                debug!(peer = %peer, "cluster peer lagging, {} frames skipped", missed)
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!(peer = %peer, "cluster peer unsubscribed");
}

struct Listener {
    instance: Instance,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Receives replicated messages from every known peer.
pub struct SubClient {
    manager: Arc<StoreManager>,
    distribution: Arc<Distribution>,
    listeners: Mutex<HashMap<String, Listener>>,
    cancel: CancellationToken,
}

impl SubClient {
    pub fn new(
        manager: Arc<StoreManager>,
        distribution: Arc<Distribution>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            distribution,
            listeners: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Starts listening to `instance`. A peer already followed is left alone.
    pub fn subscribe(self: &Arc<Self>, instance: Instance) {
        let mut listeners = self.listeners.lock();
        let key = instance.key();
        if listeners.contains_key(&key) {
            return;
        }
        let listener = self.spawn_listener(instance);
        listeners.insert(key, listener);
    }

    pub fn unsubscribe(&self, instance: &Instance) {
        if let Some(listener) = self.listeners.lock().remove(&instance.key()) {
            listener.cancel.cancel();
            info!("stopped listening to instance {}", listener.instance.key());
        }
    }

    fn spawn_listener(self: &Arc<Self>, instance: Instance) -> Listener {
        let cancel = self.cancel.child_token();
        let client = Arc::clone(self);
        let address = instance.pub_address();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                match TcpStream::connect(&address).await {
                    Ok(stream) => {
                        info!("listening to cluster peer {}", address);
                        client.receive(stream, &token).await;
                    }
                    Err(e) => warn!("failed to connect to cluster peer {}: {}", address, e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(PEER_RECONNECT_INTERVAL) => {}
                    _ = token.cancelled() => break,
                }
            }
        });
        Listener {
            instance,
            cancel,
            task,
        }
    }

    async fn receive(&self, stream: TcpStream, cancel: &CancellationToken) {
        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = cancel.cancelled() => return,
            };
            match frame {
                Some(Ok(frame)) => self.dispatch(frame.freeze()),
                Some(Err(e)) => {
                    warn!("cluster peer stream failed: {}", e);
                    return;
                }
                None => {
                    debug!("cluster peer closed the stream");
                    return;
                }
            }
        }
    }

    /// Load reports feed distribution; everything else is re-ingested locally.
    pub(crate) fn dispatch(&self, frame: Bytes) {
        let Some(message) = ClusterMessage::from_frame(frame) else {
            debug!("ignoring unknown cluster frame");
            return;
        };
        match message.mode {
            MessageMode::MonitorData => match serde_json::from_slice::<MonitorData>(&message.payload) {
                Ok(data) => self.distribution.update_monitor_data(data),
                Err(e) => warn!("invalid load report from peer: {}", e),
            },
            _ => {
                self.manager.push_sub(message);
            }
        }
    }

    /// Restarts listeners whose task ended while the peer is still known.
    pub fn sweep(self: &Arc<Self>) -> usize {
        let mut listeners = self.listeners.lock();
        let mut restarted = 0;
        for listener in listeners.values_mut() {
            if listener.task.is_finished() && !listener.cancel.is_cancelled() {
                error!(
                    "listener for instance {} is gone, restarting",
                    listener.instance.key()
                );
                *listener = self.spawn_listener(listener.instance.clone());
                restarted += 1;
            }
        }
        restarted
    }

    pub fn spawn_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PEER_HEALTH_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub fn stop(&self) {
        for (_, listener) in self.listeners.lock().drain() {
            listener.cancel.cancel();
        }
    }
}
