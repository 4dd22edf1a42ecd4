// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operation-log stream: length-delimited JSON records, answered with one
//! ack frame once the producer closes its side.

use super::spawn_accept_loop;
use crate::store::manager::StoreManager;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ACK: &[u8] = b"success";

pub fn serve(
    listener: TcpListener,
    manager: Arc<StoreManager>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn_accept_loop("event log", listener, cancel, move |stream, peer, cancel| {
        handle_stream(stream, peer, Arc::clone(&manager), cancel)
    })
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<StoreManager>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let mut received = 0usize;
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = cancel.cancelled() => return,
        };
        match frame {
            Some(Ok(frame)) => {
                received += 1;
                manager.push_event(frame.freeze());
            }
            Some(Err(e)) => {
                warn!(peer = %peer, "event log stream failed: {}", e);
                return;
            }
            None => break,
        }
    }
    debug!(peer = %peer, "event log stream closed after {} messages", received);
    if let Err(e) = framed.send(Bytes::from_static(ACK)).await {
        debug!(peer = %peer, "failed to ack event log stream: {}", e);
    }
}
