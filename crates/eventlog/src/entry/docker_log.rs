// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container stdout stream: one length-delimited docker frame per line.

use super::spawn_accept_loop;
use crate::store::manager::StoreManager;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub fn serve(
    listener: TcpListener,
    manager: Arc<StoreManager>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn_accept_loop("docker log", listener, cancel, move |stream, peer, cancel| {
        handle_stream(stream, peer, Arc::clone(&manager), cancel)
    })
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<StoreManager>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = cancel.cancelled() => return,
        };
        match frame {
            Some(Ok(frame)) => {
                manager.push_docker_log(frame.freeze());
            }
            Some(Err(e)) => {
                warn!(peer = %peer, "docker log stream failed: {}", e);
                return;
            }
            None => break,
        }
    }
    debug!(peer = %peer, "docker log stream closed");
}
