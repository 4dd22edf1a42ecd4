// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion listeners. Each one decodes its wire format just enough to hand
//! raw payloads to the store manager; it never blocks on a full channel.

pub mod docker_log;
pub mod event_log;
pub mod monitor;

use crate::errors::EntryError;
use crate::store::manager::StoreManager;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EntryConfig {
    pub bind_ip: String,
    pub event_log_port: u16,
    pub docker_log_port: u16,
    pub monitor_port: u16,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            event_log_port: 6366,
            docker_log_port: 6362,
            monitor_port: 6166,
        }
    }
}

/// Bound listeners, ready to serve.
pub struct Entry {
    event_log: TcpListener,
    docker_log: TcpListener,
    monitor: UdpSocket,
}

impl Entry {
    /// Binds every listener. Any bind failure is fatal to startup.
    pub async fn bind(config: &EntryConfig) -> Result<Self, EntryError> {
        let event_log = bind_tcp(&config.bind_ip, config.event_log_port).await?;
        let docker_log = bind_tcp(&config.bind_ip, config.docker_log_port).await?;
        let address = format!("{}:{}", config.bind_ip, config.monitor_port);
        let monitor = UdpSocket::bind(&address)
            .await
            .map_err(|source| EntryError::Bind { address, source })?;
        Ok(Self {
            event_log,
            docker_log,
            monitor,
        })
    }

    pub fn event_log_addr(&self) -> std::io::Result<SocketAddr> {
        self.event_log.local_addr()
    }

    pub fn docker_log_addr(&self) -> std::io::Result<SocketAddr> {
        self.docker_log.local_addr()
    }

    pub fn monitor_addr(&self) -> std::io::Result<SocketAddr> {
        self.monitor.local_addr()
    }

    pub fn serve(self, manager: Arc<StoreManager>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            event_log::serve(self.event_log, Arc::clone(&manager), cancel.clone()),
            docker_log::serve(self.docker_log, Arc::clone(&manager), cancel.clone()),
            monitor::serve(self.monitor, manager, cancel),
        ]
    }
}

async fn bind_tcp(ip: &str, port: u16) -> Result<TcpListener, EntryError> {
    let address = format!("{}:{}", ip, port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| EntryError::Bind {
            address: address.clone(),
            source,
        })?;
    info!("listening on {}", address);
    Ok(listener)
}

/// Accepts connections until cancelled, handling each on its own task.
pub(crate) fn spawn_accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    cancel: CancellationToken,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "{} connection opened", name);
                        tokio::spawn(handler(stream, peer, cancel.clone()));
                    }
                    Err(e) => warn!("{} accept error: {}", name, e),
                },
            }
        }
        info!("{} listener stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = taken.local_addr().expect("addr").port();
        let config = EntryConfig {
            bind_ip: "127.0.0.1".to_string(),
            event_log_port: port,
            docker_log_port: 0,
            monitor_port: 0,
        };
        let err = Entry::bind(&config).await.err().expect("bind must fail");
        let EntryError::Bind { address, .. } = err;
        assert_eq!(address, format!("127.0.0.1:{}", port));
    }
}
