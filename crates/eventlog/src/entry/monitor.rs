// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monitor samples over UDP, one JSON array per datagram.

use crate::constants::MAX_UDP_PACKET_SIZE;
use crate::store::manager::StoreManager;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn serve(
    socket: UdpSocket,
    manager: Arc<StoreManager>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buf) => received,
                _ = cancel.cancelled() => break,
            };
            match received {
                Ok((len, _)) => dispatch(&manager, &buf[..len]),
                Err(e) => warn!("monitor udp receive error: {}", e),
            }
        }
        info!("monitor listener stopped");
    })
}

/// Queues one datagram. Empty datagrams are skipped.
pub fn dispatch(manager: &StoreManager, packet: &[u8]) {
    if packet.is_empty() {
        debug!("ignoring empty monitor datagram");
        return;
    }
    manager.push_monitor(Bytes::copy_from_slice(packet));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MONITOR_CHAN_SIZE;
    use crate::file_store::FileStore;
    use crate::metadata::MemoryEventRecordStore;
    use crate::store::garbage::GarbageSink;
    use crate::store::manager::StoreManagerConfig;
    use std::sync::atomic::Ordering;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_overflow_drops_exactly_the_excess() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = StoreManager::new(
            StoreManagerConfig::default(),
            Arc::new(FileStore::new(dir.path())),
            Arc::new(GarbageSink::new(dir.path().join("garbage.log"))),
            Arc::new(MemoryEventRecordStore::new()),
        );
        let packet = br#"[{"ServiceID":"svc","HostName":"h1","Key":"/"}]"#;
        for _ in 0..=MONITOR_CHAN_SIZE {
            dispatch(&manager, packet);
        }
        dispatch(&manager, b"");

        assert_eq!(manager.dropped().monitor.load(Ordering::Relaxed), 1);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("monitor message chan is full"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one drop warning, saw {}", n)),
            }
        });
    }
}
