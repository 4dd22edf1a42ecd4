// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use eventlog::entry::{event_log::ACK, Entry, EntryConfig};
use eventlog::file_store::FileStore;
use eventlog::metadata::MemoryEventRecordStore;
use eventlog::store::garbage::GarbageSink;
use eventlog::store::manager::{StoreManager, StoreManagerConfig};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

struct Node {
    _dir: tempfile::TempDir,
    manager: Arc<StoreManager>,
    entry: EntryAddrs,
    cancel: CancellationToken,
}

struct EntryAddrs {
    event_log: std::net::SocketAddr,
    docker_log: std::net::SocketAddr,
    monitor: std::net::SocketAddr,
}

async fn start_node() -> Node {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = Arc::new(StoreManager::new(
        StoreManagerConfig::default(),
        Arc::new(FileStore::new(dir.path())),
        Arc::new(GarbageSink::new(dir.path().join("garbage.log"))),
        Arc::new(MemoryEventRecordStore::new()),
    ));
    let entry = Entry::bind(&EntryConfig {
        bind_ip: "127.0.0.1".to_string(),
        event_log_port: 0,
        docker_log_port: 0,
        monitor_port: 0,
    })
    .await
    .expect("bind");
    let addrs = EntryAddrs {
        event_log: entry.event_log_addr().expect("addr"),
        docker_log: entry.docker_log_addr().expect("addr"),
        monitor: entry.monitor_addr().expect("addr"),
    };
    let cancel = CancellationToken::new();
    Arc::clone(&manager).run(cancel.clone());
    entry.serve(Arc::clone(&manager), cancel.clone());
    Node {
        _dir: dir,
        manager,
        entry: addrs,
        cancel,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_event_log_stream_persists_and_acks() {
    let node = start_node().await;

    let stream = TcpStream::connect(node.entry.event_log).await.expect("connect");
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let records = [
        ("starting build", "info"),
        ("verbose detail", "debug"),
        ("failed step", "error"),
    ];
    for (message, level) in records {
        let record = serde_json::json!({
            "event_id": "E7",
            "message": message,
            "level": level,
            "time": "2024-03-01T10:00:00+08:00",
        });
        framed
            .send(Bytes::from(record.to_string()))
            .await
            .expect("send");
    }
    framed.send(Bytes::from_static(b"{not json")).await.expect("send");
    SinkExt::<Bytes>::close(&mut framed).await.expect("close");
    let ack = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("ack in time")
        .expect("ack frame")
        .expect("valid ack");
    assert_eq!(&ack[..], ACK);

    // Workers drain concurrently; flushing repeatedly appends whatever arrived since.
    assert!(
        eventually(|| {
            node.manager.stop();
            node.manager
                .event_logs("E7", "debug")
                .is_ok_and(|lines| lines.len() == 3)
        })
        .await,
        "event messages were not persisted"
    );

    let info = node.manager.event_logs("E7", "info").expect("read");
    let mut messages: Vec<&str> = info.iter().map(|line| line.message.as_str()).collect();
    messages.sort_unstable();
    assert_eq!(messages, ["failed step", "starting build"]);
    assert!(info.iter().all(|line| line.unix_time == 1_709_258_400));

    let errors = node.manager.event_logs("E7", "error").expect("read");
    assert_eq!(errors.len(), 2);
    node.cancel.cancel();
}

#[tokio::test]
async fn test_docker_frames_reach_history() {
    let node = start_node().await;
    let service_id = "0123456789abcdef0123456789abcdef";

    let stream = TcpStream::connect(node.entry.docker_log).await.expect("connect");
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    for line in ["one", "two"] {
        let frame = format!("abcdef123456 {}{}", service_id, line);
        framed.send(Bytes::from(frame)).await.expect("send");
    }
    framed.send(Bytes::from_static(b"short")).await.expect("send");

    assert!(
        eventually(|| node.manager.docker_logs(service_id, 10).len() == 2).await,
        "docker lines never showed up"
    );
    let mut lines = node.manager.docker_logs(service_id, 10);
    lines.sort();
    assert_eq!(lines, ["abcdef123456:one", "abcdef123456:two"]);
    assert_eq!(node.manager.docker_logs(service_id, 1).len(), 1);
    node.cancel.cancel();
}

#[tokio::test]
async fn test_monitor_datagrams_feed_the_monitor_store() {
    let node = start_node().await;
    let mut samples = node
        .manager
        .websocket_message_chan("newmonitor", "svc", "watcher")
        .await
        .expect("subscribe");

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let packet = serde_json::json!([{
        "ServiceID": "svc",
        "Port": "5000",
        "HostName": "h1",
        "MessageType": "http",
        "Key": "/index",
        "CumulativeTime": 1.5,
        "AverageTime": 0.5,
        "MaxTime": 0.9,
        "Count": 3,
        "AbnormalCount": 0,
    }]);
    socket
        .send_to(packet.to_string().as_bytes(), node.entry.monitor)
        .await
        .expect("send");

    let sample = tokio::time::timeout(Duration::from_secs(5), samples.recv())
        .await
        .expect("sample in time")
        .expect("open channel");
    let body: serde_json::Value = serde_json::from_slice(&sample.monitor_data).expect("json");
    assert_eq!(body[0]["Key"], "/index");
    node.manager.release_websocket_message_chan("newmonitor", "svc", "watcher");
    node.cancel.cancel();
}
