// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use eventlog_core::{EventLogConfig, EventLogServices, ServicesHandle};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SERVICE_ID: &str = "0123456789abcdef0123456789abcdef";

async fn start(dir: &tempfile::TempDir) -> ServicesHandle {
    start_with(dir, EventLogConfig::default()).await
}

async fn start_with(dir: &tempfile::TempDir, base: EventLogConfig) -> ServicesHandle {
    let config = EventLogConfig {
        bind_ip: "127.0.0.1".to_string(),
        event_log_port: 0,
        docker_log_port: 0,
        web_port: 0,
        cluster_pub_port: 0,
        monitor_udp_port: 0,
        log_home: dir.path().display().to_string(),
        garbage_file: dir.path().join("garbage.log").display().to_string(),
        log_level: "error".to_string(),
        // One worker keeps a single producer's records in order.
        handle_message_workers: 1,
        ..base
    };
    EventLogServices::new(config)
        .start()
        .await
        .expect("services start")
}

async fn connect(handle: &ServicesHandle, path: &str) -> Client {
    let url = format!("ws://{}{}", handle.addresses().web, path);
    let (client, _) = connect_async(url).await.expect("websocket connect");
    client
}

async fn next_text(client: &mut Client) -> Option<String> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame in time")?;
        match frame.expect("valid frame") {
            Message::Text(text) => return Some(text.as_str().to_string()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn http_get(handle: &ServicesHandle, path: &str) -> String {
    let mut stream = TcpStream::connect(handle.addresses().web)
        .await
        .expect("connect");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    response
}

async fn eventually(check: impl FnMut() -> bool) -> bool {
    eventually_within(Duration::from_secs(2), check).await
}

async fn eventually_within(wait: Duration, mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..wait.as_millis() / 10 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_event_log_stream_is_acked_and_pushed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = start(&dir).await;

    let mut client = connect(&handle, "/event_log").await;
    client
        .send(Message::text("event_id=E1"))
        .await
        .expect("subscribe");
    assert_eq!(next_text(&mut client).await.as_deref(), Some("ok"));

    let stream = TcpStream::connect(handle.addresses().event_log)
        .await
        .expect("connect");
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let progress = json!({"event_id": "E1", "message": "pulling", "level": "info", "step": "progress"});
    let last = json!({"event_id": "E1", "message": "done", "level": "info", "step": "last"});
    for record in [&progress, &last] {
        framed
            .send(Bytes::from(record.to_string()))
            .await
            .expect("send");
    }
    SinkExt::<Bytes>::close(&mut framed).await.expect("close");
    let ack = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("ack in time")
        .expect("ack frame")
        .expect("valid ack");
    assert_eq!(&ack[..], b"success");

    let first: Value = serde_json::from_str(&next_text(&mut client).await.expect("first"))
        .expect("json");
    assert_eq!(first["message"], "pulling");
    let second: Value = serde_json::from_str(&next_text(&mut client).await.expect("second"))
        .expect("json");
    assert_eq!(second["step"], "last");
    assert_eq!(next_text(&mut client).await, None);

    handle.stop().await.expect("stop");
    handle.stopped().await;
}

#[tokio::test]
async fn test_pubsub_releases_subscriptions_on_disconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = start(&dir).await;
    let manager = handle.manager().clone();

    let mut client = connect(&handle, "/pubsub").await;
    for channel in [format!("s-{}", SERVICE_ID), "e-E2".to_string()] {
        let subscribe = json!({"event": "pusher:subscribe", "data": {"channel": channel}});
        client
            .send(Message::text(subscribe.to_string()))
            .await
            .expect("subscribe");
    }
    let mut succeeded = Vec::new();
    while succeeded.len() < 3 {
        let reply: Value = serde_json::from_str(&next_text(&mut client).await.expect("reply"))
            .expect("json");
        assert_eq!(reply["event"], "pusher:succeeded");
        succeeded.push(reply["channel"].as_str().unwrap_or_default().to_string());
    }
    assert!(succeeded.contains(&format!("docker-{}", SERVICE_ID)));
    assert!(succeeded.contains(&format!("newmonitor-{}", SERVICE_ID)));
    assert!(succeeded.contains(&"event-E2".to_string()));
    assert_eq!(manager.subscriber_count("docker", SERVICE_ID), 1);
    assert_eq!(manager.subscriber_count("newmonitor", SERVICE_ID), 1);
    assert_eq!(manager.subscriber_count("event", "E2"), 1);

    let stream = TcpStream::connect(handle.addresses().docker_log)
        .await
        .expect("connect");
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let frame = format!("abcdef123456 {}hello", SERVICE_ID);
    framed.send(Bytes::from(frame)).await.expect("send");

    let log: Value = serde_json::from_str(&next_text(&mut client).await.expect("log"))
        .expect("json");
    assert_eq!(
        log,
        json!({"event": "service:log", "data": "abcdef123456:hello", "channel": format!("docker-{}", SERVICE_ID)})
    );

    drop(client);
    assert!(
        eventually(|| {
            manager.subscriber_count("docker", SERVICE_ID) == 0
                && manager.subscriber_count("newmonitor", SERVICE_ID) == 0
                && manager.subscriber_count("event", "E2") == 0
        })
        .await,
        "subscriptions outlived the connection"
    );

    handle.stop().await.expect("stop");
    handle.stopped().await;
}

/// Short deadlines; pings go out every 800ms.
fn short_keepalive() -> EventLogConfig {
    EventLogConfig {
        websocket_timeout_secs: 1,
        websocket_handshake_timeout_secs: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_event_log_drops_client_that_never_pongs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = start_with(&dir, short_keepalive()).await;
    let manager = handle.manager().clone();

    let mut client = connect(&handle, "/event_log").await;
    client
        .send(Message::text("event_id=E8"))
        .await
        .expect("subscribe");
    assert_eq!(next_text(&mut client).await.as_deref(), Some("ok"));
    assert!(eventually(|| manager.subscriber_count("event", "E8") == 1).await);

    // The client stops reading, so no pong ever answers the server's pings.
    assert!(
        eventually_within(Duration::from_secs(10), || manager.subscriber_count("event", "E8") == 0)
            .await,
        "silent client kept its subscription"
    );

    drop(client);
    handle.stop().await.expect("stop");
    handle.stopped().await;
}

#[tokio::test]
async fn test_pubsub_drops_client_that_never_pongs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = start_with(&dir, short_keepalive()).await;
    let manager = handle.manager().clone();

    let mut client = connect(&handle, "/pubsub").await;
    let subscribe = json!({"event": "pusher:subscribe", "data": {"channel": "e-E9"}});
    client
        .send(Message::text(subscribe.to_string()))
        .await
        .expect("subscribe");
    assert!(eventually(|| manager.subscriber_count("event", "E9") == 1).await);

    assert!(
        eventually_within(Duration::from_secs(10), || manager.subscriber_count("event", "E9") == 0)
            .await,
        "silent client kept its subscription"
    );

    drop(client);
    handle.stop().await.expect("stop");
    handle.stopped().await;
}

#[tokio::test]
async fn test_pubsub_rejects_invalid_channel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = start(&dir).await;

    let mut client = connect(&handle, "/pubsub").await;
    let subscribe = json!({"event": "pusher:subscribe", "data": {"channel": "x-1"}});
    client
        .send(Message::text(subscribe.to_string()))
        .await
        .expect("subscribe");
    assert_eq!(
        next_text(&mut client).await.as_deref(),
        Some(r#"{"event":"error","data":"Invalid message"}"#)
    );
    client
        .send(Message::text("not json"))
        .await
        .expect("send");
    assert_eq!(
        next_text(&mut client).await.as_deref(),
        Some(r#"{"event":"error","data":"Invalid message"}"#)
    );

    handle.stop().await.expect("stop");
    handle.stopped().await;
}

#[tokio::test]
async fn test_control_plane_over_http() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = start(&dir).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let sample = json!([{"ServiceID": SERVICE_ID, "Port": "5000", "HostName": "h1", "Key": "/", "Count": 3}]);
    socket
        .send_to(sample.to_string().as_bytes(), handle.addresses().monitor)
        .await
        .expect("send");

    let health = http_get(&handle, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#""status":"health""#));

    let missing = http_get(&handle, "/docker-instance").await;
    assert!(missing.starts_with("HTTP/1.1 412"));

    let routed = http_get(&handle, &format!("/docker-instance?service_id={}", SERVICE_ID)).await;
    assert!(routed.starts_with("HTTP/1.1 200"));
    let expected_host = format!("tcp://127.0.0.1:{}", handle.addresses().docker_log.port());
    assert!(routed.contains(&expected_host));

    let metrics = http_get(&handle, "/metrics").await;
    assert!(metrics.contains("eventlog_health_status 1"));
    assert!(metrics.contains("eventlog_chan_cache_size"));

    handle.stop().await.expect("stop");
    handle.stopped().await;
}
