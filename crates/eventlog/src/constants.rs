// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Slots in the operation-log ingestion channel.
pub const RECEIVE_CHAN_SIZE: usize = 300;
/// Slots in the channel fed by peer Sub clients.
pub const SUB_CHAN_SIZE: usize = 300;
/// Slots in the cluster broadcast ("radio") channel.
pub const PUB_CHAN_SIZE: usize = 300;
pub const DOCKER_LOG_CHAN_SIZE: usize = 2048;
pub const MONITOR_CHAN_SIZE: usize = 2048;

/// Decoded payloads above this size are rejected before JSON parsing.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Largest datagram accepted by the monitor UDP listener.
pub const MAX_UDP_PACKET_SIZE: usize = 65535;

pub const STORE_GC_INTERVAL: Duration = Duration::from_secs(30);
pub const HANDLE_BARREL_IDLE: Duration = Duration::from_secs(30);
pub const READ_BARREL_IDLE: Duration = Duration::from_secs(60);
pub const DOCKER_BARREL_IDLE: Duration = Duration::from_secs(60);
pub const MONITOR_BARREL_IDLE: Duration = Duration::from_secs(180);
/// A host stops contributing monitor samples once it has been silent this long.
pub const MONITOR_HOST_STALE: Duration = Duration::from_secs(30);

pub const HANDLE_SUBSCRIBER_CAPACITY: usize = 10;
pub const READ_SUBSCRIBER_CAPACITY: usize = 10;
pub const DOCKER_SUBSCRIBER_CAPACITY: usize = 100;
pub const MONITOR_SUBSCRIBER_CAPACITY: usize = 10;

/// History pushed to a fresh read-store subscriber.
pub const READ_HISTORY_LENGTH: usize = 1000;
/// Entries pushed per monitor snapshot, ranked by cumulative time.
pub const MONITOR_TOP_K: usize = 20;

pub const BARREL_EVENT_CHAN_SIZE: usize = 100;
pub const BARREL_EVENT_WORKERS: usize = 2;

pub const GARBAGE_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const EVENT_RECORD_RETENTION_DAYS: i64 = 30;

/// Size cap for a service's live stdout file before it is rotated.
pub const SERVICE_LOG_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const SERVICE_LOG_FILE: &str = "stdout.log";

pub const DISTRIBUTION_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
/// Load reports older than this mark the reporting instance unhealthy.
pub const MONITOR_DATA_STALE: Duration = Duration::from_secs(10);
/// Weight of one served service relative to one message per minute.
pub const SERVICE_SIZE_WEIGHT: u64 = 20;

pub const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const PEER_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const PEER_HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(120);
pub const MONITOR_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
pub const INSTANCE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const PUB_BROADCAST_CAPACITY: usize = 1024;

pub const WEBSOCKET_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PUSHER_PING_INTERVAL: Duration = Duration::from_secs(20);
pub const PUSHER_SEND_QUEUE_SIZE: usize = 256;

pub const CLIENT_CACHE_SIZE: usize = 1000;
pub const CLIENT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const CLIENT_LOGGER_TTL: Duration = Duration::from_secs(60);
pub const CLIENT_GC_INTERVAL: Duration = Duration::from_secs(20);
