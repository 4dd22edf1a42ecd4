// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-service performance samples, aggregated across reporting hosts.
//!
//! Each barrel keeps the latest sample list of every host. An insert drops
//! hosts that went quiet, merges the rest by metric key and pushes the top
//! entries by cumulative time to subscribers.

use super::barrel::{Barrel, BarrelState, SubscriberRx};
use super::keyed_buffer::{BufferPolicy, KeyedBuffer};
use super::pool::PoolStats;
use super::{spawn_gc_loop, MessageStore, StoreKind};
use crate::constants::{
    MONITOR_BARREL_IDLE, MONITOR_HOST_STALE, MONITOR_SUBSCRIBER_CAPACITY, MONITOR_TOP_K,
};
use crate::errors::StoreError;
use crate::message::{round, EventLogMessage, MonitorData, MonitorMessage};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct HostSamples {
    host_name: String,
    samples: Vec<MonitorMessage>,
    updated_at: Instant,
}

#[derive(Debug, Default)]
pub struct MonitorState {
    hosts: Vec<HostSamples>,
    snapshot: Option<Arc<EventLogMessage>>,
}

impl BarrelState for MonitorState {
    fn reset(&mut self) {
        self.hosts.clear();
        self.snapshot = None;
    }
}

pub struct MonitorPolicy {
    host_stale: Duration,
}

impl BufferPolicy for MonitorPolicy {
    type State = MonitorState;
    type Item = Vec<MonitorMessage>;

    fn idle_threshold(&self) -> Duration {
        MONITOR_BARREL_IDLE
    }

    fn subscriber_capacity(&self) -> usize {
        MONITOR_SUBSCRIBER_CAPACITY
    }

    fn insert(&self, barrel: &Barrel<MonitorState>, samples: Vec<MonitorMessage>) -> Result<(), StoreError> {
        let Some(host_name) = samples.first().map(|sample| sample.host_name.clone()) else {
            return Ok(());
        };
        let now = Instant::now();
        let mut state = barrel.state();
        match state.hosts.iter_mut().find(|host| host.host_name == host_name) {
            Some(host) => {
                host.samples = samples;
                host.updated_at = now;
            }
            None => state.hosts.push(HostSamples {
                host_name,
                samples,
                updated_at: now,
            }),
        }
        let stale = self.host_stale;
        state
            .hosts
            .retain(|host| now.saturating_duration_since(host.updated_at) <= stale);

        let top = aggregate(&state.hosts);
        let snapshot = Arc::new(EventLogMessage {
            event_id: barrel.key().to_string(),
            monitor_data: serde_json::to_vec(&top)?,
            ..Default::default()
        });
        state.snapshot = Some(Arc::clone(&snapshot));
        barrel.touch();
        barrel.broadcast(&snapshot);
        Ok(())
    }

    fn subscribe(&self, barrel: &Barrel<MonitorState>, sub_id: &str) -> SubscriberRx {
        let state = barrel.state();
        let backlog = state.snapshot.iter().cloned().collect();
        barrel.subscribe(sub_id, self.subscriber_capacity(), backlog)
    }
}

/// Merges every host's samples and keeps the top entries by cumulative time.
fn aggregate(hosts: &[HostSamples]) -> Vec<MonitorMessage> {
    let mut iter = hosts.iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    let mut merged = first.samples.clone();
    for host in iter {
        merged = merge(merged, &host.samples);
    }
    merged.sort_by(|a, b| {
        b.cumulative_time
            .partial_cmp(&a.cumulative_time)
            .unwrap_or(Ordering::Equal)
    });
    merged.truncate(MONITOR_TOP_K);
    merged
}

/// Merges `add` into `source` by metric key. Counts add up, averages are
/// averaged pairwise, cumulative times add up and the larger max wins.
fn merge(source: Vec<MonitorMessage>, add: &[MonitorMessage]) -> Vec<MonitorMessage> {
    let mut merged: Vec<MonitorMessage> = Vec::with_capacity(source.len() + add.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for sample in source {
        match index.get(&sample.key) {
            Some(&i) => merged[i] = sample,
            None => {
                index.insert(sample.key.clone(), merged.len());
                merged.push(sample);
            }
        }
    }
    for sample in add {
        match index.get(&sample.key) {
            Some(&i) => {
                let existing = &mut merged[i];
                existing.count += sample.count;
                existing.abnormal_count += sample.abnormal_count;
                existing.average_time =
                    round((existing.average_time + sample.average_time) / 2.0, 2);
                existing.cumulative_time =
                    round(existing.cumulative_time + sample.cumulative_time, 2);
                if sample.max_time > existing.max_time {
                    existing.max_time = sample.max_time;
                }
            }
            None => {
                index.insert(sample.key.clone(), merged.len());
                merged.push(sample.clone());
            }
        }
    }
    merged
}

pub struct MonitorMessageStore {
    buffer: KeyedBuffer<MonitorPolicy>,
}

impl Default for MonitorMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMessageStore {
    pub fn new() -> Self {
        Self {
            buffer: KeyedBuffer::new(MonitorPolicy {
                host_stale: MONITOR_HOST_STALE,
            }),
        }
    }
}

impl MessageStore for MonitorMessageStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Monitor
    }

    /// An empty sample list is a no-op. Samples without a service ID are
    /// rejected with [`StoreError::MissingKey`].
    fn insert_message(&self, message: EventLogMessage) -> Result<(), StoreError> {
        let samples: Vec<MonitorMessage> =
            serde_json::from_slice(&message.monitor_data).map_err(StoreError::UnreadableSamples)?;
        let Some(key) = samples.first().map(|sample| sample.service_id.clone()) else {
            return Ok(());
        };
        if key.is_empty() {
            return Err(StoreError::MissingKey);
        }
        self.buffer.insert(&key, samples)
    }

    fn sub_chan(&self, key: &str, sub_id: &str) -> Option<SubscriberRx> {
        Some(self.buffer.subscribe(key, sub_id))
    }

    fn release_sub_chan(&self, key: &str, sub_id: &str) {
        self.buffer.unsubscribe(key, sub_id);
    }

    fn subscriber_count(&self, key: &str) -> usize {
        self.buffer.subscriber_count(key)
    }

    fn history_message(&self, key: &str, _length: usize) -> Vec<String> {
        self.buffer
            .get(key)
            .and_then(|barrel| barrel.state().snapshot.clone())
            .map(|snapshot| vec![String::from_utf8_lossy(&snapshot.monitor_data).into_owned()])
            .unwrap_or_default()
    }

    fn monitor_data(&self) -> MonitorData {
        self.buffer.monitor_data()
    }

    fn barrel_count(&self) -> usize {
        self.buffer.barrel_count()
    }

    fn pool_stats(&self) -> PoolStats {
        self.buffer.pool_stats()
    }

    fn gc(&self) -> usize {
        self.buffer.gc(Instant::now()).len()
    }

    fn run(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![spawn_gc_loop(self, cancel)]
    }

    fn stop(&self) {}
}
