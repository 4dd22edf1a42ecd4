// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus exposition. Every value is read from live state at scrape time.

use crate::cluster::instance::Instance;
use crate::store::manager::StoreManager;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "eventlog";

pub struct Metrics {
    registry: Registry,
    barrel_count: IntGaugeVec,
    log_count: IntGaugeVec,
    chan_cache_size: IntGaugeVec,
    health_status: IntGauge,
    instance_up: IntGaugeVec,
    pool_hits: IntGaugeVec,
    pool_misses: IntGaugeVec,
    dropped: IntCounterVec,
}

fn gauge_vec(name: &str, help: &str, label: &str) -> prometheus::Result<IntGaugeVec> {
    IntGaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &[label])
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            barrel_count: gauge_vec("store_barrel_count", "Barrels held per store", "store")?,
            log_count: gauge_vec(
                "store_log_count",
                "Messages received per store since the last gc tick",
                "store",
            )?,
            chan_cache_size: gauge_vec(
                "chan_cache_size",
                "Messages waiting in each ingestion channel",
                "chan",
            )?,
            health_status: IntGauge::with_opts(
                Opts::new("health_status", "1 when no ingestion channel is saturated")
                    .namespace(NAMESPACE),
            )?,
            instance_up: gauge_vec("instance_up", "Cluster instance liveness", "instance")?,
            pool_hits: gauge_vec("barrel_pool_hits", "Barrels reused from the pool", "store")?,
            pool_misses: gauge_vec(
                "barrel_pool_misses",
                "Barrels allocated because the pool was empty",
                "store",
            )?,
            dropped: IntCounterVec::new(
                Opts::new(
                    "dropped_messages_total",
                    "Payloads dropped on a full channel or rejected as unreadable",
                )
                    .namespace(NAMESPACE),
                &["source"],
            )?,
        };
        metrics.registry.register(Box::new(metrics.barrel_count.clone()))?;
        metrics.registry.register(Box::new(metrics.log_count.clone()))?;
        metrics.registry.register(Box::new(metrics.chan_cache_size.clone()))?;
        metrics.registry.register(Box::new(metrics.health_status.clone()))?;
        metrics.registry.register(Box::new(metrics.instance_up.clone()))?;
        metrics.registry.register(Box::new(metrics.pool_hits.clone()))?;
        metrics.registry.register(Box::new(metrics.pool_misses.clone()))?;
        metrics.registry.register(Box::new(metrics.dropped.clone()))?;
        Ok(metrics)
    }

    pub fn refresh(&self, manager: &StoreManager, instances: &[Instance]) {
        for store in manager.stores() {
            let kind = store.kind().as_str();
            self.barrel_count
                .with_label_values(&[kind])
                .set(to_i64(store.barrel_count()));
            self.log_count
                .with_label_values(&[kind])
                .set(to_i64(store.monitor_data().log_size_peer_m));
            let pool = store.pool_stats();
            self.pool_hits.with_label_values(&[kind]).set(to_i64(pool.hits));
            self.pool_misses
                .with_label_values(&[kind])
                .set(to_i64(pool.misses));
        }
        for (chan, used) in manager.channel_usage() {
            self.chan_cache_size
                .with_label_values(&[chan])
                .set(to_i64(used));
        }
        self.health_status
            .set(i64::from(manager.health_check().is_healthy()));

        self.instance_up.reset();
        for instance in instances {
            self.instance_up
                .with_label_values(&[instance.key().as_str()])
                .set(i64::from(instance.status.is_up()));
        }

        for (source, total) in manager.dropped().snapshot() {
            let counter = self.dropped.with_label_values(&[source]);
            let seen = counter.get();
            if total > seen {
                counter.inc_by(total - seen);
            }
        }
    }

    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}
