// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Load-aware choice of the node that should receive a service's container logs.

use super::discover::Discovery;
use super::instance::{Instance, InstanceStatus};
use crate::constants::{DISTRIBUTION_HEALTH_INTERVAL, MONITOR_DATA_STALE, SERVICE_SIZE_WEIGHT};
use crate::message::MonitorData;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct LoadReport {
    data: MonitorData,
    received_at: Instant,
}

pub struct Distribution {
    discovery: Arc<Discovery>,
    monitor_datas: RwLock<HashMap<String, LoadReport>>,
    abnormal: RwLock<HashSet<String>>,
}

/// Load score of one node; lower is better.
pub fn load_score(data: &MonitorData) -> u64 {
    data.log_size_peer_m + SERVICE_SIZE_WEIGHT * data.service_size
}

/// Picks the least-loaded healthy node. Ties go to the smallest instance ID.
pub fn select_instance<'a>(
    reports: impl IntoIterator<Item = &'a MonitorData>,
    abnormal: &HashSet<String>,
) -> Option<String> {
    reports
        .into_iter()
        .filter(|data| !abnormal.contains(&data.instance_id))
        .min_by(|a, b| {
            load_score(a)
                .cmp(&load_score(b))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        })
        .map(|data| data.instance_id.clone())
}

impl Distribution {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self {
            discovery,
            monitor_datas: RwLock::new(HashMap::new()),
            abnormal: RwLock::new(HashSet::new()),
        }
    }

    /// Records the latest load of a node. A report clears any abnormal mark.
    pub fn update_monitor_data(&self, data: MonitorData) {
        if data.instance_id.is_empty() {
            debug!("ignoring load report without instance id");
            return;
        }
        if self.abnormal.write().remove(&data.instance_id) {
            info!(instance = data.instance_id.as_str(), "instance reports load again");
        }
        self.monitor_datas.write().insert(
            data.instance_id.clone(),
            LoadReport {
                data,
                received_at: Instant::now(),
            },
        );
    }

    pub fn mark_abnormal(&self, instance_id: &str) {
        self.abnormal.write().insert(instance_id.to_string());
    }

    pub fn is_abnormal(&self, instance_id: &str) -> bool {
        self.abnormal.read().contains(instance_id)
    }

    /// Forgets a node that left the cluster.
    pub fn remove_instance(&self, instance_id: &str) {
        self.monitor_datas.write().remove(instance_id);
        self.abnormal.write().remove(instance_id);
    }

    pub fn monitor_data(&self, instance_id: &str) -> Option<MonitorData> {
        self.monitor_datas
            .read()
            .get(instance_id)
            .map(|report| report.data.clone())
    }

    fn least_loaded(&self) -> Option<String> {
        let reports = self.monitor_datas.read();
        let abnormal = self.abnormal.read();
        select_instance(reports.values().map(|report| &report.data), &abnormal)
    }

    /// Resolves the node for `service_id`: a healthy pin wins, then the
    /// least-loaded node, then this node.
    pub async fn get_suitable_instance(&self, service_id: &str) -> Instance {
        match self.discovery.get_pin(service_id).await {
            Ok(Some(key)) => match self.discovery.get_instance_by_key(&key) {
                Some(instance) if !self.is_abnormal(&instance.host_id) => {
                    debug!(service_id, "using pinned instance {}", key);
                    return instance;
                }
                _ => debug!(service_id, "pinned instance {} is unavailable", key),
            },
            Ok(None) => {}
            Err(e) => warn!(service_id, "failed to read instance pin: {}", e),
        }
        self.least_loaded()
            .and_then(|id| self.discovery.get_instance(&id))
            .unwrap_or_else(|| self.discovery.current())
    }

    /// Expires stale load reports and asks discovery to confirm each silent node.
    pub async fn check_health(&self, stale_after: Duration) {
        let now = Instant::now();
        let stale: Vec<String> = {
            let mut reports = self.monitor_datas.write();
            let stale = reports
                .iter()
                .filter(|(_, report)| now.saturating_duration_since(report.received_at) > stale_after)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            for id in &stale {
                reports.remove(id);
            }
            stale
        };
        for id in stale {
            warn!(instance = id.as_str(), "instance load report is stale");
            self.mark_abnormal(&id);
            if self.discovery.instance_check_health(&id).await == InstanceStatus::Delete {
                self.abnormal.write().remove(&id);
            }
        }
    }

    pub fn spawn_health_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISTRIBUTION_HEALTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_health(MONITOR_DATA_STALE).await,
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordination::MemoryCoordinationStore;
    use crate::cluster::discover::test_instance;

    fn load(instance_id: &str, log_size_peer_m: u64) -> MonitorData {
        MonitorData {
            instance_id: instance_id.to_string(),
            service_size: 0,
            log_size_peer_m,
        }
    }

    async fn distribution() -> (Arc<Discovery>, Distribution) {
        let store = Arc::new(MemoryCoordinationStore::new());
        let (discovery, _events) =
            Discovery::new(store, "/event", test_instance("self", "10.0.0.1"));
        let discovery = Arc::new(discovery);
        for (id, ip) in [("a", "10.0.0.2"), ("b", "10.0.0.3")] {
            discovery.observe_peer(test_instance(id, ip)).await;
        }
        (Arc::clone(&discovery), Distribution::new(discovery))
    }

    #[test]
    fn test_score_weights_services() {
        let heavy = MonitorData {
            instance_id: "a".to_string(),
            service_size: 10,
            log_size_peer_m: 0,
        };
        let busy = load("b", 150);
        assert_eq!(load_score(&heavy), 200);
        assert_eq!(
            select_instance([&heavy, &busy], &HashSet::new()),
            Some("b".to_string())
        );
        assert_eq!(select_instance(std::iter::empty(), &HashSet::new()), None);
    }

    #[tokio::test]
    async fn test_least_loaded_then_failover() {
        let (_discovery, distribution) = distribution().await;
        distribution.update_monitor_data(load("a", 200));
        distribution.update_monitor_data(load("b", 150));
        assert_eq!(distribution.get_suitable_instance("svc").await.host_id, "b");

        distribution.mark_abnormal("b");
        assert_eq!(distribution.get_suitable_instance("svc").await.host_id, "a");

        // A fresh report brings the node back.
        distribution.update_monitor_data(load("b", 150));
        assert_eq!(distribution.get_suitable_instance("svc").await.host_id, "b");
    }

    #[tokio::test]
    async fn test_pin_wins_unless_abnormal() {
        let (discovery, distribution) = distribution().await;
        distribution.update_monitor_data(load("a", 200));
        distribution.update_monitor_data(load("b", 150));
        let a = discovery.get_instance("a").expect("peer a");
        discovery.save_pin("svc", &a).await.expect("pin");
        assert_eq!(distribution.get_suitable_instance("svc").await.host_id, "a");

        distribution.mark_abnormal("a");
        assert_eq!(distribution.get_suitable_instance("svc").await.host_id, "b");
    }

    #[tokio::test]
    async fn test_no_reports_falls_back_to_local_instance() {
        let (_discovery, distribution) = distribution().await;
        assert_eq!(
            distribution.get_suitable_instance("svc").await.host_id,
            "self"
        );
    }

    #[tokio::test]
    async fn test_stale_reports_mark_instances_abnormal() {
        let (discovery, distribution) = distribution().await;
        distribution.update_monitor_data(load("a", 10));
        tokio::time::sleep(Duration::from_millis(5)).await;
        distribution.check_health(Duration::ZERO).await;
        assert!(distribution.monitor_data("a").is_none());
        assert!(distribution.is_abnormal("a"));
        assert_eq!(
            discovery.get_instance("a").expect("still registered").status,
            InstanceStatus::Abnormal
        );
    }
}
