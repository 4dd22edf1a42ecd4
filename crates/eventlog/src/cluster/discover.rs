// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Node registration and peer discovery over the coordination store.
//!
//! Registry keys are `{home}/instance/{ip}:{pub_port}` holding the
//! [`Instance`] as JSON. Docker-log pins live at
//! `{home}/dockerloginstance/{service_id}` and hold an instance key.

use super::coordination::{CoordinationStore, WatchEvent};
use super::instance::{Instance, InstanceStatus};
use crate::constants::{PEER_RECONNECT_INTERVAL, REGISTER_RETRY_INTERVAL};
use crate::errors::ClusterError;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INSTANCE_EVENT_CHAN_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    Added(Instance),
    Deleted(Instance),
}

pub struct Discovery {
    store: Arc<dyn CoordinationStore>,
    home: String,
    current: RwLock<Instance>,
    others: RwLock<Vec<Instance>>,
    events: mpsc::Sender<InstanceEvent>,
}

impl Discovery {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        home: &str,
        current: Instance,
    ) -> (Self, mpsc::Receiver<InstanceEvent>) {
        let (events, rx) = mpsc::channel(INSTANCE_EVENT_CHAN_SIZE);
        let discovery = Self {
            store,
            home: home.trim_end_matches('/').to_string(),
            current: RwLock::new(current),
            others: RwLock::new(Vec::new()),
            events,
        };
        (discovery, rx)
    }

    fn instance_prefix(&self) -> String {
        format!("{}/instance/", self.home)
    }

    fn instance_path(&self, instance: &Instance) -> String {
        format!("{}{}", self.instance_prefix(), instance.key())
    }

    fn pin_path(&self, service_id: &str) -> String {
        format!("{}/dockerloginstance/{}", self.home, service_id)
    }

    pub fn current(&self) -> Instance {
        self.current.read().clone()
    }

    /// Adopts the port actually bound by the pub server. Call before registering.
    pub fn set_pub_port(&self, port: u16) {
        self.current.write().pub_port = port;
    }

    pub fn others(&self) -> Vec<Instance> {
        self.others.read().clone()
    }

    pub fn get_instance(&self, host_id: &str) -> Option<Instance> {
        let current = self.current.read();
        if current.host_id == host_id {
            return Some(current.clone());
        }
        self.others
            .read()
            .iter()
            .find(|instance| instance.host_id == host_id)
            .cloned()
    }

    pub fn get_instance_by_key(&self, key: &str) -> Option<Instance> {
        let current = self.current.read();
        if current.key() == key {
            return Some(current.clone());
        }
        self.others
            .read()
            .iter()
            .find(|instance| instance.key() == key)
            .cloned()
    }

    async fn put_instance(&self, instance: &Instance) -> Result<(), ClusterError> {
        let value = serde_json::to_string(instance)?;
        self.store.put(&self.instance_path(instance), &value).await
    }

    /// Registers this node with status `create`, retrying until it succeeds
    /// or `cancel` fires.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<Instance, ClusterError> {
        let mut instance = self.current();
        instance.status = InstanceStatus::Create;
        loop {
            match self.put_instance(&instance).await {
                Ok(()) => {
                    *self.current.write() = instance.clone();
                    info!(
                        "registered instance {} ({}) in cluster",
                        instance.host_id,
                        instance.key()
                    );
                    return Ok(instance);
                }
                Err(e) => error!("failed to register instance: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(REGISTER_RETRY_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    return Err(ClusterError::Coordination(
                        "registration cancelled".to_string(),
                    ))
                }
            }
        }
    }

    pub async fn deregister(&self) {
        let current = self.current();
        match self.store.delete(&self.instance_path(&current)).await {
            Ok(()) => info!("deregistered instance {}", current.key()),
            Err(e) => error!("failed to deregister instance: {}", e),
        }
    }

    /// Heartbeat: re-puts this node with status `update`.
    pub async fn update_current(&self) {
        let mut current = self.current();
        current.status = InstanceStatus::Update;
        match self.put_instance(&current).await {
            Ok(()) => *self.current.write() = current,
            Err(e) => error!("failed to update instance: {}", e),
        }
    }

    /// Loads the registry, then follows it until cancelled.
    pub fn spawn_watch(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let prefix = self.instance_prefix();
            loop {
                match self.store.get_prefix(&prefix).await {
                    Ok(entries) => {
                        for (key, value) in entries {
                            self.add(&key, &value).await;
                        }
                        break;
                    }
                    Err(e) => error!("failed to load instances: {}", e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(PEER_RECONNECT_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            loop {
                let mut watch = match self.store.watch_prefix(&prefix).await {
                    Ok(watch) => watch,
                    Err(e) => {
                        error!("failed to watch instances: {}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(PEER_RECONNECT_INTERVAL) => continue,
                            _ = cancel.cancelled() => return,
                        }
                    }
                };
                loop {
                    tokio::select! {
                        event = watch.recv() => match event {
                            Some(WatchEvent::Put { key, value }) => self.add(&key, &value).await,
                            Some(WatchEvent::Delete { key }) => self.remove(&key).await,
                            None => break,
                        },
                        _ = cancel.cancelled() => return,
                    }
                }
                warn!("instance watch ended, restarting");
            }
        })
    }

    fn is_current(&self, key: &str) -> bool {
        key.ends_with(&format!("/{}", self.current.read().key()))
    }

    async fn add(&self, key: &str, value: &str) {
        if self.is_current(key) {
            return;
        }
        let instance: Instance = match serde_json::from_str(value) {
            Ok(instance) => instance,
            Err(e) => {
                error!("failed to decode instance {}: {}", key, e);
                return;
            }
        };
        let added = {
            let mut others = self.others.write();
            match others.iter_mut().find(|i| i.host_id == instance.host_id) {
                Some(existing) => {
                    *existing = instance.clone();
                    debug!("updated instance {}", instance.host_id);
                    false
                }
                None => {
                    others.push(instance.clone());
                    true
                }
            }
        };
        if added {
            info!(
                "found instance {} ({}) host {}",
                instance.host_id,
                instance.key(),
                instance.host_name
            );
            if self.events.send(InstanceEvent::Added(instance)).await.is_err() {
                debug!("instance events receiver dropped");
            }
        }
    }

    async fn remove(&self, key: &str) {
        if self.is_current(key) {
            return;
        }
        let host_port = key.rsplit('/').next().unwrap_or(key);
        let removed = {
            let mut others = self.others.write();
            others
                .iter()
                .position(|i| i.key() == host_port)
                .map(|index| others.remove(index))
        };
        if let Some(instance) = removed {
            info!("instance {} went offline", instance.host_name);
            if self.events.send(InstanceEvent::Deleted(instance)).await.is_err() {
                debug!("instance events receiver dropped");
            }
        }
    }

    /// Called when a node stops reporting load. A peer is tagged abnormal;
    /// once more than half of the cluster has tagged it, its registration is
    /// removed and `Delete` is returned. The local node is only ever abnormal,
    /// and an unknown node is already gone.
    pub async fn instance_check_health(&self, host_id: &str) -> InstanceStatus {
        if self.current.read().host_id == host_id {
            error!("local instance stopped reporting load");
            return InstanceStatus::Abnormal;
        }
        let (instance, quorum) = {
            let mut others = self.others.write();
            let total = others.len();
            let Some(instance) = others.iter_mut().find(|i| i.host_id == host_id) else {
                return InstanceStatus::Delete;
            };
            instance.status = InstanceStatus::Abnormal;
            instance.tag_number += 1;
            (instance.clone(), instance.tag_number > (total + 1) / 2)
        };
        error!(instance = host_id, "instance is abnormal");
        if quorum {
            warn!(
                instance = host_id,
                "instance tagged abnormal by a majority, removing its registration"
            );
            if let Err(e) = self.store.delete(&self.instance_path(&instance)).await {
                error!("failed to remove instance {}: {}", host_id, e);
            }
            return InstanceStatus::Delete;
        }
        if let Err(e) = self.put_instance(&instance).await {
            error!("failed to update instance {}: {}", host_id, e);
        }
        InstanceStatus::Abnormal
    }

    #[cfg(test)]
    pub(crate) async fn observe_peer(&self, instance: Instance) {
        let value = serde_json::to_string(&instance).unwrap_or_default();
        self.add(&self.instance_path(&instance), &value).await;
    }

    pub async fn get_pin(&self, service_id: &str) -> Result<Option<String>, ClusterError> {
        self.store.get(&self.pin_path(service_id)).await
    }

    pub async fn save_pin(&self, service_id: &str, instance: &Instance) -> Result<(), ClusterError> {
        self.store
            .put(&self.pin_path(service_id), &instance.key())
            .await
    }
}

#[cfg(test)]
pub(crate) fn test_instance(host_id: &str, ip: &str) -> Instance {
    Instance {
        host_id: host_id.to_string(),
        host_ip: ip.to_string(),
        host_name: host_id.to_string(),
        pub_port: 6365,
        docker_log_port: 6362,
        web_port: 6363,
        status: InstanceStatus::Create,
        tag_number: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordination::MemoryCoordinationStore;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<InstanceEvent>) -> InstanceEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timely")
            .expect("event")
    }

    async fn put_peer(store: &MemoryCoordinationStore, instance: &Instance) {
        store
            .put(
                &format!("/event/instance/{}", instance.key()),
                &serde_json::to_string(instance).expect("encode"),
            )
            .await
            .expect("put");
    }

    #[tokio::test]
    async fn test_register_and_discover_peers() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let peer_a = test_instance("a", "10.0.0.2");
        put_peer(&store, &peer_a).await;

        let (discovery, mut events) =
            Discovery::new(store.clone(), "/event", test_instance("self", "10.0.0.1"));
        let discovery = Arc::new(discovery);
        let cancel = CancellationToken::new();
        let registered = discovery.register(&cancel).await.expect("register");
        assert_eq!(registered.status, InstanceStatus::Create);
        assert!(store
            .get("/event/instance/10.0.0.1:6365")
            .await
            .expect("get")
            .is_some());

        let _watch = Arc::clone(&discovery).spawn_watch(cancel.clone());
        assert_eq!(next_event(&mut events).await, InstanceEvent::Added(peer_a.clone()));

        let peer_b = test_instance("b", "10.0.0.3");
        // Watch registration races the first put, so retry until it lands.
        let event = loop {
            put_peer(&store, &peer_b).await;
            if let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(100), events.recv()).await
            {
                break event;
            }
        };
        assert_eq!(event, InstanceEvent::Added(peer_b.clone()));

        store
            .delete("/event/instance/10.0.0.2:6365")
            .await
            .expect("delete");
        assert_eq!(next_event(&mut events).await, InstanceEvent::Deleted(peer_a));
        assert_eq!(discovery.others(), vec![peer_b]);

        // The local node never shows up as a peer.
        discovery.update_current().await;
        assert!(discovery.others().iter().all(|i| i.host_id != "self"));
        assert_eq!(discovery.current().status, InstanceStatus::Update);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_check_health_requires_majority() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let (discovery, _events) =
            Discovery::new(store.clone(), "/event", test_instance("self", "10.0.0.1"));
        for (id, ip) in [("a", "10.0.0.2"), ("b", "10.0.0.3")] {
            discovery.observe_peer(test_instance(id, ip)).await;
        }

        assert_eq!(
            discovery.instance_check_health("a").await,
            InstanceStatus::Abnormal
        );
        assert_eq!(
            discovery.get_instance("a").expect("peer").status,
            InstanceStatus::Abnormal
        );
        assert_eq!(
            discovery.instance_check_health("a").await,
            InstanceStatus::Delete
        );
        assert_eq!(
            discovery.instance_check_health("self").await,
            InstanceStatus::Abnormal
        );
        assert_eq!(
            discovery.instance_check_health("ghost").await,
            InstanceStatus::Delete
        );
    }

    #[tokio::test]
    async fn test_pins() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let (discovery, _events) =
            Discovery::new(store, "/event/", test_instance("self", "10.0.0.1"));
        assert_eq!(discovery.get_pin("svc").await.expect("get"), None);
        discovery
            .save_pin("svc", &discovery.current())
            .await
            .expect("pin");
        assert_eq!(
            discovery.get_pin("svc").await.expect("get"),
            Some("10.0.0.1:6365".to_string())
        );
        assert_eq!(
            discovery.get_instance_by_key("10.0.0.1:6365").map(|i| i.host_id),
            Some("self".to_string())
        );
    }
}
