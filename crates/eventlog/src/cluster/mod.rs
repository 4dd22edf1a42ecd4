// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership, replication and log routing.
//!
//! A single-node deployment runs the same components over the in-memory
//! coordination store with replication switched off.

pub mod coordination;
pub mod discover;
pub mod distribution;
pub mod instance;
pub mod pubsub;

use crate::constants::{INSTANCE_HEARTBEAT_INTERVAL, MONITOR_BROADCAST_INTERVAL};
use crate::errors::ClusterError;
use crate::message::{ClusterMessage, MessageMode};
use crate::store::manager::StoreManager;
use coordination::CoordinationStore;
use discover::{Discovery, InstanceEvent};
use distribution::Distribution;
use instance::Instance;
use parking_lot::Mutex;
use pubsub::{PubServer, SubClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Coordination store prefix every key lives under.
    pub home: String,
    pub bind_ip: String,
    /// Run the pub server and follow peers.
    pub replicate: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            home: "/event".to_string(),
            bind_ip: "0.0.0.0".to_string(),
            replicate: false,
        }
    }
}

pub struct Cluster {
    config: ClusterConfig,
    manager: Arc<StoreManager>,
    discovery: Arc<Discovery>,
    distribution: Arc<Distribution>,
    publisher: Arc<PubServer>,
    sub: Arc<SubClient>,
    instance_events: Mutex<Option<mpsc::Receiver<InstanceEvent>>>,
    cancel: CancellationToken,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        store: Arc<dyn CoordinationStore>,
        current: Instance,
        manager: Arc<StoreManager>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (discovery, instance_events) = Discovery::new(store, &config.home, current);
        let discovery = Arc::new(discovery);
        let distribution = Arc::new(Distribution::new(Arc::clone(&discovery)));
        let sub = Arc::new(SubClient::new(
            Arc::clone(&manager),
            Arc::clone(&distribution),
            cancel.clone(),
        ));
        Self {
            config,
            manager,
            discovery,
            distribution,
            publisher: Arc::new(PubServer::new()),
            sub,
            instance_events: Mutex::new(Some(instance_events)),
            cancel,
        }
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn distribution(&self) -> &Arc<Distribution> {
        &self.distribution
    }

    pub fn current_instance(&self) -> Instance {
        self.discovery.current()
    }

    /// This node followed by every known peer.
    pub fn instances(&self) -> Vec<Instance> {
        let mut instances = vec![self.discovery.current()];
        instances.extend(self.discovery.others());
        instances
    }

    pub fn sub_listener_count(&self) -> usize {
        self.sub.listener_count()
    }

    pub async fn get_suitable_instance(&self, service_id: &str) -> Instance {
        self.distribution.get_suitable_instance(service_id).await
    }

    pub async fn save_pin(&self, service_id: &str, instance: &Instance) -> Result<(), ClusterError> {
        self.discovery.save_pin(service_id, instance).await
    }

    /// Binds the pub server when replicating, registers this node and starts
    /// discovery, health checking and the heartbeat.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, ClusterError> {
        let Some(mut instance_events) = self.instance_events.lock().take() else {
            return Err(ClusterError::Coordination(
                "cluster is already started".to_string(),
            ));
        };
        let mut tasks = Vec::new();

        if self.config.replicate {
            let address = format!(
                "{}:{}",
                self.config.bind_ip,
                self.discovery.current().pub_port
            );
            let listener = PubServer::bind(&address).await?;
            self.discovery.set_pub_port(listener.local_addr()?.port());
            tasks.push(Arc::clone(&self.publisher).serve(listener, self.cancel.clone()));
            match self.manager.take_pub_receiver() {
                Some(messages) => tasks.push(
                    Arc::clone(&self.publisher).forward(messages, self.cancel.clone()),
                ),
                None => error!("replication queue already taken, local messages will not be published"),
            }
        }

        self.discovery.register(&self.cancel).await?;
        tasks.push(Arc::clone(&self.discovery).spawn_watch(self.cancel.clone()));

        let cluster = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = instance_events.recv() => match event {
                        Some(event) => cluster.on_instance_event(event),
                        None => break,
                    },
                    _ = cluster.cancel.cancelled() => break,
                }
            }
        }));
        tasks.push(Arc::clone(&self.distribution).spawn_health_loop(self.cancel.clone()));
        tasks.push(self.spawn_heartbeat());
        if self.config.replicate {
            tasks.push(Arc::clone(&self.sub).spawn_sweep());
        }
        info!(
            "cluster started as {} (replication {})",
            self.discovery.current().key(),
            if self.config.replicate { "on" } else { "off" }
        );
        Ok(tasks)
    }

    fn on_instance_event(&self, event: InstanceEvent) {
        match event {
            InstanceEvent::Added(instance) => {
                if self.config.replicate {
                    self.sub.subscribe(instance);
                }
            }
            InstanceEvent::Deleted(instance) => {
                self.sub.unsubscribe(&instance);
                self.distribution.remove_instance(&instance.host_id);
            }
        }
    }

    /// Publishes this node's load every few seconds and refreshes its
    /// registration less often.
    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut load = tokio::time::interval(MONITOR_BROADCAST_INTERVAL);
            let mut register = tokio::time::interval(INSTANCE_HEARTBEAT_INTERVAL);
            register.tick().await;
            loop {
                tokio::select! {
                    _ = load.tick() => cluster.broadcast_load(),
                    _ = register.tick() => cluster.discovery.update_current().await,
                    _ = cluster.cancel.cancelled() => break,
                }
            }
        })
    }

    pub(crate) fn broadcast_load(&self) {
        let mut data = self.manager.monitor();
        data.instance_id = self.discovery.current().host_id;
        match serde_json::to_vec(&data) {
            Ok(payload) => {
                let peers = self
                    .publisher
                    .publish(&ClusterMessage::new(MessageMode::MonitorData, payload));
                debug!("load report sent to {} peers", peers);
            }
            Err(e) => error!("failed to encode load report: {}", e),
        }
        self.distribution.update_monitor_data(data);
    }

    /// Stops every cluster task and removes this node's registration.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.sub.stop();
        self.discovery.deregister().await;
        info!("cluster stopped");
    }
}
