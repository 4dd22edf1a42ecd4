// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{config::EventLogConfig, error::ServicesError};
use eventlog::{
    cluster::{
        coordination::{CoordinationStore, MemoryCoordinationStore},
        instance::{Instance, InstanceStatus},
        Cluster, ClusterConfig,
    },
    entry::{Entry, EntryConfig},
    file_store::FileStore,
    metadata::MemoryEventRecordStore,
    metrics::Metrics,
    store::{
        garbage::GarbageSink,
        manager::{StoreManager, StoreManagerConfig},
    },
    web::{AppState, WebConfig, WebServer},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Status of the event log services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Services are starting up.
    Starting,
    /// Services are running normally.
    Running,
    /// Services are shutting down.
    Stopping,
    /// Services have stopped.
    Stopped,
}

/// Where each listener ended up, useful when ports were chosen by the OS.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddresses {
    pub event_log: SocketAddr,
    pub docker_log: SocketAddr,
    pub monitor: SocketAddr,
    pub web: SocketAddr,
}

/// Handle to the running services.
///
/// This handle allows checking the status and stopping the services.
#[derive(Clone)]
pub struct ServicesHandle {
    status: Arc<RwLock<ServiceStatus>>,
    status_tx: broadcast::Sender<ServiceStatus>,
    cancel: CancellationToken,
    addresses: BoundAddresses,
    manager: Arc<StoreManager>,
    cluster: Arc<Cluster>,
}

impl ServicesHandle {
    /// Check if the services are currently running.
    pub async fn is_running(&self) -> bool {
        matches!(*self.status.read().await, ServiceStatus::Running)
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    pub fn addresses(&self) -> BoundAddresses {
        self.addresses
    }

    pub fn manager(&self) -> &Arc<StoreManager> {
        &self.manager
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Stop the services. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<(), ServicesError> {
        let mut status = self.status.write().await;
        match *status {
            ServiceStatus::Stopped | ServiceStatus::Stopping => return Ok(()),
            ServiceStatus::Starting => return Err(ServicesError::NotRunning),
            ServiceStatus::Running => {}
        }
        *status = ServiceStatus::Stopping;
        drop(status);
        let _ = self.status_tx.send(ServiceStatus::Stopping);

        // Signal shutdown
        self.cancel.cancel();
        Ok(())
    }

    /// Resolves once shutdown has finished flushing.
    pub async fn stopped(&self) {
        let mut rx = self.status_tx.subscribe();
        if *self.status.read().await == ServiceStatus::Stopped {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(ServiceStatus::Stopped) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if *self.status.read().await == ServiceStatus::Stopped {
                        return;
                    }
                }
            }
        }
    }
}

/// Main event log services coordinator.
///
/// Wires ingestion, stores, cluster and the web server together.
#[derive(Debug)]
pub struct EventLogServices {
    config: EventLogConfig,
}

impl EventLogServices {
    pub fn new(config: EventLogConfig) -> Self {
        Self { config }
    }

    /// Binds every listener and starts the services.
    ///
    /// Bind failures and an unreachable coordination store are returned here;
    /// nothing keeps running after an error.
    pub async fn start(self) -> Result<ServicesHandle, ServicesError> {
        let config = self.config;
        let status = Arc::new(RwLock::new(ServiceStatus::Starting));
        let (status_tx, _status_rx) = broadcast::channel(16);

        let files = Arc::new(FileStore::new(&config.log_home));
        let garbage = Arc::new(GarbageSink::new(&config.garbage_file));
        let manager = Arc::new(StoreManager::new(
            store_config(&config),
            files,
            garbage,
            Arc::new(MemoryEventRecordStore::new()),
        ));

        let entry = Entry::bind(&EntryConfig {
            bind_ip: config.bind_ip.clone(),
            event_log_port: config.event_log_port,
            docker_log_port: config.docker_log_port,
            monitor_port: config.monitor_udp_port,
        })
        .await
        .map_err(|e| ServicesError::Bind(e.to_string()))?;
        let web = WebServer::bind(WebConfig {
            bind_ip: config.bind_ip.clone(),
            port: config.web_port,
            metrics_path: config.metrics_path.clone(),
        })
        .await
        .map_err(|e| ServicesError::Bind(e.to_string()))?;

        let local = |addr: std::io::Result<SocketAddr>| {
            addr.map_err(|e| ServicesError::Runtime(format!("listener has no local address: {}", e)))
        };
        let addresses = BoundAddresses {
            event_log: local(entry.event_log_addr())?,
            docker_log: local(entry.docker_log_addr())?,
            monitor: local(entry.monitor_addr())?,
            web: local(web.local_addr())?,
        };

        let current = Instance {
            host_id: config.host_id.clone(),
            host_ip: config.host_ip.clone(),
            host_name: config.host_name.clone(),
            pub_port: config.cluster_pub_port,
            docker_log_port: addresses.docker_log.port(),
            web_port: addresses.web.port(),
            status: InstanceStatus::Create,
            tag_number: 0,
        };
        let coordination = coordination_store(&config).await?;
        let cluster = Arc::new(Cluster::new(
            ClusterConfig {
                home: config.etcd_home.clone(),
                bind_ip: config.bind_ip.clone(),
                replicate: config.cluster_mode,
            },
            coordination,
            current,
            Arc::clone(&manager),
        ));
        let metrics = Arc::new(
            Metrics::new().map_err(|e| ServicesError::Runtime(format!("metrics registry: {}", e)))?,
        );

        let cancel = CancellationToken::new();
        let mut tasks = Arc::clone(&manager).run(cancel.clone());
        match cluster.start().await {
            Ok(cluster_tasks) => tasks.extend(cluster_tasks),
            Err(e) => {
                cancel.cancel();
                stop_manager(Arc::clone(&manager)).await;
                return Err(ServicesError::ClusterStart(e.to_string()));
            }
        }
        tasks.extend(entry.serve(Arc::clone(&manager), cancel.clone()));
        let web_task = web.serve(AppState {
            manager: Arc::clone(&manager),
            cluster: Arc::clone(&cluster),
            metrics,
            timeout: Duration::from_secs(config.websocket_timeout_secs),
            handshake_timeout: Duration::from_secs(config.websocket_handshake_timeout_secs),
            cancel: cancel.clone(),
        });

        info!(
            event_log = %addresses.event_log,
            docker_log = %addresses.docker_log,
            monitor = %addresses.monitor,
            web = %addresses.web,
            "event log services started"
        );
        *status.write().await = ServiceStatus::Running;
        let _ = status_tx.send(ServiceStatus::Running);

        let handle = ServicesHandle {
            status: Arc::clone(&status),
            status_tx: status_tx.clone(),
            cancel: cancel.clone(),
            addresses,
            manager: Arc::clone(&manager),
            cluster: Arc::clone(&cluster),
        };

        tokio::spawn(async move {
            cancel.cancelled().await;
            info!("Shutting down services");
            cluster.stop().await;
            match tokio::time::timeout(SHUTDOWN_GRACE, web_task).await {
                Ok(Ok(Ok(()))) => debug!("web server stopped"),
                Ok(Ok(Err(e))) => error!("web server error: {}", e),
                Ok(Err(e)) => error!("web server task failed: {}", e),
                Err(_) => warn!("web server did not stop in time"),
            }
            for task in tasks {
                if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                    warn!("a background task did not stop in time");
                }
            }
            stop_manager(manager).await;
            *status.write().await = ServiceStatus::Stopped;
            let _ = status_tx.send(ServiceStatus::Stopped);
        });

        Ok(handle)
    }
}

/// Flushes every store on the blocking pool.
async fn stop_manager(manager: Arc<StoreManager>) {
    if let Err(e) = tokio::task::spawn_blocking(move || manager.stop()).await {
        error!("store shutdown task failed: {}", e);
    }
}

fn store_config(config: &EventLogConfig) -> StoreManagerConfig {
    StoreManagerConfig {
        message_max_number: config.message_max_number,
        message_cache_number: config.message_cache_number,
        docker_cache_number: config.docker_cache_number,
        handle_message_workers: config.handle_message_workers,
        handle_sub_workers: config.handle_sub_workers,
        handle_docker_workers: config.handle_docker_workers,
        event_retention_days: config.event_retention_days,
        service_retention_days: config.service_retention_days,
        cluster_mode: config.cluster_mode,
    }
}

#[cfg(feature = "etcd")]
async fn coordination_store(
    config: &EventLogConfig,
) -> Result<Arc<dyn CoordinationStore>, ServicesError> {
    use eventlog::cluster::coordination::EtcdCoordinationStore;

    if !config.cluster_mode {
        return Ok(Arc::new(MemoryCoordinationStore::new()));
    }
    let store = EtcdCoordinationStore::connect(&config.etcd_endpoints)
        .await
        .map_err(|e| ServicesError::ClusterStart(e.to_string()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn coordination_store(
    config: &EventLogConfig,
) -> Result<Arc<dyn CoordinationStore>, ServicesError> {
    if config.cluster_mode {
        return Err(ServicesError::InvalidConfig(
            "cluster mode needs a build with the etcd feature".to_string(),
        ));
    }
    Ok(Arc::new(MemoryCoordinationStore::new()))
}
