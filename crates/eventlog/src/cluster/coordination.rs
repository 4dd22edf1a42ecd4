// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Key-value store shared by every node of a cluster.

use crate::errors::ClusterError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

const WATCH_CHAN_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), ClusterError>;

    async fn get(&self, key: &str) -> Result<Option<String>, ClusterError>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, ClusterError>;

    async fn delete(&self, key: &str) -> Result<(), ClusterError>;

    /// Streams changes under `prefix` until the receiver is dropped.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, ClusterError>;
}

/// Process-local store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    data: RwLock<BTreeMap<String, String>>,
    watchers: Mutex<Vec<(String, mpsc::Sender<WatchEvent>)>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, event: WatchEvent) {
        self.watchers.lock().retain(|(prefix, tx)| {
            if !event.key().starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("coordination watcher on {} is full, event dropped", prefix);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), ClusterError> {
        self.data.write().insert(key.to_string(), value.to_string());
        self.notify(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, ClusterError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ClusterError> {
        if self.data.write().remove(key).is_some() {
            self.notify(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_CHAN_SIZE);
        self.watchers.lock().push((prefix.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinationStore;

#[cfg(feature = "etcd")]
mod etcd {
    use super::{CoordinationStore, WatchEvent, WATCH_CHAN_SIZE};
    use crate::errors::ClusterError;
    use async_trait::async_trait;
    use etcd_client::{Client, EventType, GetOptions, WatchOptions};
    use tokio::sync::mpsc;
    use tracing::{debug, warn};

    fn coordination_error(e: etcd_client::Error) -> ClusterError {
        ClusterError::Coordination(e.to_string())
    }

    /// etcd v3 backed store.
    #[derive(Clone)]
    pub struct EtcdCoordinationStore {
        client: Client,
    }

    impl EtcdCoordinationStore {
        pub async fn connect(endpoints: &[String]) -> Result<Self, ClusterError> {
            let client = Client::connect(endpoints, None)
                .await
                .map_err(coordination_error)?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl CoordinationStore for EtcdCoordinationStore {
        async fn put(&self, key: &str, value: &str) -> Result<(), ClusterError> {
            self.client
                .clone()
                .put(key, value, None)
                .await
                .map_err(coordination_error)?;
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
            let response = self
                .client
                .clone()
                .get(key, None)
                .await
                .map_err(coordination_error)?;
            match response.kvs().first() {
                Some(kv) => Ok(Some(kv.value_str().map_err(coordination_error)?.to_string())),
                None => Ok(None),
            }
        }

        async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, ClusterError> {
            let response = self
                .client
                .clone()
                .get(prefix, Some(GetOptions::new().with_prefix()))
                .await
                .map_err(coordination_error)?;
            let mut entries = Vec::with_capacity(response.kvs().len());
            for kv in response.kvs() {
                entries.push((
                    kv.key_str().map_err(coordination_error)?.to_string(),
                    kv.value_str().map_err(coordination_error)?.to_string(),
                ));
            }
            Ok(entries)
        }

        async fn delete(&self, key: &str) -> Result<(), ClusterError> {
            self.client
                .clone()
                .delete(key, None)
                .await
                .map_err(coordination_error)?;
            Ok(())
        }

        async fn watch_prefix(
            &self,
            prefix: &str,
        ) -> Result<mpsc::Receiver<WatchEvent>, ClusterError> {
            let (watcher, mut stream) = self
                .client
                .clone()
                .watch(prefix, Some(WatchOptions::new().with_prefix()))
                .await
                .map_err(coordination_error)?;
            let (tx, rx) = mpsc::channel(WATCH_CHAN_SIZE);
            let prefix = prefix.to_string();
            tokio::spawn(async move {
                // Dropping the watcher cancels the watch.
                let _watcher = watcher;
                loop {
                    let response = match stream.message().await {
                        Ok(Some(response)) => response,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("etcd watch on {} failed: {}", prefix, e);
                            break;
                        }
                    };
                    for event in response.events() {
                        let Some(kv) = event.kv() else {
                            continue;
                        };
                        let Ok(key) = kv.key_str() else {
                            continue;
                        };
                        let event = match event.event_type() {
                            EventType::Put => WatchEvent::Put {
                                key: key.to_string(),
                                value: kv.value_str().unwrap_or_default().to_string(),
                            },
                            EventType::Delete => WatchEvent::Delete {
                                key: key.to_string(),
                            },
                        };
                        if tx.send(event).await.is_err() {
                            debug!("etcd watch on {} dropped by its consumer", prefix);
                            return;
                        }
                    }
                }
            });
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_queries() {
        let store = MemoryCoordinationStore::new();
        store.put("/event/instance/a", "1").await.expect("put");
        store.put("/event/instance/b", "2").await.expect("put");
        store.put("/event/other", "3").await.expect("put");

        let entries = store.get_prefix("/event/instance/").await.expect("prefix");
        assert_eq!(
            entries,
            vec![
                ("/event/instance/a".to_string(), "1".to_string()),
                ("/event/instance/b".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(
            store.get("/event/other").await.expect("get"),
            Some("3".to_string())
        );
    }

    #[tokio::test]
    async fn test_watch_sees_matching_changes_only() {
        let store = MemoryCoordinationStore::new();
        let mut watch = store.watch_prefix("/event/instance/").await.expect("watch");

        store.put("/event/other", "x").await.expect("put");
        store.put("/event/instance/a", "1").await.expect("put");
        store.delete("/event/instance/a").await.expect("delete");
        store.delete("/event/instance/missing").await.expect("delete");

        assert_eq!(
            watch.try_recv().ok(),
            Some(WatchEvent::Put {
                key: "/event/instance/a".to_string(),
                value: "1".to_string()
            })
        );
        assert_eq!(
            watch.try_recv().ok(),
            Some(WatchEvent::Delete {
                key: "/event/instance/a".to_string()
            })
        );
        assert!(watch.try_recv().is_err());
    }
}
