// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic per-key barrel map shared by every store kind.

use super::barrel::{Barrel, BarrelState, SubscriberRx};
use super::pool::{BarrelPool, PoolStats};
use crate::errors::StoreError;
use crate::message::MonitorData;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Kind-specific behaviour plugged into a [`KeyedBuffer`].
pub trait BufferPolicy: Send + Sync + 'static {
    type State: BarrelState;
    type Item: Send;

    fn idle_threshold(&self) -> Duration;

    fn subscriber_capacity(&self) -> usize;

    /// Stores `item` in `barrel`. Called with the map lock held for reading,
    /// or for writing when the barrel was just created.
    fn insert(&self, barrel: &Barrel<Self::State>, item: Self::Item) -> Result<(), StoreError>;

    /// Registers a subscriber. Policies with history queue it here, under
    /// whatever barrel lock keeps it ordered against concurrent inserts.
    fn subscribe(&self, barrel: &Barrel<Self::State>, sub_id: &str) -> SubscriberRx {
        barrel.subscribe(sub_id, self.subscriber_capacity(), Vec::new())
    }

    /// Flushes whatever the barrel still holds before it goes back to the pool.
    fn evict(&self, _barrel: &Barrel<Self::State>) {}
}

pub struct KeyedBuffer<P: BufferPolicy> {
    policy: P,
    barrels: RwLock<HashMap<String, Arc<Barrel<P::State>>>>,
    pool: BarrelPool<P::State>,
    window: AtomicU64,
}

impl<P: BufferPolicy> KeyedBuffer<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            barrels: RwLock::new(HashMap::new()),
            pool: BarrelPool::default(),
            window: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn insert(&self, key: &str, item: P::Item) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::MissingKey);
        }
        self.window.fetch_add(1, Ordering::Relaxed);
        {
            let barrels = self.barrels.read();
            if let Some(barrel) = barrels.get(key) {
                return self.policy.insert(barrel, item);
            }
        }
        let mut barrels = self.barrels.write();
        let barrel = barrels
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(self.pool.acquire(key)));
        self.policy.insert(barrel, item)
    }

    /// Subscribes to `key`, creating its barrel when it does not exist yet.
    pub fn subscribe(&self, key: &str, sub_id: &str) -> SubscriberRx {
        {
            let barrels = self.barrels.read();
            if let Some(barrel) = barrels.get(key) {
                return self.policy.subscribe(barrel, sub_id);
            }
        }
        let mut barrels = self.barrels.write();
        let barrel = barrels
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(self.pool.acquire(key)));
        self.policy.subscribe(barrel, sub_id)
    }

    pub fn get_or_create(&self, key: &str) -> Arc<Barrel<P::State>> {
        if let Some(barrel) = self.get(key) {
            return barrel;
        }
        Arc::clone(
            self.barrels
                .write()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(self.pool.acquire(key))),
        )
    }

    pub fn unsubscribe(&self, key: &str, sub_id: &str) -> bool {
        self.barrels
            .read()
            .get(key)
            .is_some_and(|barrel| barrel.unsubscribe(sub_id))
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.barrels
            .read()
            .get(key)
            .map_or(0, |barrel| barrel.subscriber_count())
    }

    pub fn get(&self, key: &str) -> Option<Arc<Barrel<P::State>>> {
        self.barrels.read().get(key).cloned()
    }

    pub fn barrel_count(&self) -> usize {
        self.barrels.read().len()
    }

    /// Messages inserted since the last GC tick.
    pub fn window_count(&self) -> u64 {
        self.window.load(Ordering::Relaxed)
    }

    pub fn monitor_data(&self) -> MonitorData {
        MonitorData {
            instance_id: String::new(),
            service_size: self.barrel_count() as u64,
            log_size_peer_m: self.window_count(),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Evicts barrels idle past the policy threshold that have no
    /// subscribers, flushing each one first. Returns the evicted keys.
    ///
    /// Candidates are flushed while still in the map, so a lookup never
    /// misses a barrel whose last page is not on disk yet. The write lock is
    /// only taken afterwards to remove those still idle and unsubscribed;
    /// any insert since the flush has touched its barrel and keeps it.
    pub fn gc(&self, now: Instant) -> Vec<String> {
        let threshold = self.policy.idle_threshold();
        let expired = |barrel: &Arc<Barrel<P::State>>| {
            barrel.subscriber_count() == 0 && barrel.idle_for(now) > threshold
        };
        let candidates: Vec<Arc<Barrel<P::State>>> = self
            .barrels
            .read()
            .values()
            .filter(|&barrel| expired(barrel))
            .cloned()
            .collect();
        for barrel in &candidates {
            self.policy.evict(barrel);
        }

        let mut evicted = Vec::new();
        {
            let mut barrels = self.barrels.write();
            for candidate in candidates {
                let key = candidate.key().to_string();
                drop(candidate);
                if barrels.get(&key).is_some_and(|barrel| expired(barrel)) {
                    if let Some(barrel) = barrels.remove(&key) {
                        evicted.push((key, barrel));
                    }
                }
            }
        }
        let evicted: Vec<String> = evicted
            .into_iter()
            .map(|(key, barrel)| {
                self.pool.release(barrel);
                key
            })
            .collect();
        self.window.store(0, Ordering::Relaxed);
        if !evicted.is_empty() {
            debug!("evicted {} idle barrels", evicted.len());
        }
        evicted
    }

    /// Runs `flush` over every live barrel without evicting anything.
    pub fn for_each(&self, mut flush: impl FnMut(&Barrel<P::State>)) {
        for barrel in self.barrels.read().values() {
            flush(barrel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventLogMessage;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter(usize);

    impl BarrelState for Counter {
        fn reset(&mut self) {
            self.0 = 0;
        }
    }

    #[derive(Default)]
    struct CountingPolicy {
        evicted: AtomicUsize,
        /// Stands in for a subscriber that arrives while gc flushes the barrel.
        subscribe_on_evict: bool,
    }

    impl BufferPolicy for CountingPolicy {
        type State = Counter;
        type Item = EventLogMessage;

        fn idle_threshold(&self) -> Duration {
            Duration::from_secs(60)
        }

        fn subscriber_capacity(&self) -> usize {
            4
        }

        fn insert(&self, barrel: &Barrel<Counter>, item: EventLogMessage) -> Result<(), StoreError> {
            barrel.state().0 += 1;
            barrel.touch();
            barrel.broadcast(&Arc::new(item));
            Ok(())
        }

        fn evict(&self, barrel: &Barrel<Counter>) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            if self.subscribe_on_evict {
                drop(barrel.subscribe("late", 1, Vec::new()));
            }
        }
    }

    #[test]
    fn test_insert_creates_barrel_once() {
        let buffer = KeyedBuffer::new(CountingPolicy::default());
        buffer.insert("a", EventLogMessage::default()).expect("insert");
        buffer.insert("a", EventLogMessage::default()).expect("insert");
        buffer.insert("b", EventLogMessage::default()).expect("insert");

        assert_eq!(buffer.barrel_count(), 2);
        assert_eq!(buffer.get("a").expect("barrel").state().0, 2);
        assert_eq!(buffer.monitor_data().log_size_peer_m, 3);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let buffer = KeyedBuffer::new(CountingPolicy::default());
        assert!(matches!(
            buffer.insert("", EventLogMessage::default()),
            Err(StoreError::MissingKey)
        ));
        assert_eq!(buffer.barrel_count(), 0);
    }

    #[test]
    fn test_gc_evicts_only_idle_unsubscribed_barrels() {
        let buffer = KeyedBuffer::new(CountingPolicy::default());
        buffer.insert("idle", EventLogMessage::default()).expect("insert");
        buffer.insert("watched", EventLogMessage::default()).expect("insert");
        let _rx = buffer.subscribe("watched", "s1");

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(buffer.gc(later), vec!["idle".to_string()]);
        assert_eq!(buffer.barrel_count(), 1);
        assert_eq!(buffer.policy().evicted.load(Ordering::Relaxed), 1);
        assert_eq!(buffer.window_count(), 0);

        // Nothing is idle yet.
        assert!(buffer.gc(Instant::now()).is_empty());
    }

    #[test]
    fn test_evicted_barrel_is_recycled() {
        let buffer = KeyedBuffer::new(CountingPolicy::default());
        buffer.insert("a", EventLogMessage::default()).expect("insert");
        buffer.gc(Instant::now() + Duration::from_secs(61));
        buffer.insert("b", EventLogMessage::default()).expect("insert");

        let stats = buffer.pool_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(buffer.get("b").expect("barrel").state().0, 1);
    }

    #[test]
    fn test_get_or_create_reuses_live_barrel() {
        let buffer = KeyedBuffer::new(CountingPolicy::default());
        buffer.insert("a", EventLogMessage::default()).expect("insert");
        assert_eq!(buffer.get_or_create("a").state().0, 1);
        assert_eq!(buffer.get_or_create("b").state().0, 0);
        assert_eq!(buffer.barrel_count(), 2);
    }

    #[test]
    fn test_barrel_subscribed_during_flush_is_kept() {
        let buffer = KeyedBuffer::new(CountingPolicy {
            subscribe_on_evict: true,
            ..Default::default()
        });
        buffer.insert("a", EventLogMessage::default()).expect("insert");

        assert!(buffer.gc(Instant::now() + Duration::from_secs(61)).is_empty());
        assert_eq!(buffer.policy().evicted.load(Ordering::Relaxed), 1);
        assert_eq!(buffer.barrel_count(), 1);
        assert_eq!(buffer.subscriber_count("a"), 1);
    }

    #[test]
    fn test_subscribe_creates_barrel_and_unsubscribe_releases() {
        let buffer = KeyedBuffer::new(CountingPolicy::default());
        let mut rx = buffer.subscribe("a", "s1");
        assert_eq!(buffer.subscriber_count("a"), 1);

        buffer.insert("a", EventLogMessage::default()).expect("insert");
        assert!(rx.try_recv().is_ok());

        assert!(buffer.unsubscribe("a", "s1"));
        assert!(!buffer.unsubscribe("a", "s1"));
        assert_eq!(buffer.subscriber_count("a"), 0);
    }
}
