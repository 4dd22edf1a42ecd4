// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::barrel::{Barrel, BarrelState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_MAX_IDLE: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub idle: usize,
}

/// Free list of emptied barrels.
///
/// A released barrel is reset before it goes back on the list. One that is
/// still referenced elsewhere (an insert racing its eviction) is left to drop.
pub struct BarrelPool<S> {
    free: Mutex<Vec<Barrel<S>>>,
    max_idle: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: BarrelState> Default for BarrelPool<S> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl<S: BarrelState> BarrelPool<S> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, key: &str) -> Barrel<S> {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(mut barrel) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                barrel.reset(key);
                barrel
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Barrel::new(key)
            }
        }
    }

    pub fn release(&self, barrel: Arc<Barrel<S>>) {
        let Ok(mut barrel) = Arc::try_unwrap(barrel) else {
            return;
        };
        barrel.reset("");
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(barrel);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_barrel_is_reused_empty() {
        let pool: BarrelPool<()> = BarrelPool::new(4);
        let barrel = Arc::new(pool.acquire("a"));
        let _rx = barrel.subscribe("s1", 1, Vec::new());
        pool.release(barrel);
        assert_eq!(pool.stats().idle, 1);

        let reused = pool.acquire("b");
        assert_eq!(reused.key(), "b");
        assert_eq!(reused.subscriber_count(), 0);
        assert_eq!(
            pool.stats(),
            PoolStats {
                hits: 1,
                misses: 1,
                idle: 0
            }
        );
    }

    #[test]
    fn test_shared_barrel_is_not_recycled() {
        let pool: BarrelPool<()> = BarrelPool::new(4);
        let barrel = Arc::new(pool.acquire("a"));
        let other = Arc::clone(&barrel);
        pool.release(barrel);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(other.key(), "a");
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool: BarrelPool<()> = BarrelPool::new(1);
        pool.release(Arc::new(pool.acquire("a")));
        pool.release(Arc::new(pool.acquire("b")));
        pool.release(Arc::new(Barrel::new("c")));
        assert_eq!(pool.stats().idle, 1);
    }
}
