use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{PendingPacket, Persist, PersistStrategy, Result, StoreOutcome, Visitor};

/// Process-local store backed by a concurrent map.
///
/// The live record count is kept in an atomic so the capacity check does not need to lock
/// the whole map.
#[derive(Debug)]
pub struct MemPersist {
    strategy: PersistStrategy,
    data: DashMap<String, PendingPacket>,
    count: AtomicUsize,
}

impl MemPersist {
    pub fn new(strategy: PersistStrategy) -> Self {
        Self { strategy, data: DashMap::default(), count: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves room for one more record. Fails only when the store drops on exceed.
    fn reserve(&self) -> bool {
        let strategy = self.strategy;
        let reserved = self.count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if strategy.drop_on_exceed && strategy.exceeded(n) {
                None
            } else {
                Some(n + 1)
            }
        });
        match reserved {
            Ok(prev) => {
                if strategy.exceeded(prev) {
                    log::warn!(
                        "memory persist exceeds the maximum limit, count: {}, max_count: {}",
                        prev + 1,
                        strategy.max_count
                    );
                }
                true
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Persist for MemPersist {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, key: &str, packet: PendingPacket) -> Result<StoreOutcome> {
        if self.strategy.drop_on_exceed && self.strategy.exceeded(self.len()) {
            log::debug!("memory persist is full, drop {key}");
            return Ok(StoreOutcome::Dropped);
        }

        match self.data.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                if self.strategy.duplicate_replace {
                    entry.insert(packet);
                }
            }
            Entry::Vacant(entry) => {
                if !self.reserve() {
                    log::debug!("memory persist is full, drop {key}");
                    return Ok(StoreOutcome::Dropped);
                }
                entry.insert(packet);
            }
        }
        Ok(StoreOutcome::Stored)
    }

    async fn load(&self, key: &str) -> Result<Option<PendingPacket>> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn for_each(&self, f: &mut Visitor<'_>) -> Result<()> {
        for entry in self.data.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.data.remove(key).is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.data.retain(|_, _| {
            self.count.fetch_sub(1, Ordering::SeqCst);
            false
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tests_util::publish;

    #[tokio::test]
    async fn test_count_tracks_distinct_keys() {
        let store = MemPersist::new(PersistStrategy::default());
        store.store("c1:1", publish(1, "a")).await.unwrap();
        store.store("c1:1", publish(1, "b")).await.unwrap();
        store.store("c1:2", publish(2, "c")).await.unwrap();
        assert_eq!(store.len(), 2);

        store.delete("c1:1").await.unwrap();
        store.delete("c1:1").await.unwrap();
        assert_eq!(store.len(), 1);

        store.destroy().await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.load("c1:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capacity_is_checked_before_duplicates() {
        let strategy = PersistStrategy { max_count: 1, drop_on_exceed: true, ..Default::default() };
        let store = MemPersist::new(strategy);
        assert_eq!(store.store("c1:1", publish(1, "a")).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(store.store("c1:1", publish(1, "b")).await.unwrap(), StoreOutcome::Dropped);
        assert_eq!(store.load("c1:1").await.unwrap(), Some(publish(1, "a")));
    }

    #[tokio::test]
    async fn test_over_capacity_without_drop_keeps_writing() {
        let strategy = PersistStrategy { max_count: 1, drop_on_exceed: false, ..Default::default() };
        let store = MemPersist::new(strategy);
        store.store("c1:1", publish(1, "a")).await.unwrap();
        assert_eq!(store.store("c1:2", publish(2, "b")).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_respects_capacity() {
        let strategy = PersistStrategy { max_count: 50, drop_on_exceed: true, ..Default::default() };
        let store = Arc::new(MemPersist::new(strategy));
        let tasks = (1..=200u16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.store(&format!("c:{i}"), publish(i, "x")).await.unwrap() })
            })
            .collect::<Vec<_>>();
        let mut stored = 0;
        for t in tasks {
            if t.await.unwrap().is_stored() {
                stored += 1;
            }
        }
        assert_eq!(stored, 50);
        assert_eq!(store.len(), 50);
    }
}
