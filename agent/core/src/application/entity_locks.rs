// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-entity run ordering.
//!
//! Every synchronization run first takes the lock of the entity it is about
//! (VM uuid or rule uuid). A second event for the same entity waits for the
//! in-flight run; runs for different entities proceed independently. Entries
//! are dropped from the map once their last holder or waiter is gone.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Vm(Uuid),
    Rule(Uuid),
}

#[derive(Default)]
pub struct EntityLocks {
    locks: DashMap<EntityKey, Arc<Mutex<()>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: EntityKey) -> EntityGuard<'_> {
        let mutex = Arc::clone(&self.locks.entry(key).or_default());
        let guard = mutex.lock_owned().await;
        EntityGuard {
            key,
            locks: self,
            guard: Some(guard),
        }
    }

    /// Entities with an in-flight or waiting run.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct EntityGuard<'a> {
    key: EntityKey,
    locks: &'a EntityLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        // Release first so the strong count reflects only waiters.
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_entity_runs_are_serialized() {
        let locks = Arc::new(EntityLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let key = EntityKey::Vm(Uuid::new_v4());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(key).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_entities_do_not_block() {
        let locks = EntityLocks::new();
        let _a = locks.lock(EntityKey::Rule(Uuid::new_v4())).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(EntityKey::Rule(Uuid::new_v4())),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_vm_and_rule_keys_are_distinct() {
        let locks = EntityLocks::new();
        let uuid = Uuid::new_v4();
        let _vm = locks.lock(EntityKey::Vm(uuid)).await;
        let rule = tokio::time::timeout(Duration::from_millis(100), locks.lock(EntityKey::Rule(uuid))).await;
        assert!(rule.is_ok());
    }
}
