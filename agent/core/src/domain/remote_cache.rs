// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Remote VM Cache
//!
//! Every remote VM record learned from a successful resolution or a remote VM
//! event. The [`TagCache`](crate::domain::tag_cache::TagCache) only says
//! *which* tags were resolved; this is the population those hits are
//! answered from when tracked RVMs are recomputed.

use crate::domain::vm::RemoteVm;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RemoteVmCache {
    vms: HashMap<Uuid, RemoteVm>,
}

impl RemoteVmCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record. Returns the previous record, if any.
    pub fn upsert(&mut self, vm: RemoteVm) -> Option<RemoteVm> {
        self.vms.insert(vm.uuid, vm)
    }

    pub fn extend<I: IntoIterator<Item = RemoteVm>>(&mut self, vms: I) {
        for vm in vms {
            self.upsert(vm);
        }
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<RemoteVm> {
        self.vms.remove(uuid)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&RemoteVm> {
        self.vms.get(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.vms.contains_key(uuid)
    }

    pub fn values(&self) -> impl Iterator<Item = &RemoteVm> {
        self.vms.values()
    }

    pub fn clear(&mut self) {
        self.vms.clear();
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn remote(role: &str) -> RemoteVm {
        RemoteVm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            tags: BTreeMap::from([("role".to_string(), role.to_string())]),
            ips: vec![],
        }
    }

    #[test]
    fn test_upsert_replaces_record() {
        let mut cache = RemoteVmCache::new();
        let mut vm = remote("db");
        assert!(cache.upsert(vm.clone()).is_none());

        vm.tags.insert("role".to_string(), "qa".to_string());
        let previous = cache.upsert(vm.clone()).unwrap();
        assert_eq!(previous.tags["role"], "db");
        assert_eq!(cache.get(&vm.uuid).unwrap().tags["role"], "qa");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = RemoteVmCache::new();
        let a = remote("db");
        let b = remote("www");
        cache.extend([a.clone(), b.clone()]);

        assert!(cache.remove(&a.uuid).is_some());
        assert!(!cache.contains(&a.uuid));
        assert!(cache.contains(&b.uuid));

        cache.clear();
        assert!(cache.is_empty());
    }
}
