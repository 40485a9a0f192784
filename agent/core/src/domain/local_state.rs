// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Local State Store
//!
//! What this host currently enforces:
//!
//! - `active_rules`: rules justified by at least one local firewall-enabled VM
//! - `tracked_rvms`: remote VMs referenced by the other side of an active rule
//! - `local_vms`: the last synchronized record of each local VM, which is the
//!   "old attributes" side of a `vm.update`
//!
//! `active_rules` and `tracked_rvms` change only through [`LocalState::apply`].
//! A diff names individual entries; applying it never touches anything else,
//! so runs that computed their diffs from different snapshots for unrelated
//! entities compose.

use crate::domain::rule::FirewallRule;
use crate::domain::vm::{RemoteVm, Vm};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Keyed difference between two versions of a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    pub to_add: Vec<T>,
    /// Same key, different content. Holds the new value.
    pub to_update: Vec<T>,
    /// Holds the old value.
    pub to_remove: Vec<T>,
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Self {
            to_add: Vec::new(),
            to_update: Vec::new(),
            to_remove: Vec::new(),
        }
    }
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_update.len() + self.to_remove.len()
    }
}

pub type RuleDiff = Diff<FirewallRule>;
pub type RvmDiff = Diff<RemoteVm>;

fn diff_maps<T: Clone + PartialEq>(old: &BTreeMap<Uuid, T>, new: &BTreeMap<Uuid, T>) -> Diff<T> {
    let mut diff = Diff::default();
    for (uuid, value) in new {
        match old.get(uuid) {
            None => diff.to_add.push(value.clone()),
            Some(previous) if previous != value => diff.to_update.push(value.clone()),
            Some(_) => {}
        }
    }
    for (uuid, value) in old {
        if !new.contains_key(uuid) {
            diff.to_remove.push(value.clone());
        }
    }
    diff
}

pub fn diff_rules(
    old_active: &BTreeMap<Uuid, FirewallRule>,
    new_active: &BTreeMap<Uuid, FirewallRule>,
) -> RuleDiff {
    diff_maps(old_active, new_active)
}

pub fn diff_rvms(
    old_tracked: &BTreeMap<Uuid, RemoteVm>,
    new_tracked: &BTreeMap<Uuid, RemoteVm>,
) -> RvmDiff {
    diff_maps(old_tracked, new_tracked)
}

#[derive(Debug, Clone, Default)]
pub struct LocalState {
    active_rules: BTreeMap<Uuid, FirewallRule>,
    tracked_rvms: BTreeMap<Uuid, RemoteVm>,
    local_vms: BTreeMap<Uuid, Vm>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_rules(&self) -> &BTreeMap<Uuid, FirewallRule> {
        &self.active_rules
    }

    pub fn tracked_rvms(&self) -> &BTreeMap<Uuid, RemoteVm> {
        &self.tracked_rvms
    }

    pub fn local_vms(&self) -> &BTreeMap<Uuid, Vm> {
        &self.local_vms
    }

    pub fn local_vm(&self, uuid: &Uuid) -> Option<&Vm> {
        self.local_vms.get(uuid)
    }

    pub fn apply(&mut self, rules: &RuleDiff, rvms: &RvmDiff) {
        for rule in rules.to_remove.iter() {
            self.active_rules.remove(&rule.uuid);
        }
        for rule in rules.to_add.iter().chain(rules.to_update.iter()) {
            self.active_rules.insert(rule.uuid, rule.clone());
        }

        for vm in rvms.to_remove.iter() {
            self.tracked_rvms.remove(&vm.uuid);
        }
        for vm in rvms.to_add.iter().chain(rvms.to_update.iter()) {
            self.tracked_rvms.insert(vm.uuid, vm.clone());
        }
    }

    pub fn record_local_vm(&mut self, vm: Vm) {
        self.local_vms.insert(vm.uuid, vm);
    }

    /// Replace the whole local VM snapshot. Used by full resync.
    pub fn replace_local_vms<I: IntoIterator<Item = Vm>>(&mut self, vms: I) {
        self.local_vms = vms.into_iter().map(|vm| (vm.uuid, vm)).collect();
    }

    pub fn snapshot(&self) -> LocalStateSnapshot {
        LocalStateSnapshot {
            active_rules: self.active_rules.values().cloned().collect(),
            tracked_rvms: self.tracked_rvms.values().cloned().collect(),
            local_vms: self.local_vms.values().cloned().collect(),
        }
    }
}

/// Serializable copy of [`LocalState`] for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LocalStateSnapshot {
    pub active_rules: Vec<FirewallRule>,
    pub tracked_rvms: Vec<RemoteVm>,
    pub local_vms: Vec<Vm>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(text: &str) -> FirewallRule {
        FirewallRule::new(Uuid::new_v4(), Some(Uuid::new_v4()), text).unwrap()
    }

    fn rvm() -> RemoteVm {
        RemoteVm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            tags: Default::default(),
            ips: vec![],
        }
    }

    fn keyed<T: Clone>(items: &[T], key: impl Fn(&T) -> Uuid) -> BTreeMap<Uuid, T> {
        items.iter().map(|item| (key(item), item.clone())).collect()
    }

    #[test]
    fn test_diff_rules_classifies_entries() {
        let kept = rule("FROM any TO all vms ALLOW tcp PORT 22");
        let removed = rule("FROM any TO all vms ALLOW tcp PORT 80");
        let changed = rule("FROM any TO all vms ALLOW tcp PORT 443");
        let added = rule("FROM any TO all vms ALLOW udp PORT 53");
        let changed_new = changed.clone().with_enabled(false);

        let old = keyed(&[kept.clone(), removed.clone(), changed.clone()], |r| r.uuid);
        let new = keyed(&[kept, changed_new.clone(), added.clone()], |r| r.uuid);

        let diff = diff_rules(&old, &new);
        assert_eq!(diff.to_add, vec![added]);
        assert_eq!(diff.to_update, vec![changed_new]);
        assert_eq!(diff.to_remove, vec![removed]);
        assert_eq!(diff.len(), 3);
    }

    #[test]
    fn test_identical_maps_produce_empty_diff() {
        let vms = keyed(&[rvm(), rvm()], |v| v.uuid);
        assert!(diff_rvms(&vms, &vms).is_empty());
    }

    #[test]
    fn test_apply_touches_only_named_entries() {
        let mut state = LocalState::new();
        let a = rule("FROM any TO all vms ALLOW tcp PORT 22");
        let b = rule("FROM any TO all vms ALLOW tcp PORT 80");
        let x = rvm();

        state.apply(
            &RuleDiff {
                to_add: vec![a.clone(), b.clone()],
                ..Default::default()
            },
            &RvmDiff {
                to_add: vec![x.clone()],
                ..Default::default()
            },
        );

        // A diff computed without knowledge of `b` must leave it alone.
        let old = keyed(&[a.clone()], |r| r.uuid);
        let diff = diff_rules(&old, &BTreeMap::new());
        state.apply(&diff, &RvmDiff::default());

        assert!(!state.active_rules().contains_key(&a.uuid));
        assert!(state.active_rules().contains_key(&b.uuid));
        assert!(state.tracked_rvms().contains_key(&x.uuid));
    }

    #[test]
    fn test_local_vm_snapshot() {
        let mut state = LocalState::new();
        let vm = Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            firewall_enabled: true,
            tags: Default::default(),
            ips: vec![],
            server_uuid: None,
            local: true,
        };
        state.record_local_vm(vm.clone());
        assert_eq!(state.local_vm(&vm.uuid), Some(&vm));
        assert_eq!(state.snapshot().local_vms.len(), 1);

        state.replace_local_vms(Vec::new());
        assert!(state.local_vms().is_empty());
    }
}
