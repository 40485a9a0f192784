// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-Memory Collaborators
//!
//! HashMap-backed implementations of the four collaborator contracts, used
//! by the integration tests and by `fwsync-agent run --dry-run`. Each one
//! counts its calls and can be told to fail, so tests can assert both how
//! many round-trips a run cost and that a failed run commits nothing.

use crate::domain::backend::{BackendError, FirewallBackend, FirewallChangeset};
use crate::domain::inventory::{InventoryError, VmFilter, VmInventory};
use crate::domain::policy::{PolicyClient, RuleQuery};
use crate::domain::resolver::{ResolutionError, ResolveRequest, ResolverClient};
use crate::domain::rule::FirewallRule;
use crate::domain::vm::{RemoteVm, Vm};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// VMs running on this host.
#[derive(Clone, Default)]
pub struct InMemoryInventory {
    vms: Arc<RwLock<HashMap<Uuid, Vm>>>,
    failure: Arc<RwLock<Option<String>>>,
    calls: Arc<RwLock<Vec<VmFilter>>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut vm: Vm) {
        vm.local = true;
        self.vms.write().insert(vm.uuid, vm);
    }

    pub fn remove(&self, uuid: &Uuid) -> Option<Vm> {
        self.vms.write().remove(uuid)
    }

    /// Make every following `list` fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write() = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.failure.write() = None;
    }

    pub fn list_calls(&self) -> Vec<VmFilter> {
        self.calls.read().clone()
    }
}

#[async_trait]
impl VmInventory for InMemoryInventory {
    async fn list(&self, filter: &VmFilter) -> Result<Vec<Vm>, InventoryError> {
        self.calls.write().push(*filter);
        if let Some(message) = self.failure.read().clone() {
            return Err(InventoryError::ListFailed(message));
        }

        let mut vms: Vec<Vm> = self
            .vms
            .read()
            .values()
            .filter(|vm| filter.accepts(vm))
            .cloned()
            .collect();
        vms.sort_by_key(|vm| vm.uuid);
        Ok(vms)
    }
}

/// Policy service answering from a fixed rule set.
#[derive(Clone, Default)]
pub struct InMemoryPolicyClient {
    rules: Arc<RwLock<HashMap<Uuid, FirewallRule>>>,
    failure: Arc<RwLock<Option<String>>>,
    queries: Arc<RwLock<Vec<RuleQuery>>>,
}

impl InMemoryPolicyClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rule: FirewallRule) {
        self.rules.write().insert(rule.uuid, rule);
    }

    pub fn remove(&self, uuid: &Uuid) -> Option<FirewallRule> {
        self.rules.write().remove(uuid)
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write() = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.failure.write() = None;
    }

    pub fn queries(&self) -> Vec<RuleQuery> {
        self.queries.read().clone()
    }
}

#[async_trait]
impl PolicyClient for InMemoryPolicyClient {
    async fn rules_for_vm(&self, query: &RuleQuery) -> Result<Vec<FirewallRule>, ResolutionError> {
        self.queries.write().push(query.clone());
        if let Some(message) = self.failure.read().clone() {
            return Err(ResolutionError::Transport(message));
        }

        let mut rules: Vec<FirewallRule> = self
            .rules
            .read()
            .values()
            .filter(|rule| rule.scope().includes(query.owner_uuid))
            .cloned()
            .collect();
        rules.sort_by_key(|rule| rule.uuid);
        Ok(rules)
    }
}

/// Cluster-wide VM directory.
///
/// Holds every VM in the cluster, local ones included: the resolver is
/// expected to drop local VMs from the answer.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    vms: Arc<RwLock<HashMap<Uuid, RemoteVm>>>,
    failure: Arc<RwLock<Option<String>>>,
    requests: Arc<RwLock<Vec<ResolveRequest>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, vm: RemoteVm) {
        self.vms.write().insert(vm.uuid, vm);
    }

    pub fn remove(&self, uuid: &Uuid) -> Option<RemoteVm> {
        self.vms.write().remove(uuid)
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write() = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.failure.write() = None;
    }

    pub fn requests(&self) -> Vec<ResolveRequest> {
        self.requests.read().clone()
    }
}

fn request_selects(request: &ResolveRequest, vm: &RemoteVm) -> bool {
    if request.owner_uuid.is_some_and(|owner| owner != vm.owner_uuid) {
        return false;
    }
    if request.all_vms || request.vms.contains(&vm.uuid) {
        return true;
    }
    request.tag_pairs().any(|(name, value)| match (vm.tags.get(name), value) {
        (Some(_), None) => true,
        (Some(actual), Some(wanted)) => actual == wanted,
        (None, _) => false,
    })
}

#[async_trait]
impl ResolverClient for InMemoryDirectory {
    async fn resolve(&self, request: &ResolveRequest) -> Result<Vec<RemoteVm>, ResolutionError> {
        self.requests.write().push(request.clone());
        if let Some(message) = self.failure.read().clone() {
            return Err(ResolutionError::Transport(message));
        }

        let mut vms: Vec<RemoteVm> = self
            .vms
            .read()
            .values()
            .filter(|vm| request_selects(request, vm))
            .cloned()
            .collect();
        vms.sort_by_key(|vm| vm.uuid);
        Ok(vms)
    }
}

/// Backend that records what it is asked to do.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    changesets: Arc<RwLock<Vec<FirewallChangeset>>>,
    teardowns: Arc<RwLock<Vec<Vm>>>,
    failure: Arc<RwLock<Option<String>>>,
    apply_failure: Arc<RwLock<Option<String>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write() = Some(message.into());
    }

    /// Fail `apply` only; teardowns still succeed.
    pub fn fail_apply_with(&self, message: impl Into<String>) {
        *self.apply_failure.write() = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.failure.write() = None;
        *self.apply_failure.write() = None;
    }

    pub fn changesets(&self) -> Vec<FirewallChangeset> {
        self.changesets.read().clone()
    }

    pub fn last_changeset(&self) -> Option<FirewallChangeset> {
        self.changesets.read().last().cloned()
    }

    pub fn teardowns(&self) -> Vec<Vm> {
        self.teardowns.read().clone()
    }

    pub fn calls(&self) -> usize {
        self.changesets.read().len() + self.teardowns.read().len()
    }
}

#[async_trait]
impl FirewallBackend for RecordingBackend {
    async fn apply(&self, changeset: &FirewallChangeset) -> Result<(), BackendError> {
        let failure = self.failure.read().clone().or_else(|| self.apply_failure.read().clone());
        if let Some(message) = failure {
            return Err(BackendError::ApplyFailed(message));
        }
        self.changesets.write().push(changeset.clone());
        Ok(())
    }

    async fn teardown(&self, vm: &Vm) -> Result<(), BackendError> {
        if let Some(message) = self.failure.read().clone() {
            return Err(BackendError::TeardownFailed(message));
        }
        self.teardowns.write().push(vm.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn remote(owner: Uuid, tags: &[(&str, &str)]) -> RemoteVm {
        RemoteVm {
            uuid: Uuid::new_v4(),
            owner_uuid: owner,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ips: vec![],
        }
    }

    #[tokio::test]
    async fn test_directory_filters_by_owner_and_tag() {
        let owner = Uuid::new_v4();
        let directory = InMemoryDirectory::new();
        let db = remote(owner, &[("role", "db")]);
        let other_owner_db = remote(Uuid::new_v4(), &[("role", "db")]);
        let www = remote(owner, &[("role", "www")]);
        directory.insert(db.clone());
        directory.insert(other_owner_db);
        directory.insert(www);

        let mut request = ResolveRequest::default();
        request.owner_uuid = Some(owner);
        request.tags = BTreeMap::from([("role".to_string(), vec![Some("db".to_string())])]);

        let vms = directory.resolve(&request).await.unwrap();
        assert_eq!(vms, vec![db]);
        assert_eq!(directory.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_inventory_failure_is_verbatim() {
        let inventory = InMemoryInventory::new();
        inventory.fail_with("vmadm: zone lookup failed");
        let err = inventory.list(&VmFilter::all()).await.unwrap_err();
        assert_eq!(err.to_string(), "vmadm: zone lookup failed");
    }
}
