// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Firewall Synchronizer
//!
//! Application service that keeps this host's firewall in step with the
//! cluster policy, one event at a time.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Orchestrate matching, resolution, diffing and
//!   backend application for each lifecycle event
//! - **Collaborators:**
//!   - Domain: Rule Matcher, Tag Cache, Remote VM Cache, Local State Store
//!   - Infrastructure: VmInventory, PolicyClient, ResolverClient,
//!     FirewallBackend, EventBus
//!
//! # Run model
//!
//! Each event is one run: `Idle -> Matching -> Resolving -> Diffing ->
//! Applying -> Idle`. A run holds the lock of its entity (VM or rule uuid)
//! for its whole duration and the read side of the quiescence lock; resync
//! and cache clearing take the write side.
//!
//! Shared state sits behind one synchronous mutex that is never held across
//! an `.await`. A run snapshots what it needs, performs all I/O, then
//! applies its diffs. Diffs name individual entries, so runs for unrelated
//! entities interleave without clobbering each other.
//!
//! A failed run returns the collaborator's error untouched and commits
//! nothing: local state, the tag cache and the remote VM cache only change
//! after the backend accepted the changeset. On `vm.delete` the teardown of
//! the deleted VM is sent only after the changeset was accepted; if the
//! teardown fails, re-delivering the delete recomputes and re-sends the same
//! changeset.

use crate::application::entity_locks::{EntityKey, EntityLocks};
use crate::application::resolution::{execute_plan, plan_resolution, ResolvedTargets};
use crate::domain::backend::{BackendError, FirewallBackend, FirewallChangeset};
use crate::domain::events::SyncEvent;
use crate::domain::inventory::{InventoryError, VmFilter, VmInventory};
use crate::domain::local_state::{
    diff_rules, diff_rvms, LocalState, LocalStateSnapshot, RuleDiff, RvmDiff,
};
use crate::domain::matcher;
use crate::domain::policy::{PolicyClient, RuleQuery};
use crate::domain::remote_cache::RemoteVmCache;
use crate::domain::resolver::{ResolutionError, ResolverClient};
use crate::domain::rule::{FirewallRule, RuleRef, Scope, Side};
use crate::domain::tag_cache::TagCache;
use crate::domain::vm::{RemoteVm, Vm};
use crate::infrastructure::event_bus::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Errors surfaced to the originator of an event. Each variant carries the
/// collaborator's error unchanged.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Matching,
    Resolving,
    Diffing,
    Applying,
}

/// What one run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub activated: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub deactivated: Vec<Uuid>,
    pub tracked: Vec<Uuid>,
    pub refreshed: Vec<Uuid>,
    pub released: Vec<Uuid>,
    pub policy_requests: usize,
    pub directory_requests: usize,
    pub backend_calls: usize,
}

impl SyncOutcome {
    fn from_diffs(rules: &RuleDiff, rvms: &RvmDiff) -> Self {
        Self {
            activated: rules.to_add.iter().map(|r| r.uuid).collect(),
            updated: rules.to_update.iter().map(|r| r.uuid).collect(),
            deactivated: rules.to_remove.iter().map(|r| r.uuid).collect(),
            tracked: rvms.to_add.iter().map(|vm| vm.uuid).collect(),
            refreshed: rvms.to_update.iter().map(|vm| vm.uuid).collect(),
            released: rvms.to_remove.iter().map(|vm| vm.uuid).collect(),
            ..Default::default()
        }
    }

    /// No state change and no backend call.
    pub fn is_noop(&self) -> bool {
        self.activated.is_empty()
            && self.updated.is_empty()
            && self.deactivated.is_empty()
            && self.tracked.is_empty()
            && self.refreshed.is_empty()
            && self.released.is_empty()
            && self.backend_calls == 0
    }
}

/// Local state plus cache sizes, as served by the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStateView {
    #[serde(flatten)]
    pub state: LocalStateSnapshot,
    pub tag_cache_entries: usize,
    pub remote_vm_cache_entries: usize,
}

#[async_trait]
pub trait FirewallSyncService: Send + Sync {
    async fn on_vm_add(&self, vm: Vm) -> Result<SyncOutcome, SyncError>;
    async fn on_vm_update(&self, vm: Vm) -> Result<SyncOutcome, SyncError>;
    async fn on_vm_delete(&self, vm: Vm) -> Result<SyncOutcome, SyncError>;
    async fn on_rule_add(&self, rule: FirewallRule) -> Result<SyncOutcome, SyncError>;
    async fn on_rule_update(&self, rule: FirewallRule) -> Result<SyncOutcome, SyncError>;
    async fn on_rule_delete(&self, rule: RuleRef) -> Result<SyncOutcome, SyncError>;

    /// Drop both caches and recompute everything from the inventory and the
    /// policy service. Waits for in-flight runs to finish.
    async fn resync(&self) -> Result<SyncOutcome, SyncError>;

    /// Drop both caches without recomputing.
    async fn clear_caches(&self);

    fn state(&self) -> SyncStateView;
}

#[derive(Default)]
struct SyncState {
    local: LocalState,
    tags: TagCache,
    remotes: RemoteVmCache,
}

enum LocalVmUpdate {
    /// The run's population is the complete local population.
    Replace,
    /// Only these VMs were (re)listed.
    Upsert(Vec<Vm>),
}

/// Inputs of one recomputation.
struct RunInput {
    entity: Uuid,
    /// Local VMs the rules are matched against.
    population: Vec<Vm>,
    /// Active rules this run reconsiders, as they are now.
    old_rules: BTreeMap<Uuid, FirewallRule>,
    /// The same subset after the event.
    new_rules: BTreeMap<Uuid, FirewallRule>,
    /// Local VM whose own attributes changed.
    subject: Option<Vm>,
    /// Previous and current versions of a local VM that changed or left,
    /// enforced or not.
    moved: Vec<Vm>,
    teardown: Option<Vm>,
    local_update: LocalVmUpdate,
    /// Plan against empty caches and replace them on commit.
    fresh_caches: bool,
    policy_requests: usize,
}

pub struct StandardFirewallSyncService {
    inventory: Arc<dyn VmInventory>,
    policy: Arc<dyn PolicyClient>,
    resolver: Arc<dyn ResolverClient>,
    backend: Arc<dyn FirewallBackend>,
    event_bus: Arc<EventBus>,
    state: Mutex<SyncState>,
    locks: EntityLocks,
    quiescence: RwLock<()>,
}

impl StandardFirewallSyncService {
    pub fn new(
        inventory: Arc<dyn VmInventory>,
        policy: Arc<dyn PolicyClient>,
        resolver: Arc<dyn ResolverClient>,
        backend: Arc<dyn FirewallBackend>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inventory,
            policy,
            resolver,
            backend,
            event_bus,
            state: Mutex::new(SyncState::default()),
            locks: EntityLocks::new(),
            quiescence: RwLock::new(()),
        }
    }

    /// Whether `(scope, tag, value)` has been resolved and committed.
    pub fn has_cached_tag(&self, scope: Scope, tag: &str, value: Option<&str>) -> bool {
        self.state.lock().tags.has(scope, tag, value)
    }

    pub fn is_remote_vm_cached(&self, uuid: &Uuid) -> bool {
        self.state.lock().remotes.contains(uuid)
    }

    fn transition(&self, entity: Uuid, state: RunState) {
        debug!(entity = %entity, state = ?state, "Synchronization state");
    }

    fn finish(
        &self,
        event: &'static str,
        entity: Uuid,
        result: Result<SyncOutcome, SyncError>,
    ) -> Result<SyncOutcome, SyncError> {
        self.transition(entity, RunState::Idle);
        match &result {
            Ok(outcome) => {
                metrics::counter!("fwsync_events_total", "event" => event, "outcome" => "ok").increment(1);
                if !outcome.is_noop() {
                    info!(
                        event,
                        entity = %entity,
                        activated = outcome.activated.len(),
                        deactivated = outcome.deactivated.len(),
                        tracked = outcome.tracked.len(),
                        released = outcome.released.len(),
                        "Synchronization run applied"
                    );
                }
            }
            Err(e) => {
                metrics::counter!("fwsync_events_total", "event" => event, "outcome" => "error").increment(1);
                error!(event, entity = %entity, error = %e, "Synchronization run failed");
                self.event_bus.publish(SyncEvent::RunFailed {
                    event: event.to_string(),
                    entity,
                    error: e.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
        result
    }

    async fn list_local(&self, filter: &VmFilter) -> Result<Vec<Vm>, SyncError> {
        let mut vms = self.inventory.list(filter).await?;
        for vm in vms.iter_mut() {
            vm.local = true;
        }
        Ok(vms)
    }

    async fn rules_for_vm(&self, vm: &Vm) -> Result<Vec<FirewallRule>, SyncError> {
        metrics::counter!("fwsync_resolution_requests_total", "kind" => "policy").increment(1);
        let rules = self.policy.rules_for_vm(&RuleQuery::for_vm(vm)).await?;
        Ok(rules
            .into_iter()
            .filter(|rule| matcher::applies_to(rule, vm))
            .collect())
    }

    async fn apply_changeset(&self, changeset: &FirewallChangeset) -> Result<(), SyncError> {
        info!(
            add_rules = changeset.add_rules.len(),
            remove_rules = changeset.remove_rules.len(),
            add_remote_vms = changeset.add_remote_vms.len(),
            remove_remote_vms = changeset.remove_remote_vms.len(),
            vms = changeset.vms.len(),
            target_vms = changeset.target_vms.len(),
            "Applying firewall changeset"
        );
        metrics::counter!("fwsync_backend_calls_total").increment(1);
        self.backend.apply(changeset).await?;
        Ok(())
    }

    fn is_local(&self, vm: &Vm, listed: &[Vm]) -> bool {
        vm.local
            || listed.iter().any(|l| l.uuid == vm.uuid)
            || self.state.lock().local.local_vm(&vm.uuid).is_some()
    }

    /// Active rules a change of `owners`' VMs can affect: global rules and
    /// rules owned by any of `owners`.
    fn rules_in_scope(state: &SyncState, owners: &[Uuid]) -> BTreeMap<Uuid, FirewallRule> {
        state
            .local
            .active_rules()
            .values()
            .filter(|rule| match rule.scope() {
                Scope::Global => true,
                Scope::Owner(owner) => owners.contains(&owner),
            })
            .map(|rule| (rule.uuid, rule.clone()))
            .collect()
    }

    async fn vm_changed(&self, vm: Vm) -> Result<SyncOutcome, SyncError> {
        let _entity = self.locks.lock(EntityKey::Vm(vm.uuid)).await;
        let _quiet = self.quiescence.read().await;
        self.transition(vm.uuid, RunState::Matching);

        let listed = self.list_local(&VmFilter::all()).await?;
        if !self.is_local(&vm, &listed) {
            return self.remote_vm_changed(vm.to_remote(), listed).await;
        }

        let mut vm = vm;
        vm.local = true;
        let population: Vec<Vm> = listed
            .into_iter()
            .filter(|l| l.uuid != vm.uuid)
            .chain(std::iter::once(vm.clone()))
            .collect();

        let (candidates, policy_requests) = if vm.firewall_enabled {
            (self.rules_for_vm(&vm).await?, 1)
        } else {
            (Vec::new(), 0)
        };

        let (old_rules, new_rules, subject, moved) = {
            let state = self.state.lock();
            let previous = state.local.local_vm(&vm.uuid).cloned();
            let mut owners = vec![vm.owner_uuid];
            if let Some(previous) = &previous {
                owners.push(previous.owner_uuid);
            }

            let old_rules = Self::rules_in_scope(&state, &owners);
            let mut new_rules: BTreeMap<Uuid, FirewallRule> = old_rules
                .values()
                .filter(|rule| matcher::justified_by(rule, &population))
                .map(|rule| (rule.uuid, rule.clone()))
                .collect();
            for rule in candidates {
                new_rules.insert(rule.uuid, rule);
            }

            let changed = previous.as_ref() != Some(&vm);
            let enforced = vm.firewall_enabled || previous.as_ref().is_some_and(|p| p.firewall_enabled);
            let subject = (enforced && changed).then(|| vm.clone());
            let moved: Vec<Vm> = if changed {
                previous.into_iter().chain(std::iter::once(vm.clone())).collect()
            } else {
                Vec::new()
            };
            (old_rules, new_rules, subject, moved)
        };

        self.reconcile(RunInput {
            entity: vm.uuid,
            population,
            old_rules,
            new_rules,
            subject,
            moved,
            teardown: None,
            local_update: LocalVmUpdate::Replace,
            fresh_caches: false,
            policy_requests,
        })
        .await
    }

    /// A VM on another host changed. Merge it into the remote cache and
    /// track or release it depending on whether an active rule still
    /// references it. No resolution is needed.
    async fn remote_vm_changed(&self, vm: RemoteVm, population: Vec<Vm>) -> Result<SyncOutcome, SyncError> {
        self.transition(vm.uuid, RunState::Diffing);
        let (rvm_diff, vms) = {
            let state = self.state.lock();
            let active = state.local.active_rules();
            let referenced = active
                .values()
                .any(|rule| matcher::references(rule, &population, &vm));
            let previous = state.local.tracked_rvms().get(&vm.uuid).cloned();

            let mut diff = RvmDiff::default();
            match (referenced, previous) {
                (true, None) => diff.to_add.push(vm.clone()),
                (true, Some(previous)) if previous != vm => diff.to_update.push(vm.clone()),
                (false, Some(previous)) => diff.to_remove.push(previous),
                _ => {}
            }
            let vms = affected_vms(&population, active, &RuleDiff::default(), &diff, &[], None);
            (diff, vms)
        };

        let mut outcome = SyncOutcome::from_diffs(&RuleDiff::default(), &rvm_diff);
        let changeset = changeset_for(&RuleDiff::default(), &rvm_diff, vms, Vec::new());
        if !changeset.is_empty() {
            self.transition(vm.uuid, RunState::Applying);
            self.apply_changeset(&changeset).await?;
            outcome.backend_calls = 1;
        }

        {
            let mut state = self.state.lock();
            state.remotes.upsert(vm);
            state.local.apply(&RuleDiff::default(), &rvm_diff);
        }
        self.publish_diffs(&RuleDiff::default(), &rvm_diff);
        Ok(outcome)
    }

    async fn vm_deleted(&self, vm: Vm) -> Result<SyncOutcome, SyncError> {
        let _entity = self.locks.lock(EntityKey::Vm(vm.uuid)).await;
        let _quiet = self.quiescence.read().await;
        self.transition(vm.uuid, RunState::Matching);

        let listed = self.list_local(&VmFilter::all()).await?;
        if !self.is_local(&vm, &listed) {
            return self.remote_vm_deleted(vm.to_remote()).await;
        }

        let population: Vec<Vm> = listed.into_iter().filter(|l| l.uuid != vm.uuid).collect();
        let (old_rules, new_rules, previous) = {
            let state = self.state.lock();
            let previous = state.local.local_vm(&vm.uuid).cloned().unwrap_or_else(|| vm.clone());
            let old_rules = Self::rules_in_scope(&state, &[vm.owner_uuid, previous.owner_uuid]);
            let new_rules = old_rules
                .values()
                .filter(|rule| matcher::justified_by(rule, &population))
                .map(|rule| (rule.uuid, rule.clone()))
                .collect();
            (old_rules, new_rules, previous)
        };

        self.reconcile(RunInput {
            entity: vm.uuid,
            population,
            old_rules,
            new_rules,
            subject: None,
            moved: vec![previous.clone()],
            teardown: Some(previous),
            local_update: LocalVmUpdate::Replace,
            fresh_caches: false,
            policy_requests: 0,
        })
        .await
    }

    async fn remote_vm_deleted(&self, vm: RemoteVm) -> Result<SyncOutcome, SyncError> {
        self.transition(vm.uuid, RunState::Diffing);
        let (rvm_diff, vms) = {
            let state = self.state.lock();
            let mut diff = RvmDiff::default();
            if let Some(previous) = state.local.tracked_rvms().get(&vm.uuid) {
                diff.to_remove.push(previous.clone());
            }
            let population: Vec<Vm> = state.local.local_vms().values().cloned().collect();
            let vms = affected_vms(
                &population,
                state.local.active_rules(),
                &RuleDiff::default(),
                &diff,
                &[],
                None,
            );
            (diff, vms)
        };

        let mut outcome = SyncOutcome::from_diffs(&RuleDiff::default(), &rvm_diff);
        let changeset = changeset_for(&RuleDiff::default(), &rvm_diff, vms, Vec::new());
        if !changeset.is_empty() {
            self.transition(vm.uuid, RunState::Applying);
            self.apply_changeset(&changeset).await?;
            outcome.backend_calls = 1;
        }

        {
            let mut state = self.state.lock();
            state.remotes.remove(&vm.uuid);
            state.local.apply(&RuleDiff::default(), &rvm_diff);
        }
        self.publish_diffs(&RuleDiff::default(), &rvm_diff);
        Ok(outcome)
    }

    async fn rule_changed(&self, rule: FirewallRule) -> Result<SyncOutcome, SyncError> {
        let _entity = self.locks.lock(EntityKey::Rule(rule.uuid)).await;
        let _quiet = self.quiescence.read().await;
        self.transition(rule.uuid, RunState::Matching);

        let listed = self.list_local(&VmFilter::for_scope(rule.scope())).await?;
        let relevant = matcher::justified_by(&rule, &listed);

        let (population, previous) = {
            let state = self.state.lock();
            let mut population = state.local.local_vms().clone();
            for vm in &listed {
                population.insert(vm.uuid, vm.clone());
            }
            let previous = state.local.active_rules().get(&rule.uuid).cloned();
            (population.into_values().collect::<Vec<_>>(), previous)
        };

        if !relevant && previous.is_none() {
            debug!(rule_uuid = %rule.uuid, "Rule matches no local firewall-enabled VM, ignoring");
            return Ok(SyncOutcome::default());
        }

        let old_rules = previous.into_iter().map(|r| (r.uuid, r)).collect();
        let new_rules = if relevant {
            BTreeMap::from([(rule.uuid, rule.clone())])
        } else {
            BTreeMap::new()
        };

        self.reconcile(RunInput {
            entity: rule.uuid,
            population,
            old_rules,
            new_rules,
            subject: None,
            moved: Vec::new(),
            teardown: None,
            local_update: LocalVmUpdate::Upsert(listed),
            fresh_caches: false,
            policy_requests: 0,
        })
        .await
    }

    /// The event names the rule by uuid and owner only. The active copy, when
    /// there is one, decides the scope.
    async fn rule_deleted(&self, rule: RuleRef) -> Result<SyncOutcome, SyncError> {
        let _entity = self.locks.lock(EntityKey::Rule(rule.uuid)).await;
        let _quiet = self.quiescence.read().await;
        self.transition(rule.uuid, RunState::Matching);

        let scope = self
            .state
            .lock()
            .local
            .active_rules()
            .get(&rule.uuid)
            .map_or_else(|| rule.scope(), FirewallRule::scope);
        let listed = self.list_local(&VmFilter::for_scope(scope)).await?;

        let mut outcome = SyncOutcome::default();
        if !listed.is_empty() {
            self.transition(rule.uuid, RunState::Applying);
            let changeset = FirewallChangeset {
                remove_rules: vec![rule.uuid],
                vms: listed,
                ..Default::default()
            };
            self.apply_changeset(&changeset).await?;
            outcome.backend_calls = 1;
        }

        // Remote VMs only this rule referenced stay tracked until the next
        // recomputation or resync releases them.
        let diff = {
            let mut state = self.state.lock();
            let mut diff = RuleDiff::default();
            if let Some(current) = state.local.active_rules().get(&rule.uuid) {
                diff.to_remove.push(current.clone());
            }
            state.local.apply(&diff, &RvmDiff::default());
            diff
        };
        outcome.deactivated = diff.to_remove.iter().map(|r| r.uuid).collect();
        self.publish_diffs(&diff, &RvmDiff::default());
        Ok(outcome)
    }

    async fn resync_all(&self) -> Result<SyncOutcome, SyncError> {
        let _quiet = self.quiescence.write().await;
        let entity = Uuid::nil();
        self.transition(entity, RunState::Matching);

        let population = self.list_local(&VmFilter::all()).await?;
        let mut new_rules = BTreeMap::new();
        let mut policy_requests = 0;
        for vm in population.iter().filter(|vm| vm.firewall_enabled) {
            policy_requests += 1;
            for rule in self.rules_for_vm(vm).await? {
                new_rules.insert(rule.uuid, rule);
            }
        }

        let old_rules = self.state.lock().local.active_rules().clone();
        self.reconcile(RunInput {
            entity,
            population,
            old_rules,
            new_rules,
            subject: None,
            moved: Vec::new(),
            teardown: None,
            local_update: LocalVmUpdate::Replace,
            fresh_caches: true,
            policy_requests,
        })
        .await
    }

    /// Resolve, diff, apply and commit one recomputation.
    async fn reconcile(&self, input: RunInput) -> Result<SyncOutcome, SyncError> {
        let RunInput {
            entity,
            population,
            old_rules,
            new_rules,
            subject,
            moved,
            teardown,
            local_update,
            fresh_caches,
            policy_requests,
        } = input;

        let (plan, mut candidates, old_tracked, post_rules) = {
            let state = self.state.lock();
            let mut post_rules = state.local.active_rules().clone();
            for uuid in old_rules.keys() {
                post_rules.remove(uuid);
            }
            post_rules.extend(new_rules.iter().map(|(uuid, rule)| (*uuid, rule.clone())));

            let old_tracked = state.local.tracked_rvms().clone();
            if fresh_caches {
                let plan = plan_resolution(
                    new_rules.values(),
                    &population,
                    &TagCache::new(),
                    &RemoteVmCache::new(),
                );
                (plan, BTreeMap::new(), old_tracked, post_rules)
            } else {
                let plan = plan_resolution(new_rules.values(), &population, &state.tags, &state.remotes);
                let mut candidates = old_tracked.clone();
                candidates.extend(state.remotes.values().map(|vm| (vm.uuid, vm.clone())));
                (plan, candidates, old_tracked, post_rules)
            }
        };

        self.transition(entity, RunState::Resolving);
        let resolved = execute_plan(&plan, self.resolver.as_ref(), &population).await?;

        self.transition(entity, RunState::Diffing);
        candidates.extend(resolved.vms.iter().map(|vm| (vm.uuid, vm.clone())));
        let new_tracked = compute_tracked(&post_rules, &population, candidates.into_values());
        let rule_diff = diff_rules(&old_rules, &new_rules);
        let rvm_diff = diff_rvms(&old_tracked, &new_tracked);
        let vms = affected_vms(
            &population,
            &post_rules,
            &rule_diff,
            &rvm_diff,
            &moved,
            subject.as_ref(),
        );
        let targets = target_vms(&population, &post_rules, &rule_diff, &moved, &vms);
        let changeset = changeset_for(&rule_diff, &rvm_diff, vms, targets);

        let mut outcome = SyncOutcome::from_diffs(&rule_diff, &rvm_diff);
        outcome.policy_requests = policy_requests;
        outcome.directory_requests = resolved.requests;

        self.transition(entity, RunState::Applying);
        if !changeset.is_empty() {
            self.apply_changeset(&changeset).await?;
            outcome.backend_calls += 1;
        }
        if let Some(vm) = &teardown {
            info!(vm_uuid = %vm.uuid, "Tearing down firewall state of deleted VM");
            metrics::counter!("fwsync_backend_calls_total").increment(1);
            self.backend.teardown(vm).await?;
            outcome.backend_calls += 1;
        }

        self.commit(&rule_diff, &rvm_diff, resolved, population, local_update, fresh_caches);
        self.publish_diffs(&rule_diff, &rvm_diff);
        if let Some(vm) = teardown {
            self.event_bus.publish(SyncEvent::LocalVmTornDown {
                vm_uuid: vm.uuid,
                torn_down_at: Utc::now(),
            });
        }
        if fresh_caches {
            self.event_bus.publish(SyncEvent::CachesCleared { cleared_at: Utc::now() });
        }
        Ok(outcome)
    }

    fn commit(
        &self,
        rule_diff: &RuleDiff,
        rvm_diff: &RvmDiff,
        resolved: ResolvedTargets,
        population: Vec<Vm>,
        local_update: LocalVmUpdate,
        fresh_caches: bool,
    ) {
        let mut state = self.state.lock();
        if fresh_caches {
            state.tags.clear();
            state.remotes.clear();
        }
        match local_update {
            LocalVmUpdate::Replace => state.local.replace_local_vms(population),
            LocalVmUpdate::Upsert(vms) => {
                for vm in vms {
                    state.local.record_local_vm(vm);
                }
            }
        }
        state.local.apply(rule_diff, rvm_diff);
        for (scope, tag, value) in &resolved.tag_values {
            state.tags.add(*scope, tag, value.as_deref());
        }
        state.remotes.extend(resolved.vms);
    }

    fn publish_diffs(&self, rules: &RuleDiff, rvms: &RvmDiff) {
        let now = Utc::now();
        for rule in &rules.to_add {
            self.event_bus.publish(SyncEvent::RuleActivated {
                rule_uuid: rule.uuid,
                activated_at: now,
            });
        }
        for rule in &rules.to_update {
            self.event_bus.publish(SyncEvent::RuleUpdated {
                rule_uuid: rule.uuid,
                updated_at: now,
            });
        }
        for rule in &rules.to_remove {
            self.event_bus.publish(SyncEvent::RuleDeactivated {
                rule_uuid: rule.uuid,
                deactivated_at: now,
            });
        }
        for vm in &rvms.to_add {
            self.event_bus.publish(SyncEvent::RemoteVmTracked {
                vm_uuid: vm.uuid,
                tracked_at: now,
            });
        }
        for vm in &rvms.to_remove {
            self.event_bus.publish(SyncEvent::RemoteVmReleased {
                vm_uuid: vm.uuid,
                released_at: now,
            });
        }
    }
}

#[async_trait]
impl FirewallSyncService for StandardFirewallSyncService {
    async fn on_vm_add(&self, vm: Vm) -> Result<SyncOutcome, SyncError> {
        let uuid = vm.uuid;
        let result = self.vm_changed(vm).await;
        self.finish("vm.add", uuid, result)
    }

    async fn on_vm_update(&self, vm: Vm) -> Result<SyncOutcome, SyncError> {
        let uuid = vm.uuid;
        let result = self.vm_changed(vm).await;
        self.finish("vm.update", uuid, result)
    }

    async fn on_vm_delete(&self, vm: Vm) -> Result<SyncOutcome, SyncError> {
        let uuid = vm.uuid;
        let result = self.vm_deleted(vm).await;
        self.finish("vm.delete", uuid, result)
    }

    async fn on_rule_add(&self, rule: FirewallRule) -> Result<SyncOutcome, SyncError> {
        let uuid = rule.uuid;
        let result = self.rule_changed(rule).await;
        self.finish("rule.add", uuid, result)
    }

    async fn on_rule_update(&self, rule: FirewallRule) -> Result<SyncOutcome, SyncError> {
        let uuid = rule.uuid;
        let result = self.rule_changed(rule).await;
        self.finish("rule.update", uuid, result)
    }

    async fn on_rule_delete(&self, rule: RuleRef) -> Result<SyncOutcome, SyncError> {
        let uuid = rule.uuid;
        let result = self.rule_deleted(rule).await;
        self.finish("rule.delete", uuid, result)
    }

    async fn resync(&self) -> Result<SyncOutcome, SyncError> {
        let result = self.resync_all().await;
        self.finish("resync", Uuid::nil(), result)
    }

    async fn clear_caches(&self) {
        let _quiet = self.quiescence.write().await;
        {
            let mut state = self.state.lock();
            state.tags.clear();
            state.remotes.clear();
        }
        info!("Tag and remote VM caches cleared");
        self.event_bus.publish(SyncEvent::CachesCleared { cleared_at: Utc::now() });
    }

    fn state(&self) -> SyncStateView {
        let state = self.state.lock();
        SyncStateView {
            state: state.local.snapshot(),
            tag_cache_entries: state.tags.len(),
            remote_vm_cache_entries: state.remotes.len(),
        }
    }
}

/// Rules of `rules` paired with the sides this host needs resolved.
fn needed_sides<'a>(rules: &'a BTreeMap<Uuid, FirewallRule>, population: &[Vm]) -> Vec<(&'a FirewallRule, Vec<Side>)> {
    rules
        .values()
        .map(|rule| (rule, matcher::sides_to_resolve(rule, population)))
        .filter(|(_, sides)| !sides.is_empty())
        .collect()
}

/// Remote VMs referenced by the far side of any rule in `rules`.
fn compute_tracked<I>(rules: &BTreeMap<Uuid, FirewallRule>, population: &[Vm], candidates: I) -> BTreeMap<Uuid, RemoteVm>
where
    I: IntoIterator<Item = RemoteVm>,
{
    let needs = needed_sides(rules, population);
    let local: HashSet<Uuid> = population.iter().map(|vm| vm.uuid).collect();

    candidates
        .into_iter()
        .filter(|vm| !local.contains(&vm.uuid))
        .filter(|vm| {
            needs
                .iter()
                .any(|(rule, sides)| sides.iter().any(|side| matcher::side_matches(rule, *side, vm)))
        })
        .map(|vm| (vm.uuid, vm))
        .collect()
}

fn is_subject(rule: &FirewallRule, vm: &Vm) -> bool {
    vm.firewall_enabled
        && [Side::From, Side::To]
            .into_iter()
            .any(|side| matcher::side_matches(rule, side, vm))
}

/// Local VMs whose firewall state a diff touches: subjects of changed rules,
/// subjects of rules whose far side gained or lost a remote VM or a changed
/// local VM, and the event's own VM when its attributes changed.
fn affected_vms(
    population: &[Vm],
    rules: &BTreeMap<Uuid, FirewallRule>,
    rule_diff: &RuleDiff,
    rvm_diff: &RvmDiff,
    moved: &[Vm],
    subject: Option<&Vm>,
) -> Vec<Vm> {
    let changed_rules: Vec<&FirewallRule> = rule_diff
        .to_add
        .iter()
        .chain(&rule_diff.to_update)
        .chain(&rule_diff.to_remove)
        .collect();
    let changed_rvms: Vec<&RemoteVm> = rvm_diff
        .to_add
        .iter()
        .chain(&rvm_diff.to_update)
        .chain(&rvm_diff.to_remove)
        .collect();

    let mut vms: Vec<Vm> = population
        .iter()
        .filter(|vm| {
            changed_rules.iter().any(|rule| is_subject(rule, vm))
                || rules.values().any(|rule| {
                    matcher::matched_sides(rule, vm).into_iter().any(|side| {
                        let far = side.opposite();
                        changed_rvms.iter().any(|rvm| matcher::side_matches(rule, far, *rvm))
                            || moved
                                .iter()
                                .any(|other| other.uuid != vm.uuid && matcher::side_matches(rule, far, other))
                    })
                })
        })
        .cloned()
        .collect();

    if let Some(subject) = subject {
        if !vms.iter().any(|vm| vm.uuid == subject.uuid) {
            vms.push(subject.clone());
        }
    }
    vms
}

/// Local VMs outside `vms` that sit on a needed far side of a rule, when the
/// rule changed or the VM itself did. A firewall-disabled VM is never in
/// `vms` but can still be the target of a neighbour's rule.
fn target_vms(
    population: &[Vm],
    rules: &BTreeMap<Uuid, FirewallRule>,
    rule_diff: &RuleDiff,
    moved: &[Vm],
    vms: &[Vm],
) -> Vec<Vm> {
    let changed_rules: HashSet<Uuid> = rule_diff
        .to_add
        .iter()
        .chain(&rule_diff.to_update)
        .map(|rule| rule.uuid)
        .collect();
    let moved: HashSet<Uuid> = moved.iter().map(|vm| vm.uuid).collect();
    let needs = needed_sides(rules, population);

    population
        .iter()
        .filter(|vm| !vms.iter().any(|v| v.uuid == vm.uuid))
        .filter(|vm| {
            needs.iter().any(|(rule, sides)| {
                (changed_rules.contains(&rule.uuid) || moved.contains(&vm.uuid))
                    && sides.iter().any(|side| matcher::side_matches(rule, *side, *vm))
            })
        })
        .cloned()
        .collect()
}

fn changeset_for(rules: &RuleDiff, rvms: &RvmDiff, vms: Vec<Vm>, target_vms: Vec<Vm>) -> FirewallChangeset {
    FirewallChangeset {
        add_rules: rules.to_add.iter().chain(&rules.to_update).cloned().collect(),
        remove_rules: rules.to_remove.iter().map(|rule| rule.uuid).collect(),
        add_remote_vms: rvms.to_add.iter().chain(&rvms.to_update).cloned().collect(),
        remove_remote_vms: rvms.to_remove.clone(),
        vms,
        target_vms,
    }
}
