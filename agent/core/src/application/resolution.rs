// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote Resolver
//!
//! Turns the far sides of a set of active rules into directory requests, and
//! the directory answers into remote VM records.
//!
//! # Planning
//!
//! [`plan_resolution`] runs under the state lock and performs no I/O. It
//! walks every side that some local VM needs resolved and collects the
//! targets the caches cannot already answer:
//!
//! - tag values missing from the [`TagCache`]
//! - explicit VM references missing from the [`RemoteVmCache`]
//! - `all vms`, which is never cached
//!
//! Targets are grouped by owner scope, so an event costs at most one
//! directory request per scope regardless of how many tag values it touches.
//!
//! # Execution
//!
//! [`execute_plan`] issues the requests in order and stops at the first
//! failure. Nothing is committed here: the caller commits the returned tag
//! values and VM records only after its changeset has been applied.

use crate::domain::matcher;
use crate::domain::remote_cache::RemoteVmCache;
use crate::domain::resolver::{ResolutionError, ResolveRequest, ResolverClient};
use crate::domain::rule::{FirewallRule, Scope, Target};
use crate::domain::tag_cache::TagCache;
use crate::domain::vm::{RemoteVm, Vm};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Directory requests for one run, at most one per scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionPlan {
    pub requests: Vec<ResolveRequest>,
}

impl ResolutionPlan {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// What a successful plan produced.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTargets {
    /// Remote VMs returned by the directory. Local VMs are already dropped.
    pub vms: Vec<RemoteVm>,
    /// `(scope, tag, value)` triples to record in the tag cache on commit.
    pub tag_values: Vec<(Scope, String, Option<String>)>,
    pub requests: usize,
}

pub fn plan_resolution<'a, R>(
    rules: R,
    local_vms: &[Vm],
    tag_cache: &TagCache,
    remote_cache: &RemoteVmCache,
) -> ResolutionPlan
where
    R: IntoIterator<Item = &'a FirewallRule>,
{
    let local_uuids: HashSet<Uuid> = local_vms.iter().map(|vm| vm.uuid).collect();
    let mut by_scope: BTreeMap<Scope, ResolveRequest> = BTreeMap::new();

    for rule in rules {
        let scope = rule.scope();
        for side in matcher::sides_to_resolve(rule, local_vms) {
            for target in rule.expression().side(side) {
                let request = by_scope
                    .entry(scope)
                    .or_insert_with(|| ResolveRequest::for_scope(scope));
                let before = request.clone();

                match target {
                    Target::AllVms => request.all_vms = true,
                    Target::Vm(uuid) => {
                        if !local_uuids.contains(uuid) && !remote_cache.contains(uuid) {
                            request.add_vm(*uuid);
                        }
                    }
                    Target::Tag(tag) if tag.matches_any_value() => {
                        if !tag_cache.has(scope, &tag.name, None) {
                            request.add_tag(&tag.name, None);
                        }
                    }
                    Target::Tag(tag) => {
                        for value in &tag.values {
                            if !tag_cache.has(scope, &tag.name, Some(value)) {
                                request.add_tag(&tag.name, Some(value));
                            }
                        }
                    }
                    Target::Any | Target::Address(_) => {}
                }

                if *request != before {
                    request.add_rule(rule.uuid);
                }
            }
        }
    }

    ResolutionPlan {
        requests: by_scope
            .into_values()
            .filter(|request| !request.is_empty())
            .collect(),
    }
}

pub async fn execute_plan(
    plan: &ResolutionPlan,
    resolver: &dyn ResolverClient,
    local_vms: &[Vm],
) -> Result<ResolvedTargets, ResolutionError> {
    let local_uuids: HashSet<Uuid> = local_vms.iter().map(|vm| vm.uuid).collect();
    let mut resolved = ResolvedTargets::default();

    for request in &plan.requests {
        debug!(
            scope = %request.scope(),
            tags = request.tags.len(),
            vms = request.vms.len(),
            all_vms = request.all_vms,
            "Resolving remote targets"
        );
        metrics::counter!("fwsync_resolution_requests_total", "kind" => "directory").increment(1);
        resolved.requests += 1;

        let vms = resolver.resolve(request).await?;
        resolved
            .vms
            .extend(vms.into_iter().filter(|vm| !local_uuids.contains(&vm.uuid)));
        resolved.tag_values.extend(
            request
                .tag_pairs()
                .map(|(name, value)| (request.scope(), name.to_string(), value.map(str::to_string))),
        );
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn local_vm(owner: Uuid, tags: &[(&str, &str)]) -> Vm {
        Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: owner,
            firewall_enabled: true,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ips: vec![],
            server_uuid: None,
            local: true,
        }
    }

    fn rule(owner: Option<Uuid>, text: &str) -> FirewallRule {
        FirewallRule::new(Uuid::new_v4(), owner, text).unwrap()
    }

    #[test]
    fn test_plan_requests_only_the_far_side() {
        let owner = Uuid::new_v4();
        let www = local_vm(owner, &[("role", "www")]);
        let r = rule(Some(owner), "FROM tag role = db TO tag role = www ALLOW tcp PORT 80");

        let plan = plan_resolution([&r], &[www], &TagCache::new(), &RemoteVmCache::new());
        assert_eq!(plan.requests.len(), 1);
        let request = &plan.requests[0];
        assert_eq!(request.owner_uuid, Some(owner));
        assert_eq!(request.tags, BTreeMap::from([("role".to_string(), vec![Some("db".to_string())])]));
        assert_eq!(request.rules, vec![r.uuid]);
    }

    #[test]
    fn test_plan_skips_cached_targets() {
        let owner = Uuid::new_v4();
        let www = local_vm(owner, &[("role", "www")]);
        let r = rule(Some(owner), "FROM tag role = db TO tag role = www ALLOW tcp PORT 80");
        let mut cache = TagCache::new();
        cache.add(Scope::Owner(owner), "role", Some("db"));

        assert!(plan_resolution([&r], &[www], &cache, &RemoteVmCache::new()).is_empty());
    }

    #[test]
    fn test_plan_batches_or_values_into_one_request() {
        let owner = Uuid::new_v4();
        let couch = local_vm(owner, &[("couch", "1")]);
        let r = rule(
            None,
            "FROM (tag couch = 1 OR tag couch = 2) TO (tag couch = 1 OR tag couch = 2) ALLOW tcp PORT 5984",
        );

        let plan = plan_resolution([&r], &[couch], &TagCache::new(), &RemoteVmCache::new());
        assert_eq!(plan.requests.len(), 1);
        let pairs: Vec<_> = plan.requests[0].tag_pairs().collect();
        assert_eq!(pairs, vec![("couch", Some("1")), ("couch", Some("2"))]);
        assert_eq!(plan.requests[0].owner_uuid, None);
    }

    #[test]
    fn test_plan_skips_known_vm_refs() {
        let owner = Uuid::new_v4();
        let local = local_vm(owner, &[]);
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        let r1 = rule(Some(owner), &format!("FROM (vm {} OR vm {}) TO vm {} ALLOW tcp PORT 22", known, unknown, local.uuid));
        let r2 = rule(Some(owner), "FROM tag role = db TO tag role = www ALLOW udp PORT 53");
        let mut remote_cache = RemoteVmCache::new();
        remote_cache.upsert(RemoteVm {
            uuid: known,
            owner_uuid: owner,
            tags: Default::default(),
            ips: vec![],
        });

        // r2 does not apply: the local VM carries no tags.
        let plan = plan_resolution([&r1, &r2], &[local], &TagCache::new(), &remote_cache);
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].vms, vec![unknown]);
        assert!(!plan.requests[0].all_vms);
        assert_eq!(plan.requests[0].rules, vec![r1.uuid]);
    }

    #[test]
    fn test_plan_groups_by_scope() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let vm_a = local_vm(a, &[("role", "www")]);
        let vm_b = local_vm(b, &[("role", "www")]);
        let ra = rule(Some(a), "FROM tag role = db TO tag role = www ALLOW tcp PORT 80");
        let rb = rule(Some(b), "FROM all vms TO tag role = www ALLOW tcp PORT 443");

        let plan = plan_resolution([&ra, &rb], &[vm_a, vm_b], &TagCache::new(), &RemoteVmCache::new());
        assert_eq!(plan.requests.len(), 2);
        assert!(plan.requests.iter().any(|r| r.owner_uuid == Some(b) && r.all_vms));
    }
}
