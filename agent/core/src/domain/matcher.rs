// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Rule Matcher
//!
//! Pure predicates over rules and VM attributes. Nothing here performs I/O.
//!
//! - [`matches`] answers whether one target selects a VM, with the rule's
//!   owner scope applied. It ignores `firewall_enabled`: a disabled VM is
//!   still a valid target of other VMs' rules.
//! - [`applies_to`] answers whether a rule is activated by a local VM. Only
//!   enabled rules and firewall-enabled VMs qualify.
//! - [`sides_to_resolve`] names the sides of a rule whose VMs must be tracked
//!   because some local VM sits on the opposite side.

use crate::domain::rule::{FirewallRule, Scope, Side, Target};
use crate::domain::vm::{Vm, VmAttributes};

/// Whether `target` selects `vm` within `scope`.
///
/// [`Target::Any`] is an address wildcard and never selects a VM.
pub fn matches<V: VmAttributes + ?Sized>(target: &Target, scope: Scope, vm: &V) -> bool {
    if !scope.includes(vm.owner_uuid()) {
        return false;
    }

    match target {
        Target::Any => false,
        Target::AllVms => true,
        Target::Address(network) => vm.ips().iter().any(|ip| network.contains(*ip)),
        Target::Tag(tag) => match vm.tags().get(&tag.name) {
            Some(value) => tag.matches_any_value() || tag.values.contains(value),
            None => false,
        },
        Target::Vm(uuid) => vm.uuid() == *uuid,
    }
}

/// Whether any target on `side` of `rule` selects `vm`.
pub fn side_matches<V: VmAttributes + ?Sized>(rule: &FirewallRule, side: Side, vm: &V) -> bool {
    let scope = rule.scope();
    rule.expression()
        .side(side)
        .iter()
        .any(|target| matches(target, scope, vm))
}

/// Sides of `rule` on which `vm` is a subject. Empty unless the rule is
/// enabled and the VM is firewall-enabled.
pub fn matched_sides(rule: &FirewallRule, vm: &Vm) -> Vec<Side> {
    if !rule.enabled || !vm.firewall_enabled {
        return Vec::new();
    }
    [Side::From, Side::To]
        .into_iter()
        .filter(|side| side_matches(rule, *side, vm))
        .collect()
}

/// Whether `vm` activates `rule` on this host.
pub fn applies_to(rule: &FirewallRule, vm: &Vm) -> bool {
    !matched_sides(rule, vm).is_empty()
}

/// Whether any VM of the local population activates `rule`.
pub fn justified_by<'a, I>(rule: &FirewallRule, local_vms: I) -> bool
where
    I: IntoIterator<Item = &'a Vm>,
{
    local_vms.into_iter().any(|vm| applies_to(rule, vm))
}

/// Sides whose VMs this host needs: the opposite of every side a local VM
/// matched.
pub fn sides_to_resolve<'a, I>(rule: &FirewallRule, local_vms: I) -> Vec<Side>
where
    I: IntoIterator<Item = &'a Vm>,
{
    let mut sides = Vec::with_capacity(2);
    for vm in local_vms {
        for side in matched_sides(rule, vm) {
            let needed = side.opposite();
            if !sides.contains(&needed) {
                sides.push(needed);
            }
        }
        if sides.len() == 2 {
            break;
        }
    }
    sides
}

/// Whether `vm` is referenced by a side this host needs for `rule`.
pub fn references<'a, V, I>(rule: &FirewallRule, local_vms: I, vm: &V) -> bool
where
    V: VmAttributes + ?Sized,
    I: IntoIterator<Item = &'a Vm>,
{
    sides_to_resolve(rule, local_vms)
        .into_iter()
        .any(|side| side_matches(rule, side, vm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::TagExpr;
    use crate::domain::vm::RemoteVm;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn vm(owner: Uuid, tags: &[(&str, &str)]) -> Vm {
        Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: owner,
            firewall_enabled: true,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ips: vec!["10.0.1.1".parse().unwrap()],
            server_uuid: None,
            local: true,
        }
    }

    fn rule(owner: Option<Uuid>, text: &str) -> FirewallRule {
        FirewallRule::new(Uuid::new_v4(), owner, text).unwrap()
    }

    #[test]
    fn test_target_variants() {
        let owner = Uuid::new_v4();
        let scope = Scope::Owner(owner);
        let subject = vm(owner, &[("role", "db")]);

        assert!(!matches(&Target::Any, scope, &subject));
        assert!(matches(&Target::AllVms, scope, &subject));
        assert!(matches(&Target::Address("10.0.0.0/8".parse().unwrap()), scope, &subject));
        assert!(!matches(&Target::Address("10.0.2.1/32".parse().unwrap()), scope, &subject));
        assert!(matches(&Target::Tag(TagExpr::any_value("role")), scope, &subject));
        assert!(matches(&Target::Tag(TagExpr::with_values("role", ["qa", "db"])), scope, &subject));
        assert!(!matches(&Target::Tag(TagExpr::with_values("role", ["qa"])), scope, &subject));
        assert!(matches(&Target::Vm(subject.uuid), scope, &subject));
        assert!(!matches(&Target::Vm(Uuid::new_v4()), scope, &subject));
    }

    #[test]
    fn test_owner_scope_excludes_other_tenants() {
        let owner = Uuid::new_v4();
        let stranger = vm(Uuid::new_v4(), &[("role", "db")]);
        let r = rule(Some(owner), "FROM tag role = db TO all vms ALLOW tcp PORT 80");

        assert!(!applies_to(&r, &stranger));
        assert!(!matches(&Target::AllVms, r.scope(), &stranger));
    }

    #[test]
    fn test_global_rule_is_owner_agnostic() {
        let r = rule(None, "FROM any TO all vms ALLOW icmp TYPE 8 CODE 0");
        let subject = vm(Uuid::new_v4(), &[]);
        assert!(applies_to(&r, &subject));
        assert_eq!(matched_sides(&r, &subject), vec![Side::To]);
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let owner = Uuid::new_v4();
        let r = rule(Some(owner), "FROM all vms TO all vms ALLOW tcp PORT 22").with_enabled(false);
        assert!(!applies_to(&r, &vm(owner, &[])));
    }

    #[test]
    fn test_firewall_disabled_vm_is_target_but_not_subject() {
        let owner = Uuid::new_v4();
        let r = rule(Some(owner), "FROM ip 10.0.1.1 TO tag internal ALLOW tcp PORT 80");
        let mut subject = vm(owner, &[("internal", "true")]);
        subject.firewall_enabled = false;

        assert!(!applies_to(&r, &subject));
        assert!(side_matches(&r, Side::To, &subject));
    }

    #[test]
    fn test_sides_to_resolve_follow_local_matches() {
        let owner = Uuid::new_v4();
        let r = rule(Some(owner), "FROM tag role = db TO tag role = www ALLOW tcp PORT 80");
        let www = vm(owner, &[("role", "www")]);
        assert_eq!(sides_to_resolve(&r, [&www]), vec![Side::From]);

        let db = vm(owner, &[("role", "db")]);
        let both = sides_to_resolve(&r, [&www, &db]);
        assert_eq!(both.len(), 2);

        let remote_db = RemoteVm {
            uuid: Uuid::new_v4(),
            owner_uuid: owner,
            tags: BTreeMap::from([("role".to_string(), "db".to_string())]),
            ips: vec![],
        };
        assert!(references(&r, [&www], &remote_db));
        assert!(!references(&r, [&db], &remote_db));
    }

    #[test]
    fn test_symmetric_rule_resolves_both_sides() {
        let owner = Uuid::new_v4();
        let r = rule(
            Some(owner),
            "FROM (tag couch = 1 OR tag couch = 2) TO (tag couch = 1 OR tag couch = 2) ALLOW tcp PORT 5984",
        );
        let local = vm(owner, &[("couch", "1")]);
        let sides = sides_to_resolve(&r, [&local]);
        assert!(sides.contains(&Side::From));
        assert!(sides.contains(&Side::To));
    }
}
