// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # VM Directory Contract
//!
//! The remote resolution service answers which VMs (anywhere in the cluster)
//! carry given tags, have given uuids, or belong to an owner. A
//! [`ResolveRequest`] batches every uncached target of one owner scope so an
//! event costs at most one directory round-trip per scope.

use crate::domain::rule::Scope;
use crate::domain::vm::RemoteVm;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Resolution request failed: {0}")]
    Transport(String),
    #[error("Resolution service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed resolution response: {0}")]
    Malformed(String),
}

/// One directory request.
///
/// `tags` maps a tag name to the requested values; `None` asks for every VM
/// carrying the tag regardless of value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<Uuid>,
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<Option<String>>>,
    #[serde(default)]
    pub vms: Vec<Uuid>,
    /// Rules this request resolves targets for.
    #[serde(default)]
    pub rules: Vec<Uuid>,
    #[serde(default)]
    pub all_vms: bool,
}

impl ResolveRequest {
    pub fn for_scope(scope: Scope) -> Self {
        Self {
            owner_uuid: scope.owner_uuid(),
            ..Default::default()
        }
    }

    pub fn scope(&self) -> Scope {
        match self.owner_uuid {
            Some(owner) => Scope::Owner(owner),
            None => Scope::Global,
        }
    }

    pub fn add_tag(&mut self, name: &str, value: Option<&str>) {
        let values = self.tags.entry(name.to_string()).or_default();
        let value = value.map(str::to_string);
        if !values.contains(&value) {
            values.push(value);
            values.sort();
        }
    }

    pub fn add_vm(&mut self, uuid: Uuid) {
        if !self.vms.contains(&uuid) {
            self.vms.push(uuid);
        }
    }

    pub fn add_rule(&mut self, uuid: Uuid) {
        if !self.rules.contains(&uuid) {
            self.rules.push(uuid);
        }
    }

    /// `(name, value)` pairs requested, in order.
    pub fn tag_pairs(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.tags.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_deref()))
        })
    }

    /// Whether the request asks for anything at all.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.vms.is_empty() && !self.all_vms
    }
}

#[async_trait]
pub trait ResolverClient: Send + Sync {
    /// VMs matching any part of `request`. May include local VMs; callers
    /// drop them.
    async fn resolve(&self, request: &ResolveRequest) -> Result<Vec<RemoteVm>, ResolutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_batches_tag_values() {
        let mut request = ResolveRequest::for_scope(Scope::Global);
        request.add_tag("couch", Some("2"));
        request.add_tag("couch", Some("1"));
        request.add_tag("couch", Some("1"));
        request.add_tag("internal", None);

        let pairs: Vec<_> = request.tag_pairs().collect();
        assert_eq!(
            pairs,
            vec![("couch", Some("1")), ("couch", Some("2")), ("internal", None)]
        );
        assert_eq!(request.scope(), Scope::Global);
        assert!(!request.is_empty());
    }

    #[test]
    fn test_empty_request() {
        let owner = Uuid::new_v4();
        let mut request = ResolveRequest::for_scope(Scope::Owner(owner));
        assert!(request.is_empty());
        request.add_rule(Uuid::new_v4());
        assert!(request.is_empty());
        request.all_vms = true;
        assert!(!request.is_empty());
        assert_eq!(request.scope(), Scope::Owner(owner));
    }
}
