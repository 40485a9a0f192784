// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Policy service contract: which rules apply to a local VM.

use crate::domain::resolver::ResolutionError;
use crate::domain::rule::FirewallRule;
use crate::domain::vm::{Tags, Vm};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// `{owner_uuid, vms: [uuid], tags: {name: [value]}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleQuery {
    pub owner_uuid: Uuid,
    pub vms: Vec<Uuid>,
    pub tags: BTreeMap<String, Vec<String>>,
}

impl RuleQuery {
    pub fn for_vm(vm: &Vm) -> Self {
        Self {
            owner_uuid: vm.owner_uuid,
            vms: vec![vm.uuid],
            tags: tag_lists(&vm.tags),
        }
    }
}

fn tag_lists(tags: &Tags) -> BTreeMap<String, Vec<String>> {
    tags.iter()
        .map(|(name, value)| (name.clone(), vec![value.clone()]))
        .collect()
}

#[async_trait]
pub trait PolicyClient: Send + Sync {
    async fn rules_for_vm(&self, query: &RuleQuery) -> Result<Vec<FirewallRule>, ResolutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_shape_for_vm() {
        let vm = Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            firewall_enabled: true,
            tags: BTreeMap::from([("role".to_string(), "www".to_string())]),
            ips: vec![],
            server_uuid: None,
            local: true,
        };

        let value = serde_json::to_value(RuleQuery::for_vm(&vm)).unwrap();
        assert_eq!(
            value,
            json!({
                "owner_uuid": vm.owner_uuid,
                "vms": [vm.uuid],
                "tags": { "role": ["www"] }
            })
        );
    }
}
