// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # VM Records
//!
//! [`Vm`] is the full record of a VM as reported by the local inventory or an
//! event payload. [`RemoteVm`] is the reduced projection kept for VMs running
//! on other hosts, which exist here only so the far side of an active rule
//! can be enforced.
//!
//! Tag values arrive as arbitrary JSON scalars (`role: "db"`, `couch: 1`,
//! `internal: true`) and are normalized to strings at the boundary so that
//! matching and caching compare one representation.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Tag name -> normalized tag value.
pub type Tags = BTreeMap<String, String>;

/// A VM as seen by this agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub uuid: Uuid,
    pub owner_uuid: Uuid,

    /// Whether this VM gets enforcement on its own host. A disabled VM never
    /// activates rules here but may still be the target of other VMs' rules.
    #[serde(default)]
    pub firewall_enabled: bool,

    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Tags,

    /// Network identity used by address targets and by the backend.
    #[serde(default)]
    pub ips: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_uuid: Option<Uuid>,

    /// Running on this host.
    #[serde(default)]
    pub local: bool,
}

impl Vm {
    /// Projection used when this VM is tracked from another host.
    pub fn to_remote(&self) -> RemoteVm {
        RemoteVm {
            uuid: self.uuid,
            owner_uuid: self.owner_uuid,
            tags: self.tags.clone(),
            ips: self.ips.clone(),
        }
    }
}

/// Reduced record of a VM running on another host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVm {
    pub uuid: Uuid,
    pub owner_uuid: Uuid,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Tags,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
}

/// Attributes the rule matcher inspects. Implemented by both local and
/// remote records so one matcher serves subject and target checks.
pub trait VmAttributes {
    fn uuid(&self) -> Uuid;
    fn owner_uuid(&self) -> Uuid;
    fn tags(&self) -> &Tags;
    fn ips(&self) -> &[IpAddr];
}

impl VmAttributes for Vm {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn owner_uuid(&self) -> Uuid {
        self.owner_uuid
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn ips(&self) -> &[IpAddr] {
        &self.ips
    }
}

impl VmAttributes for RemoteVm {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn owner_uuid(&self) -> Uuid {
        self.owner_uuid
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn ips(&self) -> &[IpAddr] {
        &self.ips
    }
}

/// Normalize a JSON tag value. `null` and nested values carry no usable tag.
pub fn normalize_tag_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Build normalized tags from a raw JSON map.
pub fn normalize_tags(raw: BTreeMap<String, serde_json::Value>) -> Tags {
    raw.into_iter()
        .filter_map(|(name, value)| normalize_tag_value(&value).map(|v| (name, v)))
        .collect()
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<Tags, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw.map(normalize_tags).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tags_normalized_from_json_scalars() {
        let vm: Vm = serde_json::from_value(json!({
            "uuid": Uuid::new_v4(),
            "owner_uuid": Uuid::new_v4(),
            "firewall_enabled": true,
            "tags": { "role": "db", "couch": 1, "internal": true, "junk": null },
            "ips": ["10.0.1.5"]
        }))
        .unwrap();

        assert_eq!(vm.tags.get("role").map(String::as_str), Some("db"));
        assert_eq!(vm.tags.get("couch").map(String::as_str), Some("1"));
        assert_eq!(vm.tags.get("internal").map(String::as_str), Some("true"));
        assert!(!vm.tags.contains_key("junk"));
        assert!(!vm.local);
    }

    #[test]
    fn test_null_tags_and_missing_fields_default() {
        let vm: Vm = serde_json::from_value(json!({
            "uuid": Uuid::new_v4(),
            "owner_uuid": Uuid::new_v4(),
            "tags": null
        }))
        .unwrap();

        assert!(vm.tags.is_empty());
        assert!(vm.ips.is_empty());
        assert!(!vm.firewall_enabled);
    }
}
