// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Firewall Rules
//!
//! A [`FirewallRule`] is the policy-management record (`uuid`, `owner_uuid`,
//! `enabled`, `global`, `created_by`, the rule text) together with its parsed
//! [`RuleExpression`]. The text is parsed exactly once, when the rule is
//! constructed or deserialized, so matching never inspects strings.
//!
//! ## Invariants
//!
//! - A rule with `global = false` always carries an `owner_uuid`.
//! - The expression always corresponds to the stored text.

use crate::domain::rule_parser::{parse_rule, RuleParseError};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {0} is not global but has no owner_uuid")]
    MissingOwner(Uuid),

    #[error("rule {uuid}: {source}")]
    Parse {
        uuid: Uuid,
        #[source]
        source: RuleParseError,
    },
}

/// Ownership scope of a rule, a cache entry or a resolution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Global rules are owner-agnostic.
    Global,
    Owner(Uuid),
}

impl Scope {
    pub fn owner_uuid(&self) -> Option<Uuid> {
        match self {
            Scope::Global => None,
            Scope::Owner(owner) => Some(*owner),
        }
    }

    /// Whether a VM owned by `owner` falls inside this scope.
    pub fn includes(&self, owner: Uuid) -> bool {
        match self {
            Scope::Global => true,
            Scope::Owner(o) => *o == owner,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Owner(owner) => write!(f, "{}", owner),
        }
    }
}

/// `tag <name> [= <value>] [OR tag <name> = <value> ...]`
///
/// Values of the same tag name on one side of a rule are OR-combined. An
/// empty value set means "any value of this tag".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagExpr {
    pub name: String,
    pub values: BTreeSet<String>,
}

impl TagExpr {
    pub fn any_value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeSet::new(),
        }
    }

    pub fn with_values<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches_any_value(&self) -> bool {
        self.values.is_empty()
    }
}

/// One element of a rule's FROM or TO side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Target {
    /// Every address. Selects no VM.
    Any,
    /// Every VM in the rule's owner scope.
    AllVms,
    /// `ip <addr>` (host-length prefix) or `subnet <cidr>`.
    Address(IpNetwork),
    Tag(TagExpr),
    Vm(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmp6,
    Ah,
    Esp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcmpType {
    pub icmp_type: u8,
    pub code: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFilter {
    All,
    Ports(Vec<PortRange>),
    IcmpTypes(Vec<IcmpType>),
}

/// Parsed `FROM ... TO ... ACTION protocol ...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleExpression {
    pub from: Vec<Target>,
    pub to: Vec<Target>,
    pub action: Action,
    pub protocol: Protocol,
    pub filter: ProtocolFilter,
}

/// Which side of a rule a VM was matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    From,
    To,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::From => Side::To,
            Side::To => Side::From,
        }
    }
}

impl RuleExpression {
    pub fn side(&self, side: Side) -> &[Target] {
        match side {
            Side::From => &self.from,
            Side::To => &self.to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFirewallRule", into = "RawFirewallRule")]
pub struct FirewallRule {
    pub uuid: Uuid,
    pub owner_uuid: Option<Uuid>,
    pub enabled: bool,
    pub global: bool,
    pub created_by: Option<String>,
    pub description: Option<String>,
    text: String,
    expression: RuleExpression,
}

impl FirewallRule {
    /// Parse an enabled rule. A rule without owner is global.
    pub fn new(uuid: Uuid, owner_uuid: Option<Uuid>, text: &str) -> Result<Self, RuleError> {
        Self::try_from(RawFirewallRule {
            uuid,
            owner_uuid,
            enabled: true,
            global: owner_uuid.is_none(),
            created_by: None,
            description: None,
            rule: text.to_string(),
        })
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_global(mut self, global: bool) -> Self {
        if global || self.owner_uuid.is_some() {
            self.global = global;
        }
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expression(&self) -> &RuleExpression {
        &self.expression
    }

    pub fn scope(&self) -> Scope {
        match (self.global, self.owner_uuid) {
            (false, Some(owner)) => Scope::Owner(owner),
            _ => Scope::Global,
        }
    }

    pub fn reference(&self) -> RuleRef {
        RuleRef {
            uuid: self.uuid,
            owner_uuid: self.owner_uuid,
            global: self.global,
        }
    }
}

/// Identity of a rule without its text, as carried by delete events.
///
/// Any other field of the payload, including an unparseable `rule`, is
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRef {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<Uuid>,
    #[serde(default)]
    pub global: bool,
}

impl RuleRef {
    /// A reference without owner is treated as global.
    pub fn scope(&self) -> Scope {
        match (self.global, self.owner_uuid) {
            (false, Some(owner)) => Scope::Owner(owner),
            _ => Scope::Global,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFirewallRule {
    uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner_uuid: Option<Uuid>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    global: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    rule: String,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<RawFirewallRule> for FirewallRule {
    type Error = RuleError;

    fn try_from(raw: RawFirewallRule) -> Result<Self, Self::Error> {
        if !raw.global && raw.owner_uuid.is_none() {
            return Err(RuleError::MissingOwner(raw.uuid));
        }

        let expression = parse_rule(&raw.rule).map_err(|source| RuleError::Parse {
            uuid: raw.uuid,
            source,
        })?;

        Ok(Self {
            uuid: raw.uuid,
            owner_uuid: raw.owner_uuid,
            enabled: raw.enabled,
            global: raw.global,
            created_by: raw.created_by,
            description: raw.description,
            text: raw.rule,
            expression,
        })
    }
}

impl From<FirewallRule> for RawFirewallRule {
    fn from(rule: FirewallRule) -> Self {
        Self {
            uuid: rule.uuid,
            owner_uuid: rule.owner_uuid,
            enabled: rule.enabled,
            global: rule.global,
            created_by: rule.created_by,
            description: rule.description,
            rule: rule.text,
        }
    }
}
