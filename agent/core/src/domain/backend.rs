// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Firewall backend contract.
//!
//! The backend turns resolved rules and VM sets into packet-filter state. The
//! synchronizer hands it one [`FirewallChangeset`] per run, after the full
//! diff is known; the call is all-or-nothing from the agent's point of view.

use crate::domain::rule::FirewallRule;
use crate::domain::vm::{RemoteVm, Vm};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Firewall backend failed: {0}")]
    ApplyFailed(String),
    #[error("Firewall teardown failed: {0}")]
    TeardownFailed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallChangeset {
    /// New or changed rules.
    #[serde(default)]
    pub add_rules: Vec<FirewallRule>,
    /// Rules to remove, by uuid.
    #[serde(default)]
    pub remove_rules: Vec<Uuid>,
    /// New or changed remote VMs.
    #[serde(default)]
    pub add_remote_vms: Vec<RemoteVm>,
    #[serde(default)]
    pub remove_remote_vms: Vec<RemoteVm>,
    /// Local VMs whose firewall state is affected.
    #[serde(default)]
    pub vms: Vec<Vm>,
    /// Local VMs outside `vms` that a rule of this host references on its
    /// far side, typically VMs with their firewall disabled.
    #[serde(default)]
    pub target_vms: Vec<Vm>,
}

impl FirewallChangeset {
    /// Nothing to send. An empty changeset never reaches the backend.
    pub fn is_empty(&self) -> bool {
        self.add_rules.is_empty()
            && self.remove_rules.is_empty()
            && self.add_remote_vms.is_empty()
            && self.remove_remote_vms.is_empty()
            && self.vms.is_empty()
            && self.target_vms.is_empty()
    }
}

#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn apply(&self, changeset: &FirewallChangeset) -> Result<(), BackendError>;

    /// Remove every piece of firewall state belonging to a deleted local VM.
    async fn teardown(&self, vm: &Vm) -> Result<(), BackendError>;
}
