// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! VM inventory contract: the VMs running on this host.
//!
//! Implemented by `crate::infrastructure::vmadm::VmadmInventory` (production)
//! and `crate::infrastructure::memory::InMemoryInventory` (tests).

use crate::domain::rule::Scope;
use crate::domain::vm::Vm;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Listing filter. An empty filter lists every local VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmFilter {
    pub owner_uuid: Option<Uuid>,
}

impl VmFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn owner(owner_uuid: Uuid) -> Self {
        Self {
            owner_uuid: Some(owner_uuid),
        }
    }

    /// Filter matching a rule scope: global rules list everything.
    pub fn for_scope(scope: Scope) -> Self {
        Self {
            owner_uuid: scope.owner_uuid(),
        }
    }

    pub fn accepts(&self, vm: &Vm) -> bool {
        self.owner_uuid.map_or(true, |owner| vm.owner_uuid == owner)
    }
}

#[derive(Debug, Error)]
pub enum InventoryError {
    /// Listing failed. The message is passed through untouched.
    #[error("{0}")]
    ListFailed(String),
    #[error("Failed to parse inventory output: {0}")]
    Parse(String),
}

#[async_trait]
pub trait VmInventory: Send + Sync {
    /// List local VMs accepted by `filter`. Every returned VM has `local = true`.
    async fn list(&self, filter: &VmFilter) -> Result<Vec<Vm>, InventoryError>;
}
