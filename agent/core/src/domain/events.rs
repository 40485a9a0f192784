// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcomes of synchronization runs, published on the event bus after the
/// run has committed (or failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    RuleActivated {
        rule_uuid: Uuid,
        activated_at: DateTime<Utc>,
    },
    RuleUpdated {
        rule_uuid: Uuid,
        updated_at: DateTime<Utc>,
    },
    RuleDeactivated {
        rule_uuid: Uuid,
        deactivated_at: DateTime<Utc>,
    },
    RemoteVmTracked {
        vm_uuid: Uuid,
        tracked_at: DateTime<Utc>,
    },
    RemoteVmReleased {
        vm_uuid: Uuid,
        released_at: DateTime<Utc>,
    },
    LocalVmTornDown {
        vm_uuid: Uuid,
        torn_down_at: DateTime<Utc>,
    },
    CachesCleared {
        cleared_at: DateTime<Utc>,
    },
    RunFailed {
        event: String,
        entity: Uuid,
        error: String, // verbatim collaborator message
        failed_at: DateTime<Utc>,
    },
}

impl SyncEvent {
    /// Rule or VM the event is about. `None` for cache-wide events.
    pub fn entity(&self) -> Option<Uuid> {
        match self {
            SyncEvent::RuleActivated { rule_uuid, .. }
            | SyncEvent::RuleUpdated { rule_uuid, .. }
            | SyncEvent::RuleDeactivated { rule_uuid, .. } => Some(*rule_uuid),
            SyncEvent::RemoteVmTracked { vm_uuid, .. }
            | SyncEvent::RemoteVmReleased { vm_uuid, .. }
            | SyncEvent::LocalVmTornDown { vm_uuid, .. } => Some(*vm_uuid),
            SyncEvent::RunFailed { entity, .. } => Some(*entity),
            SyncEvent::CachesCleared { .. } => None,
        }
    }
}
