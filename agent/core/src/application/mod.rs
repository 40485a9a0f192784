// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod entity_locks;
pub mod resolution;
pub mod synchronizer;
pub mod dispatcher;

// Re-export services for convenience
pub use dispatcher::{DispatchOutcome, EventDispatcher, EventKind, EventMessage, IgnoreReason};
pub use synchronizer::{
    FirewallSyncService, StandardFirewallSyncService, SyncError, SyncOutcome, SyncStateView,
};
