// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod memory;
pub mod vmadm;
pub mod http_policy;
pub mod http_resolver;
pub mod command_backend;

pub use command_backend::CommandBackend;
pub use event_bus::{EventBus, EventBusError};
pub use http_policy::HttpPolicyClient;
pub use http_resolver::HttpResolverClient;
pub use memory::{InMemoryDirectory, InMemoryInventory, InMemoryPolicyClient, RecordingBackend};
pub use vmadm::VmadmInventory;
