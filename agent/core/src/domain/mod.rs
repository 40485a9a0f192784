// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure types and rules of the firewall synchronization engine, plus the
//! collaborator interfaces the engine consumes (inventory, policy, resolver,
//! backend). Implementations live in `crate::infrastructure`.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Rule model, matching, caches and local state

pub mod vm;
pub mod rule;
pub mod rule_parser;
pub mod matcher;
pub mod tag_cache;
pub mod remote_cache;
pub mod local_state;
pub mod inventory;
pub mod policy;
pub mod resolver;
pub mod backend;
pub mod events;
pub mod agent_config;
