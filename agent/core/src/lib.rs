// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `fwsync-core`: Rule Resolution & Remote-VM Cache Engine
//!
//! Keeps a host's firewall in step with the cluster-wide, tag-based policy.
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | rules, VMs, matcher, caches, local state, collaborator traits |
//! | [`application`] | Application | synchronizer, remote resolver, event dispatcher |
//! | [`infrastructure`] | Infrastructure | inventory command, HTTP clients, backend command, event bus |
//! | [`presentation`] | Presentation | HTTP event intake (Axum) |

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
