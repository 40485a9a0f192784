// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`fwsync-core`)
//!
//! HTTP surface that translates transport messages into application service
//! calls. Nothing here decides what the firewall should look like; every
//! request is delegated to `crate::application`.
//!
//! | Route | Method | Description |
//! |-------|--------|-------------|
//! | `/health` | GET | Liveness and version |
//! | `/events` | POST | `{name, value}` event intake |
//! | `/events/stream` | GET | Server-Sent Events feed of synchronization outcomes |
//! | `/resync` | POST | Drop caches and recompute from scratch |
//! | `/state` | GET | Active rules, tracked remote VMs, cache sizes |

pub mod api;
