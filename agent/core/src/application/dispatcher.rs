// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Event Dispatcher
//!
//! Maps transport messages (`{name, value}`) onto synchronizer entry points.
//! A message whose name is unknown or whose payload is null, empty or does
//! not decode is ignored: it is logged at warn level and reported as
//! [`DispatchOutcome::Ignored`], never as an error.
//!
//! | Name | Alias | Handler |
//! |------|-------|---------|
//! | `vm.add` | `fw.add_vm` | `on_vm_add` |
//! | `vm.update` | `fw.update_vm` | `on_vm_update` |
//! | `vm.delete` | `fw.del_vm` | `on_vm_delete` |
//! | `rule.add` | `fw.add_rule` | `on_rule_add` |
//! | `rule.update` | `fw.update_rule` | `on_rule_update` |
//! | `rule.delete` | `fw.del_rule` | `on_rule_delete` |
//!
//! Rule deletes decode into a [`RuleRef`]: only `uuid`, `owner_uuid` and
//! `global` are read, so a delete carrying no rule text, or text that no
//! longer parses, still removes the rule.

use crate::application::synchronizer::{FirewallSyncService, SyncError, SyncOutcome};
use crate::domain::rule::{FirewallRule, RuleRef};
use crate::domain::vm::Vm;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    VmAdd,
    VmUpdate,
    VmDelete,
    RuleAdd,
    RuleUpdate,
    RuleDelete,
}

impl EventKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vm.add" | "fw.add_vm" => Some(EventKind::VmAdd),
            "vm.update" | "fw.update_vm" => Some(EventKind::VmUpdate),
            "vm.delete" | "fw.del_vm" => Some(EventKind::VmDelete),
            "rule.add" | "fw.add_rule" => Some(EventKind::RuleAdd),
            "rule.update" | "fw.update_rule" => Some(EventKind::RuleUpdate),
            "rule.delete" | "fw.del_rule" => Some(EventKind::RuleDelete),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::VmAdd => "vm.add",
            EventKind::VmUpdate => "vm.update",
            EventKind::VmDelete => "vm.delete",
            EventKind::RuleAdd => "rule.add",
            EventKind::RuleUpdate => "rule.update",
            EventKind::RuleDelete => "rule.delete",
        }
    }

    fn is_vm_event(&self) -> bool {
        matches!(self, EventKind::VmAdd | EventKind::VmUpdate | EventKind::VmDelete)
    }
}

/// Transport message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl EventMessage {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum IgnoreReason {
    UnknownEvent(String),
    EmptyPayload,
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied(SyncOutcome),
    Ignored(IgnoreReason),
}

pub struct EventDispatcher {
    service: Arc<dyn FirewallSyncService>,
}

impl EventDispatcher {
    pub fn new(service: Arc<dyn FirewallSyncService>) -> Self {
        Self { service }
    }

    pub async fn dispatch(&self, message: EventMessage) -> Result<DispatchOutcome, SyncError> {
        let Some(kind) = EventKind::from_name(&message.name) else {
            return Ok(self.ignore(&message.name, IgnoreReason::UnknownEvent(message.name.clone())));
        };

        if is_empty_payload(&message.value) {
            return Ok(self.ignore(kind.name(), IgnoreReason::EmptyPayload));
        }

        let outcome = if kind.is_vm_event() {
            let vm: Vm = match serde_json::from_value(message.value) {
                Ok(vm) => vm,
                Err(e) => return Ok(self.ignore(kind.name(), IgnoreReason::Malformed(e.to_string()))),
            };
            match kind {
                EventKind::VmAdd => self.service.on_vm_add(vm).await?,
                EventKind::VmUpdate => self.service.on_vm_update(vm).await?,
                _ => self.service.on_vm_delete(vm).await?,
            }
        } else if kind == EventKind::RuleDelete {
            let rule: RuleRef = match serde_json::from_value(message.value) {
                Ok(rule) => rule,
                Err(e) => return Ok(self.ignore(kind.name(), IgnoreReason::Malformed(e.to_string()))),
            };
            self.service.on_rule_delete(rule).await?
        } else {
            let rule: FirewallRule = match serde_json::from_value(message.value) {
                Ok(rule) => rule,
                Err(e) => return Ok(self.ignore(kind.name(), IgnoreReason::Malformed(e.to_string()))),
            };
            match kind {
                EventKind::RuleAdd => self.service.on_rule_add(rule).await?,
                _ => self.service.on_rule_update(rule).await?,
            }
        };

        Ok(DispatchOutcome::Applied(outcome))
    }

    fn ignore(&self, event: &str, reason: IgnoreReason) -> DispatchOutcome {
        warn!(event, reason = ?reason, "Ignoring event");
        metrics::counter!("fwsync_events_total", "event" => event.to_string(), "outcome" => "ignored")
            .increment(1);
        DispatchOutcome::Ignored(reason)
    }
}

fn is_empty_payload(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::synchronizer::SyncStateView;
    use crate::domain::local_state::LocalState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingService {
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingService {
        fn record(&self, call: &'static str) -> Result<SyncOutcome, SyncError> {
            self.calls.lock().push(call);
            Ok(SyncOutcome::default())
        }
    }

    #[async_trait]
    impl FirewallSyncService for RecordingService {
        async fn on_vm_add(&self, _vm: Vm) -> Result<SyncOutcome, SyncError> {
            self.record("on_vm_add")
        }
        async fn on_vm_update(&self, _vm: Vm) -> Result<SyncOutcome, SyncError> {
            self.record("on_vm_update")
        }
        async fn on_vm_delete(&self, _vm: Vm) -> Result<SyncOutcome, SyncError> {
            self.record("on_vm_delete")
        }
        async fn on_rule_add(&self, _rule: FirewallRule) -> Result<SyncOutcome, SyncError> {
            self.record("on_rule_add")
        }
        async fn on_rule_update(&self, _rule: FirewallRule) -> Result<SyncOutcome, SyncError> {
            self.record("on_rule_update")
        }
        async fn on_rule_delete(&self, _rule: RuleRef) -> Result<SyncOutcome, SyncError> {
            self.record("on_rule_delete")
        }
        async fn resync(&self) -> Result<SyncOutcome, SyncError> {
            self.record("resync")
        }
        async fn clear_caches(&self) {}
        fn state(&self) -> SyncStateView {
            SyncStateView {
                state: LocalState::new().snapshot(),
                tag_cache_entries: 0,
                remote_vm_cache_entries: 0,
            }
        }
    }

    fn rule_json() -> serde_json::Value {
        json!({
            "uuid": Uuid::new_v4(),
            "owner_uuid": Uuid::new_v4(),
            "rule": "FROM tag role = db TO tag role = www ALLOW tcp PORT 80"
        })
    }

    #[tokio::test]
    async fn test_names_and_aliases_route_to_handlers() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = EventDispatcher::new(service.clone());
        let vm = json!({ "uuid": Uuid::new_v4(), "owner_uuid": Uuid::new_v4() });

        for (name, value) in [
            ("vm.add", vm.clone()),
            ("fw.update_vm", vm.clone()),
            ("fw.del_vm", vm),
            ("fw.add_rule", rule_json()),
            ("rule.update", rule_json()),
            ("fw.del_rule", rule_json()),
        ] {
            let outcome = dispatcher.dispatch(EventMessage::new(name, value)).await.unwrap();
            assert!(matches!(outcome, DispatchOutcome::Applied(_)));
        }

        assert_eq!(
            *service.calls.lock(),
            vec![
                "on_vm_add",
                "on_vm_update",
                "on_vm_delete",
                "on_rule_add",
                "on_rule_update",
                "on_rule_delete"
            ]
        );
    }

    #[tokio::test]
    async fn test_rule_delete_needs_only_uuid_and_owner() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = EventDispatcher::new(service.clone());

        let bare = json!({ "uuid": Uuid::new_v4(), "owner_uuid": Uuid::new_v4() });
        let outcome = dispatcher.dispatch(EventMessage::new("fw.del_rule", bare)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Applied(_)));

        let stale_text = json!({ "uuid": Uuid::new_v4(), "global": true, "rule": "FROM nowhere" });
        let outcome = dispatcher.dispatch(EventMessage::new("rule.delete", stale_text)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Applied(_)));

        assert_eq!(*service.calls.lock(), vec!["on_rule_delete", "on_rule_delete"]);
    }

    #[tokio::test]
    async fn test_null_rule_is_ignored() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = EventDispatcher::new(service.clone());

        let outcome = dispatcher
            .dispatch(EventMessage::new("rule.add", serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored(IgnoreReason::EmptyPayload));
        assert!(service.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_and_unknown_are_ignored() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = EventDispatcher::new(service.clone());

        let malformed = dispatcher
            .dispatch(EventMessage::new("rule.add", json!({ "uuid": "not-a-uuid" })))
            .await
            .unwrap();
        assert!(matches!(malformed, DispatchOutcome::Ignored(IgnoreReason::Malformed(_))));

        let unparseable_rule = dispatcher
            .dispatch(EventMessage::new(
                "rule.add",
                json!({ "uuid": Uuid::new_v4(), "global": true, "rule": "FROM nowhere" }),
            ))
            .await
            .unwrap();
        assert!(matches!(unparseable_rule, DispatchOutcome::Ignored(IgnoreReason::Malformed(_))));

        let unknown = dispatcher
            .dispatch(EventMessage::new("vm.migrate", json!({ "uuid": Uuid::new_v4() })))
            .await
            .unwrap();
        assert_eq!(
            unknown,
            DispatchOutcome::Ignored(IgnoreReason::UnknownEvent("vm.migrate".to_string()))
        );

        assert!(service.calls.lock().is_empty());
    }
}
