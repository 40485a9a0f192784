// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tag Cache
//!
//! Records which `(scope, tag name, tag value)` triples have already been
//! resolved against the VM directory, so a later event referencing the same
//! tag does not trigger another request.
//!
//! The cache is a conservative record of values that were asked for, never
//! an enumeration of all VMs carrying a tag. A tag target without a value
//! (`tag internal`) is recorded as the wildcard, which covers every value of
//! that tag. An entry in the [`Scope::Global`] scope covers every owner.
//!
//! Entries are only ever added after the run that requested them applied its
//! changes. The only removal is [`TagCache::clear`], used by full resync.

use crate::domain::rule::Scope;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TagValues {
    wildcard: bool,
    values: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TagCache {
    entries: HashMap<Scope, HashMap<String, TagValues>>,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `tag` (with `value`, or the wildcard when `None`) was resolved
    /// for `scope`.
    pub fn has(&self, scope: Scope, tag: &str, value: Option<&str>) -> bool {
        self.has_exact(scope, tag, value)
            || (scope != Scope::Global && self.has_exact(Scope::Global, tag, value))
    }

    fn has_exact(&self, scope: Scope, tag: &str, value: Option<&str>) -> bool {
        let Some(entry) = self.entries.get(&scope).and_then(|tags| tags.get(tag)) else {
            return false;
        };
        if entry.wildcard {
            return true;
        }
        match value {
            Some(v) => entry.values.contains(v),
            None => false,
        }
    }

    /// Record a resolved value; `None` records the wildcard.
    pub fn add(&mut self, scope: Scope, tag: &str, value: Option<&str>) {
        let entry = self
            .entries
            .entry(scope)
            .or_default()
            .entry(tag.to_string())
            .or_default();
        match value {
            Some(v) => {
                entry.values.insert(v.to_string());
            }
            None => entry.wildcard = true,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of `(scope, tag)` entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_add_then_has() {
        let owner = Scope::Owner(Uuid::new_v4());
        let mut cache = TagCache::new();
        assert!(!cache.has(owner, "role", Some("db")));

        cache.add(owner, "role", Some("db"));
        assert!(cache.has(owner, "role", Some("db")));
        assert!(!cache.has(owner, "role", Some("qa")));
        assert!(!cache.has(owner, "role", None));
        assert!(!cache.has(Scope::Owner(Uuid::new_v4()), "role", Some("db")));
    }

    #[test]
    fn test_wildcard_covers_every_value() {
        let owner = Scope::Owner(Uuid::new_v4());
        let mut cache = TagCache::new();
        cache.add(owner, "internal", None);

        assert!(cache.has(owner, "internal", None));
        assert!(cache.has(owner, "internal", Some("true")));
        assert!(!cache.has(owner, "role", None));
    }

    #[test]
    fn test_global_entry_covers_owners() {
        let mut cache = TagCache::new();
        cache.add(Scope::Global, "couch", Some("1"));

        assert!(cache.has(Scope::Owner(Uuid::new_v4()), "couch", Some("1")));
        assert!(!cache.has(Scope::Owner(Uuid::new_v4()), "couch", Some("2")));
    }

    #[test]
    fn test_clear_empties_cache() {
        let mut cache = TagCache::new();
        cache.add(Scope::Global, "couch", Some("1"));
        cache.add(Scope::Global, "couch", Some("2"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.has(Scope::Global, "couch", Some("1")));
    }
}
