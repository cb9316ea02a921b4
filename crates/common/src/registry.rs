//! # Live Object Registry
//!
//! Identity-keyed index of every object currently reachable from a
//! non-excluded static field. Built once by the collector, then read-only.

use crate::{FieldRef, ObjectId};
use std::collections::HashMap;

/// Which static field currently points at a given object.
///
/// Only the last field seen for an object is kept; one culprit is enough
/// for a report.
pub type StaticFieldInfo = FieldRef;

/// In-memory map from object identity to the static field referencing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveObjectRegistry {
    entries: HashMap<ObjectId, StaticFieldInfo>,
}

impl LiveObjectRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `info` as the owner of `obj`, replacing any earlier owner.
    ///
    /// Returns the previous owner, if there was one.
    pub fn insert(&mut self, obj: ObjectId, info: StaticFieldInfo) -> Option<StaticFieldInfo> {
        self.entries.insert(obj, info)
    }

    pub fn get(&self, obj: ObjectId) -> Option<&StaticFieldInfo> {
        self.entries.get(&obj)
    }

    pub fn contains(&self, obj: ObjectId) -> bool {
        self.entries.contains_key(&obj)
    }

    /// Returns the number of recorded objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClassId;

    #[test]
    fn test_empty_registry() {
        let registry = LiveObjectRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.get(ObjectId(1)).is_none());
    }

    #[test]
    fn test_last_owner_wins() {
        let mut registry = LiveObjectRegistry::new();
        assert!(registry
            .insert(ObjectId(7), FieldRef::new(ClassId(0), "first"))
            .is_none());
        let previous = registry.insert(ObjectId(7), FieldRef::new(ClassId(1), "second"));

        assert_eq!(previous, Some(FieldRef::new(ClassId(0), "first")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(ObjectId(7)).map(|f| f.name.as_str()), Some("second"));
    }

    #[test]
    fn test_contains_miss() {
        let mut registry = LiveObjectRegistry::new();
        registry.insert(ObjectId(100), FieldRef::new(ClassId(0), "cache"));
        assert!(registry.contains(ObjectId(100)));
        assert!(!registry.contains(ObjectId(999)));
    }
}
