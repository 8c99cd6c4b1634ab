// SPDX-License-Identifier: Apache-2.0

//! Attribute-level and list-level diffing.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_config::AttrName;

use crate::object::DataObject;
use crate::pkey::Pkey;

/// Synthetic attributes carried for key-migration bookkeeping; they never
/// participate in change detection.
pub const PKEY_SYNTHETIC_PREFIX: &str = "_pkey_";

/// Attribute-level changes between two versions of one object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectDiff {
    /// Attributes set in the new version and absent from the old one.
    #[serde(default)]
    pub added: IndexMap<AttrName, Value>,
    /// Attributes present on both sides with different values (new value).
    #[serde(default)]
    pub modified: IndexMap<AttrName, Value>,
    /// Attributes absent from the new version.
    #[serde(default)]
    pub removed: Vec<AttrName>,
}

impl ObjectDiff {
    /// Computes the changes turning `old` into `new`.
    #[must_use]
    pub fn between(old: &DataObject, new: &DataObject) -> Self {
        let mut diff = ObjectDiff::default();
        for (attr, value) in new.attrs() {
            if attr.starts_with(PKEY_SYNTHETIC_PREFIX) {
                continue;
            }
            match old.get(attr) {
                None => {
                    let _ = diff.added.insert(attr.clone(), value.clone());
                }
                Some(previous) if previous != value => {
                    let _ = diff.modified.insert(attr.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        for attr in old.attrs().keys() {
            if attr.starts_with(PKEY_SYNTHETIC_PREFIX) {
                continue;
            }
            if !new.contains(attr) {
                diff.removed.push(attr.clone());
            }
        }
        diff
    }

    /// Whether the diff carries no change at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Restricts the diff to attributes outside `excluded`.
    #[must_use]
    pub fn without_attrs(&self, excluded: &std::collections::BTreeSet<AttrName>) -> Self {
        Self {
            added: self
                .added
                .iter()
                .filter(|(k, _)| !excluded.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            modified: self
                .modified
                .iter()
                .filter(|(k, _)| !excluded.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            removed: self
                .removed
                .iter()
                .filter(|k| !excluded.contains(*k))
                .cloned()
                .collect(),
        }
    }

    /// Folds a newer diff into this one; on overlapping attributes the newer
    /// diff wins.
    pub fn merge_newer(&mut self, newer: &ObjectDiff) {
        for (attr, value) in &newer.added {
            self.removed.retain(|a| a != attr);
            let _ = self.added.insert(attr.clone(), value.clone());
        }
        for (attr, value) in &newer.modified {
            self.removed.retain(|a| a != attr);
            // An attribute this diff added stays an addition, with the newer value.
            if self.added.contains_key(attr) {
                let _ = self.added.insert(attr.clone(), value.clone());
            } else {
                let _ = self.modified.insert(attr.clone(), value.clone());
            }
        }
        for attr in &newer.removed {
            let _ = self.added.shift_remove(attr);
            let _ = self.modified.shift_remove(attr);
            if !self.removed.contains(attr) {
                self.removed.push(attr.clone());
            }
        }
    }
}

/// Changes between two snapshots of one type's object list.
#[derive(Debug, Clone, Default)]
pub struct ListDiff {
    /// Objects present in the new snapshot only.
    pub added: Vec<DataObject>,
    /// Objects present on both sides whose attributes differ.
    pub modified: Vec<(Pkey, ObjectDiff)>,
    /// Objects present in the old snapshot only (old version).
    pub removed: Vec<DataObject>,
}

impl ListDiff {
    /// Whether the two snapshots were identical.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}
