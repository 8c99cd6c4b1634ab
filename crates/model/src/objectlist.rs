// SPDX-License-Identifier: Apache-2.0

//! Ordered, pkey-indexed collections of data objects.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_config::PkeyMergeConstraint;

use crate::diff::{ListDiff, ObjectDiff};
use crate::object::DataObject;
use crate::pkey::Pkey;

/// A mapping pkey → object preserving insertion order of first occurrence.
///
/// Two sideband sets record the keys suppressed during consolidation:
/// `merge_filtered` for merge constraints and merge conflicts,
/// `integrity_filtered` for integrity constraints. Both are transient pass
/// state and are not persisted with the list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<DataObject>", into = "Vec<DataObject>")]
pub struct DataObjectList {
    objects: IndexMap<Pkey, DataObject>,
    /// Keys suppressed by merge constraints or merge conflicts.
    pub merge_filtered: BTreeSet<Pkey>,
    /// Keys suppressed by integrity constraints.
    pub integrity_filtered: BTreeSet<Pkey>,
}

impl From<Vec<DataObject>> for DataObjectList {
    fn from(objects: Vec<DataObject>) -> Self {
        let mut list = Self::default();
        for obj in objects {
            list.insert(obj);
        }
        list
    }
}

impl From<DataObjectList> for Vec<DataObject> {
    fn from(list: DataObjectList) -> Self {
        list.objects.into_values().collect()
    }
}

impl DataObjectList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the list holds no object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// O(1) lookup by key.
    #[must_use]
    pub fn get(&self, pkey: &Pkey) -> Option<&DataObject> {
        self.objects.get(pkey)
    }

    /// Mutable lookup by key.
    pub fn get_mut(&mut self, pkey: &Pkey) -> Option<&mut DataObject> {
        self.objects.get_mut(pkey)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains(&self, pkey: &Pkey) -> bool {
        self.objects.contains_key(pkey)
    }

    /// Inserts or replaces an object, keyed by its own pkey. Insertion order
    /// of first occurrence is preserved.
    pub fn insert(&mut self, obj: DataObject) {
        let _ = self.objects.insert(obj.pkey.clone(), obj);
    }

    /// Removes an object by key.
    pub fn remove(&mut self, pkey: &Pkey) -> Option<DataObject> {
        self.objects.shift_remove(pkey)
    }

    /// Iterates over objects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DataObject> {
        self.objects.values()
    }

    /// Iterates mutably over objects in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DataObject> {
        self.objects.values_mut()
    }

    /// The set of keys.
    #[must_use]
    pub fn pkeys(&self) -> BTreeSet<Pkey> {
        self.objects.keys().cloned().collect()
    }

    /// The list as native maps, suitable as an expression context.
    #[must_use]
    pub fn to_native(&self) -> Vec<Value> {
        self.objects
            .values()
            .map(|o| Value::Object(o.to_native()))
            .collect()
    }

    /// Merges another fragment of the same type into this list.
    ///
    /// `constraint` decides which keys survive; `dont_merge_on_conflict`
    /// keeps the earlier fragment's value on conflicting attributes and
    /// marks the key, instead of letting the later fragment win. Returns the
    /// keys filtered by this merge (they are also accumulated into
    /// [`DataObjectList::merge_filtered`]).
    pub fn merge_with(
        &mut self,
        other: DataObjectList,
        constraint: PkeyMergeConstraint,
        dont_merge_on_conflict: bool,
    ) -> BTreeSet<Pkey> {
        let mut filtered = BTreeSet::new();
        let self_keys = self.pkeys();
        let other_keys = other.pkeys();

        match constraint {
            PkeyMergeConstraint::MustExistInBoth => {
                for pkey in self_keys.difference(&other_keys) {
                    let _ = self.objects.shift_remove(pkey);
                    let _ = filtered.insert(pkey.clone());
                }
                for pkey in other_keys.difference(&self_keys) {
                    let _ = filtered.insert(pkey.clone());
                }
                for (pkey, obj) in other.objects {
                    if let Some(base) = self.objects.get_mut(&pkey) {
                        merge_attrs(base, obj, dont_merge_on_conflict, &mut filtered);
                    }
                }
            }
            PkeyMergeConstraint::MustNotExistInBoth => {
                for pkey in self_keys.intersection(&other_keys) {
                    let _ = self.objects.shift_remove(pkey);
                    let _ = filtered.insert(pkey.clone());
                }
                for (pkey, obj) in other.objects {
                    if !filtered.contains(&pkey) {
                        let _ = self.objects.insert(pkey, obj);
                    }
                }
            }
            PkeyMergeConstraint::MustExistInOne => {
                for (pkey, obj) in other.objects {
                    match self.objects.get_mut(&pkey) {
                        Some(base) => {
                            merge_attrs(base, obj, dont_merge_on_conflict, &mut filtered);
                        }
                        None => {
                            let _ = self.objects.insert(pkey, obj);
                        }
                    }
                }
            }
        }

        self.merge_filtered.extend(filtered.iter().cloned());
        filtered
    }

    /// Restores merge-filtered keys from the previous cache when present,
    /// preserving continuity for consumers while the sources are
    /// inconsistent.
    pub fn replace_inconsistencies_by_cached_values(&mut self, cache: &DataObjectList) {
        for pkey in self.merge_filtered.clone() {
            if let Some(cached) = cache.get(&pkey) {
                self.insert(cached.clone());
            }
        }
    }

    /// Computes the changes between this snapshot and an older one.
    ///
    /// Added objects come first in this list's order, then modified objects
    /// in this list's order, then removed objects in the old list's order.
    #[must_use]
    pub fn diff_from(&self, old: &DataObjectList) -> ListDiff {
        let mut diff = ListDiff::default();
        for obj in self.objects.values() {
            match old.get(&obj.pkey) {
                None => diff.added.push(obj.clone()),
                Some(previous) => {
                    let changes = ObjectDiff::between(previous, obj);
                    if !changes.is_empty() {
                        diff.modified.push((obj.pkey.clone(), changes));
                    }
                }
            }
        }
        for obj in old.objects.values() {
            if !self.contains(&obj.pkey) {
                diff.removed.push(obj.clone());
            }
        }
        diff
    }
}

fn merge_attrs(
    base: &mut DataObject,
    other: DataObject,
    dont_merge_on_conflict: bool,
    filtered: &mut BTreeSet<Pkey>,
) {
    for (attr, value) in other.attrs() {
        match base.get(attr) {
            Some(existing) if existing != value => {
                if dont_merge_on_conflict {
                    // Keep the earlier fragment's value; the key is marked so
                    // the cached entry can take over after the merge.
                    let _ = filtered.insert(base.pkey.clone());
                } else {
                    base.set(attr.clone(), value.clone());
                }
            }
            Some(_) => {}
            None => base.set(attr.clone(), value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;
    use syncflow_config::PkeySpec;

    fn obj(pairs: &[(&str, Value)]) -> DataObject {
        let attrs: IndexMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        DataObject::from_attrs(attrs, &PkeySpec::Single("id".to_string()))
            .unwrap()
            .unwrap()
    }

    fn list(objs: Vec<DataObject>) -> DataObjectList {
        DataObjectList::from(objs)
    }

    #[test]
    fn diff_of_identical_lists_is_empty() {
        let a = list(vec![
            obj(&[("id", json!(1)), ("login", json!("a"))]),
            obj(&[("id", json!(2)), ("login", json!("b"))]),
        ]);
        assert!(a.diff_from(&a).is_empty());
    }

    #[test]
    fn diff_buckets_added_modified_removed() {
        let old = list(vec![
            obj(&[("id", json!(1)), ("login", json!("a"))]),
            obj(&[("id", json!(2)), ("login", json!("b")), ("mail", json!("b@x"))]),
        ]);
        let new = list(vec![
            obj(&[("id", json!(2)), ("login", json!("b2"))]),
            obj(&[("id", json!(3)), ("login", json!("c"))]),
        ]);
        let diff = new.diff_from(&old);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].pkey.to_string(), "3");

        assert_eq!(diff.modified.len(), 1);
        let (pkey, changes) = &diff.modified[0];
        assert_eq!(pkey.to_string(), "2");
        assert_eq!(changes.modified.get("login"), Some(&json!("b2")));
        assert_eq!(changes.removed, vec!["mail".to_string()]);

        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].pkey.to_string(), "1");
    }

    #[test]
    fn synthetic_pkey_attrs_are_ignored_by_diff() {
        let old = list(vec![obj(&[("id", json!(1)), ("_pkey_id", json!("x"))])]);
        let new = list(vec![obj(&[("id", json!(1)), ("_pkey_id", json!("y"))])]);
        assert!(new.diff_from(&old).is_empty());
    }

    #[test]
    fn merge_must_exist_in_both_intersects() {
        let mut a = list(vec![
            obj(&[("id", json!(1)), ("a", json!("x"))]),
            obj(&[("id", json!(2)), ("a", json!("y"))]),
        ]);
        let b = list(vec![
            obj(&[("id", json!(2)), ("b", json!("z"))]),
            obj(&[("id", json!(3)), ("b", json!("w"))]),
        ]);
        let filtered = a.merge_with(b, PkeyMergeConstraint::MustExistInBoth, false);

        assert_eq!(a.len(), 1);
        let merged = a.iter().next().unwrap();
        assert_eq!(merged.pkey.to_string(), "2");
        assert_eq!(merged.get("a"), Some(&json!("y")));
        assert_eq!(merged.get("b"), Some(&json!("z")));
        assert_eq!(filtered.len(), 2);
        assert_eq!(a.merge_filtered, filtered);
    }

    #[test]
    fn merge_must_not_exist_in_both_keeps_disjoint() {
        let mut a = list(vec![
            obj(&[("id", json!(1))]),
            obj(&[("id", json!(2))]),
        ]);
        let b = list(vec![
            obj(&[("id", json!(2))]),
            obj(&[("id", json!(3))]),
        ]);
        let filtered = a.merge_with(b, PkeyMergeConstraint::MustNotExistInBoth, false);

        let keys: Vec<String> = a.iter().map(|o| o.pkey.to_string()).collect();
        assert_eq!(keys, vec!["1", "3"]);
        assert_eq!(filtered.iter().map(ToString::to_string).collect::<Vec<_>>(), vec!["2"]);
    }

    #[test]
    fn merge_conflict_with_use_cached_entry_marks_key() {
        let mut a = list(vec![obj(&[("id", json!(1)), ("mail", json!("old@x"))])]);
        let b = list(vec![obj(&[("id", json!(1)), ("mail", json!("new@x"))])]);
        let filtered = a.merge_with(b, PkeyMergeConstraint::MustExistInOne, true);

        // The earlier fragment's value survives the conflict.
        assert_eq!(a.get(&filtered.iter().next().unwrap().clone()).unwrap().get("mail"), Some(&json!("old@x")));

        // The cached entry then takes over.
        let cache = list(vec![obj(&[("id", json!(1)), ("mail", json!("cached@x"))])]);
        a.replace_inconsistencies_by_cached_values(&cache);
        assert_eq!(a.iter().next().unwrap().get("mail"), Some(&json!("cached@x")));
    }

    #[test]
    fn merge_conflict_defaults_to_later_fragment() {
        let mut a = list(vec![obj(&[("id", json!(1)), ("mail", json!("old@x"))])]);
        let b = list(vec![obj(&[("id", json!(1)), ("mail", json!("new@x"))])]);
        let filtered = a.merge_with(b, PkeyMergeConstraint::MustExistInOne, false);
        assert!(filtered.is_empty());
        assert_eq!(a.iter().next().unwrap().get("mail"), Some(&json!("new@x")));
    }

    #[test]
    fn serde_round_trip_preserves_order() {
        let a = list(vec![
            obj(&[("id", json!("z")), ("v", json!(1))]),
            obj(&[("id", json!("a")), ("v", json!(2))]),
        ]);
        let json = serde_json::to_string(&a).unwrap();
        let back: DataObjectList = serde_json::from_str(&json).unwrap();
        let keys: Vec<String> = back.iter().map(|o| o.pkey.to_string()).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }
}
