// SPDX-License-Identifier: Apache-2.0

//! Holding area for removed objects awaiting final deletion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use syncflow_config::{PkeySpec, TypeName};
use syncflow_model::{DataObject, Error as ModelError, Pkey};

/// One trashed object with its removal timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashedObject {
    /// The object's local attributes at removal time.
    pub obj: DataObject,
    /// When it was removed.
    pub trashed_at: DateTime<Utc>,
}

/// Per-type map of trashed objects, keyed by primary key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "IndexMap<TypeName, Vec<TrashedObject>>")]
#[serde(into = "IndexMap<TypeName, Vec<TrashedObject>>")]
pub struct Trashbin {
    entries: IndexMap<TypeName, IndexMap<Pkey, TrashedObject>>,
}

impl From<IndexMap<TypeName, Vec<TrashedObject>>> for Trashbin {
    fn from(snapshot: IndexMap<TypeName, Vec<TrashedObject>>) -> Self {
        let entries = snapshot
            .into_iter()
            .map(|(objtype, objs)| {
                (
                    objtype,
                    objs.into_iter()
                        .map(|t| (t.obj.pkey.clone(), t))
                        .collect(),
                )
            })
            .collect();
        Self { entries }
    }
}

impl From<Trashbin> for IndexMap<TypeName, Vec<TrashedObject>> {
    fn from(bin: Trashbin) -> Self {
        bin.entries
            .into_iter()
            .map(|(objtype, entries)| (objtype, entries.into_values().collect()))
            .collect()
    }
}

impl Trashbin {
    /// Whether the bin holds an object of this type and key.
    #[must_use]
    pub fn contains(&self, objtype: &str, pkey: &Pkey) -> bool {
        self.entries
            .get(objtype)
            .is_some_and(|m| m.contains_key(pkey))
    }

    /// Moves an object into the bin.
    pub fn insert(&mut self, objtype: &str, obj: DataObject, now: DateTime<Utc>) {
        let entries = self.entries.entry(objtype.to_string()).or_default();
        let _ = entries.insert(
            obj.pkey.clone(),
            TrashedObject {
                obj,
                trashed_at: now,
            },
        );
    }

    /// Takes an object out of the bin, e.g. for recycling.
    pub fn take(&mut self, objtype: &str, pkey: &Pkey) -> Option<TrashedObject> {
        self.entries
            .get_mut(objtype)
            .and_then(|m| m.shift_remove(pkey))
    }

    /// Removes and returns every entry older than `retention`.
    pub fn drain_expired(
        &mut self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Vec<(TypeName, TrashedObject)> {
        let mut expired = Vec::new();
        for (objtype, entries) in &mut self.entries {
            let cutoff: Vec<Pkey> = entries
                .iter()
                .filter(|(_, t)| {
                    now.signed_duration_since(t.trashed_at)
                        .to_std()
                        .is_ok_and(|age| age >= retention)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for pkey in cutoff {
                if let Some(t) = entries.shift_remove(&pkey) {
                    expired.push((objtype.clone(), t));
                }
            }
        }
        expired
    }

    /// Re-keys a type's entries under a new primary-key specification.
    ///
    /// Entries whose objects cannot provide the new key components are
    /// purged when `purge_incomplete` is set (otherwise they are kept under
    /// their old key and flagged for the operator by the caller). Returns
    /// `(rekeyed, purged)` counts.
    pub fn migrate_pkeys(
        &mut self,
        objtype: &str,
        spec: &PkeySpec,
        purge_incomplete: bool,
    ) -> Result<(usize, usize), ModelError> {
        let Some(entries) = self.entries.get_mut(objtype) else {
            return Ok((0, 0));
        };
        let mut rekeyed = IndexMap::with_capacity(entries.len());
        let mut changed = 0;
        let mut purged = 0;
        for (old_key, mut trashed) in entries.drain(..) {
            if trashed.obj.rekey(spec)? {
                if trashed.obj.pkey != old_key {
                    changed += 1;
                }
                let _ = rekeyed.insert(trashed.obj.pkey.clone(), trashed);
            } else if purge_incomplete {
                purged += 1;
            } else {
                let _ = rekeyed.insert(old_key, trashed);
            }
        }
        *entries = rekeyed;
        Ok((changed, purged))
    }

    /// Number of trashed objects across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(IndexMap::len).sum()
    }

    /// Whether the bin is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
