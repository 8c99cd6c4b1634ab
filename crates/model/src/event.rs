// SPDX-License-Identifier: Apache-2.0

//! Typed change events and their wire frame.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_config::{AttrName, TypeName};

use crate::diff::ObjectDiff;
use crate::object::DataObject;
use crate::pkey::Pkey;

/// The kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// An object appeared.
    Added,
    /// An object's attributes changed.
    Modified,
    /// An object disappeared for good.
    Removed,
    /// Client side: a removed object was moved to the trashbin instead of
    /// being deleted.
    Trashed,
    /// Client side: an added object was restored from the trashbin.
    Recycled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Added => "added",
            EventKind::Modified => "modified",
            EventKind::Removed => "removed",
            EventKind::Trashed => "trashed",
            EventKind::Recycled => "recycled",
        };
        f.write_str(s)
    }
}

/// Event payload: the full record for added/removed events, an
/// attribute-level diff for modified events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Attribute-level changes (modified events).
    Diff(ObjectDiff),
    /// The full attribute map (added, removed, trashed, recycled events).
    Full(IndexMap<AttrName, Value>),
}

impl EventPayload {
    /// The full attribute map, when this payload carries one.
    #[must_use]
    pub const fn as_full(&self) -> Option<&IndexMap<AttrName, Value>> {
        match self {
            EventPayload::Full(attrs) => Some(attrs),
            EventPayload::Diff(_) => None,
        }
    }

    /// The attribute diff, when this payload carries one.
    #[must_use]
    pub const fn as_diff(&self) -> Option<&ObjectDiff> {
        match self {
            EventPayload::Diff(diff) => Some(diff),
            EventPayload::Full(_) => None,
        }
    }

    /// The payload as a plain attribute map.
    ///
    /// For a diff payload this folds `added` and `modified` together; an
    /// empty map deserializes as an empty diff, so full-record consumers use
    /// this accessor rather than matching on the payload shape.
    #[must_use]
    pub fn to_attr_map(&self) -> IndexMap<AttrName, Value> {
        match self {
            EventPayload::Full(attrs) => attrs.clone(),
            EventPayload::Diff(diff) => diff
                .added
                .iter()
                .chain(diff.modified.iter())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// One change event on the bus.
///
/// Event numbers are monotonic across the server's lifetime (the counter is
/// persisted with the cache and resumed on restart).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic event number.
    #[serde(rename = "ev")]
    pub ev_number: u64,
    /// The kind of change.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The object type the event belongs to.
    pub objtype: TypeName,
    /// The primary key of the affected object.
    pub pkey: Pkey,
    /// Full attributes or attribute diff, depending on `kind`.
    pub attrs: EventPayload,
}

impl Event {
    /// An `added` event carrying the object's full attributes.
    #[must_use]
    pub fn added(ev_number: u64, objtype: TypeName, obj: &DataObject) -> Self {
        Self {
            ev_number,
            kind: EventKind::Added,
            objtype,
            pkey: obj.pkey.clone(),
            attrs: EventPayload::Full(obj.attrs().clone()),
        }
    }

    /// A `modified` event carrying an attribute-level diff.
    #[must_use]
    pub fn modified(ev_number: u64, objtype: TypeName, pkey: Pkey, diff: ObjectDiff) -> Self {
        Self {
            ev_number,
            kind: EventKind::Modified,
            objtype,
            pkey,
            attrs: EventPayload::Diff(diff),
        }
    }

    /// A `removed` event carrying the removed object's last attributes.
    #[must_use]
    pub fn removed(ev_number: u64, objtype: TypeName, obj: &DataObject) -> Self {
        Self {
            ev_number,
            kind: EventKind::Removed,
            objtype,
            pkey: obj.pkey.clone(),
            attrs: EventPayload::Full(obj.attrs().clone()),
        }
    }

}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {}<{}>",
            self.ev_number, self.kind, self.objtype, self.pkey
        )
    }
}
