// SPDX-License-Identifier: Apache-2.0

//! Typed data model for the consolidation engine.
//!
//! Data model:
//! - a [`Dataschema`] describes every object type: attribute sets, primary
//!   key specification, display template;
//! - a [`DataObject`] is one typed record, keyed by its [`Pkey`];
//! - a [`DataObjectList`] is an insertion-ordered, key-indexed collection
//!   with fragment merging and snapshot diffing;
//! - an [`Event`] is one change on the bus, numbered and typed.
//!
//! There is no per-type generated code: a schema descriptor plus a generic
//! record type covers every object type declared in the configuration.

mod diff;
mod error;
mod event;
mod object;
mod objectlist;
mod pkey;
mod schema;

pub use diff::{ListDiff, ObjectDiff, PKEY_SYNTHETIC_PREFIX};
pub use error::Error;
pub use event::{Event, EventKind, EventPayload};
pub use object::{DataObject, project_remote_pkey};
pub use objectlist::DataObjectList;
pub use pkey::{KeyPart, Pkey};
pub use schema::{Dataschema, SchemaDiff, TypeSchema, TypeSchemaDiff};

/// Context names reserved for the engine; they are provided to expressions
/// by the consolidator and never count as remote attributes.
pub const RESERVED_CONTEXT_VARS: &[&str] = &[
    "_SELF",
    "REMOTE_ATTRIBUTES",
    "ITEM_CACHED_VALUES",
    "ITEM_FETCHED_VALUES",
    "CACHED_VALUES",
    "FETCHED_VALUES",
];

/// The reserved context names as an owned set, for variable filtering.
#[must_use]
pub fn reserved_context_vars() -> std::collections::BTreeSet<String> {
    RESERVED_CONTEXT_VARS
        .iter()
        .map(ToString::to_string)
        .collect()
}
