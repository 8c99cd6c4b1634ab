// SPDX-License-Identifier: Apache-2.0

//! The effective schema of a datamodel: per-type attribute sets, key
//! specification and display template, plus schema diffing for drift
//! detection.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use syncflow_config::{AttrName, PkeySpec, TypeName};
use syncflow_expr::{Engine, Expression};

use crate::object::DataObject;

/// The consolidated schema of one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    /// Attributes visible to consumers (union of mapping keys over sources).
    pub hermes_attributes: BTreeSet<AttrName>,
    /// Remote attribute names read from source rows (union of free variables
    /// of mapping expressions, minus the reserved context names).
    pub remote_attributes: BTreeSet<AttrName>,
    /// Attributes redacted from dumps and logs.
    pub secrets_attributes: BTreeSet<AttrName>,
    /// Attributes kept in cache but never emitted.
    pub cacheonly_attributes: BTreeSet<AttrName>,
    /// Attributes computed client-side only.
    pub local_attributes: BTreeSet<AttrName>,
    /// Primary-key specification.
    pub primary_key: PkeySpec,
    /// Optional display template over the type's own attributes.
    pub to_string: Option<Expression>,
}

impl TypeSchema {
    /// Attributes stripped from emitted payloads: cache-only attributes stay
    /// in the cache, local attributes never travel.
    #[must_use]
    pub fn unemitted_attributes(&self) -> BTreeSet<AttrName> {
        self.cacheonly_attributes
            .union(&self.local_attributes)
            .cloned()
            .collect()
    }
}

/// The consolidated schema of a whole datamodel, in type declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataschema {
    /// Per-type schemas, keyed by type name.
    pub types: IndexMap<TypeName, TypeSchema>,
}

impl Dataschema {
    /// Renders an object for display, falling back to `Type<pkey>` when the
    /// type has no display template or the template fails.
    #[must_use]
    pub fn display_object(&self, engine: &Engine, objtype: &str, obj: &DataObject) -> String {
        if let Some(schema) = self.types.get(objtype) {
            if let Some(tpl) = &schema.to_string {
                if let Ok(rendered) = engine.render_string(tpl, &obj.to_native()) {
                    return rendered;
                }
            }
        }
        format!("{objtype}<{}>", obj.pkey)
    }

    /// Compares this schema against a previously seen one.
    #[must_use]
    pub fn diff_from(&self, old: &Dataschema) -> SchemaDiff {
        let mut diff = SchemaDiff::default();
        for (objtype, schema) in &self.types {
            match old.types.get(objtype) {
                None => diff.added_types.push(objtype.clone()),
                Some(previous) => {
                    let added: BTreeSet<AttrName> = schema
                        .hermes_attributes
                        .difference(&previous.hermes_attributes)
                        .cloned()
                        .collect();
                    let removed: BTreeSet<AttrName> = previous
                        .hermes_attributes
                        .difference(&schema.hermes_attributes)
                        .cloned()
                        .collect();
                    let pkey_changed = schema.primary_key != previous.primary_key;
                    if !added.is_empty() || !removed.is_empty() || pkey_changed {
                        let _ = diff.changed_types.insert(
                            objtype.clone(),
                            TypeSchemaDiff {
                                added_attrs: added,
                                removed_attrs: removed,
                                pkey_changed,
                            },
                        );
                    }
                }
            }
        }
        for objtype in old.types.keys() {
            if !self.types.contains_key(objtype) {
                diff.removed_types.push(objtype.clone());
            }
        }
        diff
    }
}

/// Differences between two schemas, the raw material of datamodel warnings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    /// Types present only in the newer schema.
    pub added_types: Vec<TypeName>,
    /// Types present only in the older schema.
    pub removed_types: Vec<TypeName>,
    /// Types present on both sides with attribute or key changes.
    pub changed_types: IndexMap<TypeName, TypeSchemaDiff>,
}

/// Per-type schema changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeSchemaDiff {
    /// Attributes only the newer schema has.
    pub added_attrs: BTreeSet<AttrName>,
    /// Attributes only the older schema has.
    pub removed_attrs: BTreeSet<AttrName>,
    /// Whether the primary-key specification changed.
    pub pkey_changed: bool,
}

impl SchemaDiff {
    /// Whether the schemas were identical.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_types.is_empty()
            && self.removed_types.is_empty()
            && self.changed_types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncflow_expr::CompileOpts;

    fn users_schema(attrs: &[&str], pkey: &str) -> TypeSchema {
        TypeSchema {
            hermes_attributes: attrs.iter().map(ToString::to_string).collect(),
            remote_attributes: BTreeSet::new(),
            secrets_attributes: BTreeSet::new(),
            cacheonly_attributes: BTreeSet::new(),
            local_attributes: BTreeSet::new(),
            primary_key: PkeySpec::Single(pkey.to_string()),
            to_string: None,
        }
    }

    #[test]
    fn schema_diff_reports_drift() {
        let old = Dataschema {
            types: [
                ("Users".to_string(), users_schema(&["id", "login"], "id")),
                ("Groups".to_string(), users_schema(&["id"], "id")),
            ]
            .into_iter()
            .collect(),
        };
        let new = Dataschema {
            types: [
                (
                    "Users".to_string(),
                    users_schema(&["id", "first_name"], "id"),
                ),
                ("Mailboxes".to_string(), users_schema(&["id"], "id")),
            ]
            .into_iter()
            .collect(),
        };

        let diff = new.diff_from(&old);
        assert_eq!(diff.added_types, vec!["Mailboxes"]);
        assert_eq!(diff.removed_types, vec!["Groups"]);
        let users = &diff.changed_types["Users"];
        assert!(users.added_attrs.contains("first_name"));
        assert!(users.removed_attrs.contains("login"));
        assert!(!users.pkey_changed);

        assert!(new.diff_from(&new).is_empty());
    }

    #[test]
    fn display_falls_back_to_type_and_key() {
        let engine = Engine::new();
        let tpl = engine
            .compile("User[{{ login }}]", "test", CompileOpts::default())
            .unwrap();
        // A mixed template renders; note this one is "literal-free" enough to
        // classify as a template because of the expression marker.
        let mut schema = users_schema(&["id", "login"], "id");
        schema.to_string = Some(tpl);
        let ds = Dataschema {
            types: [("Users".to_string(), schema)].into_iter().collect(),
        };

        let attrs: IndexMap<String, serde_json::Value> = [
            ("id".to_string(), serde_json::json!(1)),
            ("login".to_string(), serde_json::json!("jdoe")),
        ]
        .into_iter()
        .collect();
        let obj = DataObject::from_attrs(attrs, &PkeySpec::Single("id".to_string()))
            .unwrap()
            .unwrap();

        assert_eq!(ds.display_object(&engine, "Users", &obj), "User[jdoe]");
        assert_eq!(ds.display_object(&engine, "Unknown", &obj), "Unknown<1>");
    }
}
