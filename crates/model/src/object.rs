// SPDX-License-Identifier: Apache-2.0

//! Typed records keyed by primary key.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_config::{AttrName, PkeySpec};
use syncflow_expr::{Engine, EvalContext, Expression};

use crate::diff::ObjectDiff;
use crate::error::Error;
use crate::pkey::Pkey;

/// A typed record: a primary key plus the consolidated attributes it was
/// projected from.
///
/// Invariant: the key always equals the projection of `attrs` on the
/// primary-key specification the object was built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    /// The effective primary key.
    pub pkey: Pkey,
    attrs: IndexMap<AttrName, Value>,
}

impl DataObject {
    /// Builds an object from an already-known key and attributes, e.g. from
    /// an event payload.
    #[must_use]
    pub const fn new(pkey: Pkey, attrs: IndexMap<AttrName, Value>) -> Self {
        Self { pkey, attrs }
    }

    /// Builds an object from an attribute map, projecting the key.
    ///
    /// Returns `None` when the key cannot be projected (component absent or
    /// null).
    pub fn from_attrs(
        attrs: IndexMap<AttrName, Value>,
        spec: &PkeySpec,
    ) -> Result<Option<Self>, Error> {
        Ok(Pkey::project(&attrs, spec)?.map(|pkey| Self { pkey, attrs }))
    }

    /// Evaluates an attribute mapping against a fetched row.
    ///
    /// `extra` carries the reserved context names (`ITEM_CACHED_VALUES`) made
    /// available alongside the row attributes. Attributes whose expression
    /// references a name absent from the context are simply not set; a
    /// literal mapping reads the remote attribute of the same name, absent
    /// attributes are skipped the same way.
    pub fn from_remote(
        pkey: Pkey,
        row: &serde_json::Map<String, Value>,
        mapping: &IndexMap<AttrName, Expression>,
        engine: &Engine,
        extra: &EvalContext,
    ) -> Result<Self, Error> {
        let mut context: EvalContext = row.clone();
        for (k, v) in extra {
            let _ = context.insert(k.clone(), v.clone());
        }

        let mut attrs = IndexMap::with_capacity(mapping.len());
        for (hermes_attr, expr) in mapping {
            if let Some(remote) = expr.as_literal() {
                if let Some(value) = row.get(remote) {
                    if !value.is_null() {
                        let _ = attrs.insert(hermes_attr.clone(), value.clone());
                    }
                }
                continue;
            }
            match engine.eval(expr, &context) {
                Ok(Value::Null) => {}
                Ok(value) => {
                    let _ = attrs.insert(hermes_attr.clone(), value);
                }
                Err(e) if e.is_undefined() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self { pkey, attrs })
    }

    /// Read access to one attribute.
    #[must_use]
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    /// Whether the attribute is set on this object.
    #[must_use]
    pub fn contains(&self, attr: &str) -> bool {
        self.attrs.contains_key(attr)
    }

    /// Sets an attribute.
    pub fn set(&mut self, attr: AttrName, value: Value) {
        let _ = self.attrs.insert(attr, value);
    }

    /// Removes an attribute.
    pub fn unset(&mut self, attr: &str) {
        let _ = self.attrs.shift_remove(attr);
    }

    /// The attribute map.
    #[must_use]
    pub const fn attrs(&self) -> &IndexMap<AttrName, Value> {
        &self.attrs
    }

    /// The object as a native map, suitable as an expression context.
    #[must_use]
    pub fn to_native(&self) -> serde_json::Map<String, Value> {
        self.attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The object as a native map with secret attributes redacted, for logs
    /// and dumps.
    #[must_use]
    pub fn to_redacted_native(
        &self,
        secrets: &std::collections::BTreeSet<AttrName>,
    ) -> serde_json::Map<String, Value> {
        self.attrs
            .iter()
            .map(|(k, v)| {
                if secrets.contains(k) {
                    (k.clone(), Value::String("<redacted>".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    /// Applies an attribute-level diff to this object.
    pub fn apply_diff(&mut self, diff: &ObjectDiff) {
        for (attr, value) in &diff.added {
            let _ = self.attrs.insert(attr.clone(), value.clone());
        }
        for (attr, value) in &diff.modified {
            let _ = self.attrs.insert(attr.clone(), value.clone());
        }
        for attr in &diff.removed {
            let _ = self.attrs.shift_remove(attr);
        }
    }

    /// Re-projects the key under a new specification, e.g. after a
    /// primary-key migration. Returns `false` (leaving the object untouched)
    /// when the new components are not all present.
    pub fn rekey(&mut self, spec: &PkeySpec) -> Result<bool, Error> {
        match Pkey::project(&self.attrs, spec)? {
            Some(pkey) => {
                self.pkey = pkey;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Projects the primary key of a fetched row through a mapping.
///
/// Key components mapped by a literal are read directly from the row; ones
/// mapped by an expression are evaluated against the row alone (the item
/// cache is not available yet, the key is what selects it).
pub fn project_remote_pkey(
    row: &serde_json::Map<String, Value>,
    mapping: &IndexMap<AttrName, Expression>,
    spec: &PkeySpec,
    engine: &Engine,
) -> Result<Option<Pkey>, Error> {
    let mut parts = Vec::with_capacity(spec.attrs().len());
    for attr in spec.attrs() {
        let Some(expr) = mapping.get(attr) else {
            return Ok(None);
        };
        let value = if let Some(remote) = expr.as_literal() {
            match row.get(remote) {
                None | Some(Value::Null) => return Ok(None),
                Some(v) => v.clone(),
            }
        } else {
            match engine.eval(expr, row) {
                Ok(Value::Null) => return Ok(None),
                Ok(v) => v,
                Err(e) if e.is_undefined() => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };
        parts.push(crate::pkey::KeyPart::from_value(attr, &value)?);
    }
    Ok(Some(Pkey::from_parts(parts, spec.is_tuple())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncflow_expr::CompileOpts;

    fn mapping(engine: &Engine, pairs: &[(&str, &str)]) -> IndexMap<AttrName, Expression> {
        pairs
            .iter()
            .map(|(attr, src)| {
                (
                    (*attr).to_string(),
                    engine
                        .compile(
                            src,
                            "test",
                            CompileOpts {
                                one_template: true,
                                one_var: false,
                            },
                        )
                        .unwrap(),
                )
            })
            .collect()
    }

    fn row(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn from_remote_evaluates_mapping() {
        let engine = Engine::new();
        let mapping = mapping(
            &engine,
            &[
                ("user_id", "ID"),
                ("login", "LOGIN"),
                ("login_uppercase", "{{ LOGIN | upper }}"),
                ("missing", "NOT_THERE"),
            ],
        );
        let row = row(&[("ID", json!(1)), ("LOGIN", json!("jdoe"))]);
        let spec = PkeySpec::Single("user_id".to_string());
        let pkey = project_remote_pkey(&row, &mapping, &spec, &engine)
            .unwrap()
            .unwrap();
        let obj =
            DataObject::from_remote(pkey, &row, &mapping, &engine, &EvalContext::new()).unwrap();

        assert_eq!(obj.get("user_id"), Some(&json!(1)));
        assert_eq!(obj.get("login"), Some(&json!("jdoe")));
        assert_eq!(obj.get("login_uppercase"), Some(&json!("JDOE")));
        // The remote attribute is absent from the row: so is the consolidated one.
        assert!(!obj.contains("missing"));
    }

    #[test]
    fn item_cache_is_visible_to_expressions() {
        let engine = Engine::new();
        let mapping = mapping(
            &engine,
            &[
                ("user_id", "ID"),
                ("last_seen", "{{ ITEM_CACHED_VALUES.last_seen or TS }}"),
            ],
        );
        let row = row(&[("ID", json!(1)), ("TS", json!(100))]);
        let mut extra = EvalContext::new();
        let _ = extra.insert(
            "ITEM_CACHED_VALUES".to_string(),
            json!({"last_seen": 42}),
        );
        let obj = DataObject::from_remote(
            Pkey::Single(crate::pkey::KeyPart::Int(1)),
            &row,
            &mapping,
            &engine,
            &extra,
        )
        .unwrap();
        assert_eq!(obj.get("last_seen"), Some(&json!(42)));
    }

    #[test]
    fn secrets_are_redacted_in_dumps() {
        let engine = Engine::new();
        let mapping = mapping(&engine, &[("id", "ID"), ("password", "PW")]);
        let row = row(&[("ID", json!(1)), ("PW", json!("hunter2"))]);
        let spec = PkeySpec::Single("id".to_string());
        let pkey = project_remote_pkey(&row, &mapping, &spec, &engine)
            .unwrap()
            .unwrap();
        let obj =
            DataObject::from_remote(pkey, &row, &mapping, &engine, &EvalContext::new()).unwrap();

        let secrets = ["password".to_string()].into_iter().collect();
        let dump = obj.to_redacted_native(&secrets);
        assert_eq!(dump["password"], json!("<redacted>"));
        assert_eq!(dump["id"], json!(1));
        // The real value is untouched.
        assert_eq!(obj.get("password"), Some(&json!("hunter2")));
    }

    #[test]
    fn rekey_requires_all_components() {
        let engine = Engine::new();
        let mapping = mapping(&engine, &[("id", "ID"), ("simpleid", "SID")]);
        let row = row(&[("ID", json!("u1")), ("SID", json!(9))]);
        let spec = PkeySpec::Single("id".to_string());
        let pkey = project_remote_pkey(&row, &mapping, &spec, &engine)
            .unwrap()
            .unwrap();
        let mut obj =
            DataObject::from_remote(pkey, &row, &mapping, &engine, &EvalContext::new()).unwrap();

        let tuple = PkeySpec::Tuple(vec!["id".to_string(), "simpleid".to_string()]);
        assert!(obj.rekey(&tuple).unwrap());
        assert_eq!(obj.pkey.to_string(), "(u1, 9)");

        let missing = PkeySpec::Single("unknown".to_string());
        assert!(!obj.rekey(&missing).unwrap());
        assert_eq!(obj.pkey.to_string(), "(u1, 9)");
    }
}
