// SPDX-License-Identifier: Apache-2.0

//! Server-side datamodel configuration.

use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, error_context};
use crate::{AttrName, ScheduleConfig, SourceName, StorageConfig, TypeName};

/// Top-level server configuration: the datamodel plus ambient settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Object types in declaration order. Declaration order is semantic:
    /// consolidation processes types in this order (leaves first) and events
    /// are emitted in this order.
    pub datamodel: IndexMap<TypeName, TypeConfig>,

    /// Snapshot store settings for the server cache.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Pass scheduling.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl ServerConfig {
    /// Creates a [`ServerConfig`] from a YAML string.
    pub fn from_yaml(yaml_str: &str) -> Result<Self, Error> {
        let cfg: ServerConfig =
            serde_yaml::from_str(yaml_str).map_err(|e| Error::DeserializationError {
                format: "YAML".to_string(),
                details: e.to_string(),
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Creates a [`ServerConfig`] from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, Error> {
        let cfg: ServerConfig =
            serde_json::from_str(json_str).map_err(|e| Error::DeserializationError {
                format: "JSON".to_string(),
                details: e.to_string(),
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a [`ServerConfig`] from a file, detecting the format from the
    /// file extension (`.json`, `.yaml`, `.yml`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = crate::read_config_file(path)?;
        match crate::extension_of(path)? {
            "json" => Self::from_json(&contents),
            "yaml" | "yml" => Self::from_yaml(&contents),
            other => Err(Error::UnsupportedExtension {
                extension: other.to_string(),
            }),
        }
    }

    /// Structural validation that does not require the expression engine.
    ///
    /// Mapping/constraint compilation errors and missing primary keys are
    /// reported later, when the datamodel is built.
    pub fn validate(&self) -> Result<(), Error> {
        for (objtype, typecfg) in &self.datamodel {
            if typecfg.sources.is_empty() {
                return Err(Error::NoSourceDeclared {
                    objtype: objtype.clone(),
                });
            }
            for (srcname, srccfg) in &typecfg.sources {
                srccfg.validate(objtype, srcname)?;
            }
        }
        Ok(())
    }
}

/// Configuration of one object type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeConfig {
    /// Primary key specification: one attribute name, or an ordered list of
    /// attribute names for tuple keys.
    pub primarykeyattr: PkeySpec,

    /// Display template for objects of this type. May only reference the
    /// type's own attributes.
    #[serde(rename = "toString", default)]
    pub to_string: Option<String>,

    /// What to do when two sources disagree on an attribute value.
    #[serde(default)]
    pub on_merge_conflict: OnMergeConflict,

    /// Boolean expressions filtering objects of this type after all types
    /// have been merged. May reference other types.
    #[serde(default)]
    pub integrity_constraints: Vec<String>,

    /// Per-source settings, in declaration order. The first source is the
    /// merge base; the others are merged into it in order.
    pub sources: IndexMap<SourceName, SourceConfig>,
}

/// Configuration of one (object type, source) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Mapping of consolidated attribute names to value specifications: a
    /// literal remote attribute name, or a single template expression.
    pub attrsmapping: IndexMap<AttrName, String>,

    /// Attributes redacted from dumps and logs.
    #[serde(default)]
    pub secrets_attrs: Vec<AttrName>,

    /// Attributes kept in cache but never emitted to consumers.
    #[serde(default)]
    pub cacheonly_attrs: Vec<AttrName>,

    /// Attributes computed client-side only, never sent.
    #[serde(default)]
    pub local_attrs: Vec<AttrName>,

    /// Boolean expressions filtering this fragment's objects before merge.
    #[serde(default)]
    pub merge_constraints: Vec<String>,

    /// Which primary keys survive when this fragment is merged into the
    /// consolidated list.
    #[serde(default)]
    pub pkey_merge_constraint: PkeyMergeConstraint,

    /// The query retrieving this fragment's rows.
    pub fetch: QuerySpec,

    /// Optional per-object acknowledgement query, run after an object's
    /// changes were acknowledged by the message bus.
    #[serde(default)]
    pub commit_one: Option<QuerySpec>,

    /// Optional per-type acknowledgement query, run after a whole pass was
    /// acknowledged.
    #[serde(default)]
    pub commit_all: Option<QuerySpec>,
}

impl SourceConfig {
    fn validate(&self, objtype: &str, source: &str) -> Result<(), Error> {
        if self.fetch.querytype != QueryType::Fetch {
            return Err(Error::InvalidQueryType {
                context: error_context(objtype, source, "fetch"),
                querytype: self.fetch.querytype.to_string(),
                expected: QueryType::Fetch.to_string(),
            });
        }
        for (slot, spec) in [("commit_one", &self.commit_one), ("commit_all", &self.commit_all)] {
            if let Some(spec) = spec {
                if spec.querytype == QueryType::Fetch {
                    return Err(Error::InvalidQueryType {
                        context: error_context(objtype, source, slot),
                        querytype: spec.querytype.to_string(),
                        expected: "add, delete or modify".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A query the engine runs against a source adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySpec {
    /// The kind of query; only `fetch` returns rows.
    #[serde(rename = "type")]
    pub querytype: QueryType,

    /// The query text; may be a template rendered against the query context.
    #[serde(default)]
    pub query: String,

    /// Named query variables; every string in this tree may be a template.
    #[serde(default = "default_query_vars")]
    pub vars: Value,
}

fn default_query_vars() -> Value {
    Value::Object(serde_json::Map::new())
}

/// The kind of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Retrieves rows from the source.
    Fetch,
    /// Inserts into the source.
    Add,
    /// Deletes from the source.
    Delete,
    /// Updates the source.
    Modify,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryType::Fetch => "fetch",
            QueryType::Add => "add",
            QueryType::Delete => "delete",
            QueryType::Modify => "modify",
        };
        f.write_str(s)
    }
}

/// Primary key specification: a single attribute or an ordered tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkeySpec {
    /// A scalar key read from one attribute.
    Single(AttrName),
    /// A tuple key read from several attributes, in order.
    Tuple(Vec<AttrName>),
}

impl PkeySpec {
    /// The attribute names forming the key, in order.
    #[must_use]
    pub fn attrs(&self) -> Vec<&str> {
        match self {
            PkeySpec::Single(attr) => vec![attr.as_str()],
            PkeySpec::Tuple(attrs) => attrs.iter().map(String::as_str).collect(),
        }
    }

    /// Whether the key is a tuple.
    #[must_use]
    pub const fn is_tuple(&self) -> bool {
        matches!(self, PkeySpec::Tuple(_))
    }
}

impl fmt::Display for PkeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkeySpec::Single(attr) => f.write_str(attr),
            PkeySpec::Tuple(attrs) => write!(f, "({})", attrs.join(", ")),
        }
    }
}

/// Which primary keys survive a fragment merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PkeyMergeConstraint {
    /// Keep keys present in at least one side (set union); nothing is
    /// filtered.
    #[default]
    MustExistInOne,
    /// Keep only keys present on both sides (set intersection).
    MustExistInBoth,
    /// Keep only keys present on exactly one side; keys present on both are
    /// filtered out.
    MustNotExistInBoth,
}

/// What to do when two fragments disagree on an attribute value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMergeConflict {
    /// Take the value from the later fragment.
    #[default]
    UseLast,
    /// Keep the conflicting object out of the merge and restore it from the
    /// previous cache, preserving continuity until sources reconverge.
    UseCachedEntry,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
datamodel:
  Users:
    primarykeyattr: user_id
    toString: "User[{{ login }}]"
    sources:
      directory:
        attrsmapping:
          user_id: ID
          login: LOGIN
          displayname: "{{ FIRSTNAME ~ ' ' ~ LASTNAME }}"
        fetch:
          type: fetch
          query: "SELECT * FROM users"
  GroupsMembers:
    primarykeyattr: [group_id, user_id]
    integrity_constraints:
      - "{{ _SELF.user_id in Users_pkeys }}"
    sources:
      directory:
        attrsmapping:
          group_id: GROUP
          user_id: MEMBER
        pkey_merge_constraint: mustExistInBoth
        fetch:
          type: fetch
          query: "SELECT * FROM members"
"#;

    #[test]
    fn parses_minimal_config() {
        let cfg = ServerConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.datamodel.len(), 2);

        let users = &cfg.datamodel["Users"];
        assert_eq!(users.primarykeyattr, PkeySpec::Single("user_id".into()));
        assert_eq!(users.on_merge_conflict, OnMergeConflict::UseLast);

        let gm = &cfg.datamodel["GroupsMembers"];
        assert!(gm.primarykeyattr.is_tuple());
        assert_eq!(gm.primarykeyattr.attrs(), vec!["group_id", "user_id"]);
        assert_eq!(
            gm.sources["directory"].pkey_merge_constraint,
            PkeyMergeConstraint::MustExistInBoth
        );
    }

    #[test]
    fn declaration_order_is_preserved() {
        let cfg = ServerConfig::from_yaml(MINIMAL).unwrap();
        let order: Vec<_> = cfg.datamodel.keys().cloned().collect();
        assert_eq!(order, vec!["Users", "GroupsMembers"]);
    }

    #[test]
    fn fetch_slot_must_be_a_fetch_query() {
        let bad = MINIMAL.replace("type: fetch", "type: add");
        let err = ServerConfig::from_yaml(&bad).unwrap_err();
        assert!(matches!(err, Error::InvalidQueryType { .. }), "{err:?}");
    }

    #[test]
    fn types_without_sources_are_rejected() {
        let cfg = r"
datamodel:
  Users:
    primarykeyattr: user_id
    sources: {}
";
        let err = ServerConfig::from_yaml(cfg).unwrap_err();
        assert!(matches!(err, Error::NoSourceDeclared { .. }), "{err:?}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let bad = MINIMAL.replace("integrity_constraints:", "integrity_checks:");
        let err = ServerConfig::from_yaml(&bad).unwrap_err();
        assert!(matches!(err, Error::DeserializationError { .. }), "{err:?}");
    }
}
