// SPDX-License-Identifier: Apache-2.0

//! Primary key value objects.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_config::{AttrName, PkeySpec};

use crate::error::Error;

/// One component of a primary key.
///
/// Keys are scalars: strings, integers or booleans. Floats and structured
/// values are rejected, they make unstable keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    /// A boolean component.
    Bool(bool),
    /// An integer component.
    Int(i64),
    /// A string component.
    Str(String),
}

impl KeyPart {
    /// Builds a key component from a native value.
    pub fn from_value(attr: &str, value: &Value) -> Result<Self, Error> {
        match value {
            Value::Bool(b) => Ok(KeyPart::Bool(*b)),
            Value::Number(n) => n.as_i64().map(KeyPart::Int).ok_or_else(|| {
                Error::InvalidKeyValue {
                    attr: attr.to_string(),
                    details: format!("non-integral number {n}"),
                }
            }),
            Value::String(s) => Ok(KeyPart::Str(s.clone())),
            other => Err(Error::InvalidKeyValue {
                attr: attr.to_string(),
                details: format!("unsupported value {other}"),
            }),
        }
    }

    /// The native value this component was built from.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            KeyPart::Bool(b) => Value::Bool(*b),
            KeyPart::Int(i) => Value::from(*i),
            KeyPart::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Str(s) => f.write_str(s),
        }
    }
}

/// The effective primary key of an object: a scalar, or a tuple when the
/// type's key specification lists several attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pkey {
    /// A scalar key.
    Single(KeyPart),
    /// A tuple key, ordered like the specification.
    Tuple(Vec<KeyPart>),
}

impl Pkey {
    /// Projects a primary key out of an attribute map according to `spec`.
    ///
    /// Returns `None` when any component is absent or null: such a record
    /// cannot be keyed.
    pub fn project(attrs: &IndexMap<AttrName, Value>, spec: &PkeySpec) -> Result<Option<Self>, Error> {
        let mut parts = Vec::with_capacity(spec.attrs().len());
        for attr in spec.attrs() {
            match attrs.get(attr) {
                None | Some(Value::Null) => return Ok(None),
                Some(value) => parts.push(KeyPart::from_value(attr, value)?),
            }
        }
        Ok(Some(Self::from_parts(parts, spec.is_tuple())))
    }

    /// Assembles a key from already-extracted components.
    #[must_use]
    pub fn from_parts(mut parts: Vec<KeyPart>, tuple: bool) -> Self {
        if tuple || parts.len() != 1 {
            Pkey::Tuple(parts)
        } else {
            Pkey::Single(parts.remove(0))
        }
    }

    /// The native value form of this key (scalar or array).
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Pkey::Single(part) => part.to_value(),
            Pkey::Tuple(parts) => Value::Array(parts.iter().map(KeyPart::to_value).collect()),
        }
    }
}

impl fmt::Display for Pkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pkey::Single(part) => write!(f, "{part}"),
            Pkey::Tuple(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
        }
    }
}
