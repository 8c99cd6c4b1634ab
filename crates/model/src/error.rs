// SPDX-License-Identifier: Apache-2.0

//! Errors for the data model crate.

use syncflow_config::TypeName;

/// Errors that can occur while building schemas or constructing objects.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A primary-key component is absent from one source's attribute
    /// mapping. The key must be fetched from every source so that fragments
    /// can be matched up.
    #[error("The primary key `{pkey}` of `{objtype}` must be mapped by every source")]
    MissingPrimaryKey {
        /// The type whose key is incomplete.
        objtype: TypeName,
        /// Display form of the primary-key specification.
        pkey: String,
    },

    /// A display template references attributes outside the type's
    /// consolidated attribute set.
    #[error("Unknown attributes referenced in `{context}`: {vars:?}")]
    UnknownVars {
        /// The configuration path of the template.
        context: String,
        /// The unknown names.
        vars: Vec<String>,
    },

    /// A value that cannot be used as a primary-key component (float, list,
    /// map, null).
    #[error("Attribute `{attr}` holds a value unusable as a primary key: {details}")]
    InvalidKeyValue {
        /// The attribute the value was read from.
        attr: String,
        /// What was wrong with it.
        details: String,
    },

    /// An expression failed to compile or render.
    #[error(transparent)]
    Expr(#[from] syncflow_expr::Error),
}
