// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use miette::Diagnostic;
use std::fmt::Display;

use crate::TypeName;

/// Errors that can occur while loading or validating a configuration.
///
/// Note: All errors are contextualized with the object type and source name,
/// if applicable. Configuration errors are fatal at startup or reload: a
/// running datamodel keeps serving while the faulty replacement is rejected.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// An error that occurred while reading a configuration file.
    #[error("File read error: {details}")]
    #[diagnostic(code(syncflow::config::file_read_error))]
    FileReadError {
        /// A description of the error that occurred.
        details: String,
    },

    /// An error that occurred while deserializing a configuration document.
    #[error("{format} deserialization error: {details}")]
    #[diagnostic(code(syncflow::config::deserialization_error))]
    DeserializationError {
        /// The format of the configuration document (e.g. "YAML").
        format: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A configuration file uses an extension no loader is registered for.
    #[error("Unsupported config file extension `{extension}`")]
    #[diagnostic(code(syncflow::config::unsupported_extension))]
    UnsupportedExtension {
        /// The offending extension.
        extension: String,
    },

    /// A datamodel type declares no source at all.
    #[error("No source declared for type `{objtype}`")]
    #[diagnostic(code(syncflow::config::no_source))]
    NoSourceDeclared {
        /// The type missing sources.
        objtype: TypeName,
    },

    /// A query slot was configured with a query type it cannot carry, e.g. a
    /// `fetch` slot declared as `add`.
    #[error("Invalid query type `{querytype}` for `{context}`, expected `{expected}`")]
    #[diagnostic(code(syncflow::config::invalid_query_type))]
    InvalidQueryType {
        /// The configuration path of the query slot
        /// (`datamodel.<Type>.sources.<Src>.<slot>`).
        context: String,
        /// The declared query type.
        querytype: String,
        /// The query type the slot requires.
        expected: String,
    },
}

/// Builds the configuration path prefixing expression error messages.
pub fn error_context(objtype: &str, source: impl Display, key: &str) -> String {
    format!("datamodel.{objtype}.sources.{source}.{key}")
}
