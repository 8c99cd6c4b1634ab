// SPDX-License-Identifier: Apache-2.0

//! Errors for the expression engine.

/// Errors that can occur while compiling or rendering attribute expressions.
///
/// Every variant carries the `context` string supplied at compile time
/// (e.g. `datamodel.Users.sources.directory.attrsmapping`) so that operator
/// facing messages point at the offending configuration key.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An empty value (or a comment-only template) was used as a mapping.
    #[error("{context}: empty value was found")]
    BadMapping {
        /// The configuration path the faulty value comes from.
        context: String,
    },

    /// Literal text and template expressions are mixed in a single value, or
    /// several templates were found where only one is allowed.
    #[error(
        "{context}: a mix of raw text and templates was found in '''{template}''', \
         the source attribute name cannot be determined"
    )]
    MixedTemplate {
        /// The configuration path the faulty value comes from.
        context: String,
        /// The offending template source.
        template: String,
    },

    /// A template statement (`{{% ... %}}`) was found where only expressions
    /// (`{{{{ ... }}}}`) are allowed.
    #[error("{context}: only expressions '{{{{ ... }}}}' are allowed, found '''{template}'''")]
    NotAnExpression {
        /// The configuration path the faulty value comes from.
        context: String,
        /// The offending template source.
        template: String,
    },

    /// More variables than permitted were referenced by a template.
    #[error(
        "{context}: {count} variables found in template '''{template}''', \
         only one is allowed to ensure data consistency"
    )]
    TooManyVars {
        /// The configuration path the faulty value comes from.
        context: String,
        /// The offending template source.
        template: String,
        /// Number of distinct variables the template references.
        count: usize,
    },

    /// The template failed to parse.
    #[error("{context}: invalid template '''{template}''': {details}")]
    Syntax {
        /// The configuration path the faulty value comes from.
        context: String,
        /// The offending template source.
        template: String,
        /// Parser diagnostics.
        details: String,
    },

    /// A variable required by the template was absent from the render context.
    #[error("{context}: undefined variable while rendering '''{template}''': {details}")]
    UndefinedVar {
        /// The configuration path the template comes from.
        context: String,
        /// The template source.
        template: String,
        /// Engine diagnostics naming the variable.
        details: String,
    },

    /// Any other rendering failure (bad operand types, failing filter, ...).
    #[error("{context}: failed to render '''{template}''': {details}")]
    Render {
        /// The configuration path the template comes from.
        context: String,
        /// The template source.
        template: String,
        /// Engine diagnostics.
        details: String,
    },
}

impl Error {
    /// Returns `true` when this error reports a variable missing from the
    /// render context.
    ///
    /// Callers evaluating attribute mappings against fetched rows use this to
    /// distinguish "attribute absent from the row" (a normal outcome, the
    /// resulting attribute is simply not set) from genuine failures.
    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        matches!(self, Error::UndefinedVar { .. })
    }
}
