// SPDX-License-Identifier: Apache-2.0

//! Compiled template representation and source classification.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How a source string was classified at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprKind {
    /// No template marker at all: the string is used verbatim. In attribute
    /// mappings a literal names a remote attribute to read from the row.
    Literal,
    /// Exactly one `{{ ... }}` expression spanning the whole source.
    Expression,
    /// Anything else that still parses: several expressions, or expressions
    /// surrounded by raw text. Renders to a string.
    Template,
}

/// A compiled attribute expression.
///
/// Holds the classified source together with the set of variables it
/// references. Rendering goes through [`crate::Engine`], which owns the
/// template environment and the filter registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    kind: ExprKind,
    source: String,
    variables: BTreeSet<String>,
}

impl Expression {
    pub(crate) const fn new(kind: ExprKind, source: String, variables: BTreeSet<String>) -> Self {
        Self {
            kind,
            source,
            variables,
        }
    }

    /// The classification of this expression.
    #[must_use]
    pub const fn kind(&self) -> ExprKind {
        self.kind
    }

    /// The original source string.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variables referenced by the template.
    ///
    /// For a literal this is the literal itself: a literal in a mapping is a
    /// remote attribute name, and remote attribute sets are derived from it.
    #[must_use]
    pub const fn variables(&self) -> &BTreeSet<String> {
        &self.variables
    }

    /// Returns the source when this is a pure literal.
    #[must_use]
    pub fn as_literal(&self) -> Option<&str> {
        match self.kind {
            ExprKind::Literal => Some(&self.source),
            _ => None,
        }
    }

    /// For single expressions, the content between the `{{ }}` markers.
    pub(crate) fn inner(&self) -> &str {
        let trimmed = self.source.trim();
        match self.kind {
            ExprKind::Expression => trimmed
                .strip_prefix("{{")
                .and_then(|s| s.strip_suffix("}}"))
                .map_or(trimmed, str::trim),
            _ => &self.source,
        }
    }
}

/// Options governing how strictly a source is classified.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOpts {
    /// Reject sources mixing raw text with templates, or containing several
    /// templates. Attribute mappings use this: a mixed value makes it
    /// impossible to derive the remote attribute name.
    pub one_template: bool,
    /// Reject templates referencing more than one variable.
    pub one_var: bool,
}

pub(crate) enum Classified<'a> {
    Empty,
    Literal,
    Statement,
    Single { inner: &'a str },
    Mixed,
}

/// Classifies a raw source string without fully parsing it.
///
/// Comments (`{# ... #}`) are stripped first; a source that is empty once
/// stripped is reported as [`Classified::Empty`].
pub(crate) fn classify(source: &str) -> Classified<'_> {
    let stripped = strip_comments(source);
    if stripped.is_empty() {
        return Classified::Empty;
    }
    if stripped.contains("{%") {
        return Classified::Statement;
    }

    let mut exprs = 0usize;
    let mut outside_text = false;
    let mut first_span = None;
    let mut rest = source;
    let mut offset = 0usize;
    while let Some(start) = rest.find("{{") {
        if !rest[..start].trim().is_empty() {
            outside_text = true;
        }
        let Some(end) = rest[start..].find("}}") else {
            // An unterminated marker; let the template parser report it.
            outside_text = true;
            break;
        };
        if exprs == 0 {
            first_span = Some((offset + start, offset + start + end + 2));
        }
        exprs += 1;
        offset += start + end + 2;
        rest = &rest[start + end + 2..];
    }
    if !rest.trim().is_empty() && exprs > 0 {
        outside_text = true;
    }

    match (exprs, outside_text) {
        (0, _) => Classified::Literal,
        (1, false) => {
            let (lo, hi) = first_span.unwrap_or((0, source.len()));
            Classified::Single {
                inner: source[lo + 2..hi - 2].trim(),
            }
        }
        _ => Classified::Mixed,
    }
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{#") {
        out.push_str(&rest[..start]);
        match rest[start..].find("#}") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

pub(crate) fn reject_statement(source: &str, context: &str, opts: CompileOpts) -> Error {
    // With one-template mappings a statement necessarily means several
    // template bodies; report it the way mapping validation expects.
    if opts.one_template && source.contains("{{") {
        Error::MixedTemplate {
            context: context.to_string(),
            template: source.to_string(),
        }
    } else {
        Error::NotAnExpression {
            context: context.to_string(),
            template: source.to_string(),
        }
    }
}
