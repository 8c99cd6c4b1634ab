// SPDX-License-Identifier: Apache-2.0

//! Errors for the server crate.

use syncflow_config::SourceName;

/// Errors that can occur while consolidating and emitting events.
///
/// Configuration and schema errors are fatal at startup/reload; runtime
/// errors ([`Error::SourceFailure`], [`Error::TransportFailure`],
/// [`Error::CacheFailure`]) abort the current pass, which is retried on the
/// next tick with no partial state committed.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A source adapter failed; the current type's fetch pass is aborted.
    #[error("source `{source_name}` failed on `{querytype}` query `{query}`: {details}")]
    SourceFailure {
        /// The source that failed.
        source_name: SourceName,
        /// The query kind that was running.
        querytype: String,
        /// The rendered query text.
        query: String,
        /// Adapter diagnostics.
        details: String,
    },

    /// The event transport refused or failed a publish; the pass is aborted
    /// and the cache is not advanced past the last acknowledged event.
    #[error("transport failure: {details}")]
    TransportFailure {
        /// Transport diagnostics.
        details: String,
    },

    /// The cache snapshot store failed.
    #[error("cache failure: {0}")]
    CacheFailure(#[from] syncflow_state::Error),

    /// A source is referenced by the datamodel but no adapter was provided
    /// for it.
    #[error("no adapter registered for source `{source_name}`")]
    UnknownSource {
        /// The missing source.
        source_name: SourceName,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] syncflow_config::Error),

    /// Schema construction failed (missing primary key, unknown display
    /// variables, ...).
    #[error(transparent)]
    Model(#[from] syncflow_model::Error),

    /// An expression failed to compile or render.
    #[error(transparent)]
    Expr(#[from] syncflow_expr::Error),
}
