// SPDX-License-Identifier: Apache-2.0

//! The source adapter contract.
//!
//! A source adapter wraps one backing store (a SQL database, a directory
//! server, a REST endpoint, ...). The consolidator treats it as opaque: it
//! renders a query plus named variables and hands both over. Adapters are
//! acquired per query run with a guaranteed `close` on every exit path.

use async_trait::async_trait;
use serde_json::Value;

/// Boxed error type adapters and transports surface their failures with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One fetched record: remote attribute name → value.
pub type Row = serde_json::Map<String, Value>;

/// Contract between the consolidator and a backing store.
///
/// `fetch` is the only operation returning rows; `add`, `delete` and
/// `modify` are fire-and-forget writes used by commit queries. Adapter
/// errors surface as [`crate::Error::SourceFailure`] and abort the current
/// type's fetch pass.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Acquires the underlying connection or session.
    async fn open(&self) -> Result<(), BoxError>;

    /// Releases the underlying connection or session. Called on every exit
    /// path of a query run; failures are logged, never masking a primary
    /// error.
    async fn close(&self) -> Result<(), BoxError>;

    /// Runs a read query and returns the matching rows.
    async fn fetch(&self, query: &str, vars: &Value) -> Result<Vec<Row>, BoxError>;

    /// Runs an insert query.
    async fn add(&self, query: &str, vars: &Value) -> Result<(), BoxError>;

    /// Runs a delete query.
    async fn delete(&self, query: &str, vars: &Value) -> Result<(), BoxError>;

    /// Runs an update query.
    async fn modify(&self, query: &str, vars: &Value) -> Result<(), BoxError>;
}
