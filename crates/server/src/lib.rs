// SPDX-License-Identifier: Apache-2.0

//! Server-side datamodel consolidator.
//!
//! Pipeline: per-source [`fragment`]s fetch rows through a
//! [`adapter::SourceAdapter`] and evaluate attribute mappings; the
//! [`datamodel::Datamodel`] enforces merge constraints, merges fragments
//! and enforces cross-type integrity constraints; the
//! [`producer::EventProducer`] diffs the merged view against the persisted
//! cache and emits ordered change events over an
//! [`transport::EventTransport`]; the [`server::Server`] drives it all on a
//! tick loop with a hard per-pass deadline.

pub mod adapter;
pub mod datamodel;
pub mod error;
pub mod fragment;
pub mod producer;
pub mod server;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::{BoxError, Row, SourceAdapter};
pub use datamodel::Datamodel;
pub use error::Error;
pub use producer::{EventProducer, PassSummary, TypeChanges};
pub use server::Server;
pub use transport::{EventStream, EventTransport};
