// SPDX-License-Identifier: Apache-2.0

//! Client-side event applier with error queue and autoremediation.
//!
//! The [`Applier`] consumes the server's ordered event stream, rewrites
//! each event through the client's local attribute mappings, and dispatches
//! it to the registered [`EventHandler`] for the type. Failed or partially
//! processed events land in the persistent [`ErrorQueue`], which rewrites
//! and collapses entries as newer events arrive so retries apply the
//! minimum correct sequence. Removed objects pass through the [`Trashbin`]
//! before final deletion, and operator [`notifications`] report queue churn
//! and datamodel drift.

mod applier;
mod error;
mod handler;
pub mod notifications;
mod queue;
mod trashbin;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use applier::{Applier, BoxError};
pub use error::{Error, HandlerError};
pub use handler::{EventHandler, StepContext};
pub use notifications::{Notification, NotificationKind, NotificationSink, Notifier};
pub use queue::{ErrorQueue, QueueEntry, Remediation};
pub use trashbin::{Trashbin, TrashedObject};
