// SPDX-License-Identifier: Apache-2.0

//! Errors for the client crate.

/// Errors that can occur while applying events.
///
/// Handler failures are not part of this enum: the applier catches them and
/// enqueues the failed event for retry, they never abort the apply loop.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The local snapshot store failed.
    #[error("state failure: {0}")]
    State(#[from] syncflow_state::Error),

    /// Invalid client configuration.
    #[error(transparent)]
    Config(#[from] syncflow_config::Error),

    /// A local attribute mapping failed to compile or render.
    #[error(transparent)]
    Expr(#[from] syncflow_expr::Error),

    /// Data model construction failed.
    #[error(transparent)]
    Model(#[from] syncflow_model::Error),

    /// The event stream from the transport failed.
    #[error("event stream failure: {details}")]
    Stream {
        /// Transport diagnostics.
        details: String,
    },
}

/// A failure raised by an event handler.
///
/// Raising inside a handler is the one place where errors-as-control-flow
/// is accepted: the applier catches the failure and queues the event.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable description, stored in the queue entry.
    pub message: String,
}

impl HandlerError {
    /// A failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}
