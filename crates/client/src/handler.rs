// SPDX-License-Identifier: Apache-2.0

//! The event handler contract and step tracking for partial processing.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use syncflow_config::AttrName;
use syncflow_model::{ObjectDiff, Pkey};

use crate::error::HandlerError;

/// Tracks which steps of a multi-step handler already completed, so that a
/// retried event resumes after the last successful side effect instead of
/// redoing it.
///
/// ```
/// # use syncflow_client::StepContext;
/// # fn provision() -> Result<(), String> { Ok(()) }
/// # fn subscribe() -> Result<(), String> { Ok(()) }
/// # let mut ctx = StepContext::new(0);
/// if !ctx.already_done(1) {
///     provision()?;
///     ctx.mark_done(1);
/// }
/// if !ctx.already_done(2) {
///     // Were subscribe to fail here, the entry would be queued with
///     // step 1 recorded and a retry would start at step 2.
///     subscribe()?;
///     ctx.mark_done(2);
/// }
/// # Ok::<(), String>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    resume_from: u32,
    completed: u32,
}

impl StepContext {
    /// A context resuming after `resume_from` completed steps (0 for a
    /// fresh event).
    #[must_use]
    pub const fn new(resume_from: u32) -> Self {
        Self {
            resume_from,
            completed: resume_from,
        }
    }

    /// Whether `step` completed in an earlier attempt and must be skipped.
    #[must_use]
    pub const fn already_done(&self, step: u32) -> bool {
        step <= self.resume_from
    }

    /// Records that `step` completed its side effects.
    pub const fn mark_done(&mut self, step: u32) {
        if step > self.completed {
            self.completed = step;
        }
    }

    /// Number of steps completed so far, across all attempts.
    #[must_use]
    pub const fn completed(&self) -> u32 {
        self.completed
    }

    /// Whether this attempt completed side effects a retry must not redo.
    #[must_use]
    pub const fn is_partially_processed(&self) -> bool {
        self.completed > 0
    }
}

/// Type-specific event handler.
///
/// One handler is registered per object type; every method defaults to a
/// no-op so handlers only implement the events they care about. A handler
/// signals failure by returning a [`HandlerError`]; the applier then queues
/// the event, preserving the steps recorded on the [`StepContext`].
#[async_trait]
pub trait EventHandler: Send {
    /// A new object appeared.
    async fn on_added(
        &mut self,
        pkey: &Pkey,
        attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        let (_, _, _) = (pkey, attrs, ctx);
        Ok(())
    }

    /// An object was restored from the trashbin.
    async fn on_recycled(
        &mut self,
        pkey: &Pkey,
        attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        let (_, _, _) = (pkey, attrs, ctx);
        Ok(())
    }

    /// An object's attributes changed.
    async fn on_modified(
        &mut self,
        pkey: &Pkey,
        diff: &ObjectDiff,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        let (_, _, _) = (pkey, diff, ctx);
        Ok(())
    }

    /// An object was moved to the trashbin.
    async fn on_trashed(
        &mut self,
        pkey: &Pkey,
        attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        let (_, _, _) = (pkey, attrs, ctx);
        Ok(())
    }

    /// An object is gone for good (direct removal, or trashbin retention
    /// expired).
    async fn on_removed(
        &mut self,
        pkey: &Pkey,
        attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        let (_, _, _) = (pkey, attrs, ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_resume_after_recorded_progress() {
        let mut ctx = StepContext::new(0);
        assert!(!ctx.already_done(1));
        ctx.mark_done(1);
        assert!(ctx.is_partially_processed());
        assert_eq!(ctx.completed(), 1);

        // A retry resuming from step 1 skips it and runs step 2.
        let retry = StepContext::new(ctx.completed());
        assert!(retry.already_done(1));
        assert!(!retry.already_done(2));
    }
}
