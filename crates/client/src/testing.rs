// SPDX-License-Identifier: Apache-2.0

//! Test fixtures: a collecting notification sink and a scriptable handler.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use syncflow_config::AttrName;
use syncflow_model::{ObjectDiff, Pkey};

use crate::error::HandlerError;
use crate::handler::{EventHandler, StepContext};
use crate::notifications::{Notification, NotificationSink};

/// A sink that collects notifications for assertions.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    inner: Arc<Mutex<Vec<Notification>>>,
}

impl CollectingSink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The notifications delivered so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().expect("notifications lock").clone()
    }

    /// The subjects delivered so far.
    #[must_use]
    pub fn subjects(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|n| n.subject)
            .collect()
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&mut self, notification: Notification) {
        self.inner
            .lock()
            .expect("notifications lock")
            .push(notification);
    }
}

/// One dispatched call, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedCall {
    /// `added`, `recycled`, `modified`, `trashed` or `removed`.
    pub kind: String,
    /// Display form of the primary key.
    pub pkey: String,
}

/// A handler that records calls and fails on demand.
///
/// Objects whose key is in the failing set raise; with `fail_at_step` set,
/// step 1 completes first so the queue entry records partial processing.
#[derive(Debug, Default, Clone)]
pub struct ScriptedHandler {
    calls: Arc<Mutex<Vec<DispatchedCall>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    fail_at_step: Arc<Mutex<Option<u32>>>,
}

impl ScriptedHandler {
    /// A handler that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes events for this key fail until cleared.
    pub fn set_failing(&self, pkey: &str, failing: bool) {
        let mut set = self.failing.lock().expect("failing lock");
        if failing {
            let _ = set.insert(pkey.to_string());
        } else {
            let _ = set.remove(pkey);
        }
    }

    /// Makes failures happen at the given step, completing earlier steps.
    pub fn set_fail_at_step(&self, step: Option<u32>) {
        *self.fail_at_step.lock().expect("step lock") = step;
    }

    /// The calls dispatched so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DispatchedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, kind: &str, pkey: &Pkey, ctx: &mut StepContext) -> Result<(), HandlerError> {
        let key = pkey.to_string();
        if self.failing.lock().expect("failing lock").contains(&key) {
            if let Some(fail_step) = *self.fail_at_step.lock().expect("step lock") {
                for step in 1..fail_step {
                    if !ctx.already_done(step) {
                        ctx.mark_done(step);
                    }
                }
                return Err(HandlerError::new(format!("step {fail_step} failed for {key}")));
            }
            return Err(HandlerError::new(format!("handler failed for {key}")));
        }
        self.calls.lock().expect("calls lock").push(DispatchedCall {
            kind: kind.to_string(),
            pkey: key,
        });
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn on_added(
        &mut self,
        pkey: &Pkey,
        _attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        self.record("added", pkey, ctx)
    }

    async fn on_recycled(
        &mut self,
        pkey: &Pkey,
        _attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        self.record("recycled", pkey, ctx)
    }

    async fn on_modified(
        &mut self,
        pkey: &Pkey,
        _diff: &ObjectDiff,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        self.record("modified", pkey, ctx)
    }

    async fn on_trashed(
        &mut self,
        pkey: &Pkey,
        _attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        self.record("trashed", pkey, ctx)
    }

    async fn on_removed(
        &mut self,
        pkey: &Pkey,
        _attrs: &IndexMap<AttrName, Value>,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        self.record("removed", pkey, ctx)
    }
}
