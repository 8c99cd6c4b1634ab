// SPDX-License-Identifier: Apache-2.0

//! Persistent error queue with autoremediation.
//!
//! The queue holds events whose handler failed (or only partially
//! succeeded), totally ordered by event number. When a newer event arrives
//! for an object that already has an open entry, the queue rewrites or
//! collapses entries so that the retry applies the minimum correct
//! sequence:
//!
//! | prior | new | action |
//! |-------|-----|--------|
//! | add   | mod | fold the changes into the queued full record |
//! | add   | rem | cancel both, unless the add partially processed |
//! | mod   | mod | merge the diffs, newer values win |
//! | mod   | rem | drop the mod, queue the removal |
//! | rem   | add | queue both (recycling is handled before the queue) |
//!
//! A partially-processed entry performed side effects already: its local
//! event is never discarded, remediation may only rewrite it or append.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use syncflow_config::{PkeySpec, RemediationPolicy, TypeName};
use syncflow_model::{Event, EventKind, EventPayload, Pkey};
use tracing::debug;

/// Coarse classification of event kinds for the remediation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvClass {
    Add,
    Mod,
    Rem,
}

const fn class_of(kind: EventKind) -> EvClass {
    match kind {
        EventKind::Added | EventKind::Recycled => EvClass::Add,
        EventKind::Modified => EvClass::Mod,
        EventKind::Removed | EventKind::Trashed => EvClass::Rem,
    }
}

/// One queued event awaiting retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue key; the originating event number for server events.
    pub ev_number: u64,
    /// The server-originated form; `None` for client-local rewrites.
    pub remote_ev: Option<Event>,
    /// The event after local attribute mapping; what retries dispatch.
    pub local_ev: Option<Event>,
    /// Last failure message.
    pub err_msg: String,
    /// Number of retry attempts so far.
    pub retry_count: u32,
    /// Whether the handler completed side effects before failing.
    pub is_partially_processed: bool,
    /// Steps completed across attempts; retries resume after this step.
    pub resume_step: u32,
    /// When the entry was first queued.
    pub first_seen_at: DateTime<Utc>,
    /// When the entry was last retried.
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn event(&self) -> Option<&Event> {
        self.local_ev.as_ref().or(self.remote_ev.as_ref())
    }

    /// The object type this entry belongs to.
    #[must_use]
    pub fn objtype(&self) -> Option<&str> {
        self.event().map(|e| e.objtype.as_str())
    }

    /// The primary key this entry belongs to.
    #[must_use]
    pub fn pkey(&self) -> Option<&Pkey> {
        self.event().map(|e| &e.pkey)
    }

    fn class(&self) -> Option<EvClass> {
        self.event().map(|e| class_of(e.kind))
    }

    fn matches(&self, objtype: &str, pkey: &Pkey) -> bool {
        self.objtype() == Some(objtype) && self.pkey() == Some(pkey)
    }
}

/// What the queue decided about an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// The event was appended as its own entry.
    Queued,
    /// The event was folded into the prior open entry.
    Absorbed,
    /// The prior entry and the event cancelled each other out.
    Cancelled,
}

/// The error queue: entries ordered by event number, retried with a
/// minimum cadence, rewritten by autoremediation.
#[derive(Debug)]
pub struct ErrorQueue {
    entries: BTreeMap<u64, QueueEntry>,
    policy: RemediationPolicy,
    retry_interval: Duration,
    changed: bool,
}

impl ErrorQueue {
    /// An empty queue with the given policy and retry cadence.
    #[must_use]
    pub const fn new(policy: RemediationPolicy, retry_interval: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
            retry_interval,
            changed: false,
        }
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an open entry exists for this object. While one does, every
    /// further event for the object goes through the queue to preserve
    /// per-object ordering.
    #[must_use]
    pub fn has_open_for(&self, objtype: &str, pkey: &Pkey) -> bool {
        self.entries.values().any(|e| e.matches(objtype, pkey))
    }

    /// Appends a freshly failed event.
    pub fn push(&mut self, mut entry: QueueEntry) {
        // Local-only rewrites have no server event number; key them after
        // everything queued so far.
        if entry.ev_number == 0 || self.entries.contains_key(&entry.ev_number) {
            let next = self.entries.keys().next_back().map_or(1, |n| n + 1);
            entry.ev_number = entry.ev_number.max(next);
        }
        debug!(ev = entry.ev_number, "event queued");
        let _ = self.entries.insert(entry.ev_number, entry);
        self.changed = true;
    }

    /// Applies the remediation algebra to an event arriving while prior
    /// entries for the same object are open.
    ///
    /// `new_remote`/`new_local` are the server form and the locally mapped
    /// form; `err_msg` seeds the entry when the event has to be queued.
    pub fn remediate(
        &mut self,
        objtype: &str,
        pkey: &Pkey,
        new_remote: Option<Event>,
        new_local: Option<Event>,
        err_msg: String,
        now: DateTime<Utc>,
    ) -> Remediation {
        let prior_key = self
            .entries
            .iter()
            .rev()
            .find(|(_, e)| e.matches(objtype, pkey))
            .map(|(n, _)| *n);

        let queue_new = |queue: &mut Self| {
            let ev_number = new_remote
                .as_ref()
                .or(new_local.as_ref())
                .map_or(0, |e| e.ev_number);
            queue.push(QueueEntry {
                ev_number,
                remote_ev: new_remote.clone(),
                local_ev: new_local.clone(),
                err_msg: err_msg.clone(),
                retry_count: 0,
                is_partially_processed: false,
                resume_step: 0,
                first_seen_at: now,
                last_retry_at: None,
            });
        };

        let Some(prior_key) = prior_key else {
            queue_new(self);
            return Remediation::Queued;
        };

        let new_class = new_local
            .as_ref()
            .or(new_remote.as_ref())
            .map(|e| class_of(e.kind));
        let (prior_class, prior_partial) = {
            let prior = &self.entries[&prior_key];
            (prior.class(), prior.is_partially_processed)
        };

        if self.policy == RemediationPolicy::Disabled {
            queue_new(self);
            return Remediation::Queued;
        }

        match (prior_class, new_class) {
            (Some(EvClass::Add | EvClass::Mod), Some(EvClass::Mod)) => {
                let prior = self
                    .entries
                    .get_mut(&prior_key)
                    .expect("prior entry exists");
                if let (Some(prior_ev), Some(new_ev)) = (prior.remote_ev.as_mut(), &new_remote) {
                    fold_event(prior_ev, new_ev);
                }
                if let (Some(prior_ev), Some(new_ev)) = (prior.local_ev.as_mut(), &new_local) {
                    // Rewriting the local event is fine even when partially
                    // processed; only discarding it is not.
                    fold_event(prior_ev, new_ev);
                }
                self.changed = true;
                debug!(ev = prior_key, "newer changes folded into queued entry");
                Remediation::Absorbed
            }
            (Some(EvClass::Add), Some(EvClass::Rem))
                if self.policy == RemediationPolicy::Maximum && !prior_partial =>
            {
                // The object never materialized: the add and the remove
                // cancel out entirely.
                let _ = self.entries.remove(&prior_key);
                self.changed = true;
                debug!(ev = prior_key, "queued add cancelled by removal");
                Remediation::Cancelled
            }
            (Some(EvClass::Mod), Some(EvClass::Rem))
                if self.policy == RemediationPolicy::Maximum && !prior_partial =>
            {
                // Removing the object makes the queued modification moot.
                let _ = self.entries.remove(&prior_key);
                queue_new(self);
                Remediation::Queued
            }
            _ => {
                queue_new(self);
                Remediation::Queued
            }
        }
    }

    /// Entries due for a retry, ordered by event number.
    #[must_use]
    pub fn due(&self, now: DateTime<Utc>) -> Vec<u64> {
        self.entries
            .values()
            .filter(|e| match e.last_retry_at {
                None => true,
                Some(last) => now
                    .signed_duration_since(last)
                    .to_std()
                    .is_ok_and(|age| age >= self.retry_interval),
            })
            .map(|e| e.ev_number)
            .collect()
    }

    /// Read access to one entry.
    #[must_use]
    pub fn get(&self, ev_number: u64) -> Option<&QueueEntry> {
        self.entries.get(&ev_number)
    }

    /// Mutable access for operator intervention; the mutation is persisted
    /// with the next snapshot.
    pub fn get_mut(&mut self, ev_number: u64) -> Option<&mut QueueEntry> {
        self.changed = true;
        self.entries.get_mut(&ev_number)
    }

    /// Removes an entry (successful retry, operator decision).
    pub fn remove(&mut self, ev_number: u64) -> Option<QueueEntry> {
        let removed = self.entries.remove(&ev_number);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    /// Ordered iteration over the entries.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    /// Rewrites the local event of every entry (local mapping change).
    ///
    /// The closure returns the new local event, or `None` to drop the
    /// entry; entries that partially processed are never dropped, their
    /// local event is kept as-is instead.
    pub fn rewrite_local_events<F>(&mut self, mut rewrite: F)
    where
        F: FnMut(&QueueEntry) -> Option<Option<Event>>,
    {
        let keys: Vec<u64> = self.entries.keys().copied().collect();
        for key in keys {
            let entry = &self.entries[&key];
            let partially_processed = entry.is_partially_processed;
            let Some(new_local) = rewrite(entry) else {
                continue;
            };
            match new_local {
                Some(ev) => {
                    let entry = self.entries.get_mut(&key).expect("entry exists");
                    entry.local_ev = Some(ev);
                    self.changed = true;
                }
                None if !partially_processed => {
                    let _ = self.entries.remove(&key);
                    self.changed = true;
                }
                None => {}
            }
        }
    }

    /// Re-keys entries of a type after a primary-key migration.
    ///
    /// Events carrying a full record are re-projected; diff-only entries
    /// cannot be re-keyed and are flagged for operator attention instead.
    pub fn migrate_pkeys(&mut self, objtype: &str, spec: &PkeySpec) {
        for entry in self.entries.values_mut() {
            if entry.objtype() != Some(objtype) {
                continue;
            }
            let mut rekeyed = false;
            for ev in [entry.remote_ev.as_mut(), entry.local_ev.as_mut()]
                .into_iter()
                .flatten()
            {
                if let EventPayload::Full(attrs) = &ev.attrs {
                    if let Ok(Some(pkey)) = Pkey::project(attrs, spec) {
                        ev.pkey = pkey;
                        rekeyed = true;
                    }
                }
            }
            if !rekeyed {
                entry.err_msg =
                    "primary key migration requires operator attention".to_string();
            }
            self.changed = true;
        }
    }

    /// Whether the queue changed since the last call; resets the flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// The entries, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.values().cloned().collect()
    }

    /// Replaces the entries from a persisted snapshot.
    pub fn restore(&mut self, entries: Vec<QueueEntry>) {
        self.entries = entries.into_iter().map(|e| (e.ev_number, e)).collect();
    }

    /// Object types and keys with open entries, in queue order.
    #[must_use]
    pub fn open_objects(&self) -> Vec<(TypeName, Pkey)> {
        self.entries
            .values()
            .filter_map(|e| {
                Some((e.objtype()?.to_string(), e.pkey()?.clone()))
            })
            .collect()
    }
}

/// Folds a newer event into a queued one: full records absorb diffs,
/// diffs merge with newer values winning.
fn fold_event(prior: &mut Event, newer: &Event) {
    match (&mut prior.attrs, &newer.attrs) {
        (EventPayload::Full(attrs), EventPayload::Diff(diff)) => {
            for (attr, value) in diff.added.iter().chain(diff.modified.iter()) {
                let _ = attrs.insert(attr.clone(), value.clone());
            }
            for attr in &diff.removed {
                let _ = attrs.shift_remove(attr);
            }
        }
        (EventPayload::Diff(prior_diff), EventPayload::Diff(diff)) => {
            prior_diff.merge_newer(diff);
        }
        (EventPayload::Full(attrs), EventPayload::Full(newer_attrs)) => {
            *attrs = newer_attrs.clone();
        }
        (EventPayload::Diff(_), EventPayload::Full(_)) => {
            prior.attrs = newer.attrs.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::{Value, json};
    use syncflow_model::{DataObject, KeyPart, ObjectDiff};

    fn pkey(n: i64) -> Pkey {
        Pkey::Single(KeyPart::Int(n))
    }

    fn added_event(ev: u64, n: i64, login: &str) -> Event {
        let attrs: IndexMap<String, Value> = [
            ("id".to_string(), json!(n)),
            ("login".to_string(), json!(login)),
        ]
        .into_iter()
        .collect();
        Event::added(ev, "Users".to_string(), &DataObject::new(pkey(n), attrs))
    }

    fn modified_event(ev: u64, n: i64, attr: &str, value: Value) -> Event {
        let diff = ObjectDiff {
            added: IndexMap::new(),
            modified: [(attr.to_string(), value)].into_iter().collect(),
            removed: Vec::new(),
        };
        Event::modified(ev, "Users".to_string(), pkey(n), diff)
    }

    fn removed_event(ev: u64, n: i64) -> Event {
        let attrs: IndexMap<String, Value> =
            [("id".to_string(), json!(n))].into_iter().collect();
        Event::removed(ev, "Users".to_string(), &DataObject::new(pkey(n), attrs))
    }

    fn queue(policy: RemediationPolicy) -> ErrorQueue {
        ErrorQueue::new(policy, Duration::from_secs(0))
    }

    fn push_failed(q: &mut ErrorQueue, ev: Event, partial: bool) {
        q.push(QueueEntry {
            ev_number: ev.ev_number,
            remote_ev: Some(ev.clone()),
            local_ev: Some(ev),
            err_msg: "handler failed".to_string(),
            retry_count: 0,
            is_partially_processed: partial,
            resume_step: if partial { 1 } else { 0 },
            first_seen_at: Utc::now(),
            last_retry_at: None,
        });
    }

    #[test]
    fn modification_folds_into_queued_add() {
        let mut q = queue(RemediationPolicy::Maximum);
        push_failed(&mut q, added_event(1, 7, "jdoe"), false);

        let action = q.remediate(
            "Users",
            &pkey(7),
            Some(modified_event(2, 7, "login", json!("jdoe2"))),
            Some(modified_event(2, 7, "login", json!("jdoe2"))),
            String::new(),
            Utc::now(),
        );
        assert_eq!(action, Remediation::Absorbed);
        assert_eq!(q.len(), 1);

        let entry = q.entries().next().unwrap();
        let ev = entry.local_ev.as_ref().unwrap();
        // Still an add, now carrying the newer value.
        assert_eq!(ev.kind, EventKind::Added);
        assert_eq!(ev.attrs.to_attr_map()["login"], json!("jdoe2"));
    }

    #[test]
    fn add_and_remove_cancel_under_maximum() {
        let mut q = queue(RemediationPolicy::Maximum);
        push_failed(&mut q, added_event(1, 7, "jdoe"), false);

        let action = q.remediate(
            "Users",
            &pkey(7),
            Some(removed_event(2, 7)),
            Some(removed_event(2, 7)),
            String::new(),
            Utc::now(),
        );
        assert_eq!(action, Remediation::Cancelled);
        assert!(q.is_empty());
    }

    #[test]
    fn partial_processing_blocks_cancellation() {
        let mut q = queue(RemediationPolicy::Maximum);
        push_failed(&mut q, added_event(1, 7, "jdoe"), true);

        let action = q.remediate(
            "Users",
            &pkey(7),
            Some(removed_event(2, 7)),
            Some(removed_event(2, 7)),
            String::new(),
            Utc::now(),
        );
        // The half-applied add must be undone by the retry, so both stay,
        // in original order.
        assert_eq!(action, Remediation::Queued);
        assert_eq!(q.len(), 2);
        let numbers: Vec<u64> = q.entries().map(|e| e.ev_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn conservative_never_cancels() {
        let mut q = queue(RemediationPolicy::Conservative);
        push_failed(&mut q, added_event(1, 7, "jdoe"), false);

        let action = q.remediate(
            "Users",
            &pkey(7),
            Some(removed_event(2, 7)),
            Some(removed_event(2, 7)),
            String::new(),
            Utc::now(),
        );
        assert_eq!(action, Remediation::Queued);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn removal_supersedes_queued_modification() {
        let mut q = queue(RemediationPolicy::Maximum);
        push_failed(&mut q, modified_event(3, 7, "login", json!("x")), false);

        let action = q.remediate(
            "Users",
            &pkey(7),
            Some(removed_event(4, 7)),
            Some(removed_event(4, 7)),
            String::new(),
            Utc::now(),
        );
        assert_eq!(action, Remediation::Queued);
        assert_eq!(q.len(), 1);
        assert_eq!(
            q.entries().next().unwrap().local_ev.as_ref().unwrap().kind,
            EventKind::Removed
        );
    }

    #[test]
    fn merged_modifications_let_newer_values_win() {
        let mut q = queue(RemediationPolicy::Conservative);
        push_failed(&mut q, modified_event(3, 7, "login", json!("a")), false);

        let action = q.remediate(
            "Users",
            &pkey(7),
            Some(modified_event(4, 7, "login", json!("b"))),
            Some(modified_event(4, 7, "login", json!("b"))),
            String::new(),
            Utc::now(),
        );
        assert_eq!(action, Remediation::Absorbed);
        let entry = q.entries().next().unwrap();
        let diff = entry.local_ev.as_ref().unwrap().attrs.as_diff().unwrap();
        assert_eq!(diff.modified["login"], json!("b"));
    }

    #[test]
    fn disabled_policy_only_appends() {
        let mut q = queue(RemediationPolicy::Disabled);
        push_failed(&mut q, added_event(1, 7, "jdoe"), false);
        let action = q.remediate(
            "Users",
            &pkey(7),
            Some(removed_event(2, 7)),
            Some(removed_event(2, 7)),
            String::new(),
            Utc::now(),
        );
        assert_eq!(action, Remediation::Queued);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn retry_cadence_is_honored() {
        let mut q = ErrorQueue::new(RemediationPolicy::Disabled, Duration::from_secs(60));
        push_failed(&mut q, added_event(1, 7, "jdoe"), false);
        let now = Utc::now();

        assert_eq!(q.due(now), vec![1]);
        q.get_mut(1).unwrap().last_retry_at = Some(now);
        assert!(q.due(now).is_empty());
        assert_eq!(q.due(now + chrono::Duration::seconds(61)), vec![1]);
    }
}
