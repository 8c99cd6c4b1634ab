// SPDX-License-Identifier: Apache-2.0

//! The event applier.
//!
//! Consumes the ordered event stream, rewrites each event through the
//! client's local attribute mappings, drives the trashbin lifecycle,
//! dispatches to type handlers and feeds the error queue on failure. The
//! local mirror is only advanced by successfully dispatched events, so a
//! queued event replayed later still observes the state it expects.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_config::{AttrName, ClientConfig, PkeySpec, TypeName, error::error_context};
use syncflow_expr::{CompileOpts, Engine, EvalContext, Expression};
use syncflow_model::{
    DataObject, DataObjectList, Dataschema, Event, EventKind, EventPayload, ObjectDiff, Pkey,
    reserved_context_vars,
};
use syncflow_state::SnapshotStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, HandlerError};
use crate::handler::{EventHandler, StepContext};
use crate::notifications::{NotificationSink, Notifier};
use crate::queue::{ErrorQueue, QueueEntry};
use crate::trashbin::Trashbin;

/// Boxed error type event streams surface their failures with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const SNAP_CLIENT_DATA: &str = "client_data";
const SNAP_REMOTE_DATA: &str = "remote_data";
const SNAP_TRASHBIN: &str = "trashbin";
const SNAP_QUEUE: &str = "error_queue";
const SNAP_META: &str = "applier_meta";

/// Small bits of applier state persisted alongside the mirrors.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedMeta {
    high_water: u64,
    mapping_sources: IndexMap<TypeName, IndexMap<AttrName, String>>,
    remote_schema: Option<Dataschema>,
}

/// The client event applier.
pub struct Applier {
    engine: Engine,
    mappings: IndexMap<TypeName, IndexMap<AttrName, Expression>>,
    mapping_sources: IndexMap<TypeName, IndexMap<AttrName, String>>,
    trashbin_retention: Option<Duration>,
    purge_trashbin_on_pkey_change: bool,

    remote_schema: Option<Dataschema>,
    /// Local mirror: objects as the client sees them.
    clientdata: IndexMap<TypeName, DataObjectList>,
    /// Remote mirror: objects as the server sent them; the raw material for
    /// local mapping evaluation.
    remotedata: IndexMap<TypeName, DataObjectList>,
    trashbin: Trashbin,
    queue: ErrorQueue,
    handlers: HashMap<TypeName, Box<dyn EventHandler>>,
    notifier: Notifier,
    store: SnapshotStore,
    high_water: u64,
    mapping_drift: bool,
}

impl Applier {
    /// Builds an applier from configuration, restoring every persisted
    /// piece of state (mirrors, trashbin, queue, high-water mark).
    pub fn new(
        config: &ClientConfig,
        handlers: HashMap<TypeName, Box<dyn EventHandler>>,
        sink: Box<dyn NotificationSink>,
        engine: Engine,
    ) -> Result<Self, Error> {
        let store = SnapshotStore::open(&config.storage)?;

        let mut mappings = IndexMap::new();
        let mut mapping_sources = IndexMap::new();
        for (objtype, typecfg) in &config.datamodel {
            let context = error_context(objtype, "local", "attrsmapping");
            let mut compiled = IndexMap::with_capacity(typecfg.attrsmapping.len());
            for (attr, source) in &typecfg.attrsmapping {
                let expr = engine.compile(
                    source,
                    &context,
                    CompileOpts {
                        one_template: true,
                        one_var: false,
                    },
                )?;
                let _ = compiled.insert(attr.clone(), expr);
            }
            let _ = mappings.insert(objtype.clone(), compiled);
            let _ = mapping_sources.insert(objtype.clone(), typecfg.attrsmapping.clone());
        }

        let clientdata = store
            .load::<IndexMap<TypeName, DataObjectList>>(SNAP_CLIENT_DATA)?
            .unwrap_or_default();
        let remotedata = store
            .load::<IndexMap<TypeName, DataObjectList>>(SNAP_REMOTE_DATA)?
            .unwrap_or_default();
        let trashbin = store.load::<Trashbin>(SNAP_TRASHBIN)?.unwrap_or_default();
        let meta = store
            .load::<PersistedMeta>(SNAP_META)?
            .unwrap_or_default();

        let mut queue = ErrorQueue::new(config.autoremediation, config.errorqueue_retry_interval);
        if let Some(entries) = store.load::<Vec<QueueEntry>>(SNAP_QUEUE)? {
            queue.restore(entries);
        }

        // A changed local mapping means the mirror and the queued events
        // were computed with outdated expressions; resync_local_mappings
        // rewrites both on the next loop.
        let mapping_drift =
            !meta.mapping_sources.is_empty() && meta.mapping_sources != mapping_sources;

        Ok(Self {
            engine,
            mappings,
            mapping_sources,
            trashbin_retention: config.trashbin_retention,
            purge_trashbin_on_pkey_change: config.purge_trashbin_on_pkey_change,
            remote_schema: meta.remote_schema,
            clientdata,
            remotedata,
            trashbin,
            queue,
            handlers,
            notifier: Notifier::new(sink),
            store,
            high_water: meta.high_water,
            mapping_drift,
        })
    }

    /// The local mirror of one type.
    #[must_use]
    pub fn clientdata(&self, objtype: &str) -> Option<&DataObjectList> {
        self.clientdata.get(objtype)
    }

    /// The error queue.
    #[must_use]
    pub const fn queue(&self) -> &ErrorQueue {
        &self.queue
    }

    /// Mutable access to the error queue for operator intervention;
    /// mutations are persisted with the next snapshot.
    pub fn queue_mut(&mut self) -> &mut ErrorQueue {
        &mut self.queue
    }

    /// The trashbin.
    #[must_use]
    pub const fn trashbin(&self) -> &Trashbin {
        &self.trashbin
    }

    /// Applies one incoming event.
    ///
    /// Events at or below the high-water mark are replays of already
    /// processed deliveries and are dropped (at-least-once upstream, exactly
    /// once here).
    pub async fn apply(&mut self, ev: Event) -> Result<(), Error> {
        if ev.ev_number <= self.high_water {
            debug!(ev = ev.ev_number, "replayed event dropped");
            return Ok(());
        }
        self.high_water = ev.ev_number;

        let objtype = ev.objtype.clone();
        if !self.mappings.contains_key(&objtype) {
            // This client does not consume the type.
            return Ok(());
        }

        match ev.kind {
            EventKind::Added | EventKind::Recycled => self.apply_added(objtype, ev).await,
            EventKind::Modified => self.apply_modified(objtype, ev).await,
            EventKind::Removed | EventKind::Trashed => self.apply_removed(objtype, ev).await,
        }
    }

    async fn apply_added(&mut self, objtype: TypeName, ev: Event) -> Result<(), Error> {
        let remote_obj = DataObject::new(ev.pkey.clone(), ev.attrs.to_attr_map());
        let local_obj = self.map_local(&objtype, &remote_obj)?;

        // An added object still sitting in the trashbin is a comeback: it is
        // recycled with its new attributes rather than created from scratch.
        let recycled = self.trashbin.take(&objtype, &ev.pkey).is_some();
        let kind = if recycled {
            EventKind::Recycled
        } else {
            EventKind::Added
        };
        let local_ev = Event {
            ev_number: ev.ev_number,
            kind,
            objtype: objtype.clone(),
            pkey: ev.pkey.clone(),
            attrs: EventPayload::Full(local_obj.attrs().clone()),
        };

        if self.queue.has_open_for(&objtype, &ev.pkey) {
            let pkey = ev.pkey.clone();
            let _ = self.queue.remediate(
                &objtype,
                &pkey,
                Some(ev),
                Some(local_ev),
                "queued behind a failed event".to_string(),
                Utc::now(),
            );
            return Ok(());
        }

        let mut ctx = StepContext::new(0);
        match self.dispatch(&objtype, &local_ev, &mut ctx).await {
            Ok(()) => {
                self.remote_list(&objtype).insert(remote_obj);
                self.client_list(&objtype).insert(local_obj);
                Ok(())
            }
            Err(e) => {
                self.enqueue_failure(ev, local_ev, e, &ctx);
                Ok(())
            }
        }
    }

    async fn apply_modified(&mut self, objtype: TypeName, ev: Event) -> Result<(), Error> {
        let Some(diff) = ev.attrs.as_diff().cloned() else {
            // A modified frame always carries a diff; tolerate full payloads
            // by treating them as a replacement.
            let replacement = Event {
                kind: EventKind::Added,
                ..ev
            };
            return Box::pin(self.apply_added(objtype, replacement)).await;
        };

        let mut remote_after = self
            .remotedata
            .get(&objtype)
            .and_then(|l| l.get(&ev.pkey))
            .cloned()
            .unwrap_or_else(|| DataObject::new(ev.pkey.clone(), IndexMap::new()));
        remote_after.apply_diff(&diff);

        let local_after = self.map_local(&objtype, &remote_after)?;
        let local_before = self
            .clientdata
            .get(&objtype)
            .and_then(|l| l.get(&ev.pkey))
            .cloned()
            .unwrap_or_else(|| DataObject::new(ev.pkey.clone(), IndexMap::new()));
        let local_diff = ObjectDiff::between(&local_before, &local_after);

        if self.queue.has_open_for(&objtype, &ev.pkey) {
            let local_ev = Event::modified(
                ev.ev_number,
                objtype.clone(),
                ev.pkey.clone(),
                local_diff,
            );
            let pkey = ev.pkey.clone();
            let _ = self.queue.remediate(
                &objtype,
                &pkey,
                Some(ev),
                Some(local_ev),
                "queued behind a failed event".to_string(),
                Utc::now(),
            );
            return Ok(());
        }

        if local_diff.is_empty() {
            // The change only touched attributes the local mapping ignores.
            self.remote_list(&objtype).insert(remote_after);
            return Ok(());
        }

        let local_ev = Event::modified(
            ev.ev_number,
            objtype.clone(),
            ev.pkey.clone(),
            local_diff,
        );
        let mut ctx = StepContext::new(0);
        match self.dispatch(&objtype, &local_ev, &mut ctx).await {
            Ok(()) => {
                self.remote_list(&objtype).insert(remote_after);
                self.client_list(&objtype).insert(local_after);
                Ok(())
            }
            Err(e) => {
                self.enqueue_failure(ev, local_ev, e, &ctx);
                Ok(())
            }
        }
    }

    async fn apply_removed(&mut self, objtype: TypeName, ev: Event) -> Result<(), Error> {
        let local_obj = self
            .clientdata
            .get(&objtype)
            .and_then(|l| l.get(&ev.pkey))
            .cloned()
            .unwrap_or_else(|| {
                DataObject::new(ev.pkey.clone(), IndexMap::new())
            });

        // With a trashbin the removal is delivered as `trashed` and the
        // object is parked; the real removal happens when retention expires.
        let kind = if self.trashbin_retention.is_some() {
            EventKind::Trashed
        } else {
            EventKind::Removed
        };
        let local_ev = Event {
            ev_number: ev.ev_number,
            kind,
            objtype: objtype.clone(),
            pkey: ev.pkey.clone(),
            attrs: EventPayload::Full(local_obj.attrs().clone()),
        };

        if self.queue.has_open_for(&objtype, &ev.pkey) {
            let pkey = ev.pkey.clone();
            let _ = self.queue.remediate(
                &objtype,
                &pkey,
                Some(ev),
                Some(local_ev),
                "queued behind a failed event".to_string(),
                Utc::now(),
            );
            return Ok(());
        }

        let mut ctx = StepContext::new(0);
        match self.dispatch(&objtype, &local_ev, &mut ctx).await {
            Ok(()) => {
                let _ = self.remote_list(&objtype).remove(&ev.pkey);
                let _ = self.client_list(&objtype).remove(&ev.pkey);
                if kind == EventKind::Trashed {
                    self.trashbin.insert(&objtype, local_obj, Utc::now());
                }
                Ok(())
            }
            Err(e) => {
                self.enqueue_failure(ev, local_ev, e, &ctx);
                Ok(())
            }
        }
    }

    /// Retries due queue entries in event-number order. After the first
    /// failure for an object, its later entries are skipped to preserve
    /// per-object ordering.
    pub async fn retry_queue(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        let due = self.queue.due(now);
        let mut failed: HashSet<(TypeName, Pkey)> = HashSet::new();

        for ev_number in due {
            let Some(entry) = self.queue.get(ev_number) else {
                continue;
            };
            let Some(local_ev) = entry.local_ev.clone().or_else(|| entry.remote_ev.clone())
            else {
                let _ = self.queue.remove(ev_number);
                continue;
            };
            let key = (local_ev.objtype.clone(), local_ev.pkey.clone());
            if failed.contains(&key) {
                continue;
            }
            let remote_ev = entry.remote_ev.clone();
            let resume = entry.resume_step;

            let mut ctx = StepContext::new(resume);
            match self.dispatch(&key.0, &local_ev, &mut ctx).await {
                Ok(()) => {
                    info!(ev = ev_number, retries = self.queue.get(ev_number).map_or(0, |e| e.retry_count), "queued event applied");
                    if let Some(remote_ev) = &remote_ev {
                        apply_event_to_list(self.remote_list(&key.0), remote_ev);
                    }
                    apply_event_to_list(self.client_list(&key.0), &local_ev);
                    if local_ev.kind == EventKind::Trashed {
                        let obj =
                            DataObject::new(local_ev.pkey.clone(), local_ev.attrs.to_attr_map());
                        let _ = self.client_list(&key.0).remove(&local_ev.pkey);
                        self.trashbin.insert(&key.0, obj, now);
                    }
                    let _ = self.queue.remove(ev_number);
                }
                Err(e) => {
                    if let Some(entry) = self.queue.get_mut(ev_number) {
                        entry.retry_count += 1;
                        entry.err_msg = e.message;
                        entry.is_partially_processed =
                            entry.is_partially_processed || ctx.is_partially_processed();
                        entry.resume_step = ctx.completed();
                        entry.last_retry_at = Some(now);
                    }
                    let _ = failed.insert(key);
                }
            }
        }
        Ok(())
    }

    /// Purges trashbin entries past retention, delivering the real removals.
    pub async fn sweep_trashbin(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        let Some(retention) = self.trashbin_retention else {
            return Ok(());
        };
        for (objtype, trashed) in self.trashbin.drain_expired(retention, now) {
            let local_ev = Event {
                ev_number: 0,
                kind: EventKind::Removed,
                objtype: objtype.clone(),
                pkey: trashed.obj.pkey.clone(),
                attrs: EventPayload::Full(trashed.obj.attrs().clone()),
            };
            let mut ctx = StepContext::new(0);
            if let Err(e) = self.dispatch(&objtype, &local_ev, &mut ctx).await {
                self.queue.push(QueueEntry {
                    ev_number: 0,
                    remote_ev: None,
                    local_ev: Some(local_ev),
                    err_msg: e.message,
                    retry_count: 0,
                    is_partially_processed: ctx.is_partially_processed(),
                    resume_step: ctx.completed(),
                    first_seen_at: now,
                    last_retry_at: None,
                });
            }
        }
        Ok(())
    }

    /// Records the server's effective schema, handling primary-key
    /// migrations and emitting datamodel warnings when the local mappings
    /// no longer line up.
    pub fn set_remote_schema(&mut self, schema: Dataschema) -> Result<(), Error> {
        if let Some(previous) = self.remote_schema.clone() {
            let sdiff = schema.diff_from(&previous);
            for (objtype, type_diff) in &sdiff.changed_types {
                if type_diff.pkey_changed {
                    let spec = schema.types[objtype].primary_key.clone();
                    self.migrate_type_pkeys(objtype, &spec)?;
                }
            }
        }

        // Local mappings referencing attributes the server no longer serves
        // are datamodel warnings; they clear once the mappings catch up.
        let reserved = reserved_context_vars();
        let mut warnings = Vec::new();
        for (objtype, mapping) in &self.mappings {
            let Some(type_schema) = schema.types.get(objtype) else {
                warnings.push(format!("type {objtype} is no longer served"));
                continue;
            };
            let mut missing = BTreeSet::new();
            for expr in mapping.values() {
                for var in expr.variables() {
                    if !reserved.contains(var) && !type_schema.hermes_attributes.contains(var) {
                        let _ = missing.insert(var.clone());
                    }
                }
            }
            if !missing.is_empty() {
                warnings.push(format!(
                    "{objtype}: attributes {missing:?} are not served anymore"
                ));
            }
        }
        if warnings.is_empty() {
            self.notifier.datamodel_warnings_cleared();
        } else {
            self.notifier.datamodel_warnings(warnings.join("\n"));
        }

        self.remote_schema = Some(schema);
        self.persist()
    }

    fn migrate_type_pkeys(&mut self, objtype: &str, spec: &PkeySpec) -> Result<(), Error> {
        // Re-key the remote mirror by re-projecting each object, keeping a
        // translation to re-key the local mirror (whose own attributes may
        // not contain the key components).
        let mut translation: Vec<(Pkey, Pkey)> = Vec::new();
        if let Some(list) = self.remotedata.get_mut(objtype) {
            let objects: Vec<DataObject> = list.iter().cloned().collect();
            let mut rekeyed = DataObjectList::new();
            for mut obj in objects {
                let old = obj.pkey.clone();
                if obj.rekey(spec)? {
                    translation.push((old, obj.pkey.clone()));
                    rekeyed.insert(obj);
                } else {
                    warn!(objtype = %objtype, pkey = %old, "object dropped, new key components missing");
                }
            }
            *list = rekeyed;
        }
        if let Some(list) = self.clientdata.get_mut(objtype) {
            let mut rekeyed = DataObjectList::new();
            for (old, new) in &translation {
                if let Some(obj) = list.get(old) {
                    rekeyed.insert(DataObject::new(new.clone(), obj.attrs().clone()));
                }
            }
            *list = rekeyed;
        }

        let (_, purged) = self.trashbin.migrate_pkeys(
            objtype,
            spec,
            self.purge_trashbin_on_pkey_change,
        )?;
        if purged > 0 {
            info!(objtype = %objtype, purged, "trashbin entries purged by key migration");
        }
        self.queue.migrate_pkeys(objtype, spec);
        Ok(())
    }

    /// Rebuilds the local mirror and queued events after a local mapping
    /// change: every object is re-evaluated, differences are delivered as
    /// modified events, queued events are rewritten (and dropped when they
    /// become no-ops).
    pub async fn resync_local_mappings(&mut self) -> Result<(), Error> {
        if !self.mapping_drift {
            return Ok(());
        }
        info!("local attribute mappings changed, resyncing mirror and queue");

        let types: Vec<TypeName> = self.mappings.keys().cloned().collect();
        for objtype in &types {
            let remote_objs: Vec<DataObject> = self
                .remotedata
                .get(objtype)
                .map(|l| l.iter().cloned().collect())
                .unwrap_or_default();
            for remote_obj in remote_objs {
                if self.queue.has_open_for(objtype, &remote_obj.pkey) {
                    continue;
                }
                let local_after = self.map_local(objtype, &remote_obj)?;
                let local_before = self
                    .clientdata
                    .get(objtype)
                    .and_then(|l| l.get(&remote_obj.pkey))
                    .cloned()
                    .unwrap_or_else(|| DataObject::new(remote_obj.pkey.clone(), IndexMap::new()));
                let diff = ObjectDiff::between(&local_before, &local_after);
                if diff.is_empty() {
                    continue;
                }
                let local_ev = Event::modified(
                    0,
                    objtype.clone(),
                    remote_obj.pkey.clone(),
                    diff,
                );
                let mut ctx = StepContext::new(0);
                match self.dispatch(objtype, &local_ev, &mut ctx).await {
                    Ok(()) => {
                        self.client_list(objtype).insert(local_after);
                    }
                    Err(e) => {
                        self.queue.push(QueueEntry {
                            ev_number: 0,
                            remote_ev: None,
                            local_ev: Some(local_ev),
                            err_msg: e.message,
                            retry_count: 0,
                            is_partially_processed: ctx.is_partially_processed(),
                            resume_step: ctx.completed(),
                            first_seen_at: Utc::now(),
                            last_retry_at: None,
                        });
                    }
                }
            }
        }

        // Queued events were mapped with the old expressions: rewrite their
        // local form from the retained server form.
        let Self {
            queue,
            engine,
            mappings,
            clientdata,
            ..
        } = self;
        queue.rewrite_local_events(|entry| {
            let remote_ev = entry.remote_ev.as_ref()?;
            let mapping = mappings.get(&remote_ev.objtype)?;
            let EventPayload::Full(attrs) = &remote_ev.attrs else {
                return None; // diff-only entries keep their local form
            };
            let remote_obj = DataObject::new(remote_ev.pkey.clone(), attrs.clone());
            let local_obj =
                map_local_with(engine, mapping, &remote_obj).ok()?;

            // A rewritten event that no longer changes anything is dropped.
            let current = clientdata
                .get(&remote_ev.objtype)
                .and_then(|l| l.get(&remote_ev.pkey));
            if let Some(current) = current {
                if matches!(remote_ev.kind, EventKind::Added | EventKind::Recycled)
                    && ObjectDiff::between(current, &local_obj).is_empty()
                {
                    return Some(None);
                }
            }
            let mut local_ev = remote_ev.clone();
            local_ev.attrs = EventPayload::Full(local_obj.attrs().clone());
            Some(Some(local_ev))
        });

        self.mapping_drift = false;
        self.persist()
    }

    /// Emits the queue-changed / queue-emptied notifications when the queue
    /// contents moved since the last poll.
    pub fn poll_notifications(&mut self) {
        if self.queue.take_changed() {
            let body = self
                .queue
                .entries()
                .map(|e| format!("#{} {}", e.ev_number, e.err_msg))
                .collect::<Vec<_>>()
                .join("\n");
            self.notifier.error_queue_changed(self.queue.is_empty(), body);
        }
    }

    /// Persists every piece of applier state.
    pub fn persist(&mut self) -> Result<(), Error> {
        self.store.save(SNAP_CLIENT_DATA, &self.clientdata)?;
        self.store.save(SNAP_REMOTE_DATA, &self.remotedata)?;
        self.store.save(SNAP_TRASHBIN, &self.trashbin)?;
        self.store.save(SNAP_QUEUE, &self.queue.snapshot())?;
        self.store.save(
            SNAP_META,
            &PersistedMeta {
                high_water: self.high_water,
                mapping_sources: self.mapping_sources.clone(),
                remote_schema: self.remote_schema.clone(),
            },
        )?;
        Ok(())
    }

    /// Consumes an event stream until it ends or `cancel` fires, retrying
    /// the queue and sweeping the trashbin on their own cadences.
    pub async fn run<S>(&mut self, events: S, cancel: CancellationToken) -> Result<(), Error>
    where
        S: Stream<Item = Result<Event, BoxError>> + Unpin,
    {
        self.resync_local_mappings().await?;

        let mut events = events;
        let mut retry_ticks = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("applier cancelled");
                    self.persist()?;
                    return Ok(());
                }
                next = events.next() => match next {
                    None => {
                        self.persist()?;
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        self.persist()?;
                        return Err(Error::Stream {
                            details: e.to_string(),
                        });
                    }
                    Some(Ok(ev)) => {
                        self.apply(ev).await?;
                        self.poll_notifications();
                        self.persist()?;
                    }
                },
                _ = retry_ticks.tick() => {
                    let now = Utc::now();
                    self.retry_queue(now).await?;
                    self.sweep_trashbin(now).await?;
                    self.poll_notifications();
                    self.persist()?;
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        objtype: &str,
        local_ev: &Event,
        ctx: &mut StepContext,
    ) -> Result<(), HandlerError> {
        let Some(handler) = self.handlers.get_mut(objtype) else {
            return Ok(());
        };
        match local_ev.kind {
            EventKind::Added => {
                let attrs = local_ev.attrs.to_attr_map();
                handler.on_added(&local_ev.pkey, &attrs, ctx).await
            }
            EventKind::Recycled => {
                let attrs = local_ev.attrs.to_attr_map();
                handler.on_recycled(&local_ev.pkey, &attrs, ctx).await
            }
            EventKind::Modified => {
                let diff = local_ev.attrs.as_diff().cloned().unwrap_or_default();
                handler.on_modified(&local_ev.pkey, &diff, ctx).await
            }
            EventKind::Trashed => {
                let attrs = local_ev.attrs.to_attr_map();
                handler.on_trashed(&local_ev.pkey, &attrs, ctx).await
            }
            EventKind::Removed => {
                let attrs = local_ev.attrs.to_attr_map();
                handler.on_removed(&local_ev.pkey, &attrs, ctx).await
            }
        }
    }

    fn enqueue_failure(
        &mut self,
        remote_ev: Event,
        local_ev: Event,
        e: HandlerError,
        ctx: &StepContext,
    ) {
        warn!(ev = remote_ev.ev_number, error = %e, "handler failed, event queued");
        self.queue.push(QueueEntry {
            ev_number: remote_ev.ev_number,
            remote_ev: Some(remote_ev),
            local_ev: Some(local_ev),
            err_msg: e.message,
            retry_count: 0,
            is_partially_processed: ctx.is_partially_processed(),
            resume_step: ctx.completed(),
            first_seen_at: Utc::now(),
            last_retry_at: None,
        });
    }

    fn map_local(&self, objtype: &str, remote_obj: &DataObject) -> Result<DataObject, Error> {
        let mapping = self
            .mappings
            .get(objtype)
            .expect("mapping exists for consumed types");
        map_local_with(&self.engine, mapping, remote_obj)
    }

    fn client_list(&mut self, objtype: &str) -> &mut DataObjectList {
        self.clientdata.entry(objtype.to_string()).or_default()
    }

    fn remote_list(&mut self, objtype: &str) -> &mut DataObjectList {
        self.remotedata.entry(objtype.to_string()).or_default()
    }
}

/// Evaluates a local attribute mapping over a server-side object.
fn map_local_with(
    engine: &Engine,
    mapping: &IndexMap<AttrName, Expression>,
    remote_obj: &DataObject,
) -> Result<DataObject, Error> {
    let row: serde_json::Map<String, Value> = remote_obj.to_native();
    let obj = DataObject::from_remote(
        remote_obj.pkey.clone(),
        &row,
        mapping,
        engine,
        &EvalContext::new(),
    )?;
    Ok(obj)
}

/// Applies a successfully retried event to a mirror list.
fn apply_event_to_list(list: &mut DataObjectList, ev: &Event) {
    match ev.kind {
        EventKind::Added | EventKind::Recycled => {
            list.insert(DataObject::new(ev.pkey.clone(), ev.attrs.to_attr_map()));
        }
        EventKind::Modified => {
            if let Some(diff) = ev.attrs.as_diff() {
                match list.get_mut(&ev.pkey) {
                    Some(obj) => obj.apply_diff(diff),
                    None => {
                        let mut obj = DataObject::new(ev.pkey.clone(), IndexMap::new());
                        obj.apply_diff(diff);
                        list.insert(obj);
                    }
                }
            }
        }
        EventKind::Removed | EventKind::Trashed => {
            let _ = list.remove(&ev.pkey);
        }
    }
}
