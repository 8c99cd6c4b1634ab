// SPDX-License-Identifier: Apache-2.0

//! The event producer: diffs the consolidated view against the cache,
//! emits ordered events, and advances the cache only after the transport
//! acknowledged everything.
//!
//! Failure semantics:
//! - transport failure: the pass is aborted; the cache is not advanced past
//!   the last fully acknowledged type, so the next pass re-emits what was
//!   lost (at-least-once);
//! - commit failures: logged and ignored, the cache is authoritative.

use std::sync::Arc;

use indexmap::IndexMap;
use syncflow_config::TypeName;
use syncflow_model::{DataObject, DataObjectList, Event};
use syncflow_state::SnapshotStore;
use tracing::{debug, info, warn};

use crate::datamodel::Datamodel;
use crate::error::Error;
use crate::transport::EventTransport;

const EV_COUNTER_SNAPSHOT: &str = "ev_number";

fn cache_snapshot_name(objtype: &str) -> String {
    format!("cache_{objtype}")
}

/// Per-type change counts of one pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeChanges {
    /// Objects that appeared.
    pub added: usize,
    /// Objects whose attributes changed.
    pub modified: usize,
    /// Objects that disappeared.
    pub removed: usize,
}

/// Outcome of one consolidation pass.
#[derive(Debug, Default)]
pub struct PassSummary {
    /// Changes per type, in schema order.
    pub per_type: IndexMap<TypeName, TypeChanges>,
    /// Total number of events emitted.
    pub events: usize,
}

/// Emits change events over the transport and owns cache persistence.
pub struct EventProducer {
    transport: Arc<dyn EventTransport>,
    store: SnapshotStore,
    ev_number: u64,
    initial_sync_pending: bool,
}

impl EventProducer {
    /// Creates a producer, resuming the event counter persisted with the
    /// cache so that numbering stays monotonic across restarts.
    pub fn new(transport: Arc<dyn EventTransport>, store: SnapshotStore) -> Result<Self, Error> {
        let ev_number = store.load::<u64>(EV_COUNTER_SNAPSHOT)?.unwrap_or(0);
        Ok(Self {
            transport,
            store,
            ev_number,
            initial_sync_pending: false,
        })
    }

    /// The last event number handed out.
    #[must_use]
    pub const fn last_ev_number(&self) -> u64 {
        self.ev_number
    }

    /// Requests an initial-sync pass: the next pass emits the full
    /// consolidated view as a synthetic `added` stream instead of a diff,
    /// then normal diff emission resumes.
    pub fn request_initial_sync(&mut self) {
        self.initial_sync_pending = true;
    }

    /// Loads the persisted cache snapshots into the datamodel.
    pub fn load_cache_into(&self, dm: &mut Datamodel) -> Result<(), Error> {
        let types: Vec<TypeName> = dm.schema().types.keys().cloned().collect();
        for objtype in types {
            if let Some(list) = self
                .store
                .load::<DataObjectList>(&cache_snapshot_name(&objtype))?
            {
                debug!(objtype = %objtype, objects = list.len(), "cache snapshot loaded");
                let _ = dm.cache.insert(objtype, list);
            }
        }
        Ok(())
    }

    /// Runs one full pass: fetch and consolidate, then per type (in schema
    /// order) emit `added`, `modified`, `removed` events, advance the cache
    /// once the transport acknowledged them, and run the commit queries.
    pub async fn run_pass(&mut self, dm: &mut Datamodel) -> Result<PassSummary, Error> {
        dm.fetch().await?;

        let initial_sync = std::mem::take(&mut self.initial_sync_pending);
        let types: Vec<TypeName> = dm.schema().types.keys().cloned().collect();
        let mut summary = PassSummary::default();

        for objtype in &types {
            let schema = &dm.schema().types[objtype];
            let unemitted = schema.unemitted_attributes();
            let new_list = dm.data.get(objtype).cloned().unwrap_or_default();
            let cache_list = dm.cache.get(objtype).cloned().unwrap_or_default();

            let mut changes = TypeChanges::default();
            let mut events = Vec::new();
            let mut committable = Vec::new();

            if initial_sync {
                for obj in new_list.iter() {
                    self.ev_number += 1;
                    events.push(Event::added(
                        self.ev_number,
                        objtype.clone(),
                        &strip_attrs(obj, &unemitted),
                    ));
                    committable.push(obj.clone());
                    changes.added += 1;
                }
            } else {
                let diff = new_list.diff_from(&cache_list);
                for obj in &diff.added {
                    self.ev_number += 1;
                    events.push(Event::added(
                        self.ev_number,
                        objtype.clone(),
                        &strip_attrs(obj, &unemitted),
                    ));
                    committable.push(obj.clone());
                    changes.added += 1;
                }
                for (pkey, obj_diff) in &diff.modified {
                    // Cache-only attributes still update the cache but never
                    // travel; a diff reduced to nothing emits nothing.
                    let emitted = obj_diff.without_attrs(&unemitted);
                    if emitted.is_empty() {
                        continue;
                    }
                    self.ev_number += 1;
                    events.push(Event::modified(
                        self.ev_number,
                        objtype.clone(),
                        pkey.clone(),
                        emitted,
                    ));
                    if let Some(obj) = new_list.get(pkey) {
                        committable.push(obj.clone());
                    }
                    changes.modified += 1;
                }
                for obj in &diff.removed {
                    self.ev_number += 1;
                    events.push(Event::removed(
                        self.ev_number,
                        objtype.clone(),
                        &strip_attrs(obj, &unemitted),
                    ));
                    committable.push(obj.clone());
                    changes.removed += 1;
                }
            }

            for event in &events {
                self.transport
                    .publish(event)
                    .await
                    .map_err(|e| Error::TransportFailure {
                        details: e.to_string(),
                    })?;
            }

            // Everything up to here is acknowledged: advance and persist the
            // cache, then the event counter.
            let _ = dm.cache.insert(objtype.clone(), new_list.clone());
            self.store.save(&cache_snapshot_name(objtype), &new_list)?;
            self.store.save(EV_COUNTER_SNAPSHOT, &self.ev_number)?;

            for obj in &committable {
                if let Err(e) = dm.commit_one(objtype, obj).await {
                    warn!(objtype = %objtype, pkey = %obj.pkey, error = %e, "commit_one failed");
                }
            }
            if let Err(e) = dm.commit_all(objtype).await {
                warn!(objtype = %objtype, error = %e, "commit_all failed");
            }

            if !events.is_empty() {
                info!(
                    objtype = %objtype,
                    added = changes.added,
                    modified = changes.modified,
                    removed = changes.removed,
                    "events emitted"
                );
            }
            summary.events += events.len();
            let _ = summary.per_type.insert(objtype.clone(), changes);
        }

        Ok(summary)
    }
}

fn strip_attrs(obj: &DataObject, unemitted: &std::collections::BTreeSet<String>) -> DataObject {
    let mut stripped = obj.clone();
    for attr in unemitted {
        stripped.unset(attr);
    }
    stripped
}
