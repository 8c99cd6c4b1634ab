// SPDX-License-Identifier: Apache-2.0

//! In-memory source adapter and event transport for tests.
//!
//! The source serves canned rows keyed by the rendered query string and
//! records every write query it receives, so tests can assert both the data
//! path and the commit path. The transport collects published events and
//! replays them to subscribers in order.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use syncflow_model::Event;
use tokio::sync::mpsc;

use crate::adapter::{BoxError, Row, SourceAdapter};
use crate::transport::{EventStream, EventTransport};

/// One recorded write query.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    /// `add`, `delete` or `modify`.
    pub querytype: String,
    /// The rendered query string.
    pub query: String,
    /// The rendered query variables.
    pub vars: Value,
}

/// A source adapter backed by canned rows.
#[derive(Debug, Default)]
pub struct InMemorySource {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    commits: Mutex<Vec<RecordedQuery>>,
    opens: AtomicU64,
    closes: AtomicU64,
    failing: AtomicBool,
}

impl InMemorySource {
    /// An empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rows returned for a query string. Rows must be JSON objects.
    pub fn set_rows(&self, query: &str, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .map(|v| match v {
                Value::Object(map) => map,
                other => panic!("rows must be JSON objects, got {other}"),
            })
            .collect();
        let mut tables = self.tables.lock().expect("tables lock");
        let _ = tables.insert(query.to_string(), rows);
    }

    /// Makes every subsequent query fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The write queries recorded so far.
    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedQuery> {
        self.commits.lock().expect("commits lock").clone()
    }

    /// Number of `open` calls.
    #[must_use]
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of `close` calls; always matches [`InMemorySource::opens`]
    /// when the engine honors the scoped-resource contract.
    #[must_use]
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            Err("injected source failure".into())
        } else {
            Ok(())
        }
    }

    fn record(&self, querytype: &str, query: &str, vars: &Value) {
        self.commits.lock().expect("commits lock").push(RecordedQuery {
            querytype: querytype.to_string(),
            query: query.to_string(),
            vars: vars.clone(),
        });
    }
}

#[async_trait]
impl SourceAdapter for InMemorySource {
    async fn open(&self) -> Result<(), BoxError> {
        let _ = self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        let _ = self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self, query: &str, _vars: &Value) -> Result<Vec<Row>, BoxError> {
        self.check_failing()?;
        let tables = self.tables.lock().expect("tables lock");
        Ok(tables.get(query).cloned().unwrap_or_default())
    }

    async fn add(&self, query: &str, vars: &Value) -> Result<(), BoxError> {
        self.check_failing()?;
        self.record("add", query, vars);
        Ok(())
    }

    async fn delete(&self, query: &str, vars: &Value) -> Result<(), BoxError> {
        self.check_failing()?;
        self.record("delete", query, vars);
        Ok(())
    }

    async fn modify(&self, query: &str, vars: &Value) -> Result<(), BoxError> {
        self.check_failing()?;
        self.record("modify", query, vars);
        Ok(())
    }
}

/// An in-memory event bus: publishes append to a log, subscribers get the
/// log replayed then live events.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    published: Mutex<Vec<Event>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    failing: AtomicBool,
}

impl InMemoryTransport {
    /// An empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail until cleared; queued events are
    /// unaffected.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every event published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().expect("published lock").clone()
    }
}

#[async_trait]
impl EventTransport for InMemoryTransport {
    async fn publish(&self, event: &Event) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("injected transport failure".into());
        }
        self.published
            .lock()
            .expect("published lock")
            .push(event.clone());
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, BoxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in self.published.lock().expect("published lock").iter() {
            let _ = tx.send(event.clone());
        }
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        });
        Ok(stream.boxed())
    }
}
