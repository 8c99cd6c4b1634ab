// SPDX-License-Identifier: Apache-2.0

//! The server loop: interval-driven consolidation passes with a hard
//! per-pass deadline and cooperative cancellation.
//!
//! One pass is a critical section: no event is emitted outside of
//! [`EventProducer::run_pass`], and the loop never overlaps two passes.
//! Cancellation takes effect at the next suspension point (an adapter call,
//! a transport send, a cache write); dropping the pass future there leaves
//! the cache in its last durable state.

use syncflow_config::ScheduleConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datamodel::Datamodel;
use crate::error::Error;
use crate::producer::EventProducer;

/// The consolidation server: datamodel + producer driven by a tick loop.
pub struct Server {
    datamodel: Datamodel,
    producer: EventProducer,
    schedule: ScheduleConfig,
    cancel: CancellationToken,
}

impl Server {
    /// Assembles a server; the cache snapshots are loaded into the
    /// datamodel immediately.
    pub fn new(
        mut datamodel: Datamodel,
        producer: EventProducer,
        schedule: ScheduleConfig,
    ) -> Result<Self, Error> {
        producer.load_cache_into(&mut datamodel)?;
        Ok(Self {
            datamodel,
            producer,
            schedule,
            cancel: CancellationToken::new(),
        })
    }

    /// A token that stops the loop; already-durable state is untouched.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Direct access to the datamodel (status endpoints, tests).
    #[must_use]
    pub const fn datamodel(&self) -> &Datamodel {
        &self.datamodel
    }

    /// Direct access to the producer (initial-sync requests).
    pub fn producer_mut(&mut self) -> &mut EventProducer {
        &mut self.producer
    }

    /// Runs one pass immediately, honoring the pass deadline.
    pub async fn run_once(&mut self) -> Result<(), Error> {
        let deadline = self.schedule.pass_deadline;
        let pass = self.producer.run_pass(&mut self.datamodel);
        match tokio::time::timeout(deadline, pass).await {
            Err(_) => {
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "pass deadline exceeded, abandoning pass"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(summary)) => {
                debug!(events = summary.events, "pass complete");
                Ok(())
            }
        }
    }

    /// Runs passes until cancelled. Runtime errors abort the current pass
    /// and are retried on the next tick; they never kill the loop.
    pub async fn run(&mut self) -> Result<(), Error> {
        let mut ticks = tokio::time::interval(self.schedule.update_interval);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("server loop cancelled");
                    return Ok(());
                }
                _ = ticks.tick() => {
                    let cancel = self.cancel.clone();
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("server loop cancelled mid-pass");
                            return Ok(());
                        }
                        result = self.run_once() => {
                            if let Err(e) = result {
                                warn!(error = %e, "pass failed, retrying on next tick");
                            }
                        }
                    }
                }
            }
        }
    }
}
