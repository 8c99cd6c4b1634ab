// SPDX-License-Identifier: Apache-2.0

//! The event transport contract.

use async_trait::async_trait;
use futures::stream::BoxStream;
use syncflow_model::Event;

use crate::adapter::BoxError;

/// A stream of events as delivered to a subscriber.
pub type EventStream = BoxStream<'static, Result<Event, BoxError>>;

/// Contract between the engine and the message bus.
///
/// `publish` returning `Ok` is the acknowledgement: the event (and every
/// event before it) has been reliably accepted by the bus. Encoding of the
/// frame on the wire is the transport's business; payload semantics are
/// defined by [`Event`].
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publishes one event and waits for the bus acknowledgement.
    async fn publish(&self, event: &Event) -> Result<(), BoxError>;

    /// Subscribes to the ordered event stream.
    async fn subscribe(&self) -> Result<EventStream, BoxError>;
}
