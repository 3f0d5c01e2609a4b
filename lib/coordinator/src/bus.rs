//! Event bus abstraction.
//!
//! Delivery is at-least-once with no ordering guarantee across topics.
//! Implementations validate every event before it leaves the process.

use crate::error::EventBusError;
use crate::events::{CoordinationEvent, Topic};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use rootcause::prelude::Report;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Stream of events delivered to a subscriber.
pub type EventStream = BoxStream<'static, CoordinationEvent>;

/// Publish/subscribe transport for coordination events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an event on its topic.
    ///
    /// # Errors
    ///
    /// Fails with [`EventBusError::InvalidEvent`] if the event does not
    /// validate, or [`EventBusError::PublishFailed`] if the transport refuses it.
    async fn publish(&self, event: CoordinationEvent) -> Result<(), Report<EventBusError>>;

    /// Subscribes to the given topics.
    async fn subscribe(&self, topics: &[Topic]) -> Result<EventStream, Report<EventBusError>>;
}

/// Rejects events that fail validation.
///
/// # Errors
///
/// Returns [`EventBusError::InvalidEvent`] naming the topic and the problem.
pub fn check_event(event: &CoordinationEvent) -> Result<(), EventBusError> {
    event.validate().map_err(|reason| EventBusError::InvalidEvent {
        topic: event.topic().as_str(),
        reason,
    })
}

/// In-process bus over a tokio broadcast channel.
///
/// Subscribers that fall behind lose the oldest events; the loss is logged.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl InMemoryEventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: CoordinationEvent) -> Result<(), Report<EventBusError>> {
        check_event(&event)?;
        // No receivers is not an error: nobody is listening on any topic yet.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<EventStream, Report<EventBusError>> {
        let topics = topics.to_vec();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let delivered = match item {
                Ok(event) if topics.contains(&event.topic()) => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                    None
                }
            };
            futures::future::ready(delivered)
        });
        Ok(stream.boxed())
    }
}
