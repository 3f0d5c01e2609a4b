//! NATS-backed event bus and registry backend.
//!
//! - Events go out on core NATS subjects named after their topic
//!   (`worker.heartbeat`, `work.assigned`, ...), JSON in a versioned envelope.
//! - Registry entries live in a JetStream key-value bucket whose `max_age`
//!   is the entry TTL, so an entry that stops being refreshed disappears.

use crate::bus::{EventBus, EventStream, check_event};
use crate::envelope::Envelope;
use crate::error::{EventBusError, RegistryError};
use crate::events::{CoordinationEvent, Topic};
use crate::registry::{BackendEvent, RegistryBackend};
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use rootcause::prelude::Report;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bucket holding worker records.
pub const DEFAULT_REGISTRY_BUCKET: &str = "flowgrid-workers";

/// Event bus over core NATS subjects.
#[derive(Debug, Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
}

impl NatsEventBus {
    #[must_use]
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    fn decode(payload: &[u8]) -> Option<CoordinationEvent> {
        match Envelope::<CoordinationEvent>::from_json_bytes(payload) {
            Ok(envelope) => Some(envelope.into_payload()),
            Err(e) => {
                warn!(error = %e, "dropping undecodable event");
                None
            }
        }
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: CoordinationEvent) -> Result<(), Report<EventBusError>> {
        check_event(&event)?;
        let topic = event.topic().as_str();
        let bytes = Envelope::new(&event)
            .to_json_bytes()
            .map_err(|e| EventBusError::PublishFailed {
                topic,
                details: format!("failed to serialize event: {e}"),
            })?;

        self.client
            .publish(topic, bytes.into())
            .await
            .map_err(|e| EventBusError::PublishFailed {
                topic,
                details: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<EventStream, Report<EventBusError>> {
        let mut subscribers = Vec::with_capacity(topics.len());
        for topic in topics {
            let subscriber = self.client.subscribe(topic.as_str()).await.map_err(|e| {
                EventBusError::SubscribeFailed {
                    details: format!("{topic}: {e}"),
                }
            })?;
            subscribers.push(subscriber.boxed());
        }

        let stream = futures::stream::select_all(subscribers)
            .filter_map(|message| futures::future::ready(Self::decode(&message.payload)));
        Ok(stream.boxed())
    }
}

/// TTL-keyed registry backend on a JetStream key-value bucket.
///
/// The bucket's `max_age` bounds every entry's lifetime; `refresh` re-puts
/// the current value to restart the clock. The per-call `ttl` must match
/// the bucket's and is only checked in debug logs.
pub struct NatsKvRegistryBackend {
    store: kv::Store,
    ttl: Duration,
}

impl NatsKvRegistryBackend {
    /// Opens (or creates) the bucket.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ConnectionFailed`] if the bucket cannot be created.
    pub async fn new(
        client: async_nats::Client,
        bucket: &str,
        ttl: Duration,
    ) -> Result<Self, Report<RegistryError>> {
        let jetstream = jetstream::new(client);
        let store = jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                max_age: ttl,
                ..Default::default()
            })
            .await
            .map_err(|e| RegistryError::ConnectionFailed {
                details: format!("failed to create bucket {bucket}: {e}"),
            })?;

        Ok(Self { store, ttl })
    }

    fn check_ttl(&self, key: &str, ttl: Duration) {
        if ttl != self.ttl {
            debug!(key, requested = ?ttl, bucket = ?self.ttl, "bucket max_age overrides requested ttl");
        }
    }

    fn failed(operation: &'static str, e: impl std::fmt::Display) -> RegistryError {
        RegistryError::RequestFailed {
            operation,
            details: e.to_string(),
        }
    }
}

impl std::fmt::Debug for NatsKvRegistryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsKvRegistryBackend")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RegistryBackend for NatsKvRegistryBackend {
    async fn register(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), Report<RegistryError>> {
        self.check_ttl(key, ttl);
        self.store
            .put(key, value.into())
            .await
            .map_err(|e| Self::failed("register", e))?;
        Ok(())
    }

    async fn unregister(&self, key: &str) -> Result<(), Report<RegistryError>> {
        self.store
            .delete(key)
            .await
            .map_err(|e| Self::failed("unregister", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Report<RegistryError>> {
        let value = self
            .store
            .get(key)
            .await
            .map_err(|e| Self::failed("get", e))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Report<RegistryError>> {
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| Self::failed("list", e))?
            .boxed();

        let mut entries = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| Self::failed("list", e))?;
            if !key.starts_with(prefix) {
                continue;
            }
            // The entry may expire between listing and reading.
            if let Some(value) = self.get(&key).await? {
                entries.push((key, value));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), Report<RegistryError>> {
        self.check_ttl(key, ttl);
        let Some(value) = self.get(key).await? else {
            return Err(RegistryError::NotFound {
                key: key.to_string(),
            }
            .into());
        };
        self.store
            .put(key, value.into())
            .await
            .map_err(|e| Self::failed("refresh", e))?;
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, BackendEvent>, Report<RegistryError>> {
        let watch = self
            .store
            .watch(format!("{prefix}>"))
            .await
            .map_err(|e| Self::failed("watch", e))?;

        let stream = watch.filter_map(|entry| {
            let event = match entry {
                Ok(entry) => Some(match entry.operation {
                    kv::Operation::Put => BackendEvent::Put {
                        key: entry.key,
                        value: entry.value.to_vec(),
                    },
                    kv::Operation::Delete | kv::Operation::Purge => {
                        BackendEvent::Delete { key: entry.key }
                    }
                }),
                Err(e) => {
                    warn!(error = %e, "registry watch entry failed");
                    None
                }
            };
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }
}
