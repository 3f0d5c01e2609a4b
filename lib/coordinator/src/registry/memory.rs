//! Lease-based in-memory registry backend.
//!
//! Registering grants a lease for the entry's TTL; refreshing keeps the
//! lease alive. Expired leases are swept on every access and their keys
//! are reported as deletes on the watch stream.

use super::{BackendEvent, RegistryBackend};
use crate::error::RegistryError;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use rootcause::prelude::Report;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

type LeaseId = u64;

#[derive(Debug)]
struct Lease {
    expires_at: Instant,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: LeaseId,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

impl State {
    fn grant(&mut self, ttl: Duration, now: Instant) -> LeaseId {
        self.next_lease += 1;
        self.leases.insert(
            self.next_lease,
            Lease {
                expires_at: now + ttl,
            },
        );
        self.next_lease
    }

    /// Drops expired leases and their keys, returning the deleted keys.
    fn sweep(&mut self, now: Instant) -> Vec<String> {
        self.leases.retain(|_, lease| lease.expires_at > now);
        let leases = &self.leases;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !leases.contains_key(&entry.lease))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }
}

/// In-process backend with explicit leases.
#[derive(Debug)]
pub struct MemoryRegistryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<BackendEvent>,
}

impl MemoryRegistryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Expires overdue leases now, returning how many keys were removed.
    pub async fn sweep(&self) -> usize {
        let expired = self.state.lock().await.sweep(Instant::now());
        let count = expired.len();
        self.notify_deleted(expired);
        count
    }

    fn notify_deleted(&self, keys: Vec<String>) {
        for key in keys {
            let _ = self.events.send(BackendEvent::Delete { key });
        }
    }
}

impl Default for MemoryRegistryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistryBackend {
    async fn register(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), Report<RegistryError>> {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock().await;
            let expired = state.sweep(now);
            let lease = state.grant(ttl, now);
            if let Some(previous) = state.entries.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    lease,
                },
            ) {
                state.leases.remove(&previous.lease);
            }
            expired
        };
        self.notify_deleted(expired);
        let _ = self.events.send(BackendEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn unregister(&self, key: &str) -> Result<(), Report<RegistryError>> {
        let (expired, removed) = {
            let mut state = self.state.lock().await;
            let expired = state.sweep(Instant::now());
            let removed = state.entries.remove(key);
            if let Some(entry) = &removed {
                state.leases.remove(&entry.lease);
            }
            (expired, removed.is_some())
        };
        self.notify_deleted(expired);
        if removed {
            let _ = self.events.send(BackendEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Report<RegistryError>> {
        let (expired, value) = {
            let mut state = self.state.lock().await;
            let expired = state.sweep(Instant::now());
            (expired, state.entries.get(key).map(|e| e.value.clone()))
        };
        self.notify_deleted(expired);
        Ok(value)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Report<RegistryError>> {
        let (expired, entries) = {
            let mut state = self.state.lock().await;
            let expired = state.sweep(Instant::now());
            let entries = state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect();
            (expired, entries)
        };
        self.notify_deleted(expired);
        Ok(entries)
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), Report<RegistryError>> {
        let now = Instant::now();
        let (expired, found) = {
            let mut state = self.state.lock().await;
            let expired = state.sweep(now);
            let lease = state.entries.get(key).map(|e| e.lease);
            let found = match lease.and_then(|id| state.leases.get_mut(&id)) {
                Some(lease) => {
                    lease.expires_at = now + ttl;
                    true
                }
                None => false,
            };
            (expired, found)
        };
        self.notify_deleted(expired);

        if !found {
            return Err(RegistryError::NotFound {
                key: key.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, BackendEvent>, Report<RegistryError>> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            let event = item.ok().filter(|event| event.key().starts_with(&prefix));
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }
}
