//! Worker registry.
//!
//! The registry is the durable, cross-process view of the worker fleet. A
//! pluggable [`RegistryBackend`] stores one entry per worker under
//! `{key_prefix}.{worker_id}` with a per-entry expiry. [`WorkerRegistry`]
//! fronts the backend with a read cache that is fed by the backend's watch
//! stream and reconciled against a full `list` on every refresh tick.

pub mod memory;

use crate::config::RegistryConfig;
use crate::envelope::Envelope;
use crate::error::RegistryError;
use crate::worker::WorkerNode;
use async_trait::async_trait;
use flowgrid_core::WorkerId;
use futures::StreamExt;
use futures::stream::BoxStream;
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use memory::MemoryRegistryBackend;

/// A change observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// An entry was created or overwritten.
    Put { key: String, value: Vec<u8> },
    /// An entry was deleted or expired.
    Delete { key: String },
}

impl BackendEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Storage contract for registry entries.
///
/// Two shapes conform: a TTL-keyed store where entries expire unless
/// refreshed, and a lease-based service where register grants a lease and
/// refresh keeps it alive.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Stores `value` under `key`, expiring after `ttl` unless refreshed.
    async fn register(&self, key: &str, value: Vec<u8>, ttl: Duration)
    -> Result<(), Report<RegistryError>>;

    /// Removes `key`. Removing a missing key succeeds.
    async fn unregister(&self, key: &str) -> Result<(), Report<RegistryError>>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Report<RegistryError>>;

    /// Returns every live entry whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Report<RegistryError>>;

    /// Renews the expiry of `key` without rewriting it.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::NotFound`] if the entry is gone.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), Report<RegistryError>>;

    /// Streams changes to keys starting with `prefix`.
    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, BackendEvent>, Report<RegistryError>>;
}

/// A change to the registry's view of the fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(WorkerNode),
    Updated(WorkerNode),
    Removed(WorkerId),
}

/// Cache-fronted registry of worker records.
pub struct WorkerRegistry {
    backend: Arc<dyn RegistryBackend>,
    config: RegistryConfig,
    cache: Mutex<HashMap<WorkerId, WorkerNode>>,
    events: broadcast::Sender<RegistryEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn RegistryBackend>, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            backend,
            config,
            cache: Mutex::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Receives cache changes from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn prefix(&self) -> String {
        format!("{}.", self.config.key_prefix)
    }

    fn key_for(&self, worker_id: &WorkerId) -> String {
        format!("{}.{worker_id}", self.config.key_prefix)
    }

    fn worker_id_from_key(&self, key: &str) -> Option<WorkerId> {
        key.strip_prefix(&self.prefix())
            .filter(|id| !id.is_empty())
            .map(WorkerId::from)
    }

    fn encode(worker: &WorkerNode) -> Result<Vec<u8>, RegistryError> {
        Envelope::new(worker)
            .to_json_bytes()
            .map_err(|e| RegistryError::Serialization {
                details: e.to_string(),
            })
    }

    fn decode(bytes: &[u8]) -> Result<WorkerNode, RegistryError> {
        Envelope::<WorkerNode>::from_json_bytes(bytes)
            .map(Envelope::into_payload)
            .map_err(|e| RegistryError::Serialization {
                details: e.to_string(),
            })
    }

    /// Writes the worker record with the configured TTL and caches it.
    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    pub async fn register(&self, worker: &WorkerNode) -> Result<(), Report<RegistryError>> {
        let value = Self::encode(worker)?;
        self.backend
            .register(&self.key_for(&worker.id), value, self.config.entry_ttl())
            .await?;

        self.apply_put(worker.clone()).await;
        info!("worker registered in registry");
        Ok(())
    }

    /// Deletes the worker record and evicts it from the cache.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn unregister(&self, worker_id: &WorkerId) -> Result<(), Report<RegistryError>> {
        self.backend.unregister(&self.key_for(worker_id)).await?;
        self.apply_delete(worker_id).await;
        info!("worker removed from registry");
        Ok(())
    }

    /// Renews the worker's entry expiry.
    pub async fn refresh(&self, worker_id: &WorkerId) -> Result<(), Report<RegistryError>> {
        self.backend
            .refresh(&self.key_for(worker_id), self.config.entry_ttl())
            .await
    }

    /// Looks the worker up in the cache, falling back to the backend.
    pub async fn get(&self, worker_id: &WorkerId) -> Result<Option<WorkerNode>, Report<RegistryError>> {
        if let Some(worker) = self.cache.lock().await.get(worker_id) {
            return Ok(Some(worker.clone()));
        }

        let Some(bytes) = self.backend.get(&self.key_for(worker_id)).await? else {
            return Ok(None);
        };
        let worker = Self::decode(&bytes)?;
        self.cache
            .lock()
            .await
            .insert(worker.id.clone(), worker.clone());
        Ok(Some(worker))
    }

    /// Lists every worker stored in the backend.
    ///
    /// Entries that fail to decode are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<WorkerNode>, Report<RegistryError>> {
        let entries = self.backend.list(&self.prefix()).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, bytes)| match Self::decode(&bytes) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable registry entry");
                    None
                }
            })
            .collect())
    }

    /// Workers currently in the cache.
    pub async fn cached(&self) -> Vec<WorkerNode> {
        let mut workers: Vec<WorkerNode> = self.cache.lock().await.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Replaces the cache with a full listing, emitting the differences.
    pub async fn reconcile(&self) -> Result<(), Report<RegistryError>> {
        let listed = self.list().await?;

        let mut cache = self.cache.lock().await;
        let mut seen = HashMap::with_capacity(listed.len());
        for worker in listed {
            let event = match cache.get(&worker.id) {
                None => Some(RegistryEvent::Added(worker.clone())),
                Some(existing) if *existing != worker => Some(RegistryEvent::Updated(worker.clone())),
                Some(_) => None,
            };
            if let Some(event) = event {
                let _ = self.events.send(event);
            }
            seen.insert(worker.id.clone(), worker);
        }

        for gone in cache.keys().filter(|id| !seen.contains_key(*id)) {
            let _ = self.events.send(RegistryEvent::Removed(gone.clone()));
        }
        *cache = seen;
        debug!(workers = cache.len(), "registry cache reconciled");
        Ok(())
    }

    async fn apply_put(&self, worker: WorkerNode) {
        let mut cache = self.cache.lock().await;
        let event = match cache.insert(worker.id.clone(), worker.clone()) {
            None => Some(RegistryEvent::Added(worker)),
            Some(previous) if previous != worker => Some(RegistryEvent::Updated(worker)),
            Some(_) => None,
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    async fn apply_delete(&self, worker_id: &WorkerId) {
        if self.cache.lock().await.remove(worker_id).is_some() {
            let _ = self.events.send(RegistryEvent::Removed(worker_id.clone()));
        }
    }

    async fn apply_backend_event(&self, event: BackendEvent) {
        let Some(worker_id) = self.worker_id_from_key(event.key()) else {
            return;
        };
        match event {
            BackendEvent::Put { value, .. } => match Self::decode(&value) {
                Ok(worker) => self.apply_put(worker).await,
                Err(e) => warn!(worker_id = %worker_id, error = %e, "ignoring undecodable watch entry"),
            },
            BackendEvent::Delete { .. } => self.apply_delete(&worker_id).await,
        }
    }

    /// Starts the watch and poll tasks.
    ///
    /// The first poll runs immediately; a backend that is unreachable at
    /// startup leaves the cache empty until a later tick succeeds.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run_watch().await }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run_poll().await }));

        info!(prefix = %self.config.key_prefix, "worker registry started");
    }

    async fn run_watch(&self) {
        let prefix = self.prefix();
        loop {
            let stream = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                stream = self.backend.watch(&prefix) => stream,
            };

            match stream {
                Ok(mut stream) => loop {
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return,
                        next = stream.next() => match next {
                            Some(event) => self.apply_backend_event(event).await,
                            None => {
                                warn!("registry watch stream ended, re-establishing");
                                break;
                            }
                        },
                    }
                },
                Err(e) => warn!(error = %e, "registry watch failed"),
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.refresh_interval()) => {}
            }
        }
    }

    async fn run_poll(&self) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "registry poll failed");
                    }
                }
            }
        }
    }

    /// Stops the background tasks, waiting at most `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "registry tasks did not stop in time");
        }
        info!("worker registry stopped");
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
