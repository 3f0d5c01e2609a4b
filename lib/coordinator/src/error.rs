//! Error types for the coordinator crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `RegistryError`: registry backend and cache operations
//! - `EventBusError`: publishing and subscribing on the event bus
//! - `CoordinatorError`: assignment and worker lifecycle (wraps lower errors via context)

use flowgrid_core::{ExecutionId, WorkerId};
use std::fmt;

/// Errors from the worker registry and its backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The backend could not be reached.
    ConnectionFailed { details: String },
    /// A backend request failed.
    RequestFailed { operation: &'static str, details: String },
    /// A backend request did not finish in time.
    Timeout { operation: &'static str },
    /// No live entry exists under the key.
    NotFound { key: String },
    /// A stored record could not be encoded or decoded.
    Serialization { details: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { details } => {
                write!(f, "registry connection failed: {details}")
            }
            Self::RequestFailed { operation, details } => {
                write!(f, "registry {operation} failed: {details}")
            }
            Self::Timeout { operation } => write!(f, "registry {operation} timed out"),
            Self::NotFound { key } => write!(f, "no registry entry for {key}"),
            Self::Serialization { details } => {
                write!(f, "registry record serialization failed: {details}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors from event bus operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// The event failed validation and was not published.
    InvalidEvent { topic: &'static str, reason: String },
    /// Failed to publish.
    PublishFailed { topic: &'static str, details: String },
    /// Failed to subscribe.
    SubscribeFailed { details: String },
}

impl fmt::Display for EventBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEvent { topic, reason } => {
                write!(f, "invalid {topic} event: {reason}")
            }
            Self::PublishFailed { topic, details } => {
                write!(f, "publish to {topic} failed: {details}")
            }
            Self::SubscribeFailed { details } => write!(f, "subscribe failed: {details}"),
        }
    }
}

impl std::error::Error for EventBusError {}

/// Errors returned by the coordinator's request surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// No Active worker has spare capacity and the required tags.
    NoSuitableWorker { execution_id: ExecutionId },
    /// The worker is not known to this coordinator.
    UnknownWorker { worker_id: WorkerId },
    /// The worker record is unusable (e.g. zero capacity, empty ID).
    InvalidWorker { worker_id: WorkerId, reason: String },
    /// Registering the worker with the registry failed (context wrapper).
    Registration { worker_id: WorkerId },
    /// Unregistering the worker from the registry failed (context wrapper).
    Unregistration { worker_id: WorkerId },
    /// Starting the coordinator's background tasks failed (context wrapper).
    Startup,
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuitableWorker { execution_id } => {
                write!(f, "no suitable worker for execution {execution_id}")
            }
            Self::UnknownWorker { worker_id } => write!(f, "unknown worker: {worker_id}"),
            Self::InvalidWorker { worker_id, reason } => {
                write!(f, "invalid worker {worker_id}: {reason}")
            }
            Self::Registration { worker_id } => {
                write!(f, "registration failed for worker {worker_id}")
            }
            Self::Unregistration { worker_id } => {
                write!(f, "unregistration failed for worker {worker_id}")
            }
            Self::Startup => write!(f, "coordinator startup failed"),
        }
    }
}

impl std::error::Error for CoordinatorError {}
