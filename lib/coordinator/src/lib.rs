//! Distributed work coordination for flowgrid.
//!
//! This crate provides:
//!
//! - **Workers**: the coordinator's view of a worker and its health state machine
//! - **Registry**: a TTL-keyed, watchable store of worker records
//! - **Coordinator**: assignment, failure detection, reassignment and load rebalancing
//! - **Distribution**: consistent-hash, range and modulo partitioning of work batches
//! - **Events**: the topics and payloads exchanged over the event bus
//! - **Agent**: the worker-side loop that executes nodes and sends heartbeats

pub mod agent;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod distributor;
pub mod envelope;
pub mod error;
pub mod events;
pub mod nats;
pub mod partition;
pub mod registry;
pub mod selection;
pub mod work;
pub mod worker;

pub use agent::WorkerAgent;
pub use bus::{EventBus, EventStream, InMemoryEventBus};
pub use config::{CoordinatorConfig, PartitionStrategyKind, RegistryConfig};
pub use coordinator::{Coordinator, ReassignmentSummary};
pub use distributor::{Partition, WorkDistributor};
pub use envelope::Envelope;
pub use error::{CoordinatorError, EventBusError, RegistryError};
pub use events::{
    CoordinationEvent, CoordinatorMetrics, ReassignReason, Topic, WorkAssigned, WorkCompleted,
    WorkReassigned, WorkerHeartbeat, WorkerRegistered, WorkerUnregistered,
};
pub use nats::{NatsEventBus, NatsKvRegistryBackend};
pub use partition::{ConsistentHash, ModuloHash, PartitionMap, PartitionStrategy, RangePartition};
pub use registry::{BackendEvent, MemoryRegistryBackend, RegistryBackend, RegistryEvent, WorkerRegistry};
pub use selection::{SelectionStrategy, WorkRequirements};
pub use work::{UnitOfWork, next_units};
pub use worker::{WorkerNode, WorkerStats, WorkerStatus};
