//! Conveyor - pipeline orchestration for data transformation flows.
//!
//! Units of data (`DeltaFile`s) move through configured flows in three
//! stages (INGRESS, ENRICH, EGRESS), each stage fanning work out to
//! external action workers over a keyed queue. The core consumes worker
//! result events, advances a per-unit state machine, and persists every
//! transition with optimistic concurrency. Overflow work is cold-queued in
//! durable storage, fan-in points are coordinated through a locked join
//! store, and recovery sweeps re-push anything the queue lost.

pub mod admission;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod flows;
pub mod join;
pub mod observability;
pub mod queue;
pub mod requeue;
pub mod state_machine;
pub mod store;
pub mod types;

pub use backoff::{BackoffSpec, ResumePolicies, ResumePolicy};
pub use clock::{system_clock, Clock, FixedClock, SharedClock, SystemClock};
pub use config::{get_config, try_get_config, Config};
pub use dispatcher::{
    BatchResult, DispatchLoop, DispatcherConfig, EventDispatcher, IngressInput,
};
pub use error::{CoreError, Result};
pub use flows::{EgressFlow, EnrichFlow, FlowRegistry, IngressFlow, JoinSpec};
pub use join::{JoinConfig, JoinCoordinator, JoinDefinition, JoinReaper, JoinResolver};
pub use queue::{ActionEventQueue, HeartbeatMonitor, KeyedQueue, MemoryQueue, SharedQueue};
pub use requeue::{RequeueConfig, RequeueSweep, Requeuer};
pub use store::{
    JoinStore, MemoryJoinStore, MemoryUnitStore, PostgresJoinStore, PostgresUnitStore,
    StoreError, UnitStore,
};
pub use types::{ActionEvent, ActionInput, ActionState, ActionType, DeltaFile, EventKind, Stage};
