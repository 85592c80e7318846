//! Progress log module wiring.
//!
//! `lattice` holds the progress and tracker status enums, the four trackers
//! (`coordinate`, `disseminate`, `blocking`, `delegation`) plan remediations,
//! `state` and `shard` bundle them per transaction and per shard, `store` is
//! the serial shard executor, `remediation` runs planned work against the
//! `Remote`, and `registry` drives the periodic audit.

mod blocking;
mod config;
mod coordinate;
mod delegation;
mod disseminate;
mod lattice;
mod metrics;
mod node;
mod registry;
mod remediation;
mod shard;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod types;

pub use blocking::{BlockingSnapshot, BlockingTracker};
pub use config::{
    ProgressConfig, DEFAULT_FANOUT_CONCURRENCY, DEFAULT_REMOTE_TIMEOUT, DEFAULT_TICK_INTERVAL,
};
pub use coordinate::{CoordinateSnapshot, CoordinateTracker};
pub use delegation::{DelegationSnapshot, DelegationTracker};
pub use disseminate::{DisseminateSnapshot, DisseminateTracker};
pub use lattice::{
    CoordinateStatus, DelegationStatus, DisseminateStatus, Investigation, Progress, Resolution,
    TrackerKind,
};
pub use metrics::{ProgressMetrics, ProgressStats};
pub use node::Node;
pub use registry::ProgressLogRegistry;
pub use remediation::{Completion, CompletionOutcome, Dispatch, Remediation};
pub use shard::{ShardProgressLog, ShardProgressSnapshot};
pub use state::{TickOutcome, TransactionState, TxnProgressSnapshot};
pub use store::{CommandStore, SafeCommandStore};
pub use types::{
    Agent, Ballot, Command, Durability, Epoch, InformDurable, Known, KnownDefinition, KnownDeps,
    KnownExecuteAt, KnownOutcome, LoggingAgent, NodeId, Participants, ProgressToken, Range,
    Remote, Route, RouteKind, RoutingKey, ShardId, ShardRole, Status, Timestamp, Topology, TxnId,
    Unseekables,
};
