//! Shared types for the progress log.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the trackers, the shard executor, and the collaborator layers that
//! plug recovery, fetch and messaging into it.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

/// Logical node identifier.
pub type NodeId = u64;
/// Identifier of one command store (shard replica) on a node.
pub type ShardId = u64;
/// Topology epoch.
pub type Epoch = u64;

/// Hybrid-logical timestamp, totally ordered by epoch, clock, then node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Timestamp {
    pub epoch: Epoch,
    pub hlc: u64,
    pub node_id: NodeId,
}

impl Timestamp {
    pub const fn new(epoch: Epoch, hlc: u64, node_id: NodeId) -> Self {
        Self {
            epoch,
            hlc,
            node_id,
        }
    }
}

/// Unique transaction identifier assigned by the proposing node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TxnId {
    pub epoch: Epoch,
    pub hlc: u64,
    pub node_id: NodeId,
}

impl TxnId {
    pub const fn new(epoch: Epoch, hlc: u64, node_id: NodeId) -> Self {
        Self {
            epoch,
            hlc,
            node_id,
        }
    }

    /// Epoch the transaction was proposed in.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn as_timestamp(&self) -> Timestamp {
        Timestamp::new(self.epoch, self.hlc, self.node_id)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.epoch, self.hlc, self.node_id)
    }
}

/// Ballot used to order competing recovery attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Ballot {
    pub counter: u64,
    pub node_id: NodeId,
}

impl Ballot {
    pub const ZERO: Ballot = Ballot::zero();

    pub const fn zero() -> Self {
        Self {
            counter: 0,
            node_id: 0,
        }
    }

    pub const fn new(counter: u64, node_id: NodeId) -> Self {
        Self { counter, node_id }
    }
}

impl Default for Ballot {
    fn default() -> Self {
        Self::zero()
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.counter, self.node_id).cmp(&(other.counter, other.node_id))
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Key used to address the shards owning part of a transaction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RoutingKey(pub Vec<u8>);

impl RoutingKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

impl From<&str> for RoutingKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for RoutingKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Half-open key range `[start, end)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Range {
    start: RoutingKey,
    end: RoutingKey,
}

impl Range {
    pub fn new(start: impl Into<RoutingKey>, end: impl Into<RoutingKey>) -> anyhow::Result<Self> {
        let start = start.into();
        let end = end.into();
        anyhow::ensure!(start < end, "range start {start:?} must be below end {end:?}");
        Ok(Self { start, end })
    }

    pub fn start(&self) -> &RoutingKey {
        &self.start
    }

    pub fn end(&self) -> &RoutingKey {
        &self.end
    }

    pub fn contains(&self, key: &RoutingKey) -> bool {
        *key >= self.start && *key < self.end
    }
}

/// Keys and ranges a transaction touches, without the data needed to execute
/// against them.
///
/// Ranges are kept sorted and coalesced so that equal coverage compares equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Unseekables {
    keys: BTreeSet<RoutingKey>,
    ranges: Vec<Range>,
}

impl Unseekables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<RoutingKey>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ranges: Vec::new(),
        }
    }

    pub fn of_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = Range>,
    {
        Self {
            keys: BTreeSet::new(),
            ranges: coalesce(ranges.into_iter().collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.ranges.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RoutingKey> {
        self.keys.iter()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn contains_key(&self, key: &RoutingKey) -> bool {
        self.keys.contains(key) || self.ranges.iter().any(|r| r.contains(key))
    }

    pub fn union(&self, other: &Unseekables) -> Unseekables {
        let mut keys = self.keys.clone();
        keys.extend(other.keys.iter().cloned());
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().cloned());
        Unseekables {
            keys,
            ranges: coalesce(ranges),
        }
    }

    /// Any routing key that intersects this set: the lowest key, or the start
    /// of the lowest range when only ranges are present.
    pub fn some_intersecting_key(&self) -> Option<RoutingKey> {
        self.keys
            .iter()
            .next()
            .or_else(|| self.ranges.first().map(Range::start))
            .cloned()
    }

    pub fn with_key(&self, key: RoutingKey) -> Unseekables {
        let mut out = self.clone();
        if !out.contains_key(&key) {
            out.keys.insert(key);
        }
        out
    }
}

fn coalesce(mut ranges: Vec<Range>) -> Vec<Range> {
    ranges.sort_by(|a, b| a.start.cmp(&b.start));
    let mut out: Vec<Range> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last) if range.start <= last.end => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => out.push(range),
        }
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RouteKind {
    /// Covers every participant of the transaction.
    Full,
    /// Covers only the participants known to this replica.
    Partial,
}

/// Participants of a transaction together with its home key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Route {
    pub home_key: RoutingKey,
    pub kind: RouteKind,
    pub participants: Unseekables,
}

impl Route {
    pub fn full(home_key: RoutingKey, participants: Unseekables) -> Self {
        let participants = participants.with_key(home_key.clone());
        Self {
            home_key,
            kind: RouteKind::Full,
            participants,
        }
    }

    pub fn partial(home_key: RoutingKey, participants: Unseekables) -> Self {
        Self {
            home_key,
            kind: RouteKind::Partial,
            participants,
        }
    }

    pub fn is_full(&self) -> bool {
        self.kind == RouteKind::Full
    }

    /// A full route already covers everything; a partial route grows.
    pub fn union(&self, other: &Unseekables) -> Route {
        match self.kind {
            RouteKind::Full => self.clone(),
            RouteKind::Partial => Route {
                home_key: self.home_key.clone(),
                kind: RouteKind::Partial,
                participants: self.participants.union(other),
            },
        }
    }
}

/// Addressable participants for a fetch or invalidation: either a route
/// (which carries a home key) or a bare set of keys/ranges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Participants {
    Route(Route),
    Unseekables(Unseekables),
}

impl Participants {
    pub fn merge(route: Option<&Route>, others: &Unseekables) -> Participants {
        match route {
            Some(route) => Participants::Route(route.union(others)),
            None => Participants::Unseekables(others.clone()),
        }
    }

    /// The route's home key when known, otherwise any intersecting key.
    pub fn some_key(&self) -> Option<RoutingKey> {
        match self {
            Participants::Route(route) => Some(route.home_key.clone()),
            Participants::Unseekables(keys) => keys.some_intersecting_key(),
        }
    }

    pub fn with_key(&self, key: RoutingKey) -> Participants {
        match self {
            Participants::Route(route) => Participants::Route(Route {
                participants: route.participants.with_key(key),
                ..route.clone()
            }),
            Participants::Unseekables(keys) => Participants::Unseekables(keys.with_key(key)),
        }
    }

    pub fn unseekables(&self) -> &Unseekables {
        match self {
            Participants::Route(route) => &route.participants,
            Participants::Unseekables(keys) => keys,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unseekables().is_empty()
    }
}

/// Replicated phase of a command, in protocol order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Status {
    NotWitnessed,
    PreAccepted,
    AcceptedInvalidate,
    Accepted,
    PreCommitted,
    Committed,
    ReadyToExecute,
    PreApplied,
    Applied,
    Invalidated,
}

impl Status {
    pub fn has_been(self, phase: Status) -> bool {
        self >= phase
    }

    /// Knowledge a replica holds once it has reached this phase.
    pub fn known(self) -> Known {
        match self {
            Status::NotWitnessed | Status::AcceptedInvalidate => Known::NOTHING,
            Status::PreAccepted | Status::Accepted => Known::PROPOSED,
            Status::PreCommitted => Known::EXECUTE_AT,
            Status::Committed | Status::ReadyToExecute => Known::COMMITTED,
            Status::PreApplied | Status::Applied => Known::PRE_APPLIED,
            Status::Invalidated => Known::INVALIDATED,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Durability {
    #[default]
    NotDurable,
    /// Persisted by this replica only.
    Local,
    /// Persisted by a quorum of every shard involved.
    Durable,
}

impl Durability {
    pub fn is_durable(self) -> bool {
        self == Durability::Durable
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum KnownDefinition {
    #[default]
    Unknown,
    Known,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum KnownExecuteAt {
    #[default]
    Unknown,
    Proposed,
    Decided,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum KnownDeps {
    #[default]
    Unknown,
    Proposed,
    Decided,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum KnownOutcome {
    #[default]
    Unknown,
    Apply,
    Invalidated,
}

/// How much of a transaction's definition and outcome is known locally.
///
/// Each component is a chain; the whole is their product lattice. An
/// invalidated transaction satisfies any requirement since there is nothing
/// left to learn about it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Known {
    pub definition: KnownDefinition,
    pub execute_at: KnownExecuteAt,
    pub deps: KnownDeps,
    pub outcome: KnownOutcome,
}

impl Known {
    pub const NOTHING: Known = Known {
        definition: KnownDefinition::Unknown,
        execute_at: KnownExecuteAt::Unknown,
        deps: KnownDeps::Unknown,
        outcome: KnownOutcome::Unknown,
    };
    pub const DEFINITION: Known = Known {
        definition: KnownDefinition::Known,
        ..Known::NOTHING
    };
    pub const PROPOSED: Known = Known {
        definition: KnownDefinition::Known,
        execute_at: KnownExecuteAt::Proposed,
        deps: KnownDeps::Proposed,
        outcome: KnownOutcome::Unknown,
    };
    pub const EXECUTE_AT: Known = Known {
        execute_at: KnownExecuteAt::Decided,
        ..Known::NOTHING
    };
    pub const COMMITTED: Known = Known {
        definition: KnownDefinition::Known,
        execute_at: KnownExecuteAt::Decided,
        deps: KnownDeps::Decided,
        outcome: KnownOutcome::Unknown,
    };
    /// Minimum knowledge needed to apply the transaction locally.
    pub const PRE_APPLIED: Known = Known {
        outcome: KnownOutcome::Apply,
        ..Known::COMMITTED
    };
    pub const INVALIDATED: Known = Known {
        outcome: KnownOutcome::Invalidated,
        ..Known::NOTHING
    };

    pub fn merge(self, other: Known) -> Known {
        Known {
            definition: self.definition.max(other.definition),
            execute_at: self.execute_at.max(other.execute_at),
            deps: self.deps.max(other.deps),
            outcome: self.outcome.max(other.outcome),
        }
    }

    /// True when `other` knows at least as much as `self` requires.
    pub fn is_satisfied_by(self, other: Known) -> bool {
        if other.is_invalidated() {
            return true;
        }
        self.definition <= other.definition
            && self.execute_at <= other.execute_at
            && self.deps <= other.deps
            && self.outcome <= other.outcome
    }

    pub fn is_definition_known(self) -> bool {
        self.definition == KnownDefinition::Known
    }

    pub fn is_invalidated(self) -> bool {
        self.outcome == KnownOutcome::Invalidated
    }
}

/// Mergeable snapshot of what recovery attempts have observed, used so a
/// later attempt never regresses what an earlier one learned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ProgressToken {
    pub durability: Durability,
    pub status: Status,
    pub promised: Ballot,
    pub accepted: Ballot,
}

impl ProgressToken {
    pub const NONE: ProgressToken = ProgressToken {
        durability: Durability::NotDurable,
        status: Status::NotWitnessed,
        promised: Ballot::ZERO,
        accepted: Ballot::ZERO,
    };

    pub fn new(durability: Durability, status: Status, promised: Ballot, accepted: Ballot) -> Self {
        Self {
            durability,
            status,
            promised,
            accepted,
        }
    }

    pub fn merge(self, other: ProgressToken) -> ProgressToken {
        ProgressToken {
            durability: self.durability.max(other.durability),
            status: self.status.max(other.status),
            promised: self.promised.max(other.promised),
            accepted: self.accepted.max(other.accepted),
        }
    }
}

impl Default for ProgressToken {
    fn default() -> Self {
        Self::NONE
    }
}

/// What this shard is to a transaction for progress purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ShardRole {
    /// Owns the transaction's home key and its long-term liveness.
    Home,
    /// Participates but relies on the home shard for liveness.
    NonHome,
    /// The replica cannot yet tell which of the above it is.
    Indeterminate,
}

impl ShardRole {
    pub fn is_home(self) -> bool {
        self == ShardRole::Home
    }

    pub fn is_progress(self) -> bool {
        self != ShardRole::Indeterminate
    }
}

/// Local record of one transaction within one shard, as seen by the trackers.
///
/// Owned and mutated by the command store; trackers only read snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub txn_id: TxnId,
    pub status: Status,
    pub durability: Durability,
    pub route: Option<Route>,
    pub home_key: Option<RoutingKey>,
    pub execute_at: Option<Timestamp>,
    pub promised: Ballot,
    pub accepted: Ballot,
}

impl Command {
    pub fn not_witnessed(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            status: Status::NotWitnessed,
            durability: Durability::NotDurable,
            route: None,
            home_key: None,
            execute_at: None,
            promised: Ballot::zero(),
            accepted: Ballot::zero(),
        }
    }

    pub fn has_been(&self, phase: Status) -> bool {
        self.status.has_been(phase)
    }

    pub fn known(&self) -> Known {
        self.status.known()
    }

    pub fn has(&self, required: Known) -> bool {
        required.is_satisfied_by(self.known())
    }

    /// Durability only ever increases.
    pub fn set_durability(&mut self, durability: Durability) {
        self.durability = self.durability.max(durability);
    }

    pub fn progress_token(&self) -> ProgressToken {
        ProgressToken::new(self.durability, self.status, self.promised, self.accepted)
    }

    /// Widest participant set known for this command.
    pub fn max_unseekables(&self) -> Unseekables {
        match (&self.route, &self.home_key) {
            (Some(route), _) => route.participants.clone(),
            (None, Some(home_key)) => Unseekables::of_keys([home_key.clone()]),
            (None, None) => Unseekables::new(),
        }
    }
}

/// Announcement that a transaction is durable, sent to every replica of the
/// shards spanning its proposal and execution epochs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InformDurable {
    pub txn_id: TxnId,
    pub route: Route,
    pub execute_at: Timestamp,
    pub durability: Durability,
}

/// Read-only view of cluster membership across epochs.
#[async_trait]
pub trait Topology: Send + Sync + 'static {
    fn has_epoch(&self, epoch: Epoch) -> bool;

    fn current_epoch(&self) -> Epoch;

    /// Every replica of every shard the route touches in `[from, to]`.
    fn precise_nodes(&self, route: &Route, from: Epoch, to: Epoch) -> BTreeSet<NodeId>;

    /// Resolve once `epoch` is known locally.
    async fn await_epoch(&self, epoch: Epoch) -> anyhow::Result<()> {
        anyhow::ensure!(self.has_epoch(epoch), "epoch {epoch} is not known locally");
        Ok(())
    }
}

/// Remote operations a progress log can initiate.
///
/// The progress log is transport-agnostic; concrete implementations run the
/// actual recovery/fetch/invalidate coordinators or test harnesses.
#[async_trait]
pub trait Remote: Send + Sync + 'static {
    /// Run a higher-ballot consensus round for a stalled transaction.
    async fn recover(
        &self,
        txn_id: TxnId,
        home_key: RoutingKey,
        route: Option<Route>,
        seed: ProgressToken,
    ) -> anyhow::Result<ProgressToken>;

    /// Fetch at least `required` knowledge of `txn_id` from its replicas.
    async fn fetch(
        &self,
        required: Known,
        txn_id: TxnId,
        participants: Participants,
        execute_at: Option<Timestamp>,
        epoch: Epoch,
    ) -> anyhow::Result<Known>;

    /// Propose that `txn_id` be formally invalidated.
    async fn invalidate(
        &self,
        txn_id: TxnId,
        participants: Participants,
    ) -> anyhow::Result<ProgressToken>;

    /// Make sure a quorum of the home shard knows about `txn_id`.
    async fn inform_home(&self, txn_id: TxnId, home_key: RoutingKey) -> anyhow::Result<()>;

    async fn inform_durable(&self, target: NodeId, req: InformDurable) -> anyhow::Result<()>;
}

/// Process-wide sink for failures that escaped a shard task.
pub trait Agent: Send + Sync + 'static {
    fn on_uncaught_error(&self, shard_id: ShardId, err: anyhow::Error);
}

/// Agent that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingAgent;

impl Agent for LoggingAgent {
    fn on_uncaught_error(&self, shard_id: ShardId, err: anyhow::Error) {
        tracing::error!(shard_id, error = ?err, "uncaught progress log failure");
    }
}
