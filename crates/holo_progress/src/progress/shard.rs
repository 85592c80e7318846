//! The progress log of one shard replica.
//!
//! Protocol handlers record what they learn through the `on_*` entry points;
//! only `tick` ever starts remediation. Every method runs on the shard's
//! serial executor, reached through `SafeCommandStore`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::lattice::{CoordinateStatus, DelegationStatus, Investigation, Progress};
use super::remediation::{Completion, CompletionOutcome};
use super::state::{TickOutcome, TransactionState, TxnProgressSnapshot};
use super::types::{
    Command, Known, NodeId, RoutingKey, ShardId, ShardRole, Status, Topology, TxnId, Unseekables,
};

pub struct ShardProgressLog {
    shard_id: ShardId,
    node_id: NodeId,
    topology: Arc<dyn Topology>,
    states: HashMap<TxnId, TransactionState>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShardProgressSnapshot {
    pub shard_id: ShardId,
    pub node_id: NodeId,
    pub transactions: Vec<TxnProgressSnapshot>,
}

impl ShardProgressLog {
    pub fn new(shard_id: ShardId, node_id: NodeId, topology: Arc<dyn Topology>) -> Self {
        Self {
            shard_id,
            node_id,
            topology,
            states: HashMap::new(),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, txn_id: &TxnId) -> Option<&TransactionState> {
        self.states.get(txn_id)
    }

    pub fn txn_ids(&self) -> Vec<TxnId> {
        self.states.keys().copied().collect()
    }

    fn ensure(&mut self, txn_id: TxnId) -> &mut TransactionState {
        self.states
            .entry(txn_id)
            .or_insert_with(|| TransactionState::new(txn_id))
    }

    /// Feed knowledge implied by a status change into an existing blocking
    /// tracker; nobody is blocked on a transaction we are not tracking.
    fn record_known(&mut self, txn_id: TxnId, known: Known) {
        if let Some(blocking) = self
            .states
            .get_mut(&txn_id)
            .and_then(TransactionState::blocking_tracker_mut)
        {
            blocking.record_knowledge_advanced(known);
        }
    }

    pub fn on_witnessed(
        &mut self,
        txn_id: TxnId,
        home_key: &RoutingKey,
        role: ShardRole,
    ) -> anyhow::Result<()> {
        if role.is_home() {
            let state = self.ensure(txn_id);
            state.remember_home_key(Some(home_key));
            state
                .coordinate()
                .ensure_at_least(CoordinateStatus::Uncommitted, Progress::Expected);
        }
        Ok(())
    }

    pub fn on_pre_accepted(&mut self, command: &Command, role: ShardRole) -> anyhow::Result<()> {
        anyhow::ensure!(
            role.is_progress(),
            "pre-accept of {} recorded with indeterminate shard role",
            command.txn_id
        );
        let state = self.ensure(command.txn_id);
        state.remember_home_key(command.home_key.as_ref());
        if role.is_home() {
            state.coordinate().ensure_at_least_for(
                command,
                CoordinateStatus::Uncommitted,
                Progress::Expected,
            );
        } else {
            state.delegation(DelegationStatus::Unsafe);
        }
        Ok(())
    }

    pub fn on_accepted(&mut self, command: &Command, role: ShardRole) -> anyhow::Result<()> {
        self.ensure_safe_or_at_least(command, role, CoordinateStatus::Uncommitted, Progress::Expected)
    }

    pub fn on_committed(&mut self, command: &Command, role: ShardRole) -> anyhow::Result<()> {
        self.ensure_safe_or_at_least(
            command,
            role,
            CoordinateStatus::Committed,
            Progress::NoneExpected,
        )
    }

    pub fn on_ready_to_execute(&mut self, command: &Command, role: ShardRole) -> anyhow::Result<()> {
        self.ensure_safe_or_at_least(
            command,
            role,
            CoordinateStatus::ReadyToExecute,
            Progress::Expected,
        )
    }

    /// Only this shard's view: the home shard still cannot assume the
    /// transaction is durable everywhere.
    pub fn on_executed(&mut self, command: &Command, role: ShardRole) -> anyhow::Result<()> {
        self.record_known(command.txn_id, Known::PRE_APPLIED);
        self.ensure_safe_or_at_least(
            command,
            role,
            CoordinateStatus::ReadyToExecute,
            Progress::Expected,
        )
    }

    fn ensure_safe_or_at_least(
        &mut self,
        command: &Command,
        role: ShardRole,
        status: CoordinateStatus,
        progress: Progress,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            role.is_progress(),
            "{:?} of {} recorded with indeterminate shard role",
            status,
            command.txn_id
        );
        anyhow::ensure!(
            status <= CoordinateStatus::ReadyToExecute,
            "status events cannot move {} to {status:?}",
            command.txn_id
        );
        if status >= CoordinateStatus::Committed {
            self.record_known(command.txn_id, Known::COMMITTED);
        }

        let state = self.ensure(command.txn_id);
        state.remember_home_key(command.home_key.as_ref());
        if role.is_home() {
            state.coordinate().ensure_at_least_for(command, status, progress);
        } else {
            state.delegation(DelegationStatus::Safe);
        }
        Ok(())
    }

    /// Unlike the other status events, an indeterminate role is accepted:
    /// whatever local state exists is still settled.
    pub fn on_invalidated(&mut self, command: &Command, role: ShardRole) -> anyhow::Result<()> {
        let txn_id = command.txn_id;
        self.record_known(txn_id, Known::INVALIDATED);

        let has_coordinate = self
            .states
            .get(&txn_id)
            .is_some_and(|s| s.coordinate_tracker().is_some());
        anyhow::ensure!(
            role.is_home() || !has_coordinate,
            "{txn_id} has home-shard coordination state on a {role:?} shard"
        );

        if role.is_progress() {
            let state = self.ensure(txn_id);
            if role.is_home() {
                state.coordinate().ensure_at_least_for(
                    command,
                    CoordinateStatus::Done,
                    Progress::Done,
                );
            } else {
                state.delegation(DelegationStatus::Safe);
            }
        }
        Ok(())
    }

    /// Only the home shard disseminates durability.
    pub fn on_durable_locally(&mut self, txn_id: TxnId, role: ShardRole) {
        if !role.is_home() {
            return;
        }
        let node_id = self.node_id;
        self.ensure(txn_id).disseminate().record_durable_locally(node_id);
    }

    /// The transaction is durable across the cluster. `persisted_on` names
    /// the replicas already known to hold the outcome. Every shard that has
    /// not applied it must learn the outcome; only the home shard stops
    /// coordinating and starts announcing.
    pub fn on_durable_globally(
        &mut self,
        command: &Command,
        persisted_on: Option<BTreeSet<NodeId>>,
        role: ShardRole,
    ) -> anyhow::Result<()> {
        let txn_id = command.txn_id;
        if !command.has_been(Status::PreApplied) {
            let mut keys = command.max_unseekables();
            if keys.is_empty() {
                if let Some(home_key) = self.states.get(&txn_id).and_then(|s| s.home_key()) {
                    keys = keys.with_key(home_key.clone());
                }
            }
            self.record_blocking(txn_id, Known::PRE_APPLIED, &keys)?;
        }
        if !role.is_home() {
            return Ok(());
        }

        let topology = self.topology.clone();
        let state = self.ensure(txn_id);
        state.coordinate().record_durable_globally();
        state
            .disseminate()
            .record_durable_globally(command, topology.as_ref(), persisted_on);
        Ok(())
    }

    /// Some other replica reported the transaction durable; this replica must
    /// learn the outcome itself.
    pub fn on_durable_elsewhere(
        &mut self,
        txn_id: TxnId,
        unseekables: &Unseekables,
        role: ShardRole,
    ) -> anyhow::Result<()> {
        tracing::trace!(%txn_id, ?role, "durable elsewhere");
        self.record_blocking(txn_id, Known::PRE_APPLIED, unseekables)
    }

    /// A local transaction cannot execute until `blocked_by` is known to at
    /// least `blocked_until` over `blocked_on`. Blocking is tracked on any
    /// shard, whatever its role.
    pub fn on_waiting_on_dependency(
        &mut self,
        blocked_by: TxnId,
        blocked_until: Known,
        blocked_on: &Unseekables,
        role: ShardRole,
    ) -> anyhow::Result<()> {
        tracing::trace!(txn_id = %blocked_by, ?role, "waiting on dependency");
        self.record_blocking(blocked_by, blocked_until, blocked_on)
    }

    /// Rejected records leave no state behind.
    fn record_blocking(
        &mut self,
        txn_id: TxnId,
        required: Known,
        keys: &Unseekables,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!keys.is_empty(), "{txn_id} cannot block on an empty key set");
        self.ensure(txn_id).blocking().record_blocking(required, keys)
    }

    /// Audit one transaction. Untracked ids yield nothing.
    pub fn tick(&mut self, command: &Command) -> anyhow::Result<TickOutcome> {
        let topology = self.topology.clone();
        match self.states.get_mut(&command.txn_id) {
            Some(state) => state.on_tick(command, topology.as_ref()),
            None => Ok(TickOutcome::default()),
        }
    }

    pub fn complete(
        &mut self,
        txn_id: TxnId,
        tag: Investigation,
        completion: Completion,
    ) -> anyhow::Result<CompletionOutcome> {
        match self.states.get_mut(&txn_id) {
            Some(state) => state.complete(tag, completion),
            None => Ok(CompletionOutcome::stale()),
        }
    }

    pub fn snapshot(&self) -> ShardProgressSnapshot {
        let mut transactions: Vec<_> = self.states.values().map(TransactionState::snapshot).collect();
        transactions.sort_by_key(|t| t.txn_id);
        ShardProgressSnapshot {
            shard_id: self.shard_id,
            node_id: self.node_id,
            transactions,
        }
    }
}
