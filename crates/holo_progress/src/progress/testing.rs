//! Fixtures shared by the unit tests.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::types::{
    Ballot, Command, Durability, Epoch, NodeId, Route, RoutingKey, Status, Timestamp, Topology,
    TxnId, Unseekables,
};

pub(crate) fn txn(hlc: u64) -> TxnId {
    TxnId::new(1, hlc, 1)
}

/// Pre-accepted, with neither route nor home key known.
pub(crate) fn uncommitted_command(txn_id: TxnId) -> Command {
    Command {
        status: Status::PreAccepted,
        ..Command::not_witnessed(txn_id)
    }
}

/// Committed at epoch 1 with a full route over key `a`, homed on `home`.
pub(crate) fn pre_committed_command(txn_id: TxnId) -> Command {
    let home = RoutingKey::from("home");
    Command {
        txn_id,
        status: Status::Committed,
        durability: Durability::NotDurable,
        route: Some(Route::full(home.clone(), Unseekables::of_keys(["a"]))),
        home_key: Some(home),
        execute_at: Some(Timestamp::new(1, txn_id.hlc + 1, 1)),
        promised: Ballot::zero(),
        accepted: Ballot::zero(),
    }
}

/// Every epoch up to `current` is known; every route maps to all nodes.
pub(crate) struct StaticTopology {
    current: Epoch,
    nodes: BTreeSet<NodeId>,
}

impl StaticTopology {
    pub(crate) fn new(current: Epoch, nodes: &[NodeId]) -> Self {
        Self {
            current,
            nodes: nodes.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl Topology for StaticTopology {
    fn has_epoch(&self, epoch: Epoch) -> bool {
        epoch <= self.current
    }

    fn current_epoch(&self) -> Epoch {
        self.current
    }

    fn precise_nodes(&self, _route: &Route, _from: Epoch, _to: Epoch) -> BTreeSet<NodeId> {
        self.nodes.clone()
    }
}
