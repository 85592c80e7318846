//! Home-shard dissemination of durability.
//!
//! Once a transaction is durable, every replica spanning its proposal and
//! execution epochs should learn so, letting them stop tracking it. The set
//! of replicas can only be computed once the command is pre-committed with a
//! full route and the execution epoch is known; until then updates queue.

use std::collections::BTreeSet;

use anyhow::anyhow;
use serde::Serialize;

use super::lattice::{DisseminateStatus, Generation, Investigation, Progress, Resolution, TrackerKind};
use super::remediation::{Dispatch, Remediation};
use super::types::{Command, Durability, InformDurable, NodeId, Status, Topology, TxnId};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ReadySets {
    not_aware_of_durability: BTreeSet<NodeId>,
    not_persisted: BTreeSet<NodeId>,
}

/// Update waiting for the node sets to be computed.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Deferred {
    Persisted(BTreeSet<NodeId>),
    DurableLocally(NodeId),
}

#[derive(Clone, Debug)]
pub struct DisseminateTracker {
    status: DisseminateStatus,
    progress: Progress,
    ready: Option<ReadySets>,
    deferred: Vec<Deferred>,
    generation: Generation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisseminateSnapshot {
    pub status: DisseminateStatus,
    pub progress: Progress,
    pub ready: bool,
    pub not_aware_of_durability: Vec<NodeId>,
    pub not_persisted: Vec<NodeId>,
    pub deferred: usize,
    pub generation: u64,
}

impl Default for DisseminateTracker {
    fn default() -> Self {
        Self {
            status: DisseminateStatus::NotExecuted,
            progress: Progress::NoneExpected,
            ready: None,
            deferred: Vec::new(),
            generation: Generation::default(),
        }
    }
}

impl DisseminateTracker {
    pub fn status(&self) -> DisseminateStatus {
        self.status
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_some()
    }

    pub fn not_aware_of_durability(&self) -> Option<&BTreeSet<NodeId>> {
        self.ready.as_ref().map(|r| &r.not_aware_of_durability)
    }

    pub fn not_persisted(&self) -> Option<&BTreeSet<NodeId>> {
        self.ready.as_ref().map(|r| &r.not_persisted)
    }

    /// Compute the node sets if the command and topology now allow it, then
    /// run anything that queued while waiting.
    fn maybe_ready(&mut self, command: &Command, topology: &dyn Topology) -> bool {
        if self.ready.is_some() {
            return true;
        }
        if !command.has_been(Status::PreCommitted) {
            return false;
        }
        let Some(route) = command.route.as_ref().filter(|r| r.is_full()) else {
            return false;
        };
        let Some(execute_at) = command.execute_at else {
            return false;
        };
        if !topology.has_epoch(execute_at.epoch) {
            return false;
        }

        let nodes = topology.precise_nodes(route, command.txn_id.epoch(), execute_at.epoch);
        self.ready = Some(ReadySets {
            not_aware_of_durability: nodes.clone(),
            not_persisted: nodes,
        });
        for action in std::mem::take(&mut self.deferred) {
            self.apply(action);
        }
        true
    }

    fn when_ready(&mut self, readiness: Option<(&Command, &dyn Topology)>, action: Deferred) {
        let ready = match readiness {
            Some((command, topology)) => self.maybe_ready(command, topology),
            None => self.ready.is_some(),
        };
        if ready {
            self.apply(action);
        } else {
            self.deferred.push(action);
        }
    }

    fn apply(&mut self, action: Deferred) {
        let Some(ready) = self.ready.as_mut() else {
            return;
        };
        match action {
            Deferred::Persisted(nodes) => {
                ready.not_persisted.retain(|n| !nodes.contains(n));
                ready.not_aware_of_durability.retain(|n| !nodes.contains(n));
            }
            Deferred::DurableLocally(node) => {
                ready.not_persisted.remove(&node);
                ready.not_aware_of_durability.remove(&node);
            }
        }
        self.maybe_done();
    }

    fn maybe_done(&mut self) {
        if self
            .ready
            .as_ref()
            .is_some_and(|r| r.not_aware_of_durability.is_empty())
        {
            self.status = DisseminateStatus::Done;
            self.progress = Progress::Done;
        }
    }

    pub fn record_durable_globally(
        &mut self,
        command: &Command,
        topology: &dyn Topology,
        persisted_on: Option<BTreeSet<NodeId>>,
    ) {
        if self.status == DisseminateStatus::Done {
            return;
        }
        self.status = DisseminateStatus::Durable;
        self.progress = Progress::Expected;
        if let Some(nodes) = persisted_on {
            self.when_ready(Some((command, topology)), Deferred::Persisted(nodes));
        }
    }

    pub fn record_durable_locally(&mut self, self_id: NodeId) {
        if self.status == DisseminateStatus::Done {
            return;
        }
        self.status = DisseminateStatus::Durable;
        self.progress = Progress::Expected;
        self.when_ready(None, Deferred::DurableLocally(self_id));
    }

    pub fn on_tick(
        &mut self,
        txn_id: TxnId,
        command: &Command,
        topology: &dyn Topology,
    ) -> anyhow::Result<Option<Dispatch>> {
        match self.status {
            DisseminateStatus::NotExecuted | DisseminateStatus::Done => return Ok(None),
            DisseminateStatus::Durable => {}
        }

        if !self.maybe_ready(command, topology) {
            return Ok(None);
        }

        if self.progress != Progress::NoProgress {
            self.progress = self.progress.advance();
            return Ok(None);
        }

        self.progress = Progress::Investigating;
        let to = match self.ready.as_ref() {
            Some(ready) if !ready.not_aware_of_durability.is_empty() => {
                ready.not_aware_of_durability.clone()
            }
            _ => {
                self.status = DisseminateStatus::Done;
                self.progress = Progress::Done;
                return Ok(None);
            }
        };

        // Readiness guarantees both of these.
        let route = command
            .route
            .clone()
            .ok_or_else(|| anyhow!("ready txn {txn_id} lost its route"))?;
        let execute_at = command
            .execute_at
            .ok_or_else(|| anyhow!("ready txn {txn_id} lost its executeAt"))?;

        let tag = self.generation.begin(TrackerKind::Disseminate);
        Ok(Some(Dispatch {
            txn_id,
            tag,
            remediation: Remediation::AnnounceDurable {
                to,
                message: InformDurable {
                    txn_id,
                    route,
                    execute_at,
                    durability: Durability::Durable,
                },
            },
        }))
    }

    /// A replica confirmed it knows the transaction is durable. Always safe to
    /// apply, whichever announcement round it answers.
    pub fn on_acknowledged(&mut self, from: NodeId) -> Resolution {
        if self.status == DisseminateStatus::Done {
            return Resolution::Stale;
        }
        let Some(ready) = self.ready.as_mut() else {
            return Resolution::Stale;
        };
        ready.not_aware_of_durability.remove(&from);
        self.maybe_done();
        Resolution::Resolved(())
    }

    /// Every target of a round has answered or failed; anyone still unaware
    /// is retried after the usual quiet period.
    pub fn on_round_finished(&mut self, tag: Investigation) -> Resolution {
        if self.progress != Progress::Investigating || !self.generation.is_current(tag) {
            return Resolution::Stale;
        }
        self.progress = Progress::Expected;
        Resolution::Resolved(())
    }

    pub fn snapshot(&self) -> DisseminateSnapshot {
        let (aware, persisted) = match &self.ready {
            Some(ready) => (
                ready.not_aware_of_durability.iter().copied().collect(),
                ready.not_persisted.iter().copied().collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        DisseminateSnapshot {
            status: self.status,
            progress: self.progress,
            ready: self.ready.is_some(),
            not_aware_of_durability: aware,
            not_persisted: persisted,
            deferred: self.deferred.len(),
            generation: self.generation.current(),
        }
    }
}
