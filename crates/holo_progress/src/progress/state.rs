//! Per-transaction bundle of trackers on one shard.

use serde::Serialize;

use super::blocking::{BlockingSnapshot, BlockingTracker};
use super::coordinate::{CoordinateSnapshot, CoordinateTracker};
use super::delegation::{DelegationSnapshot, DelegationTracker};
use super::disseminate::{DisseminateSnapshot, DisseminateTracker};
use super::lattice::{DelegationStatus, Investigation, Resolution, TrackerKind};
use super::remediation::{Completion, CompletionOutcome, Dispatch};
use super::types::{Command, RoutingKey, Topology, TxnId};

/// Trackers are created on first use and never removed.
#[derive(Clone, Debug)]
pub struct TransactionState {
    txn_id: TxnId,
    home_key: Option<RoutingKey>,
    coordinate: Option<CoordinateTracker>,
    disseminate: Option<DisseminateTracker>,
    blocking: Option<BlockingTracker>,
    delegation: Option<DelegationTracker>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxnProgressSnapshot {
    pub txn_id: TxnId,
    pub home_key: Option<RoutingKey>,
    pub coordinate: Option<CoordinateSnapshot>,
    pub disseminate: Option<DisseminateSnapshot>,
    pub blocking: Option<BlockingSnapshot>,
    pub delegation: Option<DelegationSnapshot>,
}

/// Result of auditing one transaction: remediations to launch, plus the
/// errors of any trackers that failed along the way.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub dispatches: Vec<Dispatch>,
    pub errors: Vec<anyhow::Error>,
}

impl TickOutcome {
    fn collect(&mut self, planned: anyhow::Result<Option<Dispatch>>) {
        match planned {
            Ok(dispatch) => self.dispatches.extend(dispatch),
            Err(err) => self.errors.push(err),
        }
    }
}

impl TransactionState {
    pub fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            home_key: None,
            coordinate: None,
            disseminate: None,
            blocking: None,
            delegation: None,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn home_key(&self) -> Option<&RoutingKey> {
        self.home_key.as_ref()
    }

    pub(crate) fn remember_home_key(&mut self, home_key: Option<&RoutingKey>) {
        if self.home_key.is_none() {
            self.home_key = home_key.cloned();
        }
    }

    pub fn coordinate(&mut self) -> &mut CoordinateTracker {
        self.coordinate.get_or_insert_with(CoordinateTracker::default)
    }

    pub fn disseminate(&mut self) -> &mut DisseminateTracker {
        self.disseminate.get_or_insert_with(DisseminateTracker::default)
    }

    pub fn blocking(&mut self) -> &mut BlockingTracker {
        self.blocking.get_or_insert_with(BlockingTracker::default)
    }

    /// Delegation tracker raised to at least `status`.
    pub fn delegation(&mut self, status: DelegationStatus) -> &mut DelegationTracker {
        let tracker = self
            .delegation
            .get_or_insert_with(|| DelegationTracker::new(status));
        tracker.ensure_at_least(status);
        tracker
    }

    pub fn coordinate_tracker(&self) -> Option<&CoordinateTracker> {
        self.coordinate.as_ref()
    }

    pub fn disseminate_tracker(&self) -> Option<&DisseminateTracker> {
        self.disseminate.as_ref()
    }

    pub fn blocking_tracker(&self) -> Option<&BlockingTracker> {
        self.blocking.as_ref()
    }

    pub(crate) fn blocking_tracker_mut(&mut self) -> Option<&mut BlockingTracker> {
        self.blocking.as_mut()
    }

    pub fn delegation_tracker(&self) -> Option<&DelegationTracker> {
        self.delegation.as_ref()
    }

    pub(crate) fn check_txn(&self, txn_id: TxnId) -> anyhow::Result<()> {
        anyhow::ensure!(
            txn_id == self.txn_id,
            "event for {txn_id} delivered to progress state of {}",
            self.txn_id
        );
        Ok(())
    }

    /// Re-evaluate every tracker against the latest command, in a fixed order.
    /// A tracker that fails does not stop the others from being audited.
    pub fn on_tick(
        &mut self,
        command: &Command,
        topology: &dyn Topology,
    ) -> anyhow::Result<TickOutcome> {
        self.check_txn(command.txn_id)?;
        let txn_id = self.txn_id;
        let mut outcome = TickOutcome::default();

        if let Some(blocking) = self.blocking.as_mut() {
            outcome.collect(blocking.on_tick(txn_id, command, topology));
        }
        if let Some(coordinate) = self.coordinate.as_mut() {
            outcome.collect(coordinate.on_tick(txn_id, command, self.home_key.as_ref()));
        }
        if let Some(disseminate) = self.disseminate.as_mut() {
            outcome.collect(disseminate.on_tick(txn_id, command, topology));
        }
        if let Some(delegation) = self.delegation.as_mut() {
            outcome.collect(delegation.on_tick(txn_id, command, self.home_key.as_ref()));
        }
        Ok(outcome)
    }

    /// Route a remediation's completion to the tracker that dispatched it.
    pub fn complete(
        &mut self,
        tag: Investigation,
        completion: Completion,
    ) -> anyhow::Result<CompletionOutcome> {
        let txn_id = self.txn_id;
        let outcome = match (tag.tracker, completion) {
            (TrackerKind::Coordinate, Completion::Recovered(result)) => {
                match self.coordinate.as_mut().map(|c| c.on_recovered(tag, result)) {
                    Some(Resolution::Resolved(durable_globally)) => CompletionOutcome {
                        durable_globally,
                        ..CompletionOutcome::resolved()
                    },
                    _ => CompletionOutcome::stale(),
                }
            }
            (TrackerKind::Coordinate, Completion::Fetched(result)) => {
                if let Err(err) = &result {
                    tracing::debug!(%txn_id, error = ?err, "fetch to apply failed");
                }
                resolution(self.coordinate.as_mut().map(|c| c.on_fetched(tag)))
            }
            (TrackerKind::Blocking, Completion::Fetched(result)) => match self.blocking.as_mut() {
                Some(blocking) => match blocking.on_fetched(txn_id, tag, result)? {
                    Resolution::Resolved(followup) => CompletionOutcome {
                        followup,
                        ..CompletionOutcome::resolved()
                    },
                    Resolution::Stale => CompletionOutcome::stale(),
                },
                None => CompletionOutcome::stale(),
            },
            (TrackerKind::Blocking, Completion::Invalidated(result)) => {
                resolution(self.blocking.as_mut().map(|b| b.on_invalidated(tag, result)))
            }
            (TrackerKind::Disseminate, Completion::DurabilityAcknowledged(from)) => {
                resolution(self.disseminate.as_mut().map(|d| d.on_acknowledged(from)))
            }
            (TrackerKind::Disseminate, Completion::AnnouncementRoundFinished) => {
                resolution(self.disseminate.as_mut().map(|d| d.on_round_finished(tag)))
            }
            (TrackerKind::Delegation, Completion::InformedHome(result)) => {
                resolution(self.delegation.as_mut().map(|d| d.on_informed(tag, &result)))
            }
            (tracker, completion) => {
                anyhow::bail!("{tracker:?} tracker of {txn_id} cannot apply {completion:?}")
            }
        };
        Ok(outcome)
    }

    pub fn snapshot(&self) -> TxnProgressSnapshot {
        TxnProgressSnapshot {
            txn_id: self.txn_id,
            home_key: self.home_key.clone(),
            coordinate: self.coordinate.as_ref().map(CoordinateTracker::snapshot),
            disseminate: self.disseminate.as_ref().map(DisseminateTracker::snapshot),
            blocking: self.blocking.as_ref().map(BlockingTracker::snapshot),
            delegation: self.delegation.as_ref().map(DelegationTracker::snapshot),
        }
    }
}

fn resolution(resolution: Option<Resolution>) -> CompletionOutcome {
    match resolution {
        Some(Resolution::Resolved(())) => CompletionOutcome::resolved(),
        Some(Resolution::Stale) | None => CompletionOutcome::stale(),
    }
}
