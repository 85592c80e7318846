//! Home-shard tracking of the original coordinator.
//!
//! If the coordinator stalls, this is where it gets replaced: a quiet
//! transaction is either recovered at a higher ballot, or, when it is already
//! known durable, fetched so it can be applied locally.

use anyhow::anyhow;
use serde::Serialize;

use super::lattice::{CoordinateStatus, Generation, Investigation, Progress, Resolution, TrackerKind};
use super::remediation::{Dispatch, Remediation};
use super::types::{Command, Durability, Known, ProgressToken, RoutingKey, TxnId};

#[derive(Clone, Debug)]
pub struct CoordinateTracker {
    status: CoordinateStatus,
    progress: Progress,
    token: ProgressToken,
    generation: Generation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CoordinateSnapshot {
    pub status: CoordinateStatus,
    pub progress: Progress,
    pub token: ProgressToken,
    pub generation: u64,
}

impl Default for CoordinateTracker {
    fn default() -> Self {
        Self {
            status: CoordinateStatus::NotWitnessed,
            progress: Progress::NoneExpected,
            token: ProgressToken::NONE,
            generation: Generation::default(),
        }
    }
}

impl CoordinateTracker {
    pub fn status(&self) -> CoordinateStatus {
        self.status
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn token(&self) -> ProgressToken {
        self.token
    }

    /// Adopt `status` and `progress` only if `status` is strictly newer.
    pub fn ensure_at_least(&mut self, status: CoordinateStatus, progress: Progress) {
        if status > self.status {
            self.status = status;
            self.progress = progress;
        }
    }

    /// As `ensure_at_least`, also folding the command's ballots into the token.
    pub fn ensure_at_least_for(
        &mut self,
        command: &Command,
        status: CoordinateStatus,
        progress: Progress,
    ) {
        self.ensure_at_least(status, progress);
        self.update_max(command.progress_token());
    }

    pub fn update_max(&mut self, token: ProgressToken) {
        self.token = self.token.merge(token);
    }

    pub fn record_durable_globally(&mut self) {
        match self.status {
            CoordinateStatus::NotWitnessed
            | CoordinateStatus::Uncommitted
            | CoordinateStatus::Committed
            | CoordinateStatus::ReadyToExecute => {
                self.status = CoordinateStatus::Done;
                self.progress = Progress::NoneExpected;
            }
            CoordinateStatus::Done => {}
        }
    }

    pub fn on_tick(
        &mut self,
        txn_id: TxnId,
        command: &Command,
        home_key: Option<&RoutingKey>,
    ) -> anyhow::Result<Option<Dispatch>> {
        if self.progress != Progress::NoProgress {
            self.progress = self.progress.advance();
            return Ok(None);
        }

        // Escalate before anything can fail, so a failure surfaces once.
        self.progress = Progress::Investigating;
        match self.status {
            // Unwitnessed: nothing to recover. Committed: waiting to become
            // ready to execute. Done: nothing left to do.
            CoordinateStatus::NotWitnessed | CoordinateStatus::Committed | CoordinateStatus::Done => {
                anyhow::bail!(
                    "coordinate tracker for {txn_id} reached no progress in status {:?}",
                    self.status
                );
            }
            CoordinateStatus::Uncommitted | CoordinateStatus::ReadyToExecute => {}
        }

        // Commit is not guaranteed to reach the home shard, so only a durable
        // decision lets us skip recovery and just fetch the outcome.
        let remediation = if self.status >= CoordinateStatus::Committed
            && command.durability.is_durable()
        {
            let execute_at = command
                .execute_at
                .ok_or_else(|| anyhow!("durable txn {txn_id} has no executeAt"))?;
            let route = command
                .route
                .clone()
                .ok_or_else(|| anyhow!("durable txn {txn_id} has no route"))?;
            Remediation::FetchToApply {
                required: Known::PRE_APPLIED,
                route,
                execute_at,
                epoch: execute_at.epoch,
            }
        } else {
            let home_key = home_key
                .or(command.home_key.as_ref())
                .cloned()
                .ok_or_else(|| anyhow!("cannot recover {txn_id} without a home key"))?;
            Remediation::Recover {
                home_key,
                route: command.route.clone(),
                token: self.token,
            }
        };

        let tag = self.generation.begin(TrackerKind::Coordinate);
        Ok(Some(Dispatch {
            txn_id,
            tag,
            remediation,
        }))
    }

    fn accepts(&self, tag: Investigation) -> bool {
        self.progress == Progress::Investigating && self.generation.is_current(tag)
    }

    /// Completion of a fetch issued to apply a durable transaction. Whatever
    /// the outcome, the next tick re-checks.
    pub fn on_fetched(&mut self, tag: Investigation) -> Resolution {
        if !self.accepts(tag) {
            return Resolution::Stale;
        }
        self.progress = Progress::Expected;
        Resolution::Resolved(())
    }

    /// Completion of a recovery round. Resolves to the durability to
    /// propagate locally when recovery found the transaction durable.
    pub fn on_recovered(
        &mut self,
        tag: Investigation,
        result: anyhow::Result<ProgressToken>,
    ) -> Resolution<Option<Durability>> {
        if self.status > CoordinateStatus::ReadyToExecute || !self.accepts(tag) {
            return Resolution::Stale;
        }

        self.progress = Progress::Expected;
        let token = match result {
            Ok(token) => token,
            Err(err) => {
                tracing::debug!(error = ?err, "recovery attempt failed");
                return Resolution::Resolved(None);
            }
        };

        self.update_max(token);
        Resolution::Resolved(token.durability.is_durable().then_some(token.durability))
    }

    pub fn snapshot(&self) -> CoordinateSnapshot {
        CoordinateSnapshot {
            status: self.status,
            progress: self.progress,
            token: self.token,
            generation: self.generation.current(),
        }
    }
}
