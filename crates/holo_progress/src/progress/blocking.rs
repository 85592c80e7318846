//! Local knowledge gaps that block execution of a dependent transaction.
//!
//! A replica missing a dependency's outcome must not wait forever: it fetches
//! what it needs, and if no replica even knows the definition, it proposes
//! that the dependency be invalidated.

use anyhow::anyhow;
use serde::Serialize;

use super::lattice::{Generation, Investigation, Progress, Resolution, TrackerKind};
use super::remediation::{Dispatch, Remediation};
use super::types::{Command, Known, Participants, ProgressToken, Status, Topology, TxnId, Unseekables};

#[derive(Clone, Debug)]
pub struct BlockingTracker {
    blocked_until: Known,
    progress: Progress,
    blocked_on: Option<Unseekables>,
    /// Participants of the in-flight fetch, reused to seed an invalidation.
    investigating: Option<Participants>,
    generation: Generation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockingSnapshot {
    pub blocked_until: Known,
    pub progress: Progress,
    pub blocked_on: Option<Unseekables>,
    pub generation: u64,
}

impl Default for BlockingTracker {
    fn default() -> Self {
        Self {
            blocked_until: Known::NOTHING,
            progress: Progress::NoneExpected,
            blocked_on: None,
            investigating: None,
            generation: Generation::default(),
        }
    }
}

impl BlockingTracker {
    pub fn blocked_until(&self) -> Known {
        self.blocked_until
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn blocked_on(&self) -> Option<&Unseekables> {
        self.blocked_on.as_ref()
    }

    pub fn record_blocking(&mut self, required: Known, on_keys: &Unseekables) -> anyhow::Result<()> {
        anyhow::ensure!(!on_keys.is_empty(), "blocking must name at least one key or range");
        self.blocked_on = Some(match self.blocked_on.take() {
            Some(existing) => existing.union(on_keys),
            None => on_keys.clone(),
        });
        if !required.is_satisfied_by(self.blocked_until) {
            self.blocked_until = self.blocked_until.merge(required);
            self.progress = Progress::Expected;
        }
        Ok(())
    }

    pub fn record_knowledge_advanced(&mut self, known: Known) {
        if self.blocked_until.is_satisfied_by(known) {
            self.progress = Progress::NoneExpected;
        }
    }

    pub fn on_tick(
        &mut self,
        txn_id: TxnId,
        command: &Command,
        topology: &dyn Topology,
    ) -> anyhow::Result<Option<Dispatch>> {
        if self.progress != Progress::NoProgress {
            self.progress = self.progress.advance();
            return Ok(None);
        }

        if command.has(self.blocked_until) {
            self.progress = Progress::NoneExpected;
            return Ok(None);
        }

        self.progress = Progress::Investigating;
        let blocked_on = self
            .blocked_on
            .as_ref()
            .ok_or_else(|| anyhow!("txn {txn_id} blocked with no keys recorded"))?;

        let execute_at = if command.has_been(Status::PreCommitted) {
            command.execute_at
        } else {
            None
        };
        let src_epoch = execute_at.map_or(txn_id.epoch(), |at| at.epoch);
        let epoch = src_epoch.max(topology.current_epoch());
        let participants = Participants::merge(command.route.as_ref(), blocked_on);

        self.investigating = Some(participants.clone());
        let tag = self.generation.begin(TrackerKind::Blocking);
        Ok(Some(Dispatch {
            txn_id,
            tag,
            remediation: Remediation::FetchKnowledge {
                required: self.blocked_until,
                participants,
                execute_at,
                epoch,
            },
        }))
    }

    fn accepts(&self, tag: Investigation) -> bool {
        self.progress == Progress::Investigating && self.generation.is_current(tag)
    }

    /// Completion of a knowledge fetch. If nobody knows the definition, the
    /// transaction cannot be learned and is handed over for invalidation.
    pub fn on_fetched(
        &mut self,
        txn_id: TxnId,
        tag: Investigation,
        result: anyhow::Result<Known>,
    ) -> anyhow::Result<Resolution<Option<Dispatch>>> {
        if !self.accepts(tag) {
            return Ok(Resolution::Stale);
        }

        self.progress = Progress::Expected;
        let known = match result {
            Ok(known) => known,
            Err(err) => {
                tracing::debug!(%txn_id, error = ?err, "blocking fetch failed");
                return Ok(Resolution::Resolved(None));
            }
        };

        if known.is_definition_known() || known.is_invalidated() {
            self.record_knowledge_advanced(known);
            return Ok(Resolution::Resolved(None));
        }

        let participants = self
            .investigating
            .take()
            .ok_or_else(|| anyhow!("txn {txn_id} fetched without recorded participants"))?;
        let some_key = participants
            .some_key()
            .ok_or_else(|| anyhow!("txn {txn_id} has no key to invalidate on"))?;

        self.progress = Progress::Investigating;
        let tag = self.generation.begin(TrackerKind::Blocking);
        Ok(Resolution::Resolved(Some(Dispatch {
            txn_id,
            tag,
            remediation: Remediation::Invalidate {
                participants: participants.with_key(some_key),
            },
        })))
    }

    pub fn on_invalidated(
        &mut self,
        tag: Investigation,
        result: anyhow::Result<ProgressToken>,
    ) -> Resolution {
        if !self.accepts(tag) {
            return Resolution::Stale;
        }

        self.progress = Progress::Expected;
        match result {
            Ok(token) if token.durability.is_durable() => self.progress = Progress::Done,
            Ok(_) => {}
            Err(err) => tracing::debug!(error = ?err, "invalidation attempt failed"),
        }
        Resolution::Resolved(())
    }

    pub fn snapshot(&self) -> BlockingSnapshot {
        BlockingSnapshot {
            blocked_until: self.blocked_until,
            progress: self.progress,
            blocked_on: self.blocked_on.clone(),
            generation: self.generation.current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::testing::{txn, uncommitted_command, StaticTopology};
    use crate::progress::types::{Ballot, Durability, Route, RoutingKey, Timestamp};

    fn keys(names: &[&str]) -> Unseekables {
        Unseekables::of_keys(names.iter().copied())
    }

    fn escalate(tracker: &mut BlockingTracker, command: &Command, topology: &StaticTopology) -> Dispatch {
        assert!(tracker.on_tick(command.txn_id, command, topology).unwrap().is_none());
        assert_eq!(tracker.progress(), Progress::NoProgress);
        tracker
            .on_tick(command.txn_id, command, topology)
            .unwrap()
            .expect("second quiet tick escalates")
    }

    #[test]
    fn recording_requires_keys() {
        let mut tracker = BlockingTracker::default();
        assert!(tracker.record_blocking(Known::COMMITTED, &Unseekables::new()).is_err());
        assert_eq!(tracker.progress(), Progress::NoneExpected);
    }

    #[test]
    fn satisfied_knowledge_unblocks() {
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::COMMITTED, &keys(&["a"])).unwrap();
        assert_eq!(tracker.progress(), Progress::Expected);

        tracker.record_knowledge_advanced(Known::PROPOSED);
        assert_eq!(tracker.progress(), Progress::Expected);

        tracker.record_knowledge_advanced(Known::PRE_APPLIED);
        assert_eq!(tracker.progress(), Progress::NoneExpected);
    }

    #[test]
    fn weaker_requirement_does_not_reset_progress() {
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::PRE_APPLIED, &keys(&["a"])).unwrap();
        tracker.record_knowledge_advanced(Known::PRE_APPLIED);
        tracker.record_blocking(Known::COMMITTED, &keys(&["b"])).unwrap();
        assert_eq!(tracker.progress(), Progress::NoneExpected);
        assert!(tracker.blocked_on().unwrap().contains_key(&RoutingKey::from("b")));
    }

    #[test]
    fn fetch_targets_later_of_execute_and_current_epoch() {
        let topology = StaticTopology::new(4, &[1, 2, 3]);
        let mut command = uncommitted_command(txn(1));
        command.status = Status::PreCommitted;
        command.execute_at = Some(Timestamp::new(2, 5, 1));

        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::PRE_APPLIED, &keys(&["a", "b"])).unwrap();
        let dispatch = escalate(&mut tracker, &command, &topology);
        match dispatch.remediation {
            Remediation::FetchKnowledge {
                required,
                participants,
                execute_at,
                epoch,
            } => {
                assert_eq!(required, Known::PRE_APPLIED);
                assert_eq!(epoch, 4);
                assert_eq!(execute_at, Some(Timestamp::new(2, 5, 1)));
                assert_eq!(participants, Participants::Unseekables(keys(&["a", "b"])));
            }
            other => panic!("unexpected remediation {other:?}"),
        }
    }

    #[test]
    fn already_known_locally_stops_expecting() {
        let topology = StaticTopology::new(1, &[1]);
        let mut command = uncommitted_command(txn(2));
        command.status = Status::Applied;
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::PRE_APPLIED, &keys(&["a"])).unwrap();
        let _ = tracker.on_tick(txn(2), &command, &topology).unwrap();
        assert!(tracker.on_tick(txn(2), &command, &topology).unwrap().is_none());
        assert_eq!(tracker.progress(), Progress::NoneExpected);
    }

    #[test]
    fn fetched_knowledge_is_recorded() {
        let topology = StaticTopology::new(1, &[1]);
        let command = uncommitted_command(txn(3));
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::COMMITTED, &keys(&["a"])).unwrap();
        let dispatch = escalate(&mut tracker, &command, &topology);

        let resolution = tracker.on_fetched(txn(3), dispatch.tag, Ok(Known::PRE_APPLIED)).unwrap();
        assert_eq!(resolution, Resolution::Resolved(None));
        assert_eq!(tracker.progress(), Progress::NoneExpected);

        // Duplicate delivery leaves the tracker untouched.
        let before = tracker.snapshot();
        assert!(tracker
            .on_fetched(txn(3), dispatch.tag, Ok(Known::NOTHING))
            .unwrap()
            .is_stale());
        assert_eq!(tracker.snapshot(), before);
    }

    #[test]
    fn unknown_definition_triggers_invalidation_on_home_key() {
        let topology = StaticTopology::new(1, &[1]);
        let mut command = uncommitted_command(txn(4));
        command.route = Some(Route::partial(RoutingKey::from("home"), keys(&["x"])));
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::COMMITTED, &keys(&["a"])).unwrap();
        let dispatch = escalate(&mut tracker, &command, &topology);

        let followup = match tracker.on_fetched(txn(4), dispatch.tag, Ok(Known::NOTHING)).unwrap() {
            Resolution::Resolved(Some(followup)) => followup,
            other => panic!("expected invalidation, got {other:?}"),
        };
        assert_eq!(tracker.progress(), Progress::Investigating);
        match &followup.remediation {
            Remediation::Invalidate { participants } => {
                assert_eq!(participants.some_key(), Some(RoutingKey::from("home")));
                assert!(participants.unseekables().contains_key(&RoutingKey::from("home")));
                assert!(participants.unseekables().contains_key(&RoutingKey::from("a")));
            }
            other => panic!("unexpected remediation {other:?}"),
        }

        // The fetch tag is now superseded by the invalidation.
        assert!(tracker
            .on_fetched(txn(4), dispatch.tag, Ok(Known::NOTHING))
            .unwrap()
            .is_stale());

        let durable = ProgressToken::new(Durability::Durable, Status::Invalidated, Ballot::new(3, 1), Ballot::new(3, 1));
        assert_eq!(tracker.on_invalidated(followup.tag, Ok(durable)), Resolution::Resolved(()));
        assert_eq!(tracker.progress(), Progress::Done);
        assert!(tracker.on_invalidated(followup.tag, Ok(durable)).is_stale());
    }

    #[test]
    fn bare_keys_invalidate_on_lowest_key() {
        let topology = StaticTopology::new(1, &[1]);
        let command = uncommitted_command(txn(5));
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::COMMITTED, &keys(&["m", "c"])).unwrap();
        let dispatch = escalate(&mut tracker, &command, &topology);
        let Resolution::Resolved(Some(followup)) =
            tracker.on_fetched(txn(5), dispatch.tag, Ok(Known::EXECUTE_AT)).unwrap()
        else {
            panic!("expected invalidation");
        };
        match followup.remediation {
            Remediation::Invalidate { participants } => {
                assert_eq!(participants.some_key(), Some(RoutingKey::from("c")));
            }
            other => panic!("unexpected remediation {other:?}"),
        }
    }

    #[test]
    fn failed_fetch_returns_to_expected() {
        let topology = StaticTopology::new(1, &[1]);
        let command = uncommitted_command(txn(6));
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::COMMITTED, &keys(&["a"])).unwrap();
        let dispatch = escalate(&mut tracker, &command, &topology);
        let resolution = tracker
            .on_fetched(txn(6), dispatch.tag, Err(anyhow!("unreachable")))
            .unwrap();
        assert_eq!(resolution, Resolution::Resolved(None));
        assert_eq!(tracker.progress(), Progress::Expected);
    }

    #[test]
    fn failed_invalidation_retries() {
        let topology = StaticTopology::new(1, &[1]);
        let command = uncommitted_command(txn(7));
        let mut tracker = BlockingTracker::default();
        tracker.record_blocking(Known::COMMITTED, &keys(&["a"])).unwrap();
        let dispatch = escalate(&mut tracker, &command, &topology);
        let Resolution::Resolved(Some(followup)) =
            tracker.on_fetched(txn(7), dispatch.tag, Ok(Known::NOTHING)).unwrap()
        else {
            panic!("expected invalidation");
        };
        let _ = tracker.on_invalidated(followup.tag, Err(anyhow!("preempted")));
        assert_eq!(tracker.progress(), Progress::Expected);
        let again = escalate(&mut tracker, &command, &topology);
        assert!(matches!(again.remediation, Remediation::FetchKnowledge { .. }));
    }
}
