//! Non-home shards hand liveness over to the home shard, but only once they
//! know the home shard is aware of the transaction.

use anyhow::anyhow;
use serde::Serialize;

use super::lattice::{DelegationStatus, Generation, Investigation, Resolution, TrackerKind};
use super::remediation::{Dispatch, Remediation};
use super::types::{Command, RoutingKey, TxnId};

#[derive(Clone, Debug)]
pub struct DelegationTracker {
    status: DelegationStatus,
    generation: Generation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DelegationSnapshot {
    pub status: DelegationStatus,
    pub generation: u64,
}

impl DelegationTracker {
    pub fn new(status: DelegationStatus) -> Self {
        Self {
            status,
            generation: Generation::default(),
        }
    }

    pub fn status(&self) -> DelegationStatus {
        self.status
    }

    pub fn ensure_at_least(&mut self, status: DelegationStatus) {
        if status > self.status {
            self.status = status;
        }
    }

    pub fn on_tick(
        &mut self,
        txn_id: TxnId,
        command: &Command,
        home_key: Option<&RoutingKey>,
    ) -> anyhow::Result<Option<Dispatch>> {
        match self.status {
            DelegationStatus::Safe | DelegationStatus::Investigating => Ok(None),
            DelegationStatus::Unsafe => {
                self.status = DelegationStatus::StillUnsafe;
                Ok(None)
            }
            DelegationStatus::StillUnsafe => {
                self.status = DelegationStatus::Investigating;
                let home_key = home_key
                    .or(command.home_key.as_ref())
                    .cloned()
                    .ok_or_else(|| anyhow!("cannot inform home of {txn_id} without a home key"))?;
                let tag = self.generation.begin(TrackerKind::Delegation);
                Ok(Some(Dispatch {
                    txn_id,
                    tag,
                    remediation: Remediation::InformHome { home_key },
                }))
            }
        }
    }

    pub fn on_informed(&mut self, tag: Investigation, result: &anyhow::Result<()>) -> Resolution {
        if self.status != DelegationStatus::Investigating || !self.generation.is_current(tag) {
            return Resolution::Stale;
        }
        self.status = match result {
            Ok(()) => DelegationStatus::Safe,
            Err(_) => DelegationStatus::Unsafe,
        };
        Resolution::Resolved(())
    }

    pub fn snapshot(&self) -> DelegationSnapshot {
        DelegationSnapshot {
            status: self.status,
            generation: self.generation.current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::testing::{txn, uncommitted_command};

    #[test]
    fn failed_inform_loops_back_to_unsafe() {
        let id = txn(1);
        let command = uncommitted_command(id);
        let home = RoutingKey::from("home");
        let mut tracker = DelegationTracker::new(DelegationStatus::Unsafe);

        assert!(tracker.on_tick(id, &command, Some(&home)).unwrap().is_none());
        assert_eq!(tracker.status(), DelegationStatus::StillUnsafe);

        let dispatch = tracker.on_tick(id, &command, Some(&home)).unwrap().unwrap();
        assert_eq!(dispatch.remediation, Remediation::InformHome { home_key: home.clone() });
        assert_eq!(tracker.status(), DelegationStatus::Investigating);

        // In flight: no resend.
        assert!(tracker.on_tick(id, &command, Some(&home)).unwrap().is_none());

        let _ = tracker.on_informed(dispatch.tag, &Err(anyhow!("home unreachable")));
        assert_eq!(tracker.status(), DelegationStatus::Unsafe);

        assert!(tracker.on_tick(id, &command, Some(&home)).unwrap().is_none());
        assert_eq!(tracker.status(), DelegationStatus::StillUnsafe);
    }

    #[test]
    fn successful_inform_is_safe_and_final() {
        let id = txn(2);
        let command = uncommitted_command(id);
        let home = RoutingKey::from("home");
        let mut tracker = DelegationTracker::new(DelegationStatus::StillUnsafe);
        let dispatch = tracker.on_tick(id, &command, Some(&home)).unwrap().unwrap();
        assert_eq!(tracker.on_informed(dispatch.tag, &Ok(())), Resolution::Resolved(()));
        assert_eq!(tracker.status(), DelegationStatus::Safe);
        assert!(tracker.on_informed(dispatch.tag, &Err(anyhow!("late"))).is_stale());
        assert_eq!(tracker.status(), DelegationStatus::Safe);
        assert!(tracker.on_tick(id, &command, Some(&home)).unwrap().is_none());
    }

    #[test]
    fn ensure_at_least_respects_partial_order() {
        let mut tracker = DelegationTracker::new(DelegationStatus::Unsafe);
        tracker.ensure_at_least(DelegationStatus::StillUnsafe);
        assert_eq!(tracker.status(), DelegationStatus::StillUnsafe);
        tracker.ensure_at_least(DelegationStatus::Unsafe);
        assert_eq!(tracker.status(), DelegationStatus::StillUnsafe);
        tracker.ensure_at_least(DelegationStatus::Safe);
        assert_eq!(tracker.status(), DelegationStatus::Safe);
        tracker.ensure_at_least(DelegationStatus::Investigating);
        assert_eq!(tracker.status(), DelegationStatus::Safe);
    }

    #[test]
    fn missing_home_key_is_an_error() {
        let id = txn(3);
        let command = uncommitted_command(id);
        let mut tracker = DelegationTracker::new(DelegationStatus::StillUnsafe);
        assert!(tracker.on_tick(id, &command, None).is_err());
        assert_eq!(tracker.status(), DelegationStatus::Investigating);
        assert!(tracker.on_tick(id, &command, None).unwrap().is_none());
    }
}
