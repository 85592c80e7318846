//! Progress lattice, tracker status enums, and investigation tags.

use std::cmp::Ordering;

use serde::Serialize;

/// Whether a tracker expects something to advance the transaction.
///
/// A tracker moves `Expected -> NoProgress` on its first quiet tick and only
/// escalates on the second, so one polling interval of silence is tolerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Progress {
    NoneExpected,
    Expected,
    NoProgress,
    Investigating,
    Done,
}

impl Progress {
    /// Transition applied on a tick that does not escalate.
    pub fn advance(self) -> Progress {
        match self {
            Progress::NoneExpected | Progress::Investigating | Progress::Done => self,
            Progress::Expected | Progress::NoProgress => Progress::NoProgress,
        }
    }
}

/// Home-shard view of how far the original coordinator got.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CoordinateStatus {
    NotWitnessed,
    Uncommitted,
    Committed,
    ReadyToExecute,
    Done,
}

/// Home-shard view of whether every replica knows the outcome is durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DisseminateStatus {
    NotExecuted,
    Durable,
    Done,
}

/// Non-home view of whether the home shard is known to track the transaction.
///
/// `Investigating` and `Safe` are incomparable; both exceed `StillUnsafe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DelegationStatus {
    Unsafe,
    StillUnsafe,
    Investigating,
    Safe,
}

impl DelegationStatus {
    fn rank(self) -> u8 {
        match self {
            DelegationStatus::Unsafe => 0,
            DelegationStatus::StillUnsafe => 1,
            DelegationStatus::Investigating | DelegationStatus::Safe => 2,
        }
    }
}

impl PartialOrd for DelegationStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => None,
            ord => Some(ord),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TrackerKind {
    Blocking,
    Coordinate,
    Disseminate,
    Delegation,
}

/// Tag attached to a remediation when it is dispatched and carried back by
/// its completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Investigation {
    pub tracker: TrackerKind,
    pub generation: u64,
}

/// Per-tracker dispatch counter. Only the most recent dispatch is current.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Generation(u64);

impl Generation {
    pub(crate) fn begin(&mut self, tracker: TrackerKind) -> Investigation {
        self.0 += 1;
        Investigation {
            tracker,
            generation: self.0,
        }
    }

    pub(crate) fn is_current(&self, tag: Investigation) -> bool {
        tag.generation == self.0
    }

    pub(crate) fn current(&self) -> u64 {
        self.0
    }
}

/// Result of delivering a completion to a tracker.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution<T = ()> {
    /// The tracker moved on since dispatch; nothing changed.
    Stale,
    Resolved(T),
}

impl<T> Resolution<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, Resolution::Stale)
    }
}
