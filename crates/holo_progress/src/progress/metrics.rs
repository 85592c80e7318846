//! Counters for progress log activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::remediation::Remediation;

/// Atomically updated counters for `ProgressStats`.
#[derive(Debug, Default)]
pub struct ProgressMetrics {
    ticks: AtomicU64,
    recoveries: AtomicU64,
    fetches: AtomicU64,
    invalidations: AtomicU64,
    home_informs: AtomicU64,
    durability_announcements: AtomicU64,
    stale_completions: AtomicU64,
    remote_failures: AtomicU64,
    remote_timeouts: AtomicU64,
    uncaught_errors: AtomicU64,
}

/// Snapshot of `ProgressMetrics` for debugging / export.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProgressStats {
    pub ticks: u64,
    pub recoveries: u64,
    pub fetches: u64,
    pub invalidations: u64,
    pub home_informs: u64,
    pub durability_announcements: u64,
    pub stale_completions: u64,
    pub remote_failures: u64,
    pub remote_timeouts: u64,
    pub uncaught_errors: u64,
}

impl ProgressStats {
    pub fn escalations(&self) -> u64 {
        self.recoveries
            + self.fetches
            + self.invalidations
            + self.home_informs
            + self.durability_announcements
    }
}

impl ProgressMetrics {
    pub fn snapshot(&self) -> ProgressStats {
        ProgressStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            home_informs: self.home_informs.load(Ordering::Relaxed),
            durability_announcements: self.durability_announcements.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            remote_timeouts: self.remote_timeouts.load(Ordering::Relaxed),
            uncaught_errors: self.uncaught_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remediation(&self, remediation: &Remediation) {
        let counter = match remediation {
            Remediation::Recover { .. } => &self.recoveries,
            Remediation::FetchToApply { .. } | Remediation::FetchKnowledge { .. } => &self.fetches,
            Remediation::Invalidate { .. } => &self.invalidations,
            Remediation::InformHome { .. } => &self.home_informs,
            Remediation::AnnounceDurable { .. } => &self.durability_announcements,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_completion(&self) {
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_timeout(&self) {
        self.remote_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_uncaught_error(&self) {
        self.uncaught_errors.fetch_add(1, Ordering::Relaxed);
    }
}
