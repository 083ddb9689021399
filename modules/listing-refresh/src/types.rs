use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use listing_common::{OutcomeKind, PropertyId};

/// A terminal non-success outcome, emitted once per failed request so an
/// operator can tell the failure modes apart.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub id: Uuid,
    /// `None` when the payload was too malformed to carry an id.
    pub property_id: Option<PropertyId>,
    pub address: Option<String>,
    pub kind: FailureKind,
    pub detail: String,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        property_id: Option<PropertyId>,
        address: Option<&str>,
        kind: FailureKind,
        detail: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            property_id,
            address: address.map(str::to_string),
            kind,
            detail: detail.into(),
            attempts,
            occurred_at: Utc::now(),
        }
    }

    /// Property id for display; `-` for payloads that never parsed.
    pub fn target(&self) -> String {
        self.property_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The source has no property at the address (or the record is gone).
    AddressNotFound,
    /// The request can never succeed: malformed payload, unsupported
    /// address or currency.
    Rejected,
    /// Every allowed attempt ended in a transient failure.
    ExhaustedRetries,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressNotFound => write!(f, "address_not_found"),
            Self::Rejected => write!(f, "rejected"),
            Self::ExhaustedRetries => write!(f, "exhausted_retries"),
        }
    }
}

/// Live counters shared by every consumer slot.
#[derive(Debug, Default)]
pub struct RefreshCounters {
    updated: AtomicU64,
    unchanged: AtomicU64,
    not_found: AtomicU64,
    transient: AtomicU64,
    permanent: AtomicU64,
    retried: AtomicU64,
    deferred: AtomicU64,
    exhausted: AtomicU64,
    malformed: AtomicU64,
    requeued: AtomicU64,
}

impl RefreshCounters {
    pub fn record_outcome(&self, kind: OutcomeKind) {
        let counter = match kind {
            OutcomeKind::Updated => &self.updated,
            OutcomeKind::Unchanged => &self.unchanged,
            OutcomeKind::NotFound => &self.not_found,
            OutcomeKind::TransientFailure => &self.transient,
            OutcomeKind::PermanentFailure => &self.permanent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferral(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            updated: self.updated.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            transient_failures: self.transient.load(Ordering::Relaxed),
            permanent_failures: self.permanent.load(Ordering::Relaxed),
            retries: self.retried.load(Ordering::Relaxed),
            deferrals: self.deferred.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// Stats from a supervisor run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupervisorStats {
    pub updated: u64,
    pub unchanged: u64,
    pub not_found: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub retries: u64,
    pub deferrals: u64,
    pub exhausted: u64,
    pub malformed: u64,
    pub requeued: u64,
}

impl SupervisorStats {
    /// Messages settled for good (acknowledged).
    pub fn terminal(&self) -> u64 {
        self.updated + self.unchanged + self.not_found + self.permanent_failures
    }
}

impl fmt::Display for SupervisorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "updated={} unchanged={} not_found={} transient_failures={} permanent_failures={} retries={} deferrals={} exhausted={} malformed={} requeued={}",
            self.updated, self.unchanged, self.not_found, self.transient_failures,
            self.permanent_failures, self.retries, self.deferrals, self.exhausted,
            self.malformed, self.requeued,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot_into_key_value_line() {
        let counters = RefreshCounters::default();
        counters.record_outcome(OutcomeKind::Updated);
        counters.record_outcome(OutcomeKind::Updated);
        counters.record_outcome(OutcomeKind::NotFound);
        counters.record_retry();

        let stats = counters.snapshot();
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.terminal(), 3);
        let line = stats.to_string();
        assert!(line.starts_with("updated=2 unchanged=0 not_found=1"));
        assert!(line.contains("retries=1"));
    }

    #[test]
    fn failure_record_without_id_displays_dash() {
        let record = FailureRecord::new(None, None, FailureKind::Rejected, "not json", 1);
        assert_eq!(record.target(), "-");
        assert_eq!(record.kind.to_string(), "rejected");
    }
}
