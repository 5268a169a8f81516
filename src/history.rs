//!
//! Audit log of user-initiated operations.
//!
//! The log is a fixed capacity ring, the oldest record goes first. Nothing reads it back into
//! scheduling decisions.
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// How an operation ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "result", content = "message")]
pub enum Outcome {
    /// Completed
    Success,
    /// Failed, with the reason
    Failure(String),
}

impl<T, E: std::fmt::Display> From<&Result<T, E>> for Outcome {
    fn from(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => Self::Failure(e.to_string()),
        }
    }
}

/// One operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    /// When it finished
    pub timestamp: DateTime<Utc>,
    /// What was done, e.g. `delete`
    pub operation: String,
    /// Host it was done to
    pub target_host: String,
    /// How it ended
    pub outcome: Outcome,
    /// How long it took
    pub duration_ms: u64,
}

/// Bounded operation history
#[derive(Debug)]
pub struct OperationHistory {
    entries: Mutex<VecDeque<OperationRecord>>,
    capacity: usize,
}

impl OperationHistory {
    /// Empty history keeping at most `capacity` records
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a record, evicting the oldest one when full
    pub fn record(&self, operation: &str, target_host: &str, outcome: Outcome, duration: Duration) {
        let record = OperationRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            target_host: target_host.to_string(),
            outcome,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        };
        tracing::debug!("history: {:?}", record);

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// The last `n` records, oldest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<OperationRecord> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Number of records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing was recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of records held
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod test {
    use super::{OperationHistory, Outcome};
    use std::time::Duration;

    #[test]
    fn bounded_fifo() {
        let history = OperationHistory::new(50);
        for i in 0..60 {
            history.record(
                "refresh",
                &format!("host-{i}"),
                Outcome::Success,
                Duration::from_millis(i),
            );
        }
        assert_eq!(history.len(), 50);

        let recent = history.recent(50);
        assert_eq!(recent.len(), 50);
        assert_eq!(recent.first().unwrap().target_host, "host-10");
        assert_eq!(recent.last().unwrap().target_host, "host-59");
        assert!(recent.iter().all(|r| r.target_host != "host-9"));
        assert!(recent.windows(2).all(|w| w[0].duration_ms < w[1].duration_ms));
    }

    #[test]
    fn recent_subset() {
        let history = OperationHistory::new(5);
        assert!(history.is_empty());
        history.record("create", "a", Outcome::Success, Duration::ZERO);
        history.record("delete", "b", Outcome::Failure("HTTP failed 500".into()), Duration::ZERO);
        history.record("delete", "c", Outcome::Success, Duration::ZERO);

        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].target_host, "b");
        assert_eq!(recent[0].outcome, Outcome::Failure("HTTP failed 500".into()));
        assert_eq!(recent[1].target_host, "c");
        assert_eq!(history.recent(10).len(), 3);
    }

    #[test]
    fn outcome_from_result() {
        let ok: Result<(), crate::Error> = Ok(());
        assert_eq!(Outcome::from(&ok), Outcome::Success);
        let err: Result<(), crate::Error> = Err(crate::Error::general("boom"));
        assert_eq!(Outcome::from(&err), Outcome::Failure("Error boom".into()));
    }
}
