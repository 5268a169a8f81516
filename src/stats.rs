//!
//! Session counters, for display only.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters of the running session
#[derive(Debug)]
pub struct SessionStats {
    api_calls: AtomicU64,
    latency_ms: AtomicU64,
    timed_calls: AtomicU64,
    refreshes: AtomicU64,
    started_at: DateTime<Utc>,
}

/// Point in time copy of [`SessionStats`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Status payloads stored from the control plane
    pub api_calls: u64,
    /// Sum of the measured call latencies
    pub cumulative_latency_ms: u64,
    /// Average measured call latency
    pub average_latency_ms: u64,
    /// Completed fleet refreshes
    pub refreshes: u64,
    /// Session start
    pub started_at: DateTime<Utc>,
    /// Seconds since session start
    pub uptime_secs: i64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    /// Counters at zero, session starting now
    #[must_use]
    pub fn new() -> Self {
        Self {
            api_calls: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            timed_calls: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    /// Count one control-plane call
    pub fn record_api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the latency of one control-plane call
    pub fn record_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.fetch_add(millis, Ordering::Relaxed);
        self.timed_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one fleet refresh
    pub fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Total API calls so far
    #[must_use]
    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::Relaxed)
    }

    /// Total refreshes so far
    #[must_use]
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Copy the counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let cumulative_latency_ms = self.latency_ms.load(Ordering::Relaxed);
        let timed = self.timed_calls.load(Ordering::Relaxed);
        StatsSnapshot {
            api_calls: self.api_calls(),
            cumulative_latency_ms,
            average_latency_ms: cumulative_latency_ms.checked_div(timed).unwrap_or(0),
            refreshes: self.refreshes(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}
