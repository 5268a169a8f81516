//!
//! Concurrent status refresh.
//!
//! One task per host, all awaited before [`Dispatcher::refresh_all`] returns. A failing host
//! never holds up or aborts the others.
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing_futures::Instrument;

use crate::cache::CacheStore;
use crate::control_plane::ControlPlane;
use crate::stats::SessionStats;
use crate::types::HostStatus;

/// What a refresh did for one host
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostOutcome {
    /// Fresh status stored
    Updated(HostStatus),
    /// The control plane no longer knows the host, its cache entries are gone
    Deleted,
    /// Fetch failed, serving the offline entry captured at the given time
    Fallback {
        /// Capture time of the offline entry
        captured_at: DateTime<Utc>,
    },
    /// Fetch failed and there was nothing to fall back to
    NoData,
}

/// Result of [`Dispatcher::refresh_all`], in the order the hosts were given
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Outcome per host
    pub outcomes: Vec<(String, HostOutcome)>,
}

impl RefreshReport {
    fn count(&self, f: impl Fn(&HostOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }

    /// Hosts with fresh data
    #[must_use]
    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, HostOutcome::Updated(_)))
    }

    /// Hosts served from the offline cache
    #[must_use]
    pub fn fallbacks(&self) -> usize {
        self.count(|o| matches!(o, HostOutcome::Fallback { .. }))
    }

    /// Hosts without any data
    #[must_use]
    pub fn no_data(&self) -> usize {
        self.count(|o| matches!(o, HostOutcome::NoData))
    }

    /// Ids of hosts the control plane reported gone
    #[must_use]
    pub fn deleted(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == HostOutcome::Deleted)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Outcome of one host
    #[must_use]
    pub fn outcome(&self, host_id: &str) -> Option<&HostOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == host_id)
            .map(|(_, o)| o)
    }
}

/// Fans status queries out over the fleet
#[derive(Clone, Debug)]
pub struct Dispatcher {
    control_plane: ControlPlane,
    cache: Arc<CacheStore>,
    stats: Arc<SessionStats>,
}

impl Dispatcher {
    /// Dispatcher storing what `control_plane` answers in `cache`
    #[must_use]
    pub fn new(control_plane: ControlPlane, cache: Arc<CacheStore>, stats: Arc<SessionStats>) -> Self {
        Self {
            control_plane,
            cache,
            stats,
        }
    }

    /// Refresh every host in `hosts` concurrently and wait for all of them
    #[tracing::instrument(level = "debug", skip_all, fields(hosts = hosts.len()))]
    pub async fn refresh_all(&self, hosts: &[String]) -> RefreshReport {
        let tasks: Vec<_> = hosts
            .iter()
            .map(|host_id| {
                let this = self.clone();
                let id = host_id.clone();
                let span = tracing::debug_span!("refresh", host = %host_id);
                tokio::spawn(async move { this.refresh_one(&id).await }.instrument(span))
            })
            .collect();

        let results = futures_util::future::join_all(tasks).await;
        let outcomes = hosts
            .iter()
            .zip(results)
            .map(|(host_id, result)| {
                let outcome = result.unwrap_or_else(|e| {
                    tracing::error!("refresh task for {} failed: {}", host_id, e);
                    HostOutcome::NoData
                });
                (host_id.clone(), outcome)
            })
            .collect();

        self.stats.record_refresh();
        let report = RefreshReport { outcomes };
        tracing::debug!(
            "refresh done: {} updated, {} deleted, {} from offline cache, {} without data",
            report.updated(),
            report.deleted().len(),
            report.fallbacks(),
            report.no_data()
        );
        report
    }

    async fn refresh_one(&self, host_id: &str) -> HostOutcome {
        let started = Instant::now();
        let result = self.control_plane.fetch_status(host_id).await;
        self.stats.record_latency(started.elapsed());

        match result {
            Ok(payload) if payload.status == HostStatus::Deleted => {
                self.cache.purge(host_id).await;
                HostOutcome::Deleted
            }
            Ok(payload) => {
                let status = payload.status;
                self.cache.put(host_id, payload).await;
                HostOutcome::Updated(status)
            }
            Err(e) => {
                tracing::debug!("fetch failed: {}", e);
                match self.cache.restore_offline(host_id).await {
                    Some(entry) => HostOutcome::Fallback {
                        captured_at: entry.captured_at,
                    },
                    None => HostOutcome::NoData,
                }
            }
        }
    }
}
