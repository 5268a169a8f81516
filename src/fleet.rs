//!
//! The fleet synchronizer.
//!
//! A [`Fleet`] owns all session state. Several fleets can live in one process, they share
//! nothing.
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cache::{CacheStore, OfflineStore};
use crate::config::Config;
use crate::control_plane::{ControlPlane, ControlPlaneBuilder};
use crate::dispatch::{Dispatcher, RefreshReport};
use crate::health::HealthTracker;
use crate::history::{OperationHistory, Outcome};
use crate::metrics::MetricsCollector;
use crate::registry::HostRegistry;
use crate::remote::{Connector, Multiplexer, SshConnector};
use crate::stats::SessionStats;
use crate::types::{CreateRequest, HostStatus, MetricsEntry};
use crate::Result;

/// One row of the fleet view
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostView {
    /// Host identifier
    pub id: String,
    /// Last known status, `unknown` if never fetched
    pub status: HostStatus,
    /// Last known address
    pub address: Option<String>,
    /// Last observed software version
    pub version: Option<String>,
    /// Not fetched within the freshness window, or served from the offline cache
    pub stale: bool,
    /// Age of the data, `None` if there is none
    pub age: Option<Duration>,
}

/// Builder for a [`Fleet`]
pub struct FleetBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    control_plane: ControlPlaneBuilder,
}

impl FleetBuilder {
    /// Run remote commands through `connector` instead of OpenSSH
    #[must_use]
    pub fn connector(self, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector: Some(connector),
            ..self
        }
    }

    /// Add a root certificate for control-plane certificate verification
    pub fn add_root_certificate(self, cert: &[u8]) -> Result<Self> {
        Ok(Self {
            control_plane: self.control_plane.add_root_certificate(cert)?,
            ..self
        })
    }

    /// Disable control-plane certificate verification
    #[must_use]
    pub fn danger_accept_invalid_certs(self) -> Self {
        Self {
            control_plane: self.control_plane.danger_accept_invalid_certs(),
            ..self
        }
    }

    /// Validate the configuration and load the host list
    pub async fn build(self) -> Result<Fleet> {
        let config = self.config;
        config.validate()?;
        tracing::debug!("building fleet: {:?}", config);

        let health = Arc::new(HealthTracker::new());
        let stats = Arc::new(SessionStats::new());
        let cache = Arc::new(CacheStore::new(
            OfflineStore::new(&config.offline_cache_dir),
            config.status_ttl,
            stats.clone(),
        ));
        let control_plane = self
            .control_plane
            .request_timeout(config.request_timeout)
            .create_timeout(config.create_timeout)
            .retry_policy(config.retry)
            .build(&config.api_base_url, &config.api_key, health.clone())?;
        let registry = HostRegistry::load(&config.hosts_file).await?;

        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(
                SshConnector::new(&config.ssh_username, config.ssh_auth.clone())
                    .persist(config.connection_idle),
            )
        });
        let mux = Arc::new(Multiplexer::new(
            connector,
            config.connection_idle,
            config.metrics_timeout,
        ));
        let reaper = mux.spawn_reaper();

        Ok(Fleet {
            dispatcher: Dispatcher::new(control_plane.clone(), cache.clone(), stats.clone()),
            metrics: MetricsCollector::new(mux, config.metrics_ttl),
            history: OperationHistory::new(config.history_capacity),
            refreshing: tokio::sync::Mutex::new(()),
            control_plane,
            registry,
            cache,
            health,
            stats,
            reaper,
            config,
        })
    }
}

/// Status synchronizer of one fleet
pub struct Fleet {
    config: Config,
    health: Arc<HealthTracker>,
    stats: Arc<SessionStats>,
    cache: Arc<CacheStore>,
    control_plane: ControlPlane,
    dispatcher: Dispatcher,
    registry: HostRegistry,
    metrics: MetricsCollector,
    history: OperationHistory,
    refreshing: tokio::sync::Mutex<()>,
    reaper: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("config", &self.config)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.reaper.abort();
        let mux = Arc::clone(self.metrics.multiplexer());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { mux.close_all().await });
            }
            // Sessions still close themselves when the multiplexer goes
            Err(_) => tracing::debug!("no runtime left, dropping remote sessions"),
        }
    }
}

impl Fleet {
    /// Start building a fleet from `config`
    #[must_use]
    pub fn builder(config: Config) -> FleetBuilder {
        FleetBuilder {
            config,
            connector: None,
            control_plane: ControlPlane::builder(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Control-plane reachability
    #[must_use]
    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Session counters
    #[must_use]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// User operations of this session
    #[must_use]
    pub const fn history(&self) -> &OperationHistory {
        &self.history
    }

    /// Status cache
    #[must_use]
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Metrics collector
    #[must_use]
    pub const fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Known hosts
    #[must_use]
    pub const fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Control-plane client
    #[must_use]
    pub const fn control_plane(&self) -> &ControlPlane {
        &self.control_plane
    }

    /// Refresh every known host and wait for all of them.
    /// Hosts the control plane no longer knows are dropped from the host list.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let hosts = self.registry.hosts().await;
        self.refresh_hosts(&hosts).await
    }

    /// Refresh only the hosts without a fresh entry
    pub async fn refresh_stale(&self) -> Result<RefreshReport> {
        let mut stale = Vec::new();
        for host_id in self.registry.hosts().await {
            if !self.cache.is_fresh(&host_id).await {
                stale.push(host_id);
            }
        }
        if stale.is_empty() {
            tracing::trace!("every host is fresh");
            return Ok(RefreshReport::default());
        }
        self.refresh_hosts(&stale).await
    }

    /// Forget the session data, then refresh every known host
    pub async fn force_refresh(&self) -> Result<RefreshReport> {
        self.cache.invalidate_all().await;
        self.metrics.invalidate_all().await;
        self.refresh().await
    }

    async fn refresh_hosts(&self, hosts: &[String]) -> Result<RefreshReport> {
        // Refreshes don't overlap
        let _refreshing = self.refreshing.lock().await;
        let report = self.dispatcher.refresh_all(hosts).await;
        for host_id in report.deleted() {
            tracing::info!("{} was deleted upstream", host_id);
            self.metrics.invalidate(host_id).await;
            self.registry.remove(host_id).await?;
        }
        Ok(report)
    }

    /// Known hosts that weren't reported deleted
    pub async fn active_hosts(&self) -> Vec<String> {
        let mut active = Vec::new();
        for host_id in self.registry.hosts().await {
            let deleted = self
                .cache
                .get(&host_id)
                .await
                .is_some_and(|p| p.status == HostStatus::Deleted);
            if !deleted {
                active.push(host_id);
            }
        }
        active
    }

    /// The fleet as the cache sees it, without touching the network
    pub async fn hosts(&self) -> Vec<HostView> {
        let mut view = Vec::new();
        for host_id in self.registry.hosts().await {
            let row = match self.cache.entry(&host_id).await {
                Some(entry) => {
                    let age = entry.age();
                    HostView {
                        status: entry.payload.status,
                        address: entry.payload.address,
                        version: entry.payload.version,
                        stale: entry.stale || age >= self.cache.ttl(),
                        age: Some(age),
                        id: host_id,
                    }
                }
                None => HostView {
                    id: host_id,
                    status: HostStatus::Unknown,
                    address: None,
                    version: None,
                    stale: true,
                    age: None,
                },
            };
            view.push(row);
        }
        view
    }

    /// Metrics of every running host
    pub async fn collect_metrics(&self) -> Vec<(String, MetricsEntry)> {
        let hosts = self.registry.hosts().await;
        self.metrics.collect_running(&self.cache, &hosts).await
    }

    /// Provision a new host and add it to the host list
    pub async fn create_host(&self, request: &CreateRequest) -> Result<String> {
        let started = Instant::now();
        let result = match self.control_plane.create_host(request).await {
            Ok(created) => self
                .registry
                .add(&created.host_id)
                .await
                .map(|_| created.host_id),
            Err(e) => Err(e),
        };
        let target = result.as_deref().unwrap_or("-");
        self.history
            .record("create", target, Outcome::from(&result), started.elapsed());
        result
    }

    /// Tear a host down and forget everything about it
    pub async fn delete_host(&self, host_id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.delete_and_forget(host_id).await;
        self.history
            .record("delete", host_id, Outcome::from(&result), started.elapsed());
        result
    }

    async fn delete_and_forget(&self, host_id: &str) -> Result<()> {
        self.control_plane.delete_host(host_id).await?;
        self.cache.purge(host_id).await;
        self.metrics.invalidate(host_id).await;
        self.registry.remove(host_id).await?;
        Ok(())
    }

    /// True if the control plane answers
    pub async fn test_connectivity(&self) -> bool {
        self.control_plane.test_connectivity().await
    }

    /// Empty both cache tiers and the metrics cache
    pub async fn clear_cache(&self) -> Result<()> {
        let started = Instant::now();
        self.metrics.invalidate_all().await;
        let result = self.cache.clear().await;
        self.history
            .record("clear-cache", "*", Outcome::from(&result), started.elapsed());
        result
    }

    /// Close every remote connection
    pub async fn shutdown(&self) {
        self.reaper.abort();
        self.metrics.multiplexer().close_all().await;
    }
}
