//!
//! Best-effort resource metrics.
//!
//! One batched remote command per host returns `cpu|memory|disk|services`. Anything that
//! goes wrong on the way turns into [`MetricsEntry::Unavailable`], metrics never hold up the
//! status view.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cache::CacheStore;
use crate::key;
use crate::remote::Multiplexer;
use crate::types::{MetricsEntry, ResourceMetrics, ServiceStatus};
use crate::{Error, Result};

pub(crate) const METRICS_COMMAND: &str = r#"cpu=$(awk '/^cpu / {printf "%.0f", ($2+$4)*100/($2+$4+$5)}' /proc/stat 2>/dev/null || echo 0); mem=$(free 2>/dev/null | awk '/Mem:/ {printf "%.0f", $3/$2*100}' || echo 0); disk=$(df / 2>/dev/null | awk 'NR==2 {gsub(/%/,""); print $5}' || echo 0); pods=$(sudo corelightctl sensor status 2>/dev/null | grep -c Ok || sudo kubectl get pods --all-namespaces 2>/dev/null | grep -c Running || echo 0); echo "${cpu}|${mem}|${disk}|${pods}""#;
pub(crate) const UPTIME_COMMAND: &str = "uptime -p 2>/dev/null || uptime | awk '{print $3,$4}'";
pub(crate) const SERVICES_COMMAND: &str =
    "sudo corelightctl sensor status 2>/dev/null | grep -E '^[a-z]' | head -15";

/// Collects and caches [`MetricsEntry`] per host
#[derive(Debug)]
pub struct MetricsCollector {
    mux: Arc<Multiplexer>,
    cache: scc::HashMap<String, MetricsEntry>,
    ttl: Duration,
}

impl MetricsCollector {
    /// Collector running its commands through `mux`, caching results for `ttl`
    #[must_use]
    pub fn new(mux: Arc<Multiplexer>, ttl: Duration) -> Self {
        Self {
            mux,
            cache: scc::HashMap::new(),
            ttl,
        }
    }

    /// Remote connections used for collection
    #[must_use]
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    async fn cached(&self, key: &str) -> Option<MetricsEntry> {
        let entry = self.cache.get_async(key).await.map(|e| e.get().clone())?;
        match &entry {
            MetricsEntry::Available { captured_at, .. } => {
                let age = (Utc::now() - *captured_at).to_std().unwrap_or_default();
                (age < self.ttl).then_some(entry)
            }
            MetricsEntry::Unavailable => None,
        }
    }

    /// Metrics of `host_id` reachable at `address`, from cache while fresh
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_metrics(&self, host_id: &str, address: &str) -> MetricsEntry {
        let key = key::encode(host_id);
        if let Some(entry) = self.cached(&key).await {
            return entry;
        }

        let metrics = match self.mux.with_connection(address, METRICS_COMMAND).await {
            Ok(output) if output.success() => match parse_metrics(&output.stdout) {
                Some(metrics) => metrics,
                None => {
                    tracing::debug!("malformed metrics from {}: {:?}", host_id, output.stdout);
                    return MetricsEntry::Unavailable;
                }
            },
            Ok(output) => {
                tracing::debug!("metrics command on {} exited {}", host_id, output.exit_code);
                return MetricsEntry::Unavailable;
            }
            Err(e) => {
                tracing::debug!("metrics unavailable for {}: {}", host_id, e);
                return MetricsEntry::Unavailable;
            }
        };

        let entry = MetricsEntry::Available {
            metrics,
            captured_at: Utc::now(),
        };
        self.cache.upsert_async(key, entry.clone()).await;
        entry
    }

    /// Metrics of every running host with an address in `hosts`, collected concurrently.
    /// Hosts that can't be probed are left out.
    pub async fn collect_running(
        &self,
        cache: &CacheStore,
        hosts: &[String],
    ) -> Vec<(String, MetricsEntry)> {
        let mut targets = Vec::new();
        for host_id in hosts {
            if let Some(payload) = cache.get(host_id).await {
                if let (true, Some(address)) = (payload.is_ready(), payload.address) {
                    targets.push((host_id.clone(), address));
                }
            }
        }

        futures_util::future::join_all(targets.into_iter().map(|(host_id, address)| async move {
            let entry = self.get_metrics(&host_id, &address).await;
            (host_id, entry)
        }))
        .await
    }

    /// Human readable uptime of the host at `address`
    pub async fn uptime(&self, address: &str) -> Result<String> {
        let output = self.mux.with_connection(address, UPTIME_COMMAND).await?;
        if !output.success() {
            return Err(Error::Remote(format!("uptime exited {}", output.exit_code)));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Services and their state on the host at `address`
    pub async fn services(&self, address: &str) -> Result<Vec<ServiceStatus>> {
        let output = self.mux.with_connection(address, SERVICES_COMMAND).await?;
        Ok(parse_services(&output.stdout))
    }

    /// Drop the cached metrics of one host
    pub async fn invalidate(&self, host_id: &str) {
        self.cache.remove_async(&key::encode(host_id)).await;
    }

    /// Drop every cached metric
    pub async fn invalidate_all(&self) {
        self.cache.clear_async().await;
    }
}

fn parse_percent(field: &str) -> Option<u8> {
    field.trim().parse::<u8>().ok().filter(|p| *p <= 100)
}

fn parse_metrics(output: &str) -> Option<ResourceMetrics> {
    let fields: Vec<&str> = output.trim().split('|').collect();
    let [cpu, memory, disk, services] = fields.as_slice() else {
        return None;
    };
    Some(ResourceMetrics {
        cpu_percent: parse_percent(cpu)?,
        memory_percent: parse_percent(memory)?,
        disk_percent: parse_percent(disk)?,
        services: services.trim().parse().ok()?,
    })
}

fn parse_services(output: &str) -> Vec<ServiceStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(ServiceStatus {
                name: fields.next()?.to_string(),
                status: fields.next()?.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::{
        parse_metrics, parse_services, MetricsCollector, METRICS_COMMAND, SERVICES_COMMAND,
        UPTIME_COMMAND,
    };
    use crate::cache::{CacheStore, OfflineStore};
    use crate::remote::Multiplexer;
    use crate::stats::SessionStats;
    use crate::testing::FakeConnector;
    use crate::types::{HostStatus, StatusPayload};
    use std::sync::Arc;
    use std::time::Duration;

    fn collector(connector: &Arc<FakeConnector>, ttl: Duration) -> MetricsCollector {
        let mux = Multiplexer::new(
            connector.clone(),
            Duration::from_secs(300),
            Duration::from_millis(200),
        );
        MetricsCollector::new(Arc::new(mux), ttl)
    }

    #[test]
    fn parse() {
        let metrics = parse_metrics("12|40|71|9\n").unwrap();
        assert_eq!(metrics.cpu_percent, 12);
        assert_eq!(metrics.memory_percent, 40);
        assert_eq!(metrics.disk_percent, 71);
        assert_eq!(metrics.services, 9);

        for garbage in ["12|40|71", "12|40|71|9|1", "", "a|b|c|d", "12|40|171|9", "12||71|9"] {
            assert_eq!(parse_metrics(garbage), None, "{garbage}");
        }
    }

    #[test]
    fn parse_service_lines() {
        let services = parse_services("zeek Ok\nsuricata Degraded extra\n\nlonely\n");
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "zeek");
        assert_eq!(services[1].status, "Degraded");
    }

    #[tokio::test]
    async fn cached_until_ttl() {
        let connector = Arc::new(FakeConnector::default());
        connector.respond("10.0.0.1", METRICS_COMMAND, "12|40|71|9\n");
        let metrics = collector(&connector, Duration::from_millis(100));

        let first = metrics.get_metrics("sensor-a", "10.0.0.1").await;
        assert_eq!(first.cpu(), "12%");
        connector.respond("10.0.0.1", METRICS_COMMAND, "50|40|71|9\n");
        assert_eq!(metrics.get_metrics("sensor-a", "10.0.0.1").await, first);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(metrics.get_metrics("sensor-a", "10.0.0.1").await.cpu(), "50%");
    }

    #[tokio::test]
    async fn malformed_output_leaves_status_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(
            OfflineStore::new(dir.path()),
            Duration::from_secs(60),
            Arc::new(SessionStats::new()),
        );
        let payload = StatusPayload {
            host_id: "sensor-a".into(),
            status: HostStatus::Running,
            address: Some("10.0.0.1".into()),
            ..Default::default()
        };
        cache.put("sensor-a", payload.clone()).await;
        let before = cache.entry("sensor-a").await.unwrap();

        let connector = Arc::new(FakeConnector::default());
        connector.respond("10.0.0.1", METRICS_COMMAND, "12|40|71\n");
        let metrics = collector(&connector, Duration::from_secs(60));

        assert!(metrics.get_metrics("sensor-a", "10.0.0.1").await.is_unavailable());
        assert_eq!(cache.entry("sensor-a").await.unwrap(), before);
        assert!(cache.is_fresh("sensor-a").await);

        // Not cached, the next call probes again
        connector.respond("10.0.0.1", METRICS_COMMAND, "12|40|71|9\n");
        assert!(!metrics.get_metrics("sensor-a", "10.0.0.1").await.is_unavailable());
    }

    #[tokio::test]
    async fn unreachable_host_is_unavailable() {
        let connector = Arc::new(FakeConnector::default());
        connector.break_sessions("10.0.0.9");
        let metrics = collector(&connector, Duration::from_secs(60));
        assert!(metrics.get_metrics("sensor-z", "10.0.0.9").await.is_unavailable());

        let connector = Arc::new(FakeConnector::default());
        connector.respond_with_exit("10.0.0.1", METRICS_COMMAND, "", 127);
        let metrics = collector(&connector, Duration::from_secs(60));
        assert!(metrics.get_metrics("sensor-a", "10.0.0.1").await.is_unavailable());
    }

    #[tokio::test]
    async fn collect_running_hosts_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(
            OfflineStore::new(dir.path()),
            Duration::from_secs(60),
            Arc::new(SessionStats::new()),
        );
        let host = |id: &str, status, address: Option<&str>| StatusPayload {
            host_id: id.into(),
            status,
            address: address.map(Into::into),
            ..Default::default()
        };
        cache.put("a", host("a", HostStatus::Running, Some("10.0.0.1"))).await;
        cache.put("b", host("b", HostStatus::Starting, Some("10.0.0.2"))).await;
        cache.put("c", host("c", HostStatus::Running, None)).await;
        cache.put("d", host("d", HostStatus::Running, Some("10.0.0.4"))).await;

        let connector = Arc::new(FakeConnector::default());
        connector.respond("10.0.0.1", METRICS_COMMAND, "1|2|3|4");
        connector.respond("10.0.0.4", METRICS_COMMAND, "garbage");
        let metrics = collector(&connector, Duration::from_secs(60));

        let hosts: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|h| h.to_string()).collect();
        let collected = metrics.collect_running(&cache, &hosts).await;
        let ids: Vec<&str> = collected.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["a", "d"]);
        assert_eq!(collected[0].1.services(), "4");
        assert!(collected[1].1.is_unavailable());
        assert_eq!(connector.connects("10.0.0.2"), 0);
    }

    #[tokio::test]
    async fn uptime_and_services() {
        let connector = Arc::new(FakeConnector::default());
        connector.respond("10.0.0.1", UPTIME_COMMAND, "up 3 hours, 2 minutes\n");
        connector.respond("10.0.0.1", SERVICES_COMMAND, "zeek Ok\nsuricata Ok\n");
        let metrics = collector(&connector, Duration::from_secs(60));

        assert_eq!(metrics.uptime("10.0.0.1").await.unwrap(), "up 3 hours, 2 minutes");
        assert_eq!(metrics.services("10.0.0.1").await.unwrap().len(), 2);
        // Both probes share one connection
        assert_eq!(connector.connects("10.0.0.1"), 1);
    }
}
