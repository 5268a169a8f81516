//!
//! Two tier status cache.
//!
//! The session tier lives in memory for the life of the process and is what views read. The
//! offline tier is a directory on disk that survives restarts and is only read when the
//! control plane can't be reached. Entries are independent per host: the session map locks
//! per bucket, never across the whole fleet.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::key;
use crate::stats::SessionStats;
use crate::types::StatusPayload;

mod offline;

pub use offline::OfflineStore;

/// Returned by [`CacheStore::offline_age`] when there is no offline entry
pub const NO_OFFLINE_DATA: u64 = u64::MAX;

/// A cached status payload
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    /// Payload as decoded from the control plane
    pub payload: StatusPayload,
    /// When the payload was observed
    pub captured_at: DateTime<Utc>,
    /// Restored from the offline tier rather than fetched this session
    pub stale: bool,
}

impl CacheEntry {
    /// Time since capture, zero if the clock went backwards
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.captured_at).to_std().unwrap_or_default()
    }
}

/// Status cache of a fleet
#[derive(Debug)]
pub struct CacheStore {
    session: scc::HashMap<String, CacheEntry>,
    offline: OfflineStore,
    ttl: Duration,
    stats: Arc<SessionStats>,
}

impl CacheStore {
    /// Cache with the given freshness window, persisting to `offline`
    #[must_use]
    pub fn new(offline: OfflineStore, ttl: Duration, stats: Arc<SessionStats>) -> Self {
        Self {
            session: scc::HashMap::new(),
            offline,
            ttl,
            stats,
        }
    }

    /// Freshness window
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Offline tier
    #[must_use]
    pub const fn offline(&self) -> &OfflineStore {
        &self.offline
    }

    /// Store a payload fetched from the control plane, stamped now, in both tiers.
    /// A failing offline write is logged and otherwise ignored.
    pub async fn put(&self, host_id: &str, payload: StatusPayload) {
        let key = key::encode(host_id);
        let captured_at = Utc::now();

        if let Err(e) = self.offline.write(&key, &payload, captured_at).await {
            tracing::warn!("failed to persist offline entry for {}: {}", host_id, e);
        }

        let entry = CacheEntry {
            payload,
            captured_at,
            stale: false,
        };
        self.session.upsert_async(key, entry).await;
        self.stats.record_api_call();
    }

    /// Session payload, fresh or not
    pub async fn get(&self, host_id: &str) -> Option<StatusPayload> {
        self.entry(host_id).await.map(|e| e.payload)
    }

    /// Session entry with its capture time and staleness
    pub async fn entry(&self, host_id: &str) -> Option<CacheEntry> {
        self.session
            .get_async(&key::encode(host_id))
            .await
            .map(|e| e.get().clone())
    }

    /// True if a session entry fetched this session is younger than the TTL
    pub async fn is_fresh(&self, host_id: &str) -> bool {
        self.entry(host_id)
            .await
            .is_some_and(|e| !e.stale && e.age() < self.ttl)
    }

    /// Forget the session tier, the offline tier is untouched
    pub async fn invalidate_all(&self) {
        let dropped = self.session.len();
        self.session.clear_async().await;
        tracing::debug!("invalidated {} session entries", dropped);
    }

    /// Offline payload
    pub async fn get_offline(&self, host_id: &str) -> Option<StatusPayload> {
        self.read_offline(host_id).await.map(|(payload, _)| payload)
    }

    /// Age in seconds of the offline entry, [`NO_OFFLINE_DATA`] if there is none
    pub async fn offline_age(&self, host_id: &str) -> u64 {
        match self.offline.captured_at(&key::encode(host_id)).await {
            Some(at) => u64::try_from((Utc::now() - at).num_seconds()).unwrap_or(0),
            None => NO_OFFLINE_DATA,
        }
    }

    async fn read_offline(&self, host_id: &str) -> Option<(StatusPayload, DateTime<Utc>)> {
        match self.offline.read(&key::encode(host_id)).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("unreadable offline entry for {}: {}", host_id, e);
                None
            }
        }
    }

    /// Copy the offline entry into the session tier, flagged stale.
    /// Returns the restored entry, `None` if there was nothing to restore.
    pub async fn restore_offline(&self, host_id: &str) -> Option<CacheEntry> {
        let (payload, captured_at) = self.read_offline(host_id).await?;
        let entry = CacheEntry {
            payload,
            captured_at,
            stale: true,
        };
        self.session
            .upsert_async(key::encode(host_id), entry.clone())
            .await;
        tracing::debug!(
            "serving {} from offline cache captured {}",
            host_id,
            captured_at
        );
        Some(entry)
    }

    /// Forget everything about a host, in both tiers
    pub async fn purge(&self, host_id: &str) {
        let key = key::encode(host_id);
        self.session.remove_async(&key).await;
        if let Err(e) = self.offline.remove(&key).await {
            tracing::warn!("failed to remove offline entry for {}: {}", host_id, e);
        }
    }

    /// Explicit cache clear, both tiers
    pub async fn clear(&self) -> crate::Result<()> {
        self.session.clear_async().await;
        let removed = self.offline.clear().await?;
        tracing::info!("cleared cache, {} offline entries removed", removed);
        Ok(())
    }
}
