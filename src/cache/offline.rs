//!
//! Durable offline tier.
//!
//! One file pair per host: `{key}.json` holds the last payload seen from the control plane,
//! `{key}.time` its capture time in epoch seconds. Files are replaced by rename so a reader
//! never sees a half written payload.
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::types::StatusPayload;
use crate::Result;

const PAYLOAD_EXT: &str = "json";
const TIME_EXT: &str = "time";

/// Offline cache directory
#[derive(Clone, Debug)]
pub struct OfflineStore {
    dir: PathBuf,
}

impl OfflineStore {
    /// Store rooted at `dir`, created on first write
    #[must_use]
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ext}"))
    }

    /// Persist `payload` captured at `captured_at` under `key`
    pub async fn write(
        &self,
        key: &str,
        payload: &StatusPayload,
        captured_at: DateTime<Utc>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec(payload)?;
        self.replace(&self.path(key, PAYLOAD_EXT), &json).await?;
        self.replace(
            &self.path(key, TIME_EXT),
            captured_at.timestamp().to_string().as_bytes(),
        )
        .await
    }

    async fn replace(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Last persisted payload and its capture time
    pub async fn read(&self, key: &str) -> Result<Option<(StatusPayload, DateTime<Utc>)>> {
        let data = match tokio::fs::read(self.path(key, PAYLOAD_EXT)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload: StatusPayload = serde_json::from_slice(&data)?;

        let captured_at = self.time_of(key).await;
        Ok(Some((payload, captured_at)))
    }

    /// Capture time only, `None` when there is no payload
    pub async fn captured_at(&self, key: &str) -> Option<DateTime<Utc>> {
        if !tokio::fs::try_exists(self.path(key, PAYLOAD_EXT))
            .await
            .unwrap_or(false)
        {
            return None;
        }
        Some(self.time_of(key).await)
    }

    // A payload without a readable capture time is as old as it gets
    async fn time_of(&self, key: &str) -> DateTime<Utc> {
        tokio::fs::read_to_string(self.path(key, TIME_EXT))
            .await
            .ok()
            .and_then(|text| text.trim().parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_default()
    }

    /// Drop the entry of `key`
    pub async fn remove(&self, key: &str) -> Result<()> {
        for ext in [PAYLOAD_EXT, TIME_EXT] {
            match tokio::fs::remove_file(self.path(key, ext)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Drop every entry, returns the number of payloads removed
    pub async fn clear(&self) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(PAYLOAD_EXT) => {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
                Some(TIME_EXT) => tokio::fs::remove_file(&path).await?,
                _ => {}
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod test {
    use super::OfflineStore;
    use crate::types::{HostStatus, StatusPayload};
    use chrono::{Duration, TimeZone, Utc};

    fn payload(status: HostStatus) -> StatusPayload {
        StatusPayload {
            host_id: "sensor-1".into(),
            status,
            address: Some("10.0.0.1".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn write_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(dir.path().join("nested"));
        assert!(store.read("sensor_1").await.unwrap().is_none());

        let captured_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store
            .write("sensor_1", &payload(HostStatus::Running), captured_at)
            .await
            .unwrap();

        let (read, at) = store.read("sensor_1").await.unwrap().unwrap();
        assert_eq!(read, payload(HostStatus::Running));
        assert_eq!(at, captured_at);
        assert_eq!(store.captured_at("sensor_1").await, Some(captured_at));

        let time = std::fs::read_to_string(dir.path().join("nested/sensor_1.time")).unwrap();
        assert_eq!(time, "1700000000");
    }

    #[tokio::test]
    async fn missing_time_is_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(dir.path());
        store
            .write("k", &payload(HostStatus::Stopped), Utc::now() - Duration::seconds(5))
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("k.time")).unwrap();

        let (_, at) = store.read("k").await.unwrap().unwrap();
        assert_eq!(at.timestamp(), 0);
        assert_eq!(store.captured_at("k").await, Some(at));

        std::fs::write(dir.path().join("k.time"), b"yesterday").unwrap();
        assert_eq!(store.captured_at("k").await.map(|t| t.timestamp()), Some(0));
        assert_eq!(store.captured_at("missing").await, None);
    }

    #[tokio::test]
    async fn corrupt_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k.json"), b"{not json").unwrap();
        let store = OfflineStore::new(dir.path());
        assert!(store.read("k").await.is_err());
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();
        let store = OfflineStore::new(dir.path());
        for key in ["a", "b", "c"] {
            store
                .write(key, &payload(HostStatus::Running), Utc::now())
                .await
                .unwrap();
        }

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.read("a").await.unwrap().is_none());

        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.read("b").await.unwrap().is_none());
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(OfflineStore::new(dir.path().join("nope")).clear().await.unwrap(), 0);
    }
}
