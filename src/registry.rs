//!
//! Persisted list of known hosts.
//!
//! A plain text file with one host id per line. The file is rewritten on every change, the
//! last write wins if several processes share it.
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::Result;

/// The fleet's known hosts
#[derive(Debug)]
pub struct HostRegistry {
    path: PathBuf,
    hosts: Mutex<Vec<String>>,
}

impl HostRegistry {
    /// Load the list at `path`, a missing file is an empty fleet
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let hosts = match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no host list at {}, starting empty", path.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("loaded {} hosts from {}", hosts.len(), path.display());
        Ok(Self {
            path,
            hosts: Mutex::new(hosts),
        })
    }

    /// Location of the list
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Known hosts, oldest first by the numeric suffix of their id
    pub async fn hosts(&self) -> Vec<String> {
        let mut hosts = self.hosts.lock().await.clone();
        hosts.sort_by_key(|id| numeric_suffix(id));
        hosts
    }

    /// True if `host_id` is known
    pub async fn contains(&self, host_id: &str) -> bool {
        self.hosts.lock().await.iter().any(|h| h == host_id)
    }

    /// Add a host, returns false if it was already known
    pub async fn add(&self, host_id: &str) -> Result<bool> {
        let mut hosts = self.hosts.lock().await;
        if hosts.iter().any(|h| h == host_id) {
            return Ok(false);
        }
        hosts.push(host_id.to_string());
        self.persist(&hosts).await?;
        Ok(true)
    }

    /// Forget a host, returns false if it wasn't known
    pub async fn remove(&self, host_id: &str) -> Result<bool> {
        let mut hosts = self.hosts.lock().await;
        let before = hosts.len();
        hosts.retain(|h| h != host_id);
        if hosts.len() == before {
            return Ok(false);
        }
        self.persist(&hosts).await?;
        tracing::info!("removed {} from {}", host_id, self.path.display());
        Ok(true)
    }

    async fn persist(&self, hosts: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut text = hosts.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }
}

fn parse(text: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !hosts.iter().any(|h| h == line) {
            hosts.push(line.to_string());
        }
    }
    hosts
}

// Ids end in a creation timestamp, anything else sorts first
fn numeric_suffix(host_id: &str) -> u64 {
    host_id
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
