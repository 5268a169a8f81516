//!
//! Engine configuration.
//!
//! The engine only takes plain values. Reading them from the environment is left to the
//! caller, or to [`crate::env_config`] when the `env-config` feature is enabled.
use std::path::PathBuf;
use std::time::Duration;

use crate::control_plane::RetryPolicy;
use crate::{Error, Result};

/// Default freshness window of a status entry
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(60);
/// Default freshness window of a metrics entry
pub const DEFAULT_METRICS_TTL: Duration = Duration::from_secs(60);
/// Default per-attempt timeout of a status query
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Host creation is slow, it gets its own timeout
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout of a metrics command
pub const DEFAULT_METRICS_TIMEOUT: Duration = Duration::from_secs(5);
/// Remote connections unused for this long are closed
pub const DEFAULT_CONNECTION_IDLE: Duration = Duration::from_secs(5 * 60);
/// Default number of operations kept in the history
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// SSH credentials, picked by availability
#[derive(Clone)]
pub enum SshAuth {
    /// Key based, using the user's ssh setup
    Keys,
    /// Password based, fed to `sshpass`
    Password(String),
    /// Nothing configured, ssh runs in batch mode and fails if it needs a prompt
    None,
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keys => f.write_str("Keys"),
            Self::Password(_) => f.write_str("Password(***)"),
            Self::None => f.write_str("None"),
        }
    }
}

/// Configuration of a [`crate::Fleet`]
#[derive(Clone)]
pub struct Config {
    /// Control-plane base URL
    pub api_base_url: String,
    /// Static credential sent as `x-api-key`
    pub api_key: String,
    /// Remote-execution user
    pub ssh_username: String,
    /// Remote-execution credentials
    pub ssh_auth: SshAuth,
    /// File with one known host id per line
    pub hosts_file: PathBuf,
    /// Directory of the durable offline cache
    pub offline_cache_dir: PathBuf,
    /// Freshness window of status entries
    pub status_ttl: Duration,
    /// Freshness window of metrics entries
    pub metrics_ttl: Duration,
    /// Retry/backoff of status queries
    pub retry: RetryPolicy,
    /// Per-attempt timeout of status queries
    pub request_timeout: Duration,
    /// Timeout of host creation
    pub create_timeout: Duration,
    /// Timeout of metrics commands
    pub metrics_timeout: Duration,
    /// Idle period after which remote connections are closed
    pub connection_idle: Duration,
    /// Number of operations kept in the history
    pub history_capacity: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("ssh_username", &self.ssh_username)
            .field("ssh_auth", &self.ssh_auth)
            .field("hosts_file", &self.hosts_file)
            .field("offline_cache_dir", &self.offline_cache_dir)
            .field("status_ttl", &self.status_ttl)
            .field("metrics_ttl", &self.metrics_ttl)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field("metrics_timeout", &self.metrics_timeout)
            .field("connection_idle", &self.connection_idle)
            .field("history_capacity", &self.history_capacity)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Configuration with default tuning for the given control plane
    #[must_use]
    pub fn new(api_base_url: &str, api_key: &str) -> Self {
        Self {
            api_base_url: api_base_url.to_string(),
            api_key: api_key.to_string(),
            ssh_username: "broala".to_string(),
            ssh_auth: SshAuth::Keys,
            hosts_file: PathBuf::from(".sensors"),
            offline_cache_dir: default_offline_cache_dir(),
            status_ttl: DEFAULT_STATUS_TTL,
            metrics_ttl: DEFAULT_METRICS_TTL,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            metrics_timeout: DEFAULT_METRICS_TIMEOUT,
            connection_idle: DEFAULT_CONNECTION_IDLE,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    /// Check that the required values are present
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(Error::Config("control-plane base URL is required".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("control-plane API key is required".into()));
        }
        url::Url::parse(&self.api_base_url)?;
        if self.history_capacity == 0 {
            return Err(Error::Config("history capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// `<user cache dir>/sensor-fleet`, or `~/.ec2sensor/cache` where there is no cache dir
#[must_use]
pub fn default_offline_cache_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || {
            dirs::home_dir()
                .unwrap_or_default()
                .join(".ec2sensor")
                .join("cache")
        },
        |dir| dir.join("sensor-fleet"),
    )
}

#[cfg(test)]
mod test {
    use super::{Config, SshAuth};

    #[test]
    fn validate() {
        assert!(Config::new("https://api.example.net/sensors", "key").validate().is_ok());
        assert!(Config::new("", "key").validate().is_err());
        assert!(Config::new("https://api.example.net", " ").validate().is_err());
        assert!(Config::new("not a url", "key").validate().is_err());

        let mut config = Config::new("https://api.example.net", "key");
        config.history_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn secrets_stay_out_of_debug() {
        let mut config = Config::new("https://api.example.net", "top-secret-key");
        config.ssh_auth = SshAuth::Password("hunter2".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("top-secret-key"));
        assert!(!debug.contains("hunter2"));
    }
}
