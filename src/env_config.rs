//!
//! Optional module for loading the configuration from the environment
//!
//! * `EC2_SENSOR_BASE_URL` - control-plane base URL (required)
//! * `EC2_SENSOR_API_KEY` - control-plane API key (required)
//! * `SSH_USERNAME` - remote user, defaults to `broala`
//! * `SSH_PASSWORD` - remote password, key authentication is used when unset
//! * `SENSORS_FILE` - host list, defaults to `../.sensors`
//! * `SENSOR_FLEET_CACHE_DIR` - offline cache directory
//! * `SENSOR_FLEET_STATUS_TTL` / `SENSOR_FLEET_METRICS_TTL` - freshness windows in seconds
//! * `SENSOR_FLEET_MAX_RETRIES` / `SENSOR_FLEET_RETRY_DELAY_MS` - status query backoff
//!
//! A `.env` file in the current or the parent directory is loaded first, values already set in
//! the environment win.
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, SshAuth};
use crate::{Error, Result};

/// Build a [`Config`] from the environment and validate it
pub fn from_env() -> Result<Config> {
    for file in [".env", "../.env"] {
        if dotenvy::from_filename(file).is_ok() {
            tracing::debug!("Loaded environment from {}", file);
        }
    }

    let base_url = std::env::var("EC2_SENSOR_BASE_URL")
        .map_err(|_| Error::Config("EC2_SENSOR_BASE_URL is required".into()))?;
    let api_key = std::env::var("EC2_SENSOR_API_KEY")
        .map_err(|_| Error::Config("EC2_SENSOR_API_KEY is required".into()))?;

    let mut config = Config::new(&base_url, &api_key);

    if let Ok(username) = std::env::var("SSH_USERNAME") {
        if !username.is_empty() {
            config.ssh_username = username;
        }
    }
    config.ssh_auth = match std::env::var("SSH_PASSWORD") {
        Ok(password) if !password.is_empty() => SshAuth::Password(password),
        _ => detect_key_auth(dirs::home_dir().as_deref()),
    };
    config.hosts_file = std::env::var("SENSORS_FILE")
        .map_or_else(|_| PathBuf::from("../.sensors"), PathBuf::from);
    if let Ok(dir) = std::env::var("SENSOR_FLEET_CACHE_DIR") {
        config.offline_cache_dir = PathBuf::from(dir);
    }

    if let Some(secs) = parse_var::<u64>("SENSOR_FLEET_STATUS_TTL")? {
        config.status_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_var::<u64>("SENSOR_FLEET_METRICS_TTL")? {
        config.metrics_ttl = Duration::from_secs(secs);
    }
    if let Some(retries) = parse_var::<u32>("SENSOR_FLEET_MAX_RETRIES")? {
        config.retry.max_retries = retries;
    }
    if let Some(millis) = parse_var::<u64>("SENSOR_FLEET_RETRY_DELAY_MS")? {
        config.retry.initial_delay = Duration::from_millis(millis);
    }

    config.validate()?;
    Ok(config)
}

fn detect_key_auth(home: Option<&Path>) -> SshAuth {
    let has_key = home.is_some_and(|home| {
        ["id_rsa", "id_ed25519"]
            .iter()
            .any(|key| home.join(".ssh").join(key).exists())
    });
    if has_key {
        SshAuth::Keys
    } else {
        SshAuth::None
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value '{value}'"))),
        _ => Ok(None),
    }
}
