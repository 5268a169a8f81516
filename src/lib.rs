//!
//! Status synchronization and caching engine for a fleet of ephemeral sensor hosts.
//!
//! ## Fleet
//! A [`Fleet`] owns every piece of session state: the status cache, the control-plane
//! health flag, the session statistics, the remote-execution connections and the
//! operation history.
//! ```no_run
//! #[tokio::main]
//! async fn main() -> Result<(), sensor_fleet::Error> {
//!     use sensor_fleet::{Config, Fleet};
//!
//!     let config = Config::new("https://sensors.example.net/api", "secret api key");
//!     let fleet = Fleet::builder(config).build().await?;
//!
//!     // Fetch every known host concurrently and wait for all of them
//!     let report = fleet.refresh().await?;
//!     println!("{} hosts updated", report.updated());
//!
//!     // The view is built from the cache only, it never blocks on the network
//!     for host in fleet.hosts().await {
//!         println!("{} {} stale={}", host.id, host.status, host.stale);
//!     }
//!
//!     if !fleet.health().is_online() {
//!         println!("offline mode: {:?}", fleet.health().last_error());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Metrics
//! Resource metrics are collected over a reused SSH connection, one batched command per host.
//! ```no_run
//! # async fn metrics(fleet: &sensor_fleet::Fleet) {
//! for (host_id, metrics) in fleet.collect_metrics().await {
//!     println!("{host_id}: cpu {}", metrics.cpu());
//! }
//! # }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod control_plane;
pub mod dispatch;
pub mod fleet;
pub mod health;
pub mod history;
pub mod key;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod stats;
pub mod types;

#[cfg(feature = "env-config")]
pub mod env_config;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use fleet::{Fleet, FleetBuilder};

/// Error returned by the engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-success status returned by the control plane
    #[error("HTTP failed {0}, {1}")]
    WebServer(u16, String),

    /// The retry budget was exhausted without reaching the control plane
    #[error("Control plane unreachable after {attempts} attempts: {last_error}")]
    Unreachable {
        /// Number of attempts made
        attempts: u32,
        /// Description of the last failure
        last_error: String,
    },

    /// The control plane answered with something we can't parse/understand
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// JSON serialization/deserialization error
    #[error("Serde JSON error: {0}")]
    Serde(#[from] serde_json::Error),

    /// URL parsing error
    #[error("URL: {0}")]
    URL(#[from] url::ParseError),

    /// HTTP client error
    #[error("Reqwest: {0}")]
    HTTPClient(#[from] reqwest::Error),

    /// The remote-execution transport to an address broke
    #[error("Connection to {0} is broken")]
    ConnectionBroken(String),

    /// A remote command could not be run or returned garbage
    #[error("Remote command failed: {0}")]
    Remote(String),

    /// Operation timed out
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// IO Errors
    #[error("IO error {0}")]
    IO(#[from] std::io::Error),

    /// General Error
    #[error("Error {0}")]
    General(String),
}

impl Error {
    /// Create a general error
    #[must_use]
    pub fn general(err: &str) -> Self {
        Self::General(err.to_string())
    }

    /// Transient failures are worth retrying: the control plane may answer next time.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::WebServer(status, _) => *status >= 500,
            Self::HTTPClient(_) | Self::Malformed(_) | Self::Serde(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// True when the error means the control plane itself could not be reached.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
