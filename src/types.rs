//!
//! Types returned from the control plane and the metrics collector.
//!
//! NOTE: The status payload is not exhaustive, unknown fields are carried along untouched.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle status of a host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Being provisioned
    #[serde(alias = "pending")]
    Starting,
    /// Up and reachable
    Running,
    /// Stopped, but still exists
    Stopped,
    /// Provisioning or runtime failure
    Error,
    /// Gone upstream
    #[serde(alias = "terminated")]
    Deleted,
    /// Never observed or not understood
    #[default]
    #[serde(other)]
    Unknown,
}

impl HostStatus {
    /// Label used in views
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status payload returned from `GET /{host_id}`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Host identifier
    #[serde(rename = "ec2_sensor_name", default)]
    pub host_id: String,
    /// Lifecycle status
    #[serde(
        rename = "sensor_status",
        default,
        deserialize_with = "status_or_unknown"
    )]
    pub status: HostStatus,
    /// Network address, only present once the host has one
    #[serde(
        rename = "sensor_ip",
        default,
        deserialize_with = "address",
        skip_serializing_if = "Option::is_none"
    )]
    pub address: Option<String>,
    /// Login user on the host
    #[serde(rename = "sensor_username", default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Host flavour
    #[serde(rename = "sensor_type", default, skip_serializing_if = "Option::is_none")]
    pub host_type: Option<String>,
    /// Software branch the host was built from
    #[serde(rename = "dev_branch", default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Provisioning stack
    #[serde(rename = "stack_name", default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    /// Installed software version
    #[serde(rename = "brolin_version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Creation time as reported by the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Fields this crate doesn't know about
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusPayload {
    /// Payload standing for a host the control plane no longer knows about
    #[must_use]
    pub fn deleted(host_id: &str) -> Self {
        Self {
            host_id: host_id.to_string(),
            status: HostStatus::Deleted,
            ..Default::default()
        }
    }

    /// True if the host can take remote commands
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == HostStatus::Running && self.address.is_some()
    }
}

// A null or missing status is just as unknown as a status we don't recognise.
fn status_or_unknown<'de, D>(deserializer: D) -> Result<HostStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HostStatus>::deserialize(deserializer)?.unwrap_or_default())
}

fn address<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let address = Option::<String>::deserialize(deserializer)?;
    Ok(address
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty() && a != "no-ip" && a != "null"))
}

/// Resource usage of a host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// CPU usage percentage
    pub cpu_percent: u8,
    /// Memory usage percentage
    pub memory_percent: u8,
    /// Root disk usage percentage
    pub disk_percent: u8,
    /// Number of healthy services/pods
    pub services: u32,
}

/// Result of a metrics collection
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum MetricsEntry {
    /// Metrics collected at `captured_at`
    Available {
        /// Values
        metrics: ResourceMetrics,
        /// Capture time
        captured_at: DateTime<Utc>,
    },
    /// Host could not be probed or answered garbage
    Unavailable,
}

impl MetricsEntry {
    /// The collected values, if any
    #[must_use]
    pub const fn metrics(&self) -> Option<&ResourceMetrics> {
        match self {
            Self::Available { metrics, .. } => Some(metrics),
            Self::Unavailable => None,
        }
    }

    /// True for the "not available" sentinel
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// CPU column, `-` when unavailable
    #[must_use]
    pub fn cpu(&self) -> String {
        self.metrics()
            .map_or_else(|| "-".to_string(), |m| format!("{}%", m.cpu_percent))
    }

    /// Memory column, `-` when unavailable
    #[must_use]
    pub fn memory(&self) -> String {
        self.metrics()
            .map_or_else(|| "-".to_string(), |m| format!("{}%", m.memory_percent))
    }

    /// Disk column, `-` when unavailable
    #[must_use]
    pub fn disk(&self) -> String {
        self.metrics()
            .map_or_else(|| "-".to_string(), |m| format!("{}%", m.disk_percent))
    }

    /// Services column, `-` when unavailable
    #[must_use]
    pub fn services(&self) -> String {
        self.metrics()
            .map_or_else(|| "-".to_string(), |m| m.services.to_string())
    }
}

/// Body of `POST /create`
#[derive(Clone, Debug, Serialize)]
pub struct CreateRequest {
    /// Branch the new host is built from
    pub development_branch: String,
    /// Owning team
    pub team_name: String,
    /// Requesting user
    pub username: String,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            development_branch: "testing".to_string(),
            team_name: "cicd".to_string(),
            username: "codebuff".to_string(),
        }
    }
}

/// Returned from `POST /create`
#[derive(Clone, Debug, Deserialize)]
pub struct CreateResponse {
    /// New host identifier
    #[serde(rename = "ec2_sensor_name", default)]
    pub host_id: String,
    /// Address, usually not assigned yet
    #[serde(rename = "sensor_ip", default, deserialize_with = "address")]
    pub address: Option<String>,
    /// Initial status
    #[serde(
        rename = "sensor_status",
        default,
        deserialize_with = "status_or_unknown"
    )]
    pub status: HostStatus,
}

/// A service and its state on a host
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// Service name
    pub name: String,
    /// Reported state
    pub status: String,
}
