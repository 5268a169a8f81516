//!
//! Control-plane REST client.
//!
//! Status queries are retried with exponential backoff and feed the [`HealthTracker`]:
//! only a query that spends its whole retry budget without an answer takes the fleet view
//! offline. A host the control plane doesn't know is an answer, not an outage.
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use crate::health::HealthTracker;
use crate::types::{CreateRequest, CreateResponse, StatusPayload};
use crate::{Error, Result};

mod retry;

pub(crate) use retry::{Attempt, GaveUp};
pub use retry::RetryPolicy;

const API_KEY_HEADER: &str = "x-api-key";
const CONNECTIVITY_PATH: &str = "test-connectivity-check";
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
// Plain text body the control plane answers with for unknown hosts, e.g.
// "Error: sensor ec2-sensor-... does not exist"
const ERROR_PREFIX: &str = "Error:";
const DOES_NOT_EXIST: &str = "does not exist";

/// Builder for a [`ControlPlane`] client
#[derive(Clone)]
pub struct ControlPlaneBuilder {
    reqwest_ca: Vec<reqwest::Certificate>,
    disable_cert_verification: bool,
    request_timeout: Duration,
    create_timeout: Duration,
    retry: RetryPolicy,
}

impl ControlPlaneBuilder {
    /// Create a new builder instance
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reqwest_ca: Vec::new(),
            disable_cert_verification: false,
            request_timeout: crate::config::DEFAULT_REQUEST_TIMEOUT,
            create_timeout: crate::config::DEFAULT_CREATE_TIMEOUT,
            retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_secs(1),
            },
        }
    }

    /// Add a root certificate for API certificate verification
    pub fn add_root_certificate(mut self, cert: &[u8]) -> Result<Self> {
        let ca = reqwest::Certificate::from_pem(cert)?;
        self.reqwest_ca.push(ca);
        Ok(self)
    }

    /// Disable certificate verification
    #[must_use]
    pub fn danger_accept_invalid_certs(self) -> Self {
        Self {
            disable_cert_verification: true,
            ..self
        }
    }

    /// Timeout of a single status query attempt
    #[must_use]
    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    /// Timeout of host creation
    #[must_use]
    pub fn create_timeout(self, create_timeout: Duration) -> Self {
        Self {
            create_timeout,
            ..self
        }
    }

    /// Retry budget of status queries
    #[must_use]
    pub fn retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Client for the control plane at `base_url`, reporting reachability to `health`
    pub fn build(
        &self,
        base_url: &str,
        api_key: &str,
        health: Arc<HealthTracker>,
    ) -> Result<ControlPlane> {
        let base_url = url::Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("{base_url} can't be a base URL")));
        }

        let client = reqwest::Client::builder();
        let client = self
            .reqwest_ca
            .iter()
            .fold(client, |client, ca| client.add_root_certificate(ca.clone()));
        let client = client
            .danger_accept_invalid_certs(self.disable_cert_verification)
            .build()?;

        Ok(ControlPlane {
            base_url,
            api_key: api_key.to_string(),
            client,
            health,
            retry: self.retry,
            request_timeout: self.request_timeout,
            create_timeout: self.create_timeout,
        })
    }
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The `ControlPlane` is used for all interaction with the host lifecycle API.
#[derive(Clone)]
pub struct ControlPlane {
    base_url: url::Url,
    api_key: String,
    client: reqwest::Client,
    health: Arc<HealthTracker>,
    retry: RetryPolicy,
    request_timeout: Duration,
    create_timeout: Duration,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field("create_timeout", &self.create_timeout)
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Create a ControlPlane builder
    #[must_use]
    pub const fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    /// Health tracker this client reports to
    #[must_use]
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Retry budget of status queries
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn url_for(&self, segment: &str) -> Result<url::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("{} can't be a base URL", self.base_url)))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    /// Fetch the status of one host.
    ///
    /// A host unknown to the control plane comes back as a payload with status
    /// [`crate::types::HostStatus::Deleted`]. [`Error::Unreachable`] means the retry budget
    /// was spent and the health tracker is now offline.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn fetch_status(&self, host_id: &str) -> Result<StatusPayload> {
        let url = self.url_for(host_id)?;

        match self.retry.run(|_| self.attempt_status(&url, host_id)).await {
            Ok(payload) => {
                self.health.mark_online();
                Ok(payload)
            }
            Err(GaveUp::Aborted(e)) => {
                // We got an answer, just not a useful one
                self.health.mark_online();
                Err(e)
            }
            Err(GaveUp::Exhausted { attempts, last }) => {
                let last_error = last.to_string();
                self.health.mark_offline(&last_error);
                Err(Error::Unreachable {
                    attempts,
                    last_error,
                })
            }
        }
    }

    async fn attempt_status(
        &self,
        url: &url::Url,
        host_id: &str,
    ) -> std::result::Result<StatusPayload, Attempt> {
        let result = self
            .client
            .get(url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .header("Accept", "application/json")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Attempt::from(Error::from(e)))?;

        let status = result.status();
        let text = result
            .text()
            .await
            .map_err(|e| Attempt::from(Error::from(e)))?;

        if status == StatusCode::NOT_FOUND
            || (!status.is_server_error() && reports_missing(&text))
        {
            tracing::info!("{} does not exist upstream", host_id);
            return Ok(StatusPayload::deleted(host_id));
        }
        if !status.is_success() {
            if !status.is_server_error() {
                tracing::error!("status query for {} failed: {}", host_id, status);
            }
            return Err(Error::WebServer(status.as_u16(), status.to_string()).into());
        }

        let mut payload: StatusPayload = serde_json::from_str(&text)
            .map_err(|e| Attempt::from(Error::Malformed(format!("{host_id}: {e}"))))?;
        if payload.host_id.is_empty() {
            payload.host_id = host_id.to_string();
        }
        Ok(payload)
    }

    /// Provision a new host
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_host(&self, request: &CreateRequest) -> Result<CreateResponse> {
        let url = self.url_for("create")?;
        tracing::debug!("POST {} {:?}", url, request);

        let result = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Accept", "application/json")
            .json(request)
            .timeout(self.create_timeout)
            .send()
            .await?;

        let status = result.status();
        let text = result.text().await?;
        if !status.is_success() {
            tracing::error!("POST call failed");
            return Err(Error::WebServer(status.as_u16(), text));
        }

        let created: CreateResponse =
            serde_json::from_str(&text).map_err(|e| Error::Malformed(e.to_string()))?;
        if created.host_id.is_empty() {
            return Err(Error::Malformed("no host id in create response".into()));
        }
        tracing::info!("created host {}", created.host_id);
        Ok(created)
    }

    /// Tear a host down. Deleting a host that is already gone succeeds.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_host(&self, host_id: &str) -> Result<()> {
        let url = self.url_for(host_id)?;
        tracing::debug!("DELETE {}", url);

        let result = self
            .client
            .delete(url)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = result.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!("{} was already gone", host_id);
            return Ok(());
        }
        if !status.is_success() {
            tracing::error!("DELETE call failed");
            let text = result.text().await.unwrap_or_default();
            return Err(Error::WebServer(status.as_u16(), text));
        }
        Ok(())
    }

    /// True if the control plane answers at all, even with a client error
    pub async fn test_connectivity(&self) -> bool {
        let Ok(url) = self.url_for(CONNECTIVITY_PATH) else {
            return false;
        };
        match self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await
        {
            Ok(result) => !result.status().is_server_error(),
            Err(e) => {
                tracing::debug!("connectivity check failed: {}", e);
                false
            }
        }
    }
}

// Only a plain text error counts, a JSON payload may quote the phrase in any field
fn reports_missing(body: &str) -> bool {
    body.contains(ERROR_PREFIX)
        && body.contains(DOES_NOT_EXIST)
        && serde_json::from_str::<serde_json::Value>(body).is_err()
}
