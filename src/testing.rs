//!
//! Test fixtures: an in-process control plane and an in-memory remote transport.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::{Config, SshAuth};
use crate::control_plane::RetryPolicy;
use crate::remote::{CommandOutput, Connector, Session};
use crate::{Error, Result};

/// Status body of a running host
pub(crate) fn running(host_id: &str, address: &str) -> Value {
    json!({
        "ec2_sensor_name": host_id,
        "sensor_ip": address,
        "sensor_status": "running",
        "brolin_version": "28.4.1",
    })
}

/// Configuration pointing at `base_url` with a fast retry budget
pub(crate) fn test_config(base_url: &str, dir: &Path) -> Config {
    let mut config = Config::new(base_url, MockControlPlane::API_KEY);
    config.ssh_auth = SshAuth::None;
    config.hosts_file = dir.join("sensors");
    config.offline_cache_dir = dir.join("offline");
    config.retry = RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(5),
    };
    config.request_timeout = Duration::from_millis(300);
    config.metrics_timeout = Duration::from_millis(300);
    config
}

/// Scripted answer of the mock control plane
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Status(Value),
    NotFound,
    ServerError,
    Text(String),
    Hang,
    /// Server error for the first n hits, then the wrapped reply
    FailFirst(u32, Box<Reply>),
}

#[derive(Default)]
struct MockState {
    replies: HashMap<String, Reply>,
    fallback: Option<Reply>,
    hits: HashMap<String, u32>,
    deleted: Vec<String>,
    last_create: Option<Value>,
    created: u32,
}

type Shared = Arc<Mutex<MockState>>;

/// Control plane served on a random local port, shut down on drop
pub(crate) struct MockControlPlane {
    addr: SocketAddr,
    state: Shared,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for MockControlPlane {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl MockControlPlane {
    pub const API_KEY: &'static str = "test-api-key";

    pub async fn start() -> Self {
        let state = Shared::default();
        let app = Router::new()
            .route("/create", post(create))
            .route("/{host_id}", get(status).delete(delete))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            state,
            server,
        }
    }

    /// URL nothing listens on
    pub async fn closed_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set(&self, host_id: &str, reply: Reply) {
        self.state.lock().replies.insert(host_id.to_string(), reply);
    }

    /// Reply for every host without its own
    pub fn set_fallback(&self, reply: Reply) {
        self.state.lock().fallback = Some(reply);
    }

    pub fn hits(&self, host_id: &str) -> u32 {
        self.state.lock().hits.get(host_id).copied().unwrap_or(0)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn last_create(&self) -> Option<Value> {
        self.state.lock().last_create.clone()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("x-api-key").and_then(|v| v.to_str().ok()) == Some(MockControlPlane::API_KEY)
}

fn resolve(reply: Reply, hit: u32) -> Reply {
    match reply {
        Reply::FailFirst(n, _) if hit <= n => Reply::ServerError,
        Reply::FailFirst(_, then) => resolve(*then, hit),
        reply => reply,
    }
}

async fn status(
    State(state): State<Shared>,
    UrlPath(host_id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let reply = {
        let mut state = state.lock();
        let hits = state.hits.entry(host_id.clone()).or_default();
        *hits += 1;
        let hit = *hits;
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
        }
        let reply = state
            .replies
            .get(&host_id)
            .or(state.fallback.as_ref())
            .cloned()
            .unwrap_or(Reply::NotFound);
        resolve(reply, hit)
    };

    match reply {
        Reply::Status(body) => Json(body).into_response(),
        Reply::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
        Reply::Text(text) => text.into_response(),
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        Reply::ServerError | Reply::FailFirst(..) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn delete(
    State(state): State<Shared>,
    UrlPath(host_id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut state = state.lock();
    if state.replies.remove(&host_id).is_some() {
        state.deleted.push(host_id);
        StatusCode::OK.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn create(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut state = state.lock();
    state.created += 1;
    let host_id = format!(
        "ec2-sensor-{}-{}-{}-{}",
        body["development_branch"].as_str().unwrap_or_default(),
        body["team_name"].as_str().unwrap_or_default(),
        body["username"].as_str().unwrap_or_default(),
        1_700_000_000 + state.created
    );
    state.replies.insert(
        host_id.clone(),
        Reply::Status(json!({"ec2_sensor_name": host_id, "sensor_status": "pending"})),
    );
    state.last_create = Some(body);
    Json(json!({"ec2_sensor_name": host_id, "sensor_status": "pending"})).into_response()
}

#[derive(Default)]
struct FakeState {
    responses: HashMap<(String, String), (String, i32)>,
    broken: HashSet<String>,
    hanging: HashSet<String>,
    connects: HashMap<String, u32>,
    closes: HashMap<String, u32>,
    active: HashMap<String, u32>,
    max_active: HashMap<String, u32>,
}

/// In-memory [`Connector`], commands answer from a script
#[derive(Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn respond(&self, address: &str, command: &str, stdout: &str) {
        self.respond_with_exit(address, command, stdout, 0);
    }

    pub fn respond_with_exit(&self, address: &str, command: &str, stdout: &str, exit_code: i32) {
        self.state.lock().responses.insert(
            (address.to_string(), command.to_string()),
            (stdout.to_string(), exit_code),
        );
    }

    /// Live sessions report a broken transport, new ones can't be opened
    pub fn break_sessions(&self, address: &str) {
        self.state.lock().broken.insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.state.lock().broken.remove(address);
    }

    /// Commands never complete
    pub fn hang(&self, address: &str) {
        self.state.lock().hanging.insert(address.to_string());
    }

    pub fn connects(&self, address: &str) -> u32 {
        self.state.lock().connects.get(address).copied().unwrap_or(0)
    }

    pub fn closes(&self, address: &str) -> u32 {
        self.state.lock().closes.get(address).copied().unwrap_or(0)
    }

    pub fn max_concurrent(&self, address: &str) -> u32 {
        self.state.lock().max_active.get(address).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn Session>> {
        let mut state = self.state.lock();
        if state.broken.contains(address) {
            return Err(Error::ConnectionBroken(address.to_string()));
        }
        *state.connects.entry(address.to_string()).or_default() += 1;
        Ok(Box::new(FakeSession {
            address: address.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    address: String,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait::async_trait]
impl Session for FakeSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let hanging = {
            let mut state = self.state.lock();
            if state.broken.contains(&self.address) {
                return Err(Error::ConnectionBroken(self.address.clone()));
            }
            let active = state.active.entry(self.address.clone()).or_default();
            *active += 1;
            let now = *active;
            let max = state.max_active.entry(self.address.clone()).or_default();
            *max = (*max).max(now);
            state.hanging.contains(&self.address)
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;

        let mut state = self.state.lock();
        if let Some(active) = state.active.get_mut(&self.address) {
            *active -= 1;
        }
        let (stdout, exit_code) = state
            .responses
            .get(&(self.address.clone(), command.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(CommandOutput { stdout, exit_code })
    }

    async fn close(&mut self) {
        *self
            .state
            .lock()
            .closes
            .entry(self.address.clone())
            .or_default() += 1;
    }
}
