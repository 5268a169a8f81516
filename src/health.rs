//!
//! Control-plane reachability.
//!
//! Offline means the control plane could not be reached within a call's retry budget. A host
//! that no longer exists is not a health problem.
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Snapshot of the control-plane health
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthState {
    /// Control plane reachable
    pub online: bool,
    /// Description of the failure that took us offline
    pub last_error: Option<String>,
    /// When `online` last changed
    pub since: DateTime<Utc>,
}

/// Process-wide health flag, shared by every fetch of a [`crate::Fleet`]
#[derive(Debug)]
pub struct HealthTracker {
    state: RwLock<HealthState>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// Starts online
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HealthState {
                online: true,
                last_error: None,
                since: Utc::now(),
            }),
        }
    }

    /// A call reached the control plane
    pub fn mark_online(&self) {
        let mut state = self.state.write();
        if !state.online {
            tracing::info!("control plane reachable again");
            state.online = true;
            state.since = Utc::now();
        }
        state.last_error = None;
    }

    /// A call spent its retry budget without reaching the control plane
    pub fn mark_offline(&self, error: &str) {
        let mut state = self.state.write();
        if state.online {
            tracing::warn!("control plane unreachable, switching to offline mode: {}", error);
            state.online = false;
            state.since = Utc::now();
        }
        state.last_error = Some(error.to_string());
    }

    /// Current flag
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.read().online
    }

    /// Failure that took us offline, cleared when back online
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    /// Copy of the whole state
    #[must_use]
    pub fn snapshot(&self) -> HealthState {
        self.state.read().clone()
    }
}
