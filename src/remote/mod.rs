//!
//! Remote command execution with connection reuse.
//!
//! The [`Multiplexer`] keeps at most one live [`Session`] per host address. A session is
//! established by a [`Connector`] on first use, reused by every following command, and torn
//! down once it sits idle for longer than the idle timeout or the transport reports it broken.
//! Commands are never retried here, they may not be idempotent.
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Error, Result};

mod ssh;

pub use ssh::SshConnector;

/// Captured result of a remote command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Exit status of the command
    pub exit_code: i32,
}

impl CommandOutput {
    /// Command exited with 0
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Establishes transport sessions to an address
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session, paying the handshake cost
    async fn connect(&self, address: &str) -> Result<Box<dyn Session>>;
}

/// An established transport session
#[async_trait::async_trait]
pub trait Session: Send {
    /// Run `command`. [`Error::ConnectionBroken`] means the session is unusable.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Tear the session down
    async fn close(&mut self);
}

struct Slot {
    session: Option<Box<dyn Session>>,
    last_used: Instant,
}

impl Slot {
    fn empty() -> Self {
        Self {
            session: None,
            last_used: Instant::now(),
        }
    }

    fn idle_for(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() >= idle_timeout
    }

    async fn discard(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// One reusable session per host address
pub struct Multiplexer {
    connector: Arc<dyn Connector>,
    slots: scc::HashMap<String, Arc<Mutex<Slot>>>,
    idle_timeout: Duration,
    command_timeout: Duration,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("addresses", &self.slots.len())
            .field("idle_timeout", &self.idle_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Multiplexer opening sessions through `connector`
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        idle_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            slots: scc::HashMap::new(),
            idle_timeout,
            command_timeout,
        }
    }

    /// Timeout applied to each command
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    async fn slot(&self, address: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .entry_async(address.to_string())
            .await
            .or_insert_with(|| Arc::new(Mutex::new(Slot::empty())))
            .get()
            .clone()
    }

    /// Run `command` on `address`, reusing the live session if there is one.
    ///
    /// The address is locked for the duration of the command. A broken or timed out session
    /// is discarded and the error returned, the next call connects again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn with_connection(&self, address: &str, command: &str) -> Result<CommandOutput> {
        let slot = self.slot(address).await;
        let mut slot = slot.lock().await;

        if slot.session.is_some() && slot.idle_for(self.idle_timeout) {
            tracing::debug!("connection to {} idle too long, reconnecting", address);
            slot.discard().await;
        }
        if slot.session.is_none() {
            tracing::debug!("connecting to {}", address);
            slot.session = Some(self.connector.connect(address).await?);
        }
        let Some(session) = slot.session.as_mut() else {
            return Err(Error::ConnectionBroken(address.to_string()));
        };

        let result = match tokio::time::timeout(self.command_timeout, session.exec(command)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.command_timeout)),
        };

        match &result {
            Err(e @ (Error::ConnectionBroken(_) | Error::Timeout(_))) => {
                tracing::warn!("dropping connection to {}: {}", address, e);
                slot.discard().await;
            }
            _ => slot.last_used = Instant::now(),
        }
        result
    }

    async fn snapshot(&self) -> Vec<(String, Arc<Mutex<Slot>>)> {
        let mut slots = Vec::new();
        self.slots
            .retain_async(|address, slot| {
                slots.push((address.clone(), Arc::clone(slot)));
                true
            })
            .await;
        slots
    }

    /// Close sessions idle for longer than the idle timeout. Busy addresses are skipped.
    ///
    /// Addresses left without a session are forgotten unless a caller is about to use them.
    pub async fn reap_idle(&self) -> usize {
        let mut closed = 0;
        for (address, slot) in self.snapshot().await {
            let Ok(mut slot) = slot.try_lock() else {
                continue;
            };
            if slot.session.is_some() && slot.idle_for(self.idle_timeout) {
                tracing::debug!("closing idle connection to {}", address);
                slot.discard().await;
                closed += 1;
            }
        }

        // The map's own reference is the only one left when nobody holds the slot
        self.slots
            .retain_async(|_, slot| {
                Arc::strong_count(slot) > 1
                    || slot.try_lock().map_or(true, |s| s.session.is_some())
            })
            .await;
        closed
    }

    /// Reap idle sessions periodically until the multiplexer is dropped
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = (self.idle_timeout / 2).max(Duration::from_secs(1));
        let mux: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(mux) = mux.upgrade() else {
                    break;
                };
                mux.reap_idle().await;
            }
        })
    }

    /// Close every session, waiting for commands in flight
    pub async fn close_all(&self) {
        for (_, slot) in self.snapshot().await {
            slot.lock().await.discard().await;
        }
        self.slots.clear_async().await;
    }

    /// Number of live sessions
    pub async fn open_connections(&self) -> usize {
        let mut open = 0;
        for (_, slot) in self.snapshot().await {
            if slot.lock().await.session.is_some() {
                open += 1;
            }
        }
        open
    }

    /// Number of addresses with a slot, live or not
    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.slots.len()
    }
}

/// True if a TCP connection to `address:port` opens within `timeout`
pub async fn port_open(address: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((address, port))).await,
        Ok(Ok(_))
    )
}
