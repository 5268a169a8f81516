//!
//! OpenSSH transport.
//!
//! Each session is an OpenSSH control master for one address. Commands run as short lived
//! `ssh` processes that attach to the master's socket, so only the first one pays for the
//! handshake.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use super::{CommandOutput, Connector, Session};
use crate::config::SshAuth;
use crate::{Error, Result};

// ssh reserves 255 for its own failures, remote commands never see it
const SSH_TRANSPORT_FAILURE: i32 = 255;

static CONTROL_DIRS: AtomicUsize = AtomicUsize::new(0);

// Holds the master sockets, removed once the last connector clone is gone
#[derive(Debug)]
struct ControlDir(PathBuf);

impl ControlDir {
    fn new() -> Self {
        let n = CONTROL_DIRS.fetch_add(1, Ordering::Relaxed);
        Self(std::env::temp_dir().join(format!("sensor-fleet-{}-{n}", std::process::id())))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ControlDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.0) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!("failed to remove {}: {}", self.0.display(), e);
            }
            _ => {}
        }
    }
}

/// Opens OpenSSH control-master sessions
#[derive(Clone, Debug)]
pub struct SshConnector {
    username: String,
    auth: SshAuth,
    connect_timeout: Duration,
    persist: Duration,
    control_dir: Arc<ControlDir>,
}

impl SshConnector {
    /// Connector logging in as `username`
    #[must_use]
    pub fn new(username: &str, auth: SshAuth) -> Self {
        Self {
            username: username.to_string(),
            auth,
            connect_timeout: Duration::from_secs(10),
            persist: crate::config::DEFAULT_CONNECTION_IDLE,
            control_dir: Arc::new(ControlDir::new()),
        }
    }

    /// Handshake timeout
    #[must_use]
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// How long an unused master outlives its last command
    #[must_use]
    pub fn persist(self, persist: Duration) -> Self {
        Self { persist, ..self }
    }

    fn target(&self, address: &str) -> String {
        format!("{}@{}", self.username, address)
    }

    fn base_command(&self) -> std::process::Command {
        let mut cmd = match &self.auth {
            SshAuth::Password(password) => {
                let mut cmd = std::process::Command::new("sshpass");
                cmd.args(["-e", "ssh"]).env("SSHPASS", password);
                cmd
            }
            SshAuth::Keys | SshAuth::None => {
                let mut cmd = std::process::Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ])
        .arg("-o")
        .arg(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        ))
        .arg("-o")
        .arg(format!(
            "ControlPath={}",
            self.control_dir.path().join("%C").display()
        ))
        .stdin(Stdio::null());
        cmd
    }

    fn command(&self) -> Command {
        let mut cmd = Command::from(self.base_command());
        cmd.kill_on_drop(true);
        cmd
    }

    fn master_command(&self, address: &str) -> Command {
        let mut cmd = self.command();
        cmd.args(["-o", "ControlMaster=yes"])
            .arg("-o")
            .arg(format!("ControlPersist={}", self.persist.as_secs().max(1)))
            .args(["-f", "-N"])
            .arg(self.target(address))
            // The backgrounded master keeps inherited pipes open, don't hand it any
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn exec_command(&self, address: &str, remote: &str) -> Command {
        let mut cmd = self.command();
        cmd.args(["-o", "ControlMaster=no"])
            .arg(self.target(address))
            .arg(remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    // Blocking on purpose, it also runs where no runtime is left
    fn control_command(&self, address: &str, op: &str) -> std::process::Command {
        let mut cmd = self.base_command();
        cmd.args(["-O", op])
            .arg(self.target(address))
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait::async_trait]
impl Connector for SshConnector {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self, address: &str) -> Result<Box<dyn Session>> {
        tokio::fs::create_dir_all(self.control_dir.path()).await?;

        // Leave ssh a moment to report its own connect timeout
        let deadline = self.connect_timeout + Duration::from_secs(2);
        let status = tokio::time::timeout(deadline, self.master_command(address).status())
            .await
            .map_err(|_| Error::Timeout(deadline))??;

        if !status.success() {
            tracing::debug!("ssh master to {} exited with {:?}", address, status.code());
            return Err(Error::ConnectionBroken(address.to_string()));
        }
        tracing::debug!("ssh master to {} established", address);

        Ok(Box::new(SshSession {
            connector: self.clone(),
            address: address.to_string(),
            closed: false,
        }))
    }
}

struct SshSession {
    connector: SshConnector,
    address: String,
    closed: bool,
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped without close, the master would otherwise linger for ControlPersist
        match self.connector.control_command(&self.address, "exit").status() {
            Ok(_) => tracing::debug!("ssh master to {} closed on drop", self.address),
            Err(e) => tracing::warn!("failed to close ssh master to {}: {}", self.address, e),
        }
    }
}

#[async_trait::async_trait]
impl Session for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let output = self
            .connector
            .exec_command(&self.address, command)
            .output()
            .await?;
        command_output(&self.address, output.status.code(), &output.stdout)
    }

    async fn close(&mut self) {
        self.closed = true;
        match Command::from(self.connector.control_command(&self.address, "exit"))
            .status()
            .await
        {
            Ok(status) if status.success() => {
                tracing::debug!("ssh master to {} closed", self.address);
            }
            Ok(_) => tracing::debug!("ssh master to {} was already gone", self.address),
            Err(e) => tracing::warn!("failed to close ssh master to {}: {}", self.address, e),
        }
    }
}

fn command_output(address: &str, code: Option<i32>, stdout: &[u8]) -> Result<CommandOutput> {
    match code {
        Some(SSH_TRANSPORT_FAILURE) | None => Err(Error::ConnectionBroken(address.to_string())),
        Some(exit_code) => Ok(CommandOutput {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            exit_code,
        }),
    }
}
