//! SSH transport built on `openssh`.
//!
//! One multiplexed master session per host. Short commands and uploads go
//! through the session itself; long-running node channels are separate
//! `ssh -tt` clients attached to the master's control socket, so the remote
//! side gets a pseudo-terminal and dies when the client goes away.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::transport::{ExecOutput, PutOutcome, RemoteChannel, RemoteTransport};
use super::RemoteCredentials;
use crate::errors::{HarnessError, HarnessResult};

/// Keep-alive interval so idle sessions survive NAT and firewall timeouts.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SshTransport {
    runtime: Runtime,
    session: Mutex<Option<Session>>,
    control_socket: PathBuf,
    address: String,
    username: String,
    port: Option<u16>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl SshTransport {
    /// Establish the master session.
    ///
    /// Authentication is key or agent based; unknown host keys are added.
    pub fn connect(credentials: &RemoteCredentials) -> HarnessResult<Self> {
        if credentials.password.is_some() {
            return Err(HarnessError::Configuration(format!(
                "password authentication is not supported for {}; configure a key or agent",
                credentials.address
            )));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let username = credentials
            .username
            .clone()
            .unwrap_or_else(crate::node::config::current_username);

        let mut builder = SessionBuilder::default();
        builder
            .user(username.clone())
            .known_hosts_check(KnownHosts::Add)
            .server_alive_interval(KEEPALIVE_INTERVAL)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(port) = credentials.port {
            builder.port(port);
        }
        if let Some(keyfile) = &credentials.identity_file {
            builder.keyfile(keyfile);
        }

        debug!(address = %credentials.address, user = %username, "opening ssh master session");
        let session = runtime
            .block_on(builder.connect(&credentials.address))
            .map_err(|e| {
                HarnessError::Connection(format!(
                    "ssh to {}@{} failed: {e}",
                    username, credentials.address
                ))
            })?;
        let control_socket = session.control_socket().to_path_buf();
        info!(address = %credentials.address, user = %username, "ssh session established");

        Ok(Self {
            runtime,
            session: Mutex::new(Some(session)),
            control_socket,
            address: credentials.address.clone(),
            username,
            port: credentials.port,
        })
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed_error(&self) -> HarnessError {
        HarnessError::connection(format!("session to {} is closed", self.address))
    }
}

impl RemoteTransport for SshTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn exists(&self, remote_path: &str) -> HarnessResult<bool> {
        let output = self.exec(&format!(
            "test -e {}",
            shell_escape::escape(remote_path.into())
        ))?;
        Ok(output.success())
    }

    fn put_if_absent(&self, local: &Path, remote_path: &str) -> HarnessResult<PutOutcome> {
        let contents = std::fs::read(local)?;
        let script = format!(
            "set -o noclobber; cat > {}",
            shell_escape::escape(remote_path.into())
        );
        let guard = self.lock_session();
        let session = guard.as_ref().ok_or_else(|| self.closed_error())?;
        let output = self.runtime.block_on(async {
            let mut child = session
                .command("sh")
                .arg("-c")
                .arg(&script)
                .stdin(openssh::Stdio::piped())
                .stdout(openssh::Stdio::piped())
                .stderr(openssh::Stdio::piped())
                .spawn()
                .await?;
            if let Some(mut stdin) = child.stdin().take() {
                stdin.write_all(&contents).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, HarnessError>(child.wait_with_output().await?)
        })?;
        drop(guard);

        if output.status.success() {
            return Ok(PutOutcome::Written);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // noclobber refuses to truncate a file another writer already created.
        if stderr.contains("exist") {
            return Ok(PutOutcome::AlreadyExists);
        }
        Err(HarnessError::Connection(format!(
            "upload of {} to {}:{} failed: {}",
            local.display(),
            self.address,
            remote_path,
            stderr.trim()
        )))
    }

    fn exec(&self, command: &str) -> HarnessResult<ExecOutput> {
        let guard = self.lock_session();
        let session = guard.as_ref().ok_or_else(|| self.closed_error())?;
        let output = self
            .runtime
            .block_on(session.command("sh").arg("-c").arg(command).output())?;
        drop(guard);
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn spawn_channel(&self, command: &str) -> HarnessResult<RemoteChannel> {
        let mut ssh = Command::new("ssh");
        ssh.arg("-S")
            .arg(&self.control_socket)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-tt");
        if let Some(port) = self.port {
            ssh.arg("-p").arg(port.to_string());
        }
        ssh.arg(self.destination())
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = ssh
            .spawn()
            .map_err(|e| HarnessError::connection(format!("failed to open channel to {}: {e}", self.address)))?;
        debug!(address = %self.address, pid = child.id(), "opened channel");
        Ok(RemoteChannel::from_child(child))
    }

    fn close(&self) -> HarnessResult<()> {
        let session = self.lock_session().take();
        if let Some(session) = session {
            self.runtime.block_on(session.close())?;
            debug!(address = %self.address, "ssh session closed");
        }
        Ok(())
    }
}
