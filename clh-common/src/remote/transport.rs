//! Transport seam between [`RemoteHost`](super::RemoteHost) and the wire.
//!
//! Production uses [`SshTransport`](super::ssh::SshTransport); tests plug in
//! a transport that runs everything on the local machine.

use std::io;
use std::path::Path;
use std::process::{Child, ChildStdout, ChildStderr, ExitStatus};

use tracing::debug;

use crate::errors::HarnessResult;

/// Output of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Result of a create-if-absent upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Someone else created the destination first.
    AlreadyExists,
}

/// Operations a remote host must support.
pub trait RemoteTransport: Send + Sync {
    /// Publicly reachable address of the host.
    fn address(&self) -> &str;

    /// Login name on the host.
    fn username(&self) -> &str;

    /// `user@address`, for logs and peer copies.
    fn destination(&self) -> String {
        format!("{}@{}", self.username(), self.address())
    }

    /// Stat-like probe for a remote path.
    fn exists(&self, remote_path: &str) -> HarnessResult<bool>;

    /// Copy `local` to `remote_path` unless the destination already exists.
    fn put_if_absent(&self, local: &Path, remote_path: &str) -> HarnessResult<PutOutcome>;

    /// Run a shell command to completion.
    fn exec(&self, command: &str) -> HarnessResult<ExecOutput>;

    /// Start `command` on a pseudo-terminal backed channel.
    fn spawn_channel(&self, command: &str) -> HarnessResult<RemoteChannel>;

    /// Tear down the session.
    fn close(&self) -> HarnessResult<()> {
        Ok(())
    }
}

/// An interactive command channel.
///
/// Backed by a local child process relaying the remote command (for SSH, an
/// `ssh -tt` client multiplexed over the master session). Because the remote
/// side has a pseudo-terminal, closing the channel hangs up the terminal and
/// the remote process dies with it.
#[derive(Debug)]
pub struct RemoteChannel {
    child: Child,
    closed: bool,
    exit_status: Option<ExitStatus>,
}

impl RemoteChannel {
    pub fn from_child(child: Child) -> Self {
        Self {
            child,
            closed: false,
            exit_status: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the command on this channel has finished.
    pub fn exit_status_ready(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(err) => {
                debug!(error = %err, "channel status check failed, treating as exited");
                true
            }
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Close the channel, killing whatever runs on it. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        drop(self.child.stdin.take());
        if !self.exit_status_ready() {
            match self.child.kill() {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
                Err(err) => return Err(err),
            }
        }
        let status = self.child.wait()?;
        self.exit_status.get_or_insert(status);
        Ok(())
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
