//! Loopback transport for tests.
//!
//! Behaves like a remote host without opening any network connection: the
//! "remote" filesystem is a local directory, and commands run through the
//! local `/bin/sh`. Counters record how often each operation was used so
//! tests can assert that cached uploads never touch the transport.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::transport::{ExecOutput, PutOutcome, RemoteChannel, RemoteTransport};
use crate::errors::{HarnessError, HarnessResult};

/// Operation counters, shared with whoever holds [`LoopbackTransport::stats`].
#[derive(Debug, Default)]
pub struct LoopbackStats {
    puts: AtomicUsize,
    probes: AtomicUsize,
    execs: AtomicUsize,
}

impl LoopbackStats {
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    root: PathBuf,
    address: String,
    username: String,
    stats: Arc<LoopbackStats>,
}

impl LoopbackTransport {
    /// Remote absolute paths map below `root`.
    pub fn new(root: impl Into<PathBuf>, address: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            address: address.into(),
            username: username.into(),
            stats: Arc::default(),
        }
    }

    /// Local location backing a remote path.
    pub fn local_path(&self, remote_path: &str) -> PathBuf {
        self.root.join(remote_path.trim_start_matches('/'))
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        Arc::clone(&self.stats)
    }
}

impl RemoteTransport for LoopbackTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn exists(&self, remote_path: &str) -> HarnessResult<bool> {
        self.stats.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.local_path(remote_path).exists())
    }

    fn put_if_absent(&self, local: &Path, remote_path: &str) -> HarnessResult<PutOutcome> {
        self.stats.puts.fetch_add(1, Ordering::SeqCst);
        let dest = self.local_path(remote_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(mut file) => {
                let mut source = std::fs::File::open(local)?;
                io::copy(&mut source, &mut file)?;
                Ok(PutOutcome::Written)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    fn exec(&self, command: &str) -> HarnessResult<ExecOutput> {
        self.stats.execs.fetch_add(1, Ordering::SeqCst);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()?;
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn spawn_channel(&self, command: &str) -> HarnessResult<RemoteChannel> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("exec {command}"))
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HarnessError::connection(format!("failed to open channel: {e}")))?;
        Ok(RemoteChannel::from_child(child))
    }
}
