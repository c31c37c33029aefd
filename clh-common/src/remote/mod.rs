//! Remote hosts: one authenticated session, content-addressed uploads,
//! synchronous commands and pseudo-terminal channels for node processes.

pub mod loopback;
#[cfg(unix)]
pub mod ssh;
pub mod transport;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

pub use loopback::{LoopbackStats, LoopbackTransport};
pub use transport::{ExecOutput, PutOutcome, RemoteChannel, RemoteTransport};

use crate::errors::{HarnessError, HarnessResult};
use crate::node::config::current_username;
use crate::sandbox::find_file;

/// How to reach and authenticate against a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub address: String,
    /// Defaults to the local user.
    pub username: Option<String>,
    /// Rejected: sessions authenticate with keys or an agent.
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
}

impl RemoteCredentials {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

/// Destination of an upload: `/tmp/<hash(content, uploader)>-<basename>`.
///
/// Deterministic, so a second process uploading the same file as the same
/// user finds it already present and skips the transfer.
pub fn upload_destination(local: &Path, uploader: &str) -> HarnessResult<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(local)?;
    io::copy(&mut file, &mut hasher)?;
    hasher.update(uploader.as_bytes());
    let basename = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| HarnessError::Configuration(format!("not a file: {}", local.display())))?;
    Ok(format!("/tmp/{}-{}", hasher.finalize().to_hex(), basename))
}

/// A host nodes can be launched on.
pub struct RemoteHost {
    transport: Box<dyn RemoteTransport>,
    uploader: String,
    uploaded: Mutex<HashMap<PathBuf, String>>,
}

impl std::fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHost")
            .field("destination", &self.transport.destination())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ssh://{}", self.transport.destination())
    }
}

impl RemoteHost {
    /// Open an SSH session to the host.
    #[cfg(unix)]
    pub fn connect(credentials: RemoteCredentials) -> HarnessResult<Self> {
        let transport = ssh::SshTransport::connect(&credentials)?;
        Ok(Self::with_transport(Box::new(transport)))
    }

    pub fn with_transport(transport: Box<dyn RemoteTransport>) -> Self {
        Self {
            transport,
            uploader: current_username(),
            uploaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    pub fn username(&self) -> &str {
        self.transport.username()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, String>> {
        self.uploaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remote path a local file was uploaded (or recorded) to.
    pub fn uploaded_path(&self, local: &Path) -> Option<String> {
        let key = cache_key(local);
        self.cache().get(&key).cloned()
    }

    /// Upload `local` once; repeat calls return the cached destination.
    ///
    /// The transfer is skipped when the destination already exists, and a
    /// concurrent writer winning the race counts as success.
    pub fn upload(&self, local: impl AsRef<Path>) -> HarnessResult<String> {
        let found = find_file(local.as_ref())?;
        let key = cache_key(&found);
        if let Some(dest) = self.cache().get(&key) {
            return Ok(dest.clone());
        }

        let dest = upload_destination(&found, &self.uploader)?;
        if self.transport.exists(&dest)? {
            info!(host = %self, file = %found.display(), dest = %dest, "Skipping upload, file exists on remote side");
        } else {
            debug!(host = %self, file = %found.display(), dest = %dest, "uploading file");
            match self.transport.put_if_absent(&found, &dest)? {
                PutOutcome::Written => {}
                PutOutcome::AlreadyExists => {
                    debug!(host = %self, dest = %dest, "file appeared during upload, keeping it");
                }
            }
        }

        self.cache().insert(key, dest.clone());
        Ok(dest)
    }

    /// Record a file as uploaded by external means.
    pub fn record_file(&self, local: impl AsRef<Path>, dest: impl Into<String>) {
        self.cache().insert(cache_key(local.as_ref()), dest.into());
    }

    /// Run a command to completion and return its full output.
    pub fn exec(&self, command: &str) -> HarnessResult<ExecOutput> {
        self.transport.exec(command)
    }

    /// Run a command, relaying its output to this process's stdout/stderr.
    pub fn run_command(&self, command: &str) -> HarnessResult<i32> {
        info!(host = %self, "Running `{command}`");
        let output = self.transport.exec(command)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&output.stdout)?;
        stdout.flush()?;
        let mut stderr = io::stderr().lock();
        stderr.write_all(&output.stderr)?;
        stderr.flush()?;
        Ok(output.status)
    }

    /// Start `command` on a pseudo-terminal channel tied to this session.
    pub fn open_channel(&self, command: &str) -> HarnessResult<RemoteChannel> {
        self.transport.spawn_channel(command)
    }

    /// Copy an already uploaded file from this host to each peer.
    pub fn push_to_peers(&self, local: impl AsRef<Path>, peers: &[Arc<RemoteHost>]) -> HarnessResult<()> {
        let local = local.as_ref();
        let dest = self.uploaded_path(local).ok_or_else(|| {
            HarnessError::Configuration(format!(
                "{} was never uploaded to {}",
                local.display(),
                self
            ))
        })?;
        for peer in peers {
            if std::ptr::eq(peer.as_ref(), self) || peer.transport.destination() == self.transport.destination() {
                continue;
            }
            let command = format!(
                "scp {} {}:{}",
                shell_escape::escape(dest.as_str().into()),
                peer.transport.destination(),
                shell_escape::escape(dest.as_str().into()),
            );
            let status = self.run_command(&command)?;
            if status != 0 {
                return Err(HarnessError::Connection(format!(
                    "copy of {dest} from {self} to {peer} exited with {status}"
                )));
            }
            peer.record_file(local, dest.clone());
        }
        Ok(())
    }

    pub fn close(&self) -> HarnessResult<()> {
        self.transport.close()
    }
}

fn cache_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    fn host(root: &Path, address: &str) -> (Arc<RemoteHost>, Arc<LoopbackStats>) {
        let transport = LoopbackTransport::new(root, address, "ops");
        let stats = transport.stats();
        (Arc::new(RemoteHost::with_transport(Box::new(transport))), stats)
    }

    #[test]
    fn test_destination_depends_on_content_and_uploader() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(&a).unwrap();
        fs::write(a.join("h2o.jar"), b"same").unwrap();

        let first = upload_destination(&a.join("h2o.jar"), "alice").unwrap();
        let again = upload_destination(&a.join("h2o.jar"), "alice").unwrap();
        let other_user = upload_destination(&a.join("h2o.jar"), "bob").unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other_user);
        assert!(first.starts_with("/tmp/") && first.ends_with("-h2o.jar"));
        // 64 hex chars of blake3 plus "/tmp/" and "-h2o.jar".
        assert_eq!(first.len(), 5 + 64 + 8);
    }

    #[test]
    fn test_upload_twice_transfers_once() {
        let dir = tempfile::tempdir().unwrap();
        let remote_root = dir.path().join("remote");
        let file = dir.path().join("h2o.jar");
        fs::write(&file, b"jar bytes").unwrap();
        let (host, stats) = host(&remote_root, "10.0.0.1");

        let first = host.upload(&file).unwrap();
        let second = host.upload(&file).unwrap();
        assert_eq!(first, second);
        assert_eq!(stats.put_count(), 1);
        assert_eq!(stats.probe_count(), 1);
        let stored = remote_root.join(first.trim_start_matches('/'));
        assert_eq!(fs::read(stored).unwrap(), b"jar bytes");
    }

    #[test]
    fn test_identical_content_skips_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let remote_root = dir.path().join("remote");
        for sub in ["x", "y"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
            fs::write(dir.path().join(sub).join("flatfile"), b"10.0.0.1:54321\n").unwrap();
        }
        let (host, stats) = host(&remote_root, "10.0.0.1");

        let a = host.upload(dir.path().join("x/flatfile")).unwrap();
        let b = host.upload(dir.path().join("y/flatfile")).unwrap();
        assert_eq!(a, b);
        assert_eq!(stats.put_count(), 1);
        assert_eq!(stats.probe_count(), 2);
    }

    #[test]
    fn test_concurrent_writer_counts_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let remote_root = dir.path().join("remote");
        let file = dir.path().join("creds");
        fs::write(&file, b"secret").unwrap();
        let transport = LoopbackTransport::new(&remote_root, "10.0.0.1", "ops");
        let dest = upload_destination(&file, &current_username()).unwrap();

        // Another process created the destination between probe and put.
        assert_eq!(transport.put_if_absent(&file, &dest).unwrap(), PutOutcome::Written);
        assert_eq!(
            transport.put_if_absent(&file, &dest).unwrap(),
            PutOutcome::AlreadyExists
        );
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _) = host(dir.path(), "10.0.0.1");
        let err = host.upload(dir.path().join("missing.jar")).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_record_file_and_push_requires_upload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let (a, _) = host(&dir.path().join("a"), "10.0.0.1");
        let (b, _) = host(&dir.path().join("b"), "10.0.0.2");

        assert!(a.push_to_peers(&file, &[b.clone()]).is_err());

        a.record_file(&file, "/tmp/abc-f");
        assert_eq!(a.uploaded_path(&file).as_deref(), Some("/tmp/abc-f"));
        // Pushing to itself only is a no-op.
        a.push_to_peers(&file, &[a.clone()]).unwrap();
        assert!(b.uploaded_path(&file).is_none());
    }

    #[test]
    fn test_run_command_returns_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _) = host(dir.path(), "10.0.0.1");
        assert_eq!(host.run_command("true").unwrap(), 0);
        assert_eq!(host.run_command("exit 7").unwrap(), 7);
        assert_eq!(host.exec("printf hi").unwrap().stdout, b"hi");
    }

    #[test]
    fn test_display() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _) = host(dir.path(), "10.0.0.9");
        assert_eq!(host.to_string(), "ssh://ops@10.0.0.9");
    }
}
