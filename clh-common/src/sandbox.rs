//! Sandbox area: the per-cluster working and log directory.
//!
//! Everything a cluster writes locally lands here: captured node output,
//! the flat-file, ice directories, and the two plain-text artefact logs
//! (`commands.log` for activity, `rest.log` for full request/response
//! exchanges). CI archives the directory, and the error scanner reads it.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::env::expand_home;
use crate::errors::{HarnessError, HarnessResult};
use crate::scanner::{ErrorScanner, LogPatternScanner};

pub const COMMANDS_LOG: &str = "commands.log";
pub const REST_LOG: &str = "rest.log";

/// Shared "error already reported" flag for one cluster.
///
/// Cloned handles observe the same flag. Read-then-set without a lock is
/// fine: setting it twice is harmless and a race only costs one extra scan.
#[derive(Debug, Clone, Default)]
pub struct SandboxState {
    error_reported: Arc<AtomicBool>,
}

impl SandboxState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_reported(&self) -> bool {
        self.error_reported.load(Ordering::Relaxed)
    }

    pub fn mark_reported(&self) {
        self.error_reported.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.error_reported.store(false, Ordering::Relaxed);
    }
}

/// Options fixed when the sandbox is opened.
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    pub test_name: String,
    /// Also write `rest.log`.
    pub debug_rest: bool,
    pub ignore_errors: bool,
}

/// The sandbox directory plus the state and scanner that operate on it.
pub struct Sandbox {
    root: PathBuf,
    state: SandboxState,
    scanner: Arc<dyn ErrorScanner>,
    options: SandboxOptions,
    ignore_errors: AtomicBool,
    username: String,
    log_lock: Mutex<()>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("root", &self.root)
            .field("state", &self.state)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Remove any previous sandbox at `root` and create a fresh one.
    ///
    /// A fresh sandbox starts with a cleared "already reported" flag.
    pub fn create(root: impl AsRef<Path>, options: SandboxOptions) -> HarnessResult<Self> {
        let root = expand_home(&root.as_ref().to_string_lossy());
        if root.exists() {
            info!(dir = %root.display(), "Removing previous sandbox (if slow, might be old ice dir spill files)");
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        let sandbox = Self::open(root, options)?;
        sandbox.state.reset();
        Ok(sandbox)
    }

    /// Open an existing sandbox (creating the directory if needed) without cleaning it.
    pub fn open(root: impl Into<PathBuf>, options: SandboxOptions) -> HarnessResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            state: SandboxState::new(),
            scanner: Arc::new(LogPatternScanner::new()),
            ignore_errors: AtomicBool::new(options.ignore_errors),
            options,
            username: crate::node::config::current_username(),
            log_lock: Mutex::new(()),
        })
    }

    /// Replace the error scanner.
    pub fn with_scanner(mut self, scanner: Arc<dyn ErrorScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Share an existing state handle (e.g. the supervisor's).
    pub fn with_state(mut self, state: SandboxState) -> Self {
        self.state = state;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &SandboxState {
        &self.state
    }

    pub fn test_name(&self) -> &str {
        &self.options.test_name
    }

    pub fn set_ignore_errors(&self, ignore: bool) {
        self.ignore_errors.store(ignore, Ordering::Relaxed);
    }

    pub fn ignore_errors(&self) -> bool {
        self.ignore_errors.load(Ordering::Relaxed)
    }

    pub fn commands_log_path(&self) -> PathBuf {
        self.root.join(COMMANDS_LOG)
    }

    pub fn rest_log_path(&self) -> PathBuf {
        self.root.join(REST_LOG)
    }

    /// Host list shared by every node of a flat-file cluster.
    pub fn flatfile_path(&self) -> PathBuf {
        self.root.join(format!("flatfile-{}", self.username))
    }

    /// Create an empty, world-readable temp file inside the sandbox.
    pub fn tmp_file(&self, prefix: &str, suffix: &str) -> HarnessResult<(File, PathBuf)> {
        let named = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.root)?;
        let (file, path) = named.keep().map_err(|e| HarnessError::Io(e.error))?;
        make_world_readable(&path)?;
        Ok((file, path))
    }

    /// Create a temp directory inside the sandbox that outlives this call.
    pub fn tmp_dir(&self, prefix: &str) -> HarnessResult<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(&self.root)?;
        Ok(dir.keep())
    }

    /// Append one line to `commands.log`: timestamp, URL-decoded command, optional comment.
    pub fn log_command(&self, cmd: &str, comment: Option<&str>) {
        let mut line = format!("{} -- ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"));
        if cmd.is_empty() {
            if let Some(comment) = comment {
                line.push_str(comment);
            }
        } else {
            match urlencoding::decode(cmd) {
                Ok(decoded) => line.push_str(&decoded),
                Err(_) => line.push_str(cmd),
            }
            if let Some(comment) = comment {
                line.push_str("    #");
                line.push_str(comment);
            }
        }
        line.push('\n');
        self.append(&self.commands_log_path(), &line);
    }

    /// Append to `rest.log` when verbose REST diagnostics are on.
    pub fn log_rest(&self, text: &str) {
        if !self.options.debug_rest {
            return;
        }
        self.append(&self.rest_log_path(), &format!("{text}\n"));
    }

    pub fn debug_rest(&self) -> bool {
        self.options.debug_rest
    }

    fn append(&self, path: &Path, text: &str) {
        let _guard = self.log_lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(text.as_bytes()));
        match result {
            Ok(()) => {
                let _ = make_world_readable(path);
            }
            Err(err) => warn!(path = %path.display(), error = %err, "failed to append sandbox log"),
        }
    }

    /// Run the scanner unless a problem was already reported for this cluster.
    ///
    /// Returns whether a problem was found. A problem that is not ignored
    /// marks the shared state and fails with [`HarnessError::SandboxErrors`].
    pub fn check_for_errors(&self, cloud_shutdown_is_error: bool) -> HarnessResult<bool> {
        if self.state.was_reported() {
            debug!("sandbox error already reported, skipping scan");
            return Ok(false);
        }
        let ignore = self.ignore_errors();
        let found = self.scanner.scan_for_errors(
            &self.root,
            ignore,
            cloud_shutdown_is_error,
            &self.options.test_name,
        );
        if found {
            self.state.mark_reported();
            if !ignore {
                return Err(HarnessError::SandboxErrors(self.root.clone()));
            }
        }
        Ok(found)
    }
}

#[cfg(unix)]
fn make_world_readable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn make_world_readable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Locate `base` relative to the working directory or a few ancestors.
pub fn find_file(base: impl AsRef<Path>) -> HarnessResult<PathBuf> {
    let base = base.as_ref();
    let expanded = expand_home(&base.to_string_lossy());
    if expanded.is_absolute() {
        return if expanded.exists() {
            Ok(expanded)
        } else {
            Err(HarnessError::Configuration(format!(
                "unable to find file {}",
                base.display()
            )))
        };
    }
    let candidates = [
        expanded.clone(),
        Path::new("..").join(&expanded),
        Path::new("../..").join(&expanded),
        Path::new("../../..").join(&expanded),
    ];
    candidates
        .into_iter()
        .find(|candidate| candidate.exists())
        .ok_or_else(|| HarnessError::Configuration(format!("unable to find file {}", base.display())))
}
