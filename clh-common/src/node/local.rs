//! Nodes running as child processes of this harness.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::args::{build_args, resolve_address, shell_join, LaunchPaths};
use super::config::NodeConfig;
use super::{ClusterNode, Endpoint, NodeCore, NodeKind, PersistedNodeState};
use crate::drain::{spawn_drain, DrainSink};
use crate::errors::{HarnessError, HarnessResult};
use crate::request::RequestClient;
use crate::sandbox::find_file;

/// Time between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Exit code reported when the process was already gone or could not be reaped.
pub const EXIT_UNKNOWN: i32 = -1;

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct LocalNode {
    core: NodeCore,
    child: Child,
    pid: u32,
    exit_code: Option<i32>,
    stdout_log: Option<std::path::PathBuf>,
    stderr_log: Option<std::path::PathBuf>,
}

impl LocalNode {
    /// Launch a node on this machine.
    ///
    /// Output is captured into sandbox files through background drains,
    /// or inherited when `capture_output` is off.
    pub fn spawn(config: NodeConfig, client: Arc<RequestClient>) -> HarnessResult<Self> {
        config.validate()?;
        let sandbox = Arc::clone(client.sandbox());
        let address = resolve_address(&config, client.overrides(), None);

        let artifact = find_file(&config.artifact)?;
        let ice_root = sandbox.tmp_dir("ice.")?;
        let paths = LaunchPaths {
            artifact: artifact.display().to_string(),
            classpath: config
                .classpath
                .as_ref()
                .map(|entries| entries.iter().map(|p| p.display().to_string()).collect()),
            flatfile: Some(sandbox.flatfile_path().display().to_string()),
            ice_root: ice_root.display().to_string(),
            hdfs_config: config.hdfs_config.as_ref().map(|p| p.display().to_string()),
            aws_credentials: config
                .aws_credentials
                .as_ref()
                .map(|p| p.display().to_string()),
        };
        let args = build_args(&config, &address, &paths, client.overrides());

        let log_prefix = match config.node_id {
            Some(id) => format!("local-node-{id}"),
            None => "local-node".to_string(),
        };

        let logs = if config.capture_output {
            Some((
                sandbox.tmp_file(&format!("{log_prefix}.stdout."), ".log")?,
                sandbox.tmp_file(&format!("{log_prefix}.stderr."), ".log")?,
            ))
        } else {
            None
        };

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]).stdin(Stdio::null());
        if logs.is_some() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        let mut child = command.spawn().map_err(|e| {
            HarnessError::Configuration(format!("failed to start {}: {e}", args[0]))
        })?;
        let pid = child.id();

        let mut stdout_log = None;
        let mut stderr_log = None;
        let comment = match logs {
            Some(((out_file, out_path), (err_file, err_path))) => {
                if let Some(stdout) = child.stdout.take() {
                    spawn_drain(&format!("{log_prefix}-stdout"), stdout, DrainSink::File(out_file))?;
                }
                if let Some(stderr) = child.stderr.take() {
                    spawn_drain(&format!("{log_prefix}-stderr"), stderr, DrainSink::File(err_file))?;
                }
                let comment = format!(
                    "PID {pid}, stdout {}, stderr {}",
                    file_name(&out_path),
                    file_name(&err_path)
                );
                stdout_log = Some(out_path);
                stderr_log = Some(err_path);
                comment
            }
            None => format!("PID {pid}"),
        };
        sandbox.log_command(&shell_join(&args), Some(&comment));
        info!(pid, node_id = ?config.node_id, port = config.port, "started local node");

        let endpoint = Endpoint::new(address.http_addr, config.port);
        Ok(Self {
            core: NodeCore {
                config,
                endpoint,
                paths,
                client,
            },
            child,
            pid,
            exit_code: None,
            stdout_log,
            stderr_log,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Captured stdout file, when output is captured.
    pub fn stdout_log(&self) -> Option<&Path> {
        self.stdout_log.as_deref()
    }

    pub fn stderr_log(&self) -> Option<&Path> {
        self.stderr_log.as_deref()
    }

    /// Exit code once the process was reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Ask the JVM for a thread dump (SIGQUIT).
    pub fn stack_dump(&self) -> HarnessResult<()> {
        if send_signal(self.pid, "QUIT")? {
            Ok(())
        } else {
            Err(HarnessError::Connection(format!("process {} is not running", self.pid)))
        }
    }

    /// Non-blocking reap; caches the exit code.
    fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code(status));
                self.exit_code
            }
            Ok(None) => None,
            Err(err) => {
                debug!(pid = self.pid, error = %err, "wait failed, treating process as gone");
                self.exit_code = Some(EXIT_UNKNOWN);
                self.exit_code
            }
        }
    }

    fn wait_until(&mut self, deadline: Instant) -> Option<i32> {
        loop {
            if let Some(code) = self.poll_exit() {
                return Some(code);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn stop(&mut self) -> HarnessResult<i32> {
        if let Some(code) = self.poll_exit() {
            return Ok(code);
        }
        // A failed TERM means the process exited in between; the wait below reaps it.
        send_signal(self.pid, "TERM")?;
        if let Some(code) = self.wait_until(Instant::now() + TERMINATE_GRACE) {
            return Ok(code);
        }
        warn!(pid = self.pid, endpoint = %self.core.endpoint, "node ignored SIGTERM, killing");
        self.child.kill()?;
        self.wait_until(Instant::now() + TERMINATE_GRACE).ok_or_else(|| {
            HarnessError::Connection(format!(
                "process {} did not die within {}s of SIGKILL",
                self.pid,
                TERMINATE_GRACE.as_secs()
            ))
        })
    }
}

impl ClusterNode for LocalNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Local
    }

    fn node_id(&self) -> Option<u32> {
        self.core.config.node_id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.core.endpoint
    }

    fn is_alive(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    /// SIGTERM, a grace period, then SIGKILL. Failures are logged and
    /// reported as [`EXIT_UNKNOWN`].
    fn terminate_self_only(&mut self) -> HarnessResult<Option<i32>> {
        match self.stop() {
            Ok(code) => {
                debug!(pid = self.pid, code, "local node stopped");
                Ok(Some(code))
            }
            Err(err) => {
                warn!(pid = self.pid, error = %err, "ignoring failure while terminating local node");
                self.exit_code.get_or_insert(EXIT_UNKNOWN);
                Ok(Some(EXIT_UNKNOWN))
            }
        }
    }

    fn terminate(&mut self) -> HarnessResult<()> {
        if self.is_alive() {
            self.core.shutdown_best_effort();
        }
        self.terminate_self_only().map(|_| ())
    }

    fn artifact_path(&self) -> Option<&str> {
        Some(&self.core.paths.artifact)
    }

    fn flat_file_path(&self) -> Option<&str> {
        self.core.paths.flatfile.as_deref()
    }

    fn working_directory(&self) -> Option<&str> {
        Some(&self.core.paths.ice_root)
    }

    fn persisted_state(&self) -> PersistedNodeState {
        self.core.persisted_state(false)
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        if self.poll_exit().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Exit code, or the negated signal number when killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    EXIT_UNKNOWN
}

/// Whether the signal was delivered.
fn send_signal(pid: u32, signal: &str) -> HarnessResult<bool> {
    let output = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()?;
    if !output.status.success() {
        debug!(
            pid,
            signal,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "kill failed"
        );
    }
    Ok(output.status.success())
}
