//! Nodes launched over a remote host's session.
//!
//! The node runs on a pseudo-terminal channel, so closing the channel is
//! how it gets killed. Artifacts are uploaded to the host first; the
//! command line refers to their upload destinations.

use std::sync::Arc;

use tracing::{info, warn};

use super::args::{build_args, resolve_address, shell_join, LaunchPaths};
use super::config::NodeConfig;
use super::{ClusterNode, Endpoint, NodeCore, NodeKind, PersistedNodeState};
use crate::drain::{spawn_drain, DrainSink};
use crate::errors::HarnessResult;
use crate::remote::{RemoteChannel, RemoteHost};
use crate::request::RequestClient;

#[derive(Debug)]
pub struct RemoteNode {
    core: NodeCore,
    host: Arc<RemoteHost>,
    channel: RemoteChannel,
}

/// `/home/<user>/ice.<port>.<time>` or `/tmp/ice.<port>.<time>`.
fn remote_ice_root(config: &NodeConfig, host: &RemoteHost) -> String {
    let now = chrono::Utc::now();
    let stamp = format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros());
    if config.use_home_for_ice {
        format!("/home/{}/ice.{}.{}", host.username(), config.port, stamp)
    } else {
        format!("/tmp/ice.{}.{}", config.port, stamp)
    }
}

impl RemoteNode {
    /// Upload what the node needs and start it on a new channel of `host`.
    pub fn spawn(
        host: Arc<RemoteHost>,
        config: NodeConfig,
        client: Arc<RequestClient>,
    ) -> HarnessResult<Self> {
        config.validate()?;
        let sandbox = Arc::clone(client.sandbox());
        let address = resolve_address(&config, client.overrides(), Some(host.address()));

        let artifact = host.upload(&config.artifact)?;
        let flatfile_local = sandbox.flatfile_path();
        let flatfile = if config.use_flatfile || flatfile_local.exists() {
            Some(host.upload(&flatfile_local)?)
        } else {
            None
        };
        let aws_credentials = config
            .aws_credentials
            .as_ref()
            .map(|path| host.upload(path))
            .transpose()?;
        let hdfs_config = config
            .hdfs_config
            .as_ref()
            .map(|path| host.upload(path))
            .transpose()?;

        let paths = LaunchPaths {
            artifact,
            classpath: config
                .classpath
                .as_ref()
                .map(|entries| entries.iter().map(|p| p.display().to_string()).collect()),
            flatfile,
            ice_root: remote_ice_root(&config, &host),
            hdfs_config,
            aws_credentials,
        };
        let command = shell_join(&build_args(&config, &address, &paths, client.overrides()));

        let mut channel = host.open_channel(&command)?;

        let stdout = channel.take_stdout();
        let stderr = channel.take_stderr();
        let comment = if config.capture_output {
            let mut prefix = match config.node_id {
                Some(id) => format!("remote-node-{id}"),
                None => "remote-node".to_string(),
            };
            prefix.push('-');
            prefix.push_str(host.address());

            let (out_file, out_path) = sandbox.tmp_file(&format!("{prefix}.stdout."), ".log")?;
            let (err_file, err_path) = sandbox.tmp_file(&format!("{prefix}.stderr."), ".log")?;
            if let Some(stdout) = stdout {
                spawn_drain(&format!("{prefix}-stdout"), stdout, DrainSink::File(out_file))?;
            }
            if let Some(stderr) = stderr {
                spawn_drain(&format!("{prefix}-stderr"), stderr, DrainSink::File(err_file))?;
            }
            format!(
                "Remote on {}, stdout {}, stderr {}",
                address.http_addr,
                out_path.file_name().unwrap_or_default().to_string_lossy(),
                err_path.file_name().unwrap_or_default().to_string_lossy(),
            )
        } else {
            if let Some(stdout) = stdout {
                spawn_drain("remote-stdout", stdout, DrainSink::Stdout)?;
            }
            if let Some(stderr) = stderr {
                spawn_drain("remote-stderr", stderr, DrainSink::Stderr)?;
            }
            format!("Remote on {}", address.http_addr)
        };
        sandbox.log_command(&command, Some(&comment));
        info!(host = %host, node_id = ?config.node_id, port = config.port, "started remote node");

        let endpoint = Endpoint::new(address.http_addr, config.port);
        Ok(Self {
            core: NodeCore {
                config,
                endpoint,
                paths,
                client,
            },
            host,
            channel,
        })
    }

    pub fn host(&self) -> &Arc<RemoteHost> {
        &self.host
    }

    pub fn channel_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl ClusterNode for RemoteNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Remote
    }

    fn node_id(&self) -> Option<u32> {
        self.core.config.node_id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.core.endpoint
    }

    fn is_alive(&mut self) -> bool {
        if self.channel.is_closed() || self.channel.exit_status_ready() {
            return false;
        }
        self.core.probe()
    }

    /// Close the channel; the pseudo-terminal hangup kills the node.
    fn terminate_self_only(&mut self) -> HarnessResult<Option<i32>> {
        if let Err(err) = self.channel.close() {
            warn!(host = %self.host, error = %err, "ignoring failure while closing node channel");
        }
        Ok(self.channel.exit_status().and_then(|status| status.code()))
    }

    fn terminate(&mut self) -> HarnessResult<()> {
        if !self.channel.is_closed() {
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
        self.core.persisted_state(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalOverrides;
    use crate::remote::LoopbackTransport;
    use crate::sandbox::{Sandbox, SandboxOptions};
    use std::fs;

    fn client(root: &std::path::Path) -> Arc<RequestClient> {
        let sandbox = Sandbox::create(root.join("sandbox"), SandboxOptions::default()).unwrap();
        Arc::new(RequestClient::new(Arc::new(sandbox), GlobalOverrides::default()))
    }

    #[test]
    fn test_spawn_uploads_and_runs_on_channel() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("node.sh");
        fs::write(&script, "echo started \"$@\"\nsleep 30\n").unwrap();
        let jar = dir.path().join("h2o.jar");
        fs::write(&jar, b"jar").unwrap();
        let client = client(dir.path());
        let host = Arc::new(RemoteHost::with_transport(Box::new(LoopbackTransport::new(
            dir.path().join("remote"),
            "127.0.0.1",
            "ops",
        ))));

        let config = NodeConfig::builder()
            .program("sh")
            .leading_args([script.display().to_string()])
            .artifact(&jar)
            .port(1)
            .node_id(0)
            .use_home_for_ice(true)
            .build()
            .unwrap();
        let mut node = RemoteNode::spawn(Arc::clone(&host), config, client).unwrap();

        let artifact = node.artifact_path().unwrap().to_string();
        assert!(artifact.starts_with("/tmp/") && artifact.ends_with("-h2o.jar"));
        assert_eq!(host.uploaded_path(&jar).as_deref(), Some(artifact.as_str()));
        assert!(node.working_directory().unwrap().starts_with("/home/ops/ice.1."));
        assert_eq!(node.endpoint().http_addr, "127.0.0.1");
        // No flatfile was written, so none was uploaded.
        assert!(node.flat_file_path().is_none());
        assert!(node.persisted_state().remote);

        // Nothing listens on port 1, so the probe fails even though the channel is open.
        assert!(!node.is_alive());
        node.terminate_self_only().unwrap();
        assert!(node.channel_closed());
        assert!(!node.is_alive());
    }
}
