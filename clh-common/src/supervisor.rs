//! Cluster composition root.
//!
//! [`ClusterSupervisor`] owns the sandbox, the request client, every node
//! and every remote host of one cluster. It builds clusters, waits for them
//! to accept connections, exports and adopts cluster state, and tears
//! everything down.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::GlobalOverrides;
use crate::errors::{HarnessError, HarnessResult};
use crate::node::args::{local_ip_address, resolve_address};
use crate::node::config::current_username;
use crate::node::{
    ClusterNode, ClusterStateFile, CloudStart, ExternalNode, LocalNode, NodeConfig, NodeKind,
    RemoteNode, SHUTDOWN_TIMEOUT,
};
use crate::remote::RemoteHost;
use crate::request::RequestClient;
use crate::sandbox::{Sandbox, SandboxOptions, SandboxState};
use crate::stabilize::{stabilize, FailureMessage, StabilizeOutcome, StabilizeRequest};

/// Default wait for a fresh cluster to accept connections.
pub const DEFAULT_STABILIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between connection attempts while a cluster boots.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-node timeout of one connection attempt.
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ports are handed out two apart; each node also uses `port + 1`.
pub const PORT_STRIDE: u16 = 2;

pub struct ClusterSupervisor {
    sandbox: Arc<Sandbox>,
    client: Arc<RequestClient>,
    nodes: Vec<Box<dyn ClusterNode>>,
    hosts: Vec<Arc<RemoteHost>>,
}

impl std::fmt::Debug for ClusterSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSupervisor")
            .field("sandbox", &self.sandbox.root())
            .field("nodes", &self.nodes)
            .field("hosts", &self.hosts)
            .finish()
    }
}

impl ClusterSupervisor {
    pub fn new(client: Arc<RequestClient>) -> Self {
        Self {
            sandbox: Arc::clone(client.sandbox()),
            client,
            nodes: Vec::new(),
            hosts: Vec::new(),
        }
    }

    /// Fresh sandbox at `root` and a client configured from `overrides`.
    pub fn create(root: impl AsRef<Path>, overrides: GlobalOverrides) -> HarnessResult<Self> {
        let sandbox = Sandbox::create(
            root,
            SandboxOptions {
                test_name: overrides.test_name.clone(),
                debug_rest: overrides.debug_rest,
                ignore_errors: false,
            },
        )?;
        let client = RequestClient::new(Arc::new(sandbox), overrides);
        Ok(Self::new(Arc::new(client)))
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn state(&self) -> &SandboxState {
        self.sandbox.state()
    }

    pub fn client(&self) -> &Arc<RequestClient> {
        &self.client
    }

    pub fn nodes(&self) -> &[Box<dyn ClusterNode>] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Box<dyn ClusterNode>] {
        &mut self.nodes
    }

    pub fn hosts(&self) -> &[Arc<RemoteHost>] {
        &self.hosts
    }

    /// Write the flat-file listing `addr:port` for every member.
    pub fn write_flatfile(&self, members: &[(String, u16)]) -> HarnessResult<PathBuf> {
        let path = self.sandbox.flatfile_path();
        let mut text = String::new();
        for (addr, port) in members {
            let _ = writeln!(text, "{addr}:{port}");
        }
        std::fs::write(&path, text)?;
        debug!(path = %path.display(), members = members.len(), "wrote flatfile");
        Ok(path)
    }

    /// Start `node_count` local nodes on ports `base + 2i` and wait for them.
    ///
    /// On failure every node started so far is torn down before returning.
    pub fn build_local_cluster(
        &mut self,
        node_count: usize,
        template: &NodeConfig,
        timeout: Duration,
    ) -> HarnessResult<StabilizeOutcome> {
        if node_count == 0 {
            return Err(HarnessError::configuration("cluster needs at least one node"));
        }
        template.validate()?;
        self.sandbox.set_ignore_errors(template.sandbox_ignore_errors);

        let http_addr = resolve_address(template, self.client.overrides(), None).http_addr;
        let members = (0..node_count)
            .map(|i| member_port(template.port, i).map(|port| (http_addr.clone(), port)))
            .collect::<HarnessResult<Vec<_>>>()?;
        self.write_flatfile(&members)?;

        let result = self.spawn_local(template, &members).and_then(|()| {
            info!(nodes = node_count, "local cluster started, waiting for connections");
            self.wait_for_nodes_to_accept_connections(timeout)
        });
        self.cleanup_on_error(result)
    }

    fn spawn_local(&mut self, template: &NodeConfig, members: &[(String, u16)]) -> HarnessResult<()> {
        for (i, (_, port)) in members.iter().enumerate() {
            let config = template.for_member(i as u32, *port);
            let node = LocalNode::spawn(config, Arc::clone(&self.client))?;
            self.nodes.push(Box::new(node));
        }
        Ok(())
    }

    /// Start `nodes_per_host` nodes on each host and wait for them.
    ///
    /// The artifact is uploaded once to the first host and copied from there
    /// to the others.
    pub fn build_cluster_with_hosts(
        &mut self,
        hosts: Vec<Arc<RemoteHost>>,
        nodes_per_host: usize,
        template: &NodeConfig,
        timeout: Duration,
    ) -> HarnessResult<StabilizeOutcome> {
        if hosts.is_empty() || nodes_per_host == 0 {
            return Err(HarnessError::configuration(
                "cluster needs at least one host and one node per host",
            ));
        }
        template.validate()?;
        self.sandbox.set_ignore_errors(template.sandbox_ignore_errors);
        self.hosts.extend(hosts.iter().cloned());

        let mut placements = Vec::new();
        for host in &hosts {
            for j in 0..nodes_per_host {
                let address = resolve_address(template, self.client.overrides(), Some(host.address()));
                placements.push((Arc::clone(host), address.http_addr, member_port(template.port, j)?));
            }
        }
        let members: Vec<(String, u16)> = placements
            .iter()
            .map(|(_, addr, port)| (addr.clone(), *port))
            .collect();
        self.write_flatfile(&members)?;

        let result = self
            .distribute_artifact(&hosts, template)
            .and_then(|()| {
                for (i, (host, _, port)) in placements.into_iter().enumerate() {
                    let config = template.for_member(i as u32, port);
                    let node = RemoteNode::spawn(host, config, Arc::clone(&self.client))?;
                    self.nodes.push(Box::new(node));
                }
                info!(nodes = self.nodes.len(), hosts = hosts.len(), "remote cluster started, waiting for connections");
                self.wait_for_nodes_to_accept_connections(timeout)
            });
        self.cleanup_on_error(result)
    }

    fn distribute_artifact(&self, hosts: &[Arc<RemoteHost>], template: &NodeConfig) -> HarnessResult<()> {
        let Some(first) = hosts.first() else {
            return Ok(());
        };
        first.upload(&template.artifact)?;
        if hosts.len() > 1 {
            let local = crate::sandbox::find_file(&template.artifact)?;
            first.push_to_peers(&local, hosts)?;
        }
        Ok(())
    }

    fn cleanup_on_error<T>(&mut self, result: HarnessResult<T>) -> HarnessResult<T> {
        if let Err(err) = &result {
            error!(error = %err, "cluster build failed, tearing down what was started");
            for node in &mut self.nodes {
                if let Err(kill) = node.terminate_self_only() {
                    debug!(error = %kill, "ignoring terminate failure during cleanup");
                }
            }
            self.nodes.clear();
        }
        result
    }

    /// Poll every node until all accept connections.
    ///
    /// Nodes that answered once are not probed again. Every
    /// [`ESCALATION_INTERVAL`](crate::stabilize::ESCALATION_INTERVAL) retries
    /// the sandbox is scanned so a crashing cluster fails fast.
    pub fn wait_for_nodes_to_accept_connections(&self, timeout: Duration) -> HarnessResult<StabilizeOutcome> {
        let total = self.nodes.len();
        let endpoints: Vec<_> = self.nodes.iter().map(|n| n.endpoint().clone()).collect();
        let client = &self.client;
        let sandbox = &self.sandbox;
        let mut accepted = HashSet::new();

        let request = StabilizeRequest::new(FailureMessage::formatter(move |elapsed, retries| {
            format!(
                "cloud of {total} nodes did not accept connections after {:.2} seconds ({retries} retries)",
                elapsed.as_secs_f64()
            )
        }))
        .timeout(timeout)
        .retry_delay(CONNECT_RETRY_DELAY);

        let outcome = stabilize(
            request,
            |_attempt| {
                for endpoint in &endpoints {
                    if accepted.contains(endpoint) {
                        continue;
                    }
                    match client.get_cloud(endpoint, CONNECT_PROBE_TIMEOUT, true) {
                        Ok(_) => {
                            debug!(endpoint = %endpoint, "node accepts connections");
                            accepted.insert(endpoint.clone());
                        }
                        Err(err) if err.is_connection_failure() => return Ok(false),
                        Err(err) => return Err(err),
                    }
                }
                Ok(true)
            },
            || sandbox.check_for_errors(false).map(|_| ()),
        )?;
        info!(
            nodes = total,
            retries = outcome.retries,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "cluster accepts connections"
        );
        Ok(outcome)
    }

    /// Adopt every node listed in an exported state file.
    pub fn adopt(&mut self, state_file: &Path) -> HarnessResult<usize> {
        let states = ClusterStateFile::load(state_file)?.nodes()?;
        if let Some(first) = states.first() {
            self.sandbox.set_ignore_errors(first.sandbox_ignore_errors);
        }
        let count = states.len();
        for state in states {
            self.nodes
                .push(Box::new(ExternalNode::from_state(state, Arc::clone(&self.client))));
        }
        info!(nodes = count, file = %state_file.display(), "adopted external cluster");
        Ok(count)
    }

    /// Write the state file another session can [`adopt`](Self::adopt).
    pub fn export_state(&self, path: &Path) -> HarnessResult<()> {
        let cloud_start = CloudStart {
            time: chrono::Local::now().to_rfc3339(),
            cwd: std::env::current_dir()?.display().to_string(),
            test_name: self.client.overrides().test_name.clone(),
            username: current_username(),
            ip: local_ip_address().to_string(),
        };
        let states: Vec<_> = self.nodes.iter().map(|n| n.persisted_state()).collect();
        ClusterStateFile::new(cloud_start, &states).save(path)?;
        info!(nodes = states.len(), file = %path.display(), "exported cluster state");
        Ok(())
    }

    pub fn check_sandbox_for_errors(&self, cloud_shutdown_is_error: bool) -> HarnessResult<bool> {
        self.sandbox.check_for_errors(cloud_shutdown_is_error)
    }

    /// Check every node reports a cloud of `expected` members.
    pub fn verify_cloud_size(&self, expected: usize, timeout: Duration) -> HarnessResult<()> {
        for node in &self.nodes {
            let cloud = self.client.get_cloud(node.endpoint(), timeout, false)?;
            let size = cloud.get("cloud_size").and_then(serde_json::Value::as_u64);
            if size != Some(expected as u64) {
                return Err(HarnessError::Protocol(format!(
                    "node {} reports cloud_size {}, expected {expected}",
                    node.endpoint(),
                    size.map_or_else(|| "missing".to_string(), |s| s.to_string())
                )));
            }
        }
        Ok(())
    }

    /// Stop every node and scan the sandbox.
    ///
    /// One best-effort shutdown request goes to the first spawned node. When
    /// it is accepted, spawned nodes are only stopped locally; otherwise each
    /// node gets its own shutdown request first. Failures are logged and do
    /// not stop the remaining nodes; the first one is returned after the scan.
    pub fn teardown(&mut self) -> HarnessResult<()> {
        self.teardown_and_take_nodes().map(|_| ())
    }

    /// [`teardown`](Self::teardown), handing back the stopped nodes so their
    /// exit state can still be inspected.
    pub fn teardown_and_take_nodes(&mut self) -> HarnessResult<Vec<Box<dyn ClusterNode>>> {
        let mut nodes = std::mem::take(&mut self.nodes);
        if nodes.is_empty() {
            self.check_sandbox_for_errors(false)?;
            return Ok(nodes);
        }

        let cloud_shutdown_sent = match nodes.iter().find(|n| n.kind() != NodeKind::External) {
            Some(first) => match self.client.shutdown_all(first.endpoint(), SHUTDOWN_TIMEOUT) {
                Ok(()) => true,
                Err(err) => {
                    debug!(error = %err, "cloud shutdown request failed, terminating nodes directly");
                    false
                }
            },
            None => false,
        };

        let mut first_error = None;
        for node in &mut nodes {
            let stopped = if cloud_shutdown_sent && node.kind() != NodeKind::External {
                node.terminate_self_only().map(|_| ())
            } else {
                node.terminate()
            };
            if let Err(err) = stopped {
                warn!(endpoint = %node.endpoint(), error = %err, "node terminate failed");
                first_error.get_or_insert(err);
            }
        }

        for host in self.hosts.drain(..) {
            if let Err(err) = host.close() {
                debug!(host = %host, error = %err, "host close failed");
            }
        }

        self.check_sandbox_for_errors(false)?;
        first_error.map_or(Ok(nodes), Err)
    }
}

fn member_port(base: u16, index: usize) -> HarnessResult<u16> {
    u16::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(PORT_STRIDE))
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| HarnessError::Configuration(format!("port {base} + {PORT_STRIDE}*{index} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_ports() {
        assert_eq!(member_port(54321, 0).unwrap(), 54321);
        assert_eq!(member_port(54321, 2).unwrap(), 54325);
        assert!(member_port(65534, 1).is_err());
    }

    #[test]
    fn test_flatfile_lists_members() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ClusterSupervisor::create(dir.path().join("sb"), GlobalOverrides::default()).unwrap();
        let path = supervisor
            .write_flatfile(&[("10.0.0.1".to_string(), 54321), ("10.0.0.1".to_string(), 54323)])
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "10.0.0.1:54321\n10.0.0.1:54323\n"
        );
    }

    #[test]
    fn test_empty_cluster_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = ClusterSupervisor::create(dir.path().join("sb"), GlobalOverrides::default()).unwrap();
        let template = NodeConfig::builder().build().unwrap();
        assert!(matches!(
            supervisor.build_local_cluster(0, &template, Duration::from_secs(1)),
            Err(HarnessError::Configuration(_))
        ));
        assert!(supervisor.teardown().is_ok());
    }

    #[test]
    fn test_empty_wait_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ClusterSupervisor::create(dir.path().join("sb"), GlobalOverrides::default()).unwrap();
        let outcome = supervisor
            .wait_for_nodes_to_accept_connections(Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome.retries, 0);
    }
}
