//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clh_common::config::GlobalOverrides;
use clh_common::node::{NodeConfig, PROBE_TIMEOUT};
use clh_common::request::RequestOptions;
use clh_common::stabilize::StabilizeOutcome;
use clh_common::{
    ClusterFile, ClusterSupervisor, HarnessResult, RemoteHost, RequestClient, Sandbox,
    SandboxOptions,
};
use tracing::{info, warn};

/// Options of `clh run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: PathBuf,
    pub sandbox: Option<PathBuf>,
    pub export: Option<PathBuf>,
    pub requests: Vec<String>,
    pub expect_cloud_size: Option<usize>,
    pub hold: Duration,
}

/// Build the cluster, exercise it, then always tear it down.
pub fn run(options: &RunOptions, overrides: GlobalOverrides) -> Result<()> {
    let file = ClusterFile::load(&options.config)?;
    let template = file.cluster.node_template()?;
    let sandbox_dir = options
        .sandbox
        .clone()
        .unwrap_or_else(|| PathBuf::from(&overrides.sandbox_name));

    let mut supervisor = ClusterSupervisor::create(&sandbox_dir, overrides)
        .with_context(|| format!("failed to create sandbox {}", sandbox_dir.display()))?;
    info!(sandbox = %supervisor.sandbox().root().display(), "sandbox ready");

    let result = build(&mut supervisor, &file, &template)
        .map_err(anyhow::Error::from)
        .and_then(|outcome| {
            info!(
                nodes = supervisor.nodes().len(),
                retries = outcome.retries,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "cluster is up"
            );
            exercise(&supervisor, options)
        });

    let teardown = supervisor.teardown();
    result?;
    teardown.context("teardown failed")?;
    info!("cluster torn down cleanly");
    Ok(())
}

fn build(
    supervisor: &mut ClusterSupervisor,
    file: &ClusterFile,
    template: &NodeConfig,
) -> HarnessResult<StabilizeOutcome> {
    let timeout = file.cluster.stabilize_timeout();
    if !file.is_remote() {
        return supervisor.build_local_cluster(file.cluster.node_count, template, timeout);
    }
    let hosts = connect_hosts(file)?;
    supervisor.build_cluster_with_hosts(hosts, file.cluster.nodes_per_host, template, timeout)
}

#[cfg(unix)]
fn connect_hosts(file: &ClusterFile) -> HarnessResult<Vec<Arc<RemoteHost>>> {
    file.hosts
        .iter()
        .map(|entry| RemoteHost::connect(entry.credentials()).map(Arc::new))
        .collect()
}

#[cfg(not(unix))]
fn connect_hosts(_file: &ClusterFile) -> HarnessResult<Vec<Arc<RemoteHost>>> {
    Err(clh_common::HarnessError::Unsupported(
        "remote hosts require ssh, which is only available on unix".to_string(),
    ))
}

fn exercise(supervisor: &ClusterSupervisor, options: &RunOptions) -> Result<()> {
    if let Some(expected) = options.expect_cloud_size {
        supervisor.verify_cloud_size(expected, PROBE_TIMEOUT)?;
        info!(expected, "every node agrees on the cloud size");
    }

    if !options.requests.is_empty() {
        let Some(first) = supervisor.nodes().first() else {
            bail!("no nodes to send requests to");
        };
        for path in &options.requests {
            let body = supervisor
                .client()
                .request(first.endpoint(), &RequestOptions::get(path.as_str()))?;
            if let Some(body) = body {
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
        }
    }

    if let Some(path) = &options.export {
        supervisor.export_state(path)?;
        println!("{}", path.display());
    }

    if !options.hold.is_zero() {
        info!(secs = options.hold.as_secs(), "holding cluster before teardown");
        std::thread::sleep(options.hold);
    }
    Ok(())
}

/// Supervisor over an existing sandbox, holding the nodes of a state file.
fn adopt(state: &Path, sandbox: Option<&Path>, overrides: GlobalOverrides) -> Result<ClusterSupervisor> {
    let dir = sandbox.map_or_else(|| PathBuf::from(&overrides.sandbox_name), Path::to_path_buf);
    let sandbox = Sandbox::open(
        dir,
        SandboxOptions {
            test_name: overrides.test_name.clone(),
            debug_rest: overrides.debug_rest,
            ignore_errors: false,
        },
    )?;
    let client = RequestClient::new(Arc::new(sandbox), overrides);
    let mut supervisor = ClusterSupervisor::new(Arc::new(client));
    supervisor
        .adopt(state)
        .with_context(|| format!("failed to adopt {}", state.display()))?;
    Ok(supervisor)
}

/// Report which adopted nodes answer; fails if any does not.
pub fn probe(state: &Path, sandbox: Option<&Path>, overrides: GlobalOverrides) -> Result<()> {
    let mut supervisor = adopt(state, sandbox, overrides)?;
    let total = supervisor.nodes().len();
    let mut dead = 0;
    for node in supervisor.nodes_mut() {
        let alive = node.is_alive();
        if !alive {
            dead += 1;
        }
        println!(
            "{}",
            serde_json::json!({ "endpoint": node.endpoint().to_string(), "alive": alive })
        );
    }
    if dead > 0 {
        bail!("{dead} of {total} nodes are not reachable");
    }
    Ok(())
}

/// Ask every adopted node to shut down.
pub fn shutdown(state: &Path, sandbox: Option<&Path>, overrides: GlobalOverrides) -> Result<()> {
    let mut supervisor = adopt(state, sandbox, overrides)?;
    let total = supervisor.nodes().len();
    if let Err(err) = supervisor.teardown() {
        warn!(error = %err, "some nodes did not acknowledge the shutdown");
        return Err(err.into());
    }
    info!(nodes = total, "shutdown sent to every node");
    Ok(())
}
