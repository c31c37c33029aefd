//! Command line assembly for cluster nodes.
//!
//! The argument list is a pure function of [`NodeConfig`], the resolved
//! address, the launch paths and the global overrides, so the same inputs
//! always produce the same ordered list.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::{info, warn};

use super::config::NodeConfig;
use crate::config::GlobalOverrides;

/// First debugger attach port; node `n` listens on `DEBUGGER_BASE_PORT + n`.
pub const DEBUGGER_BASE_PORT: u16 = 8000;

/// Paths as seen by the node process (local paths, or remote upload destinations).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchPaths {
    pub artifact: String,
    pub classpath: Option<Vec<String>>,
    pub flatfile: Option<String>,
    pub ice_root: String,
    pub hdfs_config: Option<String>,
    pub aws_credentials: Option<String>,
}

/// Network identity of a node, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Explicit address (command line override, host address or configured).
    pub bind_addr: Option<String>,
    /// Address used to reach the node over HTTP.
    pub http_addr: String,
    pub force_ip: bool,
    pub network: Option<String>,
}

/// Resolve a node's address: command line override, then the explicit
/// address (a remote host's, or the configured one), then this machine's IP.
pub fn resolve_address(
    config: &NodeConfig,
    overrides: &GlobalOverrides,
    host_address: Option<&str>,
) -> ResolvedAddress {
    let bind_addr = overrides
        .ip
        .clone()
        .or_else(|| host_address.map(str::to_string))
        .or_else(|| config.address.clone());
    let force_ip = config.force_ip.unwrap_or(bind_addr.is_some());
    let http_addr = bind_addr
        .clone()
        .unwrap_or_else(|| local_ip_address().to_string());
    ResolvedAddress {
        bind_addr,
        http_addr,
        force_ip,
        network: overrides.network.clone().or_else(|| config.network.clone()),
    }
}

/// Best guess at this machine's outward-facing IPv4 address.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ip_address() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn debugger_port(node_id: Option<u32>) -> u16 {
    let offset = node_id
        .and_then(|id| u16::try_from(id).ok())
        .unwrap_or(0);
    DEBUGGER_BASE_PORT.saturating_add(offset)
}

/// Build the full ordered argument list, launcher first.
///
/// Heap bounds are validated when the [`NodeConfig`] is built.
pub fn build_args(
    config: &NodeConfig,
    address: &ResolvedAddress,
    paths: &LaunchPaths,
    overrides: &GlobalOverrides,
) -> Vec<String> {
    let mut args = vec![config.program.clone()];
    args.extend(config.leading_args.iter().cloned());

    if let Some(gb) = config.heap_gb {
        args.push(format!("-Xms{gb}G"));
        args.push(format!("-Xmx{gb}G"));
    }
    if let Some(mb) = config.heap_mb {
        args.push(format!("-Xms{mb}m"));
        args.push(format!("-Xmx{mb}m"));
    }

    args.extend(config.extra_args.iter().cloned());

    if config.enable_debugger || overrides.debugger {
        let port = debugger_port(config.node_id);
        info!(
            debugger_port = port,
            http_addr = %address.http_addr,
            node_port = config.port,
            "You can attach a debugger to this node"
        );
        args.push(format!(
            "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address={port}"
        ));
    }

    if config.disable_assertions {
        warn!(node_id = ?config.node_id, "node is running with assertions disabled");
    } else {
        args.push("-ea".to_string());
    }

    if config.use_maprfs {
        args.push("-Djava.library.path=/opt/mapr/lib".to_string());
    }

    match &paths.classpath {
        Some(entries) => {
            args.push("-classpath".to_string());
            args.push(entries.join(":"));
            args.push(config.main_class.clone());
        }
        None => {
            args.push("-jar".to_string());
            args.push(paths.artifact.clone());
        }
    }

    if let Some(hdfs_config) = &paths.hdfs_config {
        args.push(format!("-hdfs_config={hdfs_config}"));
    }

    if overrides.beta_features {
        args.push("-beta".to_string());
    }

    if let Some(network) = &address.network {
        args.push(format!("-network={network}"));
    }

    if address.force_ip
        && let Some(ip) = &address.bind_addr
    {
        args.push(format!("--ip={ip}"));
    }

    args.push(format!("--port={}", config.port));

    if config.use_flatfile
        && let Some(flatfile) = &paths.flatfile
    {
        args.push(format!("--flatfile={flatfile}"));
    }

    args.push(format!("--ice_root={}", paths.ice_root));
    args.push(format!("--name={}", config.cloud_name));

    let name_node = config.hdfs_name_node.as_deref().unwrap_or_default();
    let hdfs_version = config.hdfs_version.as_deref().unwrap_or_default();
    if config.use_hdfs {
        args.push("-hdfs".to_string());
        args.push(format!("hdfs://{name_node}"));
        args.push(format!("-hdfs_version={hdfs_version}"));
    }
    if config.use_maprfs {
        args.push("-hdfs".to_string());
        args.push(format!("maprfs:///{name_node}"));
        args.push(format!("-hdfs_version={hdfs_version}"));
    }

    if let Some(aws) = &paths.aws_credentials {
        args.push(format!("--aws_credentials={aws}"));
    }

    if config.random_udp_drop || overrides.random_udp_drop {
        args.push("--random_udp_drop".to_string());
    }
    if config.force_tcp {
        args.push("--force_tcp".to_string());
    }
    if config.disable_log {
        args.push("--nolog".to_string());
    }

    args
}

/// Join arguments into one shell command line, quoting where needed.
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_escape::escape(arg.as_str().into()).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides() -> GlobalOverrides {
        GlobalOverrides {
            beta_features: false,
            ..GlobalOverrides::default()
        }
    }

    fn paths() -> LaunchPaths {
        LaunchPaths {
            artifact: "/opt/h2o.jar".to_string(),
            flatfile: Some("/sb/flatfile-alice".to_string()),
            ice_root: "/sb/ice.x".to_string(),
            ..LaunchPaths::default()
        }
    }

    fn config() -> NodeConfig {
        NodeConfig::builder()
            .username("alice")
            .cloud_name("c1")
            .address("10.1.1.5")
            .port(54323)
            .node_id(1)
            .heap_gb(4)
            .build()
            .unwrap()
    }

    #[test]
    fn test_full_argument_order() {
        let config = config();
        let address = resolve_address(&config, &overrides(), None);
        let args = build_args(&config, &address, &paths(), &overrides());
        assert_eq!(
            args,
            vec![
                "java",
                "-Xms4G",
                "-Xmx4G",
                "-ea",
                "-jar",
                "/opt/h2o.jar",
                "--ip=10.1.1.5",
                "--port=54323",
                "--ice_root=/sb/ice.x",
                "--name=c1",
            ]
        );
    }

    #[test]
    fn test_deterministic() {
        let config = config();
        let address = resolve_address(&config, &overrides(), None);
        let first = build_args(&config, &address, &paths(), &overrides());
        let second = build_args(&config, &address, &paths(), &overrides());
        assert_eq!(first, second);
    }

    #[test]
    fn test_heap_mb_flags() {
        let config = NodeConfig::builder().heap_mb(512).build().unwrap();
        let address = resolve_address(&config, &overrides(), None);
        let args = build_args(&config, &address, &paths(), &overrides());
        assert!(args.contains(&"-Xms512m".to_string()));
        assert!(args.contains(&"-Xmx512m".to_string()));
    }

    #[test]
    fn test_debugger_port_from_node_id() {
        assert_eq!(debugger_port(None), 8000);
        assert_eq!(debugger_port(Some(3)), 8003);

        let config = config();
        let mut global = overrides();
        global.debugger = true;
        let address = resolve_address(&config, &global, None);
        let args = build_args(&config, &address, &paths(), &global);
        assert!(args.contains(
            &"-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address=8001".to_string()
        ));
    }

    #[test]
    fn test_ip_only_when_forced() {
        let config = NodeConfig::builder().address("10.1.1.5").force_ip(false).build().unwrap();
        let address = resolve_address(&config, &overrides(), None);
        assert_eq!(address.http_addr, "10.1.1.5");
        let args = build_args(&config, &address, &paths(), &overrides());
        assert!(!args.iter().any(|a| a.starts_with("--ip=")));

        let config = NodeConfig::builder().build().unwrap();
        let address = resolve_address(&config, &overrides(), None);
        assert!(!address.force_ip);
        assert!(address.bind_addr.is_none());
    }

    #[test]
    fn test_override_ip_beats_configured_address() {
        let config = config();
        let mut global = overrides();
        global.ip = Some("192.168.0.9".to_string());
        let address = resolve_address(&config, &global, Some("10.9.9.9"));
        assert_eq!(address.http_addr, "192.168.0.9");

        let address = resolve_address(&config, &overrides(), Some("10.9.9.9"));
        assert_eq!(address.http_addr, "10.9.9.9");
    }

    #[test]
    fn test_optional_flags() {
        let config = NodeConfig::builder()
            .program("/usr/bin/env")
            .leading_args(["java"])
            .extra_arg("-XX:+UseG1GC")
            .disable_assertions(true)
            .use_flatfile(true)
            .maprfs("mapr1", "mapr3.1.1")
            .random_udp_drop(true)
            .force_tcp(true)
            .disable_log(true)
            .network("10.0.0.0/8")
            .build()
            .unwrap();
        let mut paths = paths();
        paths.aws_credentials = Some("/tmp/aws".to_string());
        paths.hdfs_config = Some("/tmp/core-site.xml".to_string());
        let mut global = overrides();
        global.beta_features = true;
        let address = resolve_address(&config, &global, None);
        let args = build_args(&config, &address, &paths, &global);

        assert_eq!(&args[..3], &["/usr/bin/env", "java", "-XX:+UseG1GC"]);
        assert!(!args.contains(&"-ea".to_string()));
        let position = |needle: &str| args.iter().position(|a| a == needle).unwrap();
        assert!(position("-Djava.library.path=/opt/mapr/lib") < position("-jar"));
        assert!(position("-hdfs_config=/tmp/core-site.xml") < position("-beta"));
        assert!(position("-network=10.0.0.0/8") < position("--port=54321"));
        assert!(position("--flatfile=/sb/flatfile-alice") < position("--ice_root=/sb/ice.x"));
        assert!(position("maprfs:///mapr1") < position("--aws_credentials=/tmp/aws"));
        assert_eq!(
            &args[args.len() - 3..],
            &["--random_udp_drop", "--force_tcp", "--nolog"]
        );
    }

    #[test]
    fn test_classpath_mode() {
        let config = NodeConfig::builder().build().unwrap();
        let mut paths = paths();
        paths.classpath = Some(vec!["build/classes".to_string(), "lib/a.jar".to_string()]);
        let address = resolve_address(&config, &overrides(), None);
        let args = build_args(&config, &address, &paths, &overrides());
        let at = args.iter().position(|a| a == "-classpath").unwrap();
        assert_eq!(args[at + 1], "build/classes:lib/a.jar");
        assert_eq!(args[at + 2], "water.Boot");
        assert!(!args.contains(&"-jar".to_string()));
    }

    #[test]
    fn test_shell_join_quotes() {
        let joined = shell_join(&["java".to_string(), "--name=a b".to_string()]);
        assert_eq!(joined, "java '--name=a b'");
    }
}
