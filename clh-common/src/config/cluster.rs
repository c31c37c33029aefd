//! TOML description of a cluster.
//!
//! ```toml
//! [cluster]
//! node_count = 2
//! heap_gb = 1
//! artifact = "target/h2o.jar"
//!
//! [[hosts]]
//! address = "10.0.0.5"
//! username = "ops"
//! ```
//!
//! Without `[[hosts]]` entries the cluster runs locally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};
use crate::node::config::{NodeConfig, DEFAULT_BASE_PORT};
use crate::remote::RemoteCredentials;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterFile {
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Number of local nodes.
    #[serde(default = "default_node_count")]
    pub node_count: usize,
    /// Nodes started on each `[[hosts]]` entry.
    #[serde(default = "default_nodes_per_host")]
    pub nodes_per_host: usize,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    pub heap_gb: Option<u32>,
    pub heap_mb: Option<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub use_flatfile: bool,
    pub cloud_name: Option<String>,
    /// Explicit node address (local clusters only).
    pub address: Option<String>,
    #[serde(default = "default_artifact")]
    pub artifact: PathBuf,
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub leading_args: Vec<String>,
    #[serde(default = "default_true")]
    pub capture_output: bool,
    #[serde(default)]
    pub sandbox_ignore_errors: bool,
    #[serde(default = "default_stabilize_timeout_secs")]
    pub stabilize_timeout_secs: u64,
}

fn default_node_count() -> usize {
    2
}

fn default_nodes_per_host() -> usize {
    1
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_artifact() -> PathBuf {
    PathBuf::from("target/h2o.jar")
}

fn default_program() -> String {
    "java".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stabilize_timeout_secs() -> u64 {
    30
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            node_count: default_node_count(),
            nodes_per_host: default_nodes_per_host(),
            base_port: default_base_port(),
            heap_gb: None,
            heap_mb: None,
            extra_args: Vec::new(),
            use_flatfile: false,
            cloud_name: None,
            address: None,
            artifact: default_artifact(),
            program: default_program(),
            leading_args: Vec::new(),
            capture_output: true,
            sandbox_ignore_errors: false,
            stabilize_timeout_secs: default_stabilize_timeout_secs(),
        }
    }
}

impl ClusterSection {
    pub fn stabilize_timeout(&self) -> Duration {
        Duration::from_secs(self.stabilize_timeout_secs)
    }

    /// Configuration every member starts from; id and port are set per member.
    pub fn node_template(&self) -> HarnessResult<NodeConfig> {
        let mut builder = NodeConfig::builder()
            .port(self.base_port)
            .extra_args(self.extra_args.iter().cloned())
            .use_flatfile(self.use_flatfile)
            .artifact(self.artifact.clone())
            .program(self.program.clone())
            .leading_args(self.leading_args.iter().cloned())
            .capture_output(self.capture_output)
            .sandbox_ignore_errors(self.sandbox_ignore_errors);
        if let Some(gb) = self.heap_gb {
            builder = builder.heap_gb(gb);
        }
        if let Some(mb) = self.heap_mb {
            builder = builder.heap_mb(mb);
        }
        if let Some(name) = &self.cloud_name {
            builder = builder.cloud_name(name.clone());
        }
        if let Some(address) = &self.address {
            builder = builder.address(address.clone());
        }
        builder.build()
    }
}

/// One `[[hosts]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
}

impl HostEntry {
    pub fn credentials(&self) -> RemoteCredentials {
        RemoteCredentials {
            address: self.address.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            identity_file: self
                .identity_file
                .as_ref()
                .map(|p| crate::config::env::expand_home(&p.to_string_lossy())),
            port: self.port,
        }
    }
}

impl ClusterFile {
    pub fn parse(text: &str) -> HarnessResult<Self> {
        toml::from_str(text)
            .map_err(|e| HarnessError::Configuration(format!("invalid cluster file: {e}")))
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!("cannot read cluster file {}: {e}", path.display()))
        })?;
        Self::parse(&text).map_err(|e| match e {
            HarnessError::Configuration(msg) => {
                HarnessError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn is_remote(&self) -> bool {
        !self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = ClusterFile::parse("").unwrap();
        assert_eq!(file.cluster, ClusterSection::default());
        assert_eq!(file.cluster.node_count, 2);
        assert_eq!(file.cluster.base_port, 54321);
        assert!(!file.is_remote());
    }

    #[test]
    fn test_full_file() {
        let file = ClusterFile::parse(
            r#"
            [cluster]
            node_count = 3
            heap_gb = 1
            extra_args = ["-XX:+UseG1GC"]
            program = "/usr/bin/env"
            leading_args = ["java"]
            stabilize_timeout_secs = 15

            [[hosts]]
            address = "10.0.0.5"
            username = "ops"
            port = 2222
            "#,
        )
        .unwrap();
        assert!(file.is_remote());
        assert_eq!(file.cluster.stabilize_timeout(), Duration::from_secs(15));
        let creds = file.hosts[0].credentials();
        assert_eq!(creds.address, "10.0.0.5");
        assert_eq!(creds.port, Some(2222));

        let template = file.cluster.node_template().unwrap();
        assert_eq!(template.heap_gb, Some(1));
        assert_eq!(template.program, "/usr/bin/env");
        assert_eq!(template.extra_args, vec!["-XX:+UseG1GC"]);
    }

    #[test]
    fn test_heap_out_of_range_fails_template() {
        let file = ClusterFile::parse("[cluster]\nheap_gb = 0\n").unwrap();
        assert!(matches!(
            file.cluster.node_template(),
            Err(HarnessError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            ClusterFile::parse("[cluster\n"),
            Err(HarnessError::Configuration(_))
        ));
        assert!(ClusterFile::parse("[cluster]\nnode_count = \"two\"\n").is_err());
    }
}
