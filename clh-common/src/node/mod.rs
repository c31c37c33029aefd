//! Cluster nodes.
//!
//! Three backends share one lifecycle contract, [`ClusterNode`]:
//!
//! - [`LocalNode`]: a process spawned on this machine.
//! - [`RemoteNode`]: a process running on a pseudo-terminal channel of a
//!   [`RemoteHost`](crate::remote::RemoteHost).
//! - [`ExternalNode`]: a node some other session started, adopted from its
//!   exported [`PersistedNodeState`].
//!
//! Starting is implicit in construction. A node's endpoint is fixed once
//! constructed.

pub mod args;
pub mod config;
pub mod external;
pub mod local;
pub mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub use args::{LaunchPaths, ResolvedAddress};
pub use config::{NodeConfig, NodeConfigBuilder};
pub use external::ExternalNode;
pub use local::LocalNode;
pub use remote::RemoteNode;

use crate::errors::{HarnessError, HarnessResult};
use crate::request::RequestClient;

/// Timeout of the reachability probe behind `is_alive`.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of the graceful shutdown request sent before killing a node.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a node answers HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub http_addr: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(http_addr: impl Into<String>, port: u16) -> Self {
        Self {
            http_addr: http_addr.into(),
            port,
        }
    }

    /// `http://addr:port/path`, without doubling a leading slash.
    pub fn url(&self, path: &str) -> String {
        let delim = if path.starts_with('/') { "" } else { "/" };
        format!("http://{}:{}{}{}", self.http_addr, self.port, delim, path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}/", self.http_addr, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Local,
    Remote,
    External,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::External => "external",
        })
    }
}

/// Lifecycle contract shared by every node backend.
pub trait ClusterNode: Send + fmt::Debug {
    fn kind(&self) -> NodeKind;

    fn node_id(&self) -> Option<u32>;

    fn endpoint(&self) -> &Endpoint;

    /// Whether the node still runs and answers. Never fails: probe errors
    /// count as "not alive".
    fn is_alive(&mut self) -> bool;

    /// Stop this node only, without asking the cloud to shut down.
    ///
    /// Returns the exit code when the backend has one.
    fn terminate_self_only(&mut self) -> HarnessResult<Option<i32>>;

    /// Graceful shutdown request, then [`terminate_self_only`](Self::terminate_self_only).
    fn terminate(&mut self) -> HarnessResult<()>;

    /// Artifact the node was launched from, as the node sees it.
    fn artifact_path(&self) -> Option<&str>;

    fn flat_file_path(&self) -> Option<&str>;

    /// The node's ice (working) directory.
    fn working_directory(&self) -> Option<&str>;

    /// Snapshot for the exported cluster state.
    fn persisted_state(&self) -> PersistedNodeState;
}

/// State shared by the spawning backends: configuration, endpoint, paths
/// and the client used to talk to the node.
#[derive(Debug)]
pub(crate) struct NodeCore {
    pub config: NodeConfig,
    pub endpoint: Endpoint,
    pub paths: LaunchPaths,
    pub client: Arc<RequestClient>,
}

impl NodeCore {
    /// One `Cloud.json` round trip with connection errors suppressed.
    pub fn probe(&self) -> bool {
        match self
            .client
            .get_cloud(&self.endpoint, PROBE_TIMEOUT, true)
        {
            Ok(_) => true,
            Err(err) => {
                debug!(endpoint = %self.endpoint, error = %err, "reachability probe failed");
                false
            }
        }
    }

    /// Ask the node to shut down; failure is logged and ignored.
    pub fn shutdown_best_effort(&self) {
        if let Err(err) = self.client.shutdown_all(&self.endpoint, SHUTDOWN_TIMEOUT) {
            debug!(endpoint = %self.endpoint, error = %err, "graceful shutdown request failed, killing anyway");
        }
    }

    pub fn persisted_state(&self, remote: bool) -> PersistedNodeState {
        let config = &self.config;
        PersistedNodeState {
            http_addr: self.endpoint.http_addr.clone(),
            port: self.endpoint.port,
            node_id: config.node_id,
            username: Some(config.username.clone()),
            cloud_name: Some(config.cloud_name.clone()),
            remote,
            artifact: Some(self.paths.artifact.clone()),
            flatfile: self.paths.flatfile.clone(),
            ice_dir: Some(self.paths.ice_root.clone()),
            use_flatfile: config.use_flatfile,
            use_hdfs: config.use_hdfs,
            use_maprfs: config.use_maprfs,
            hdfs_name_node: config.hdfs_name_node.clone(),
            hdfs_version: config.hdfs_version.clone(),
            aws_credentials: self.paths.aws_credentials.clone(),
            java_heap_gb: config.heap_gb,
            java_heap_mb: config.heap_mb,
            sandbox_ignore_errors: config.sandbox_ignore_errors,
            delete_keys_at_teardown: config.delete_keys_at_teardown,
        }
    }
}

/// A value in the flat key/value node record after sentinel decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlatValue {
    Null,
    Bool(bool),
    Text(String),
}

impl FlatValue {
    /// `"None"` is null, `"true"`/`"false"` are booleans, anything else stays text.
    pub fn decode(raw: &str) -> Self {
        match raw {
            "None" => Self::Null,
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            other => Self::Text(other.to_string()),
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::String(s) => Self::decode(s),
            Value::Number(n) => Self::Text(n.to_string()),
            other => Self::Text(other.to_string()),
        }
    }
}

/// Typed record of one node, exported by one session and adopted by another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedNodeState {
    pub http_addr: String,
    pub port: u16,
    pub node_id: Option<u32>,
    pub username: Option<String>,
    pub cloud_name: Option<String>,
    pub remote: bool,
    pub artifact: Option<String>,
    pub flatfile: Option<String>,
    pub ice_dir: Option<String>,
    pub use_flatfile: bool,
    pub use_hdfs: bool,
    pub use_maprfs: bool,
    pub hdfs_name_node: Option<String>,
    pub hdfs_version: Option<String>,
    pub aws_credentials: Option<String>,
    pub java_heap_gb: Option<u32>,
    pub java_heap_mb: Option<u32>,
    pub sandbox_ignore_errors: bool,
    pub delete_keys_at_teardown: bool,
}

fn flat_opt<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "None".to_string(), ToString::to_string)
}

fn flat_bool(value: bool) -> String {
    let text = if value { "true" } else { "false" };
    text.to_string()
}

impl PersistedNodeState {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.http_addr.clone(), self.port)
    }

    /// Flat string map with `"None"`/`"true"`/`"false"` sentinels.
    pub fn to_flat(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("http_addr".to_string(), self.http_addr.clone());
        map.insert("port".to_string(), self.port.to_string());
        map.insert("node_id".to_string(), flat_opt(&self.node_id));
        map.insert("username".to_string(), flat_opt(&self.username));
        map.insert("cloud_name".to_string(), flat_opt(&self.cloud_name));
        map.insert("remote".to_string(), flat_bool(self.remote));
        map.insert("artifact".to_string(), flat_opt(&self.artifact));
        map.insert("flatfile".to_string(), flat_opt(&self.flatfile));
        map.insert("ice_dir".to_string(), flat_opt(&self.ice_dir));
        map.insert("use_flatfile".to_string(), flat_bool(self.use_flatfile));
        map.insert("use_hdfs".to_string(), flat_bool(self.use_hdfs));
        map.insert("use_maprfs".to_string(), flat_bool(self.use_maprfs));
        map.insert("hdfs_name_node".to_string(), flat_opt(&self.hdfs_name_node));
        map.insert("hdfs_version".to_string(), flat_opt(&self.hdfs_version));
        map.insert("aws_credentials".to_string(), flat_opt(&self.aws_credentials));
        map.insert("java_heap_gb".to_string(), flat_opt(&self.java_heap_gb));
        map.insert("java_heap_mb".to_string(), flat_opt(&self.java_heap_mb));
        map.insert(
            "sandbox_ignore_errors".to_string(),
            flat_bool(self.sandbox_ignore_errors),
        );
        map.insert(
            "delete_keys_at_teardown".to_string(),
            flat_bool(self.delete_keys_at_teardown),
        );
        map
    }

    /// Decode a flat record. `http_addr` and `port` are required; unknown
    /// keys are skipped.
    pub fn from_flat(record: &Map<String, Value>) -> HarnessResult<Self> {
        let mut state = Self {
            http_addr: String::new(),
            port: 0,
            node_id: None,
            username: None,
            cloud_name: None,
            remote: false,
            artifact: None,
            flatfile: None,
            ice_dir: None,
            use_flatfile: false,
            use_hdfs: false,
            use_maprfs: false,
            hdfs_name_node: None,
            hdfs_version: None,
            aws_credentials: None,
            java_heap_gb: None,
            java_heap_mb: None,
            sandbox_ignore_errors: false,
            delete_keys_at_teardown: false,
        };
        let mut http_addr = None;
        let mut port = None;

        for (key, raw) in record {
            let value = FlatValue::from_json(raw);
            match key.as_str() {
                "http_addr" => http_addr = text(key, value)?,
                "port" => port = number(key, value)?,
                "node_id" => state.node_id = number(key, value)?,
                "username" => state.username = text(key, value)?,
                "cloud_name" => state.cloud_name = text(key, value)?,
                "remote" => state.remote = boolean(key, value)?,
                "artifact" => state.artifact = text(key, value)?,
                "flatfile" => state.flatfile = text(key, value)?,
                "ice_dir" => state.ice_dir = text(key, value)?,
                "use_flatfile" => state.use_flatfile = boolean(key, value)?,
                "use_hdfs" => state.use_hdfs = boolean(key, value)?,
                "use_maprfs" => state.use_maprfs = boolean(key, value)?,
                "hdfs_name_node" => state.hdfs_name_node = text(key, value)?,
                "hdfs_version" => state.hdfs_version = text(key, value)?,
                "aws_credentials" => state.aws_credentials = text(key, value)?,
                "java_heap_gb" => state.java_heap_gb = number(key, value)?,
                "java_heap_mb" => state.java_heap_mb = number(key, value)?,
                "sandbox_ignore_errors" => state.sandbox_ignore_errors = boolean(key, value)?,
                "delete_keys_at_teardown" => state.delete_keys_at_teardown = boolean(key, value)?,
                _ => debug!(key = %key, "ignoring unknown node state key"),
            }
        }

        state.http_addr = http_addr
            .ok_or_else(|| HarnessError::configuration("node state is missing http_addr"))?;
        state.port = port.ok_or_else(|| HarnessError::configuration("node state is missing port"))?;
        Ok(state)
    }
}

fn text(key: &str, value: FlatValue) -> HarnessResult<Option<String>> {
    match value {
        FlatValue::Null => Ok(None),
        FlatValue::Text(s) => Ok(Some(s)),
        FlatValue::Bool(b) => Err(HarnessError::Configuration(format!(
            "node state key {key}: expected text, got {b}"
        ))),
    }
}

fn boolean(key: &str, value: FlatValue) -> HarnessResult<bool> {
    match value {
        FlatValue::Null => Ok(false),
        FlatValue::Bool(b) => Ok(b),
        FlatValue::Text(s) => Err(HarnessError::Configuration(format!(
            "node state key {key}: expected true/false, got {s:?}"
        ))),
    }
}

fn number<T: std::str::FromStr>(key: &str, value: FlatValue) -> HarnessResult<Option<T>> {
    match text(key, value)? {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|_| {
            HarnessError::Configuration(format!("node state key {key}: not a number: {s:?}"))
        }),
    }
}

/// How and by whom an exported cluster was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStart {
    pub time: String,
    pub cwd: String,
    #[serde(alias = "python_test_name")]
    pub test_name: String,
    pub username: String,
    pub ip: String,
}

/// The exported cluster state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateFile {
    pub cloud_start: CloudStart,
    pub h2o_nodes: Vec<Map<String, Value>>,
}

impl ClusterStateFile {
    pub fn new(cloud_start: CloudStart, nodes: &[PersistedNodeState]) -> Self {
        let h2o_nodes = nodes
            .iter()
            .map(|node| {
                node.to_flat()
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect()
            })
            .collect();
        Self {
            cloud_start,
            h2o_nodes,
        }
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!("cannot read cluster state {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            HarnessError::Configuration(format!("invalid cluster state {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::Configuration(format!("cannot encode cluster state: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Decode every node record; the first malformed one fails the load.
    pub fn nodes(&self) -> HarnessResult<Vec<PersistedNodeState>> {
        if self.h2o_nodes.is_empty() {
            warn!("cluster state lists no nodes");
        }
        self.h2o_nodes.iter().map(PersistedNodeState::from_flat).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PersistedNodeState {
        PersistedNodeState {
            http_addr: "10.0.0.4".to_string(),
            port: 54323,
            node_id: Some(1),
            username: Some("alice".to_string()),
            cloud_name: Some("clh-alice-77".to_string()),
            remote: true,
            artifact: Some("/tmp/abc-h2o.jar".to_string()),
            flatfile: None,
            ice_dir: Some("/tmp/ice.54323.1".to_string()),
            use_flatfile: false,
            use_hdfs: true,
            use_maprfs: false,
            hdfs_name_node: Some("nn:9000".to_string()),
            hdfs_version: Some("cdh4".to_string()),
            aws_credentials: None,
            java_heap_gb: Some(4),
            java_heap_mb: None,
            sandbox_ignore_errors: false,
            delete_keys_at_teardown: true,
        }
    }

    #[test]
    fn test_endpoint_url_delimiter() {
        let endpoint = Endpoint::new("127.0.0.1", 54321);
        assert_eq!(endpoint.url("3/Cloud.json"), "http://127.0.0.1:54321/3/Cloud.json");
        assert_eq!(endpoint.url("/3/Cloud.json"), "http://127.0.0.1:54321/3/Cloud.json");
        assert_eq!(endpoint.to_string(), "http://127.0.0.1:54321/");
    }

    #[test]
    fn test_flat_sentinels() {
        let flat = sample().to_flat();
        assert_eq!(flat["flatfile"], "None");
        assert_eq!(flat["remote"], "true");
        assert_eq!(flat["use_flatfile"], "false");
        assert_eq!(flat["port"], "54323");

        assert_eq!(FlatValue::decode("None"), FlatValue::Null);
        assert_eq!(FlatValue::decode("null"), FlatValue::Text("null".to_string()));
    }

    #[test]
    fn test_state_file_preserves_every_field() {
        let file = ClusterStateFile::new(
            CloudStart {
                time: "t".to_string(),
                cwd: "/w".to_string(),
                test_name: "t1".to_string(),
                username: "alice".to_string(),
                ip: "10.0.0.1".to_string(),
            },
            &[sample()],
        );
        let text = serde_json::to_string(&file).unwrap();
        let back: ClusterStateFile = serde_json::from_str(&text).unwrap();
        assert_eq!(back.nodes().unwrap(), vec![sample()]);
    }

    #[test]
    fn test_native_json_values_are_accepted() {
        let record = json!({
            "http_addr": "h",
            "port": 1234,
            "use_flatfile": true,
            "flatfile": null,
            "h2o_addr": "legacy key"
        });
        let state = PersistedNodeState::from_flat(record.as_object().unwrap()).unwrap();
        assert_eq!(state.port, 1234);
        assert!(state.use_flatfile);
        assert_eq!(state.flatfile, None);
    }

    #[test]
    fn test_missing_required_keys_fail_early() {
        let record = json!({"http_addr": "h"});
        assert!(matches!(
            PersistedNodeState::from_flat(record.as_object().unwrap()),
            Err(HarnessError::Configuration(_))
        ));
        let record = json!({"http_addr": "h", "port": "x"});
        assert!(PersistedNodeState::from_flat(record.as_object().unwrap()).is_err());
        let record = json!({"http_addr": "h", "port": "1", "remote": "yes"});
        assert!(PersistedNodeState::from_flat(record.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_python_test_name_alias() {
        let text = r#"{"cloud_start": {"time": "t", "cwd": "c", "python_test_name": "p", "username": "u", "ip": "i"}, "h2o_nodes": []}"#;
        let file: ClusterStateFile = serde_json::from_str(text).unwrap();
        assert_eq!(file.cloud_start.test_name, "p");
        assert!(file.nodes().unwrap().is_empty());
    }
}
