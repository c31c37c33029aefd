//! Node configuration.
//!
//! [`NodeConfig`] is immutable once built: the builder validates heap bounds
//! and fills in identity defaults (owning user, per-process cloud name), so a
//! constructed node never has to re-check its own settings.

use std::path::PathBuf;

use crate::errors::{HarnessError, HarnessResult};

/// Port of the first node in a cluster.
pub const DEFAULT_BASE_PORT: u16 = 54321;

/// Valid heap sizes in GB.
pub const HEAP_GB_RANGE: std::ops::RangeInclusive<u32> = 1..=256;

/// Valid heap sizes in MB.
pub const HEAP_MB_RANGE: std::ops::RangeInclusive<u32> = 1..=256_000;

/// Boot class used when launching from a classpath instead of a jar.
pub const DEFAULT_MAIN_CLASS: &str = "water.Boot";

/// Configuration of one cluster node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub node_id: Option<u32>,
    /// Explicit bind address; when set it also becomes the node's HTTP address.
    pub address: Option<String>,
    pub port: u16,
    /// Pass `--ip=` to the node. Defaults to "an explicit address is known".
    pub force_ip: Option<bool>,
    pub network: Option<String>,

    pub heap_gb: Option<u32>,
    pub heap_mb: Option<u32>,
    pub extra_args: Vec<String>,

    /// Runtime launcher and the arguments placed before any node flags.
    pub program: String,
    pub leading_args: Vec<String>,
    pub artifact: PathBuf,
    /// Launch from these classpath entries instead of `-jar <artifact>`.
    pub classpath: Option<Vec<PathBuf>>,
    pub main_class: String,

    pub use_flatfile: bool,
    pub use_home_for_ice: bool,
    pub use_hdfs: bool,
    pub use_maprfs: bool,
    pub hdfs_name_node: Option<String>,
    pub hdfs_version: Option<String>,
    pub hdfs_config: Option<PathBuf>,
    pub aws_credentials: Option<PathBuf>,

    pub enable_debugger: bool,
    pub disable_assertions: bool,
    pub random_udp_drop: bool,
    pub force_tcp: bool,
    pub disable_log: bool,

    pub username: String,
    pub cloud_name: String,

    pub capture_output: bool,
    pub sandbox_ignore_errors: bool,
    pub delete_keys_at_teardown: bool,
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Copy of this configuration for another member of the same cluster.
    pub fn for_member(&self, node_id: u32, port: u16) -> Self {
        Self {
            node_id: Some(node_id),
            port,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if let Some(gb) = self.heap_gb
            && !HEAP_GB_RANGE.contains(&gb)
        {
            return Err(HarnessError::Configuration(format!(
                "heap_gb <1 or >256 (GB): {gb}"
            )));
        }
        if let Some(mb) = self.heap_mb
            && !HEAP_MB_RANGE.contains(&mb)
        {
            return Err(HarnessError::Configuration(format!(
                "heap_mb <1 or >256000 (MB): {mb}"
            )));
        }
        if (self.use_hdfs || self.use_maprfs)
            && (self.hdfs_name_node.is_none() || self.hdfs_version.is_none())
        {
            return Err(HarnessError::configuration(
                "hdfs/maprfs requires hdfs_name_node and hdfs_version",
            ));
        }
        if self.program.is_empty() {
            return Err(HarnessError::configuration("runtime program is empty"));
        }
        Ok(())
    }
}

/// Username of the current process owner.
pub fn current_username() -> String {
    whoami::username().unwrap_or_else(|_| "unknown".to_string())
}

/// Cloud name unique per (user, process).
pub fn default_cloud_name(username: &str) -> String {
    format!("clh-{}-{}", username, std::process::id())
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Clone, Default)]
pub struct NodeConfigBuilder {
    node_id: Option<u32>,
    address: Option<String>,
    port: Option<u16>,
    force_ip: Option<bool>,
    network: Option<String>,
    heap_gb: Option<u32>,
    heap_mb: Option<u32>,
    extra_args: Vec<String>,
    program: Option<String>,
    leading_args: Vec<String>,
    artifact: Option<PathBuf>,
    classpath: Option<Vec<PathBuf>>,
    main_class: Option<String>,
    use_flatfile: bool,
    use_home_for_ice: bool,
    use_hdfs: bool,
    use_maprfs: bool,
    hdfs_name_node: Option<String>,
    hdfs_version: Option<String>,
    hdfs_config: Option<PathBuf>,
    aws_credentials: Option<PathBuf>,
    enable_debugger: bool,
    disable_assertions: bool,
    random_udp_drop: bool,
    force_tcp: bool,
    disable_log: bool,
    username: Option<String>,
    cloud_name: Option<String>,
    capture_output: Option<bool>,
    sandbox_ignore_errors: bool,
    delete_keys_at_teardown: bool,
}

impl NodeConfigBuilder {
    pub fn node_id(mut self, id: u32) -> Self {
        self.node_id = Some(id);
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn force_ip(mut self, force: bool) -> Self {
        self.force_ip = Some(force);
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn heap_gb(mut self, gb: u32) -> Self {
        self.heap_gb = Some(gb);
        self
    }

    pub fn heap_mb(mut self, mb: u32) -> Self {
        self.heap_mb = Some(mb);
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn classpath(mut self, entries: Vec<PathBuf>, main_class: Option<String>) -> Self {
        self.classpath = Some(entries);
        self.main_class = main_class;
        self
    }

    pub fn use_flatfile(mut self, enabled: bool) -> Self {
        self.use_flatfile = enabled;
        self
    }

    pub fn use_home_for_ice(mut self, enabled: bool) -> Self {
        self.use_home_for_ice = enabled;
        self
    }

    pub fn hdfs(mut self, name_node: impl Into<String>, version: impl Into<String>) -> Self {
        self.use_hdfs = true;
        self.hdfs_name_node = Some(name_node.into());
        self.hdfs_version = Some(version.into());
        self
    }

    pub fn maprfs(mut self, name_node: impl Into<String>, version: impl Into<String>) -> Self {
        self.use_maprfs = true;
        self.hdfs_name_node = Some(name_node.into());
        self.hdfs_version = Some(version.into());
        self
    }

    pub fn hdfs_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.hdfs_config = Some(path.into());
        self
    }

    pub fn aws_credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.aws_credentials = Some(path.into());
        self
    }

    pub fn enable_debugger(mut self, enabled: bool) -> Self {
        self.enable_debugger = enabled;
        self
    }

    pub fn disable_assertions(mut self, disabled: bool) -> Self {
        self.disable_assertions = disabled;
        self
    }

    pub fn random_udp_drop(mut self, enabled: bool) -> Self {
        self.random_udp_drop = enabled;
        self
    }

    pub fn force_tcp(mut self, enabled: bool) -> Self {
        self.force_tcp = enabled;
        self
    }

    pub fn disable_log(mut self, disabled: bool) -> Self {
        self.disable_log = disabled;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn cloud_name(mut self, name: impl Into<String>) -> Self {
        self.cloud_name = Some(name.into());
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = Some(capture);
        self
    }

    pub fn sandbox_ignore_errors(mut self, ignore: bool) -> Self {
        self.sandbox_ignore_errors = ignore;
        self
    }

    pub fn delete_keys_at_teardown(mut self, delete: bool) -> Self {
        self.delete_keys_at_teardown = delete;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> HarnessResult<NodeConfig> {
        let username = self.username.unwrap_or_else(current_username);
        let cloud_name = self
            .cloud_name
            .unwrap_or_else(|| default_cloud_name(&username));

        let config = NodeConfig {
            node_id: self.node_id,
            address: self.address,
            port: self.port.unwrap_or(DEFAULT_BASE_PORT),
            force_ip: self.force_ip,
            network: self.network,
            heap_gb: self.heap_gb,
            heap_mb: self.heap_mb,
            extra_args: self.extra_args,
            program: self.program.unwrap_or_else(|| "java".to_string()),
            leading_args: self.leading_args,
            artifact: self
                .artifact
                .unwrap_or_else(|| PathBuf::from("target/h2o.jar")),
            classpath: self.classpath,
            main_class: self
                .main_class
                .unwrap_or_else(|| DEFAULT_MAIN_CLASS.to_string()),
            use_flatfile: self.use_flatfile,
            use_home_for_ice: self.use_home_for_ice,
            use_hdfs: self.use_hdfs,
            use_maprfs: self.use_maprfs,
            hdfs_name_node: self.hdfs_name_node,
            hdfs_version: self.hdfs_version,
            hdfs_config: self.hdfs_config,
            aws_credentials: self.aws_credentials,
            enable_debugger: self.enable_debugger,
            disable_assertions: self.disable_assertions,
            random_udp_drop: self.random_udp_drop,
            force_tcp: self.force_tcp,
            disable_log: self.disable_log,
            username,
            cloud_name,
            capture_output: self.capture_output.unwrap_or(true),
            sandbox_ignore_errors: self.sandbox_ignore_errors,
            delete_keys_at_teardown: self.delete_keys_at_teardown,
        };
        config.validate()?;
        Ok(config)
    }
}
