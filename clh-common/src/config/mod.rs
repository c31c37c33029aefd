//! Configuration sources for the harness.
//!
//! Two layers feed node construction: [`GlobalOverrides`] (process-wide knobs
//! from the environment or the command line) and [`ClusterFile`] (a TOML
//! description of one cluster). Explicit overrides beat per-node defaults.

pub mod cluster;
pub mod env;

pub use cluster::{ClusterFile, ClusterSection, HostEntry};
pub use env::{EnvError, EnvParser};

use crate::errors::{HarnessError, HarnessResult};

/// Default directory name of the sandbox area.
pub const DEFAULT_SANDBOX_NAME: &str = "sandbox";

/// Process-wide overrides applied on top of every node's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOverrides {
    /// Explicit bind address; wins over any configured node address.
    pub ip: Option<String>,
    /// Network mask handed to nodes as `-network=`.
    pub network: Option<String>,
    /// Force debugger attach on every node.
    pub debugger: bool,
    pub random_udp_drop: bool,
    pub verbose: bool,
    /// Record full request/response exchanges in `rest.log`.
    pub debug_rest: bool,
    pub beta_features: bool,
    pub test_name: String,
    pub sandbox_name: String,
}

impl Default for GlobalOverrides {
    fn default() -> Self {
        Self {
            ip: None,
            network: None,
            debugger: false,
            random_udp_drop: false,
            verbose: false,
            debug_rest: false,
            beta_features: true,
            test_name: default_test_name(),
            sandbox_name: DEFAULT_SANDBOX_NAME.to_string(),
        }
    }
}

impl GlobalOverrides {
    /// Read overrides from `CLH_*` environment variables.
    ///
    /// All malformed variables are reported together as one configuration error.
    pub fn from_env() -> HarnessResult<Self> {
        let defaults = Self::default();
        let mut parser = EnvParser::new();

        let overrides = Self {
            ip: parser.get_optional_string("IP"),
            network: parser.get_optional_string("NETWORK"),
            debugger: parser.get_bool("DEBUGGER", defaults.debugger),
            random_udp_drop: parser.get_bool("RANDOM_UDP_DROP", defaults.random_udp_drop),
            verbose: parser.get_bool("VERBOSE", defaults.verbose),
            debug_rest: parser.get_bool("DEBUG_REST", defaults.debug_rest),
            beta_features: parser.get_bool("BETA_FEATURES", defaults.beta_features),
            test_name: parser.get_string("TEST_NAME", &defaults.test_name),
            sandbox_name: parser.get_string("SANDBOX_NAME", &defaults.sandbox_name),
        };

        if parser.has_errors() {
            let joined = parser
                .take_errors()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HarnessError::Configuration(joined));
        }
        Ok(overrides)
    }
}

fn default_test_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let overrides = GlobalOverrides::default();
        assert!(overrides.beta_features);
        assert!(!overrides.debugger);
        assert_eq!(overrides.sandbox_name, "sandbox");
        assert!(!overrides.test_name.is_empty());
    }

    #[test]
    #[serial(clh_env)]
    fn test_from_env_reads_overrides() {
        // SAFETY: serialized with every other env-touching test
        unsafe {
            std::env::set_var("CLH_IP", "10.0.0.7");
            std::env::set_var("CLH_DEBUGGER", "1");
            std::env::set_var("CLH_SANDBOX_NAME", "sandbox-ci");
        }
        let overrides = GlobalOverrides::from_env().unwrap();
        assert_eq!(overrides.ip.as_deref(), Some("10.0.0.7"));
        assert!(overrides.debugger);
        assert_eq!(overrides.sandbox_name, "sandbox-ci");
        // SAFETY: serialized with every other env-touching test
        unsafe {
            std::env::remove_var("CLH_IP");
            std::env::remove_var("CLH_DEBUGGER");
            std::env::remove_var("CLH_SANDBOX_NAME");
        }
    }

    #[test]
    #[serial(clh_env)]
    fn test_from_env_reports_all_errors() {
        // SAFETY: serialized with every other env-touching test
        unsafe {
            std::env::set_var("CLH_VERBOSE", "loudly");
            std::env::set_var("CLH_DEBUG_REST", "sometimes");
        }
        let err = GlobalOverrides::from_env().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("CLH_VERBOSE"));
        assert!(text.contains("CLH_DEBUG_REST"));
        // SAFETY: serialized with every other env-touching test
        unsafe {
            std::env::remove_var("CLH_VERBOSE");
            std::env::remove_var("CLH_DEBUG_REST");
        }
    }
}
