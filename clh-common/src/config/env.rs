//! Environment variable parsing with type safety.
//!
//! Collects every malformed `CLH_*` variable instead of failing on the first,
//! so a misconfigured CI job reports all of its problems at once.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, PartialEq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the CLH_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "CLH_",
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        env::var(self.var_name(name)).unwrap_or_else(|_| default.to_string())
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Option<String> {
        match env::var(self.var_name(name)) {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return default;
        };
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                default
            }
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> String {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return default.to_string();
        };
        let lower = value.to_lowercase();
        match lower.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => lower,
            _ => {
                self.errors.push(EnvError::InvalidLogLevel {
                    var: var_name,
                    value,
                });
                default.to_string()
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(stripped), Some(home)) => home.join(stripped),
        _ => PathBuf::from(value),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_env(key: &str, value: &str) {
        // SAFETY: serialized with every other env-touching test
        unsafe { env::set_var(key, value) };
    }

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: serialized with every other env-touching test
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial(clh_env)]
    fn test_get_bool_values() {
        let vars = ["CLH_TEST_BOOL"];
        for (raw, expected) in [("1", true), ("Yes", true), ("off", false), ("", false)] {
            set_env("CLH_TEST_BOOL", raw);
            let mut parser = EnvParser::new();
            assert_eq!(parser.get_bool("TEST_BOOL", !expected), expected, "{raw}");
            assert!(!parser.has_errors());
        }
        cleanup_env(&vars);
    }

    #[test]
    #[serial(clh_env)]
    fn test_invalid_values_are_collected() {
        let vars = ["CLH_BAD_BOOL", "CLH_BAD_LEVEL"];
        set_env("CLH_BAD_BOOL", "maybe");
        set_env("CLH_BAD_LEVEL", "loud");

        let mut parser = EnvParser::new();
        assert!(!parser.get_bool("BAD_BOOL", false));
        assert_eq!(parser.get_log_level("BAD_LEVEL", "info"), "info");

        let errors = parser.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], EnvError::InvalidValue { .. }));
        assert!(matches!(errors[1], EnvError::InvalidLogLevel { .. }));
        assert!(!parser.has_errors());
        cleanup_env(&vars);
    }

    #[test]
    #[serial(clh_env)]
    fn test_optional_string_treats_empty_as_unset() {
        set_env("CLH_TEST_EMPTY", "");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_string("TEST_EMPTY"), None);
        assert_eq!(parser.get_optional_string("TEST_UNSET_VALUE"), None);
        cleanup_env(&["CLH_TEST_EMPTY"]);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/x"), home.join("x"));
        }
    }
}
