//! Sandbox log scanning.
//!
//! The harness only cares about the boolean outcome of a scan; which lines
//! count as a failure is the scanner's business. [`LogPatternScanner`] is the
//! default: a handful of regexes over the captured stdout/stderr logs.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use regex::Regex;
use tracing::{debug, error, warn};

/// Scans a sandbox directory for latent failures.
///
/// Implementations must be idempotent and side-effect free apart from logging.
pub trait ErrorScanner: Send + Sync {
    fn scan_for_errors(
        &self,
        log_dir: &Path,
        ignore_errors: bool,
        cloud_shutdown_is_error: bool,
        test_name: &str,
    ) -> bool;
}

impl<F> ErrorScanner for F
where
    F: Fn(&Path, bool, bool, &str) -> bool + Send + Sync,
{
    fn scan_for_errors(
        &self,
        log_dir: &Path,
        ignore_errors: bool,
        cloud_shutdown_is_error: bool,
        test_name: &str,
    ) -> bool {
        self(log_dir, ignore_errors, cloud_shutdown_is_error, test_name)
    }
}

/// Maximum number of offending lines reported per scan.
const MAX_REPORTED_LINES: usize = 20;

/// Regex-based scanner over `*stdout*` / `*stderr*` files in the sandbox.
#[derive(Debug, Clone)]
pub struct LogPatternScanner {
    fatal: Regex,
    shutdown: Regex,
    ignore: Option<Regex>,
}

impl LogPatternScanner {
    pub fn new() -> Self {
        Self {
            fatal: Regex::new(
                r"\bERROR\b|Exception|OutOfMemoryError|java\.lang\.AssertionError|\bFATAL\b",
            )
            .expect("static regex"),
            shutdown: Regex::new(r"(?i)\bshutdown\b").expect("static regex"),
            ignore: None,
        }
    }

    /// Lines matching `pattern` are never reported.
    pub fn with_ignore(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.ignore = Some(Regex::new(pattern)?);
        Ok(self)
    }

    fn is_failure(&self, line: &str, cloud_shutdown_is_error: bool) -> bool {
        if self.ignore.as_ref().is_some_and(|re| re.is_match(line)) {
            return false;
        }
        self.fatal.is_match(line) || (cloud_shutdown_is_error && self.shutdown.is_match(line))
    }

    /// Collect `(file name, line)` pairs that look like failures.
    pub fn find_failures(&self, log_dir: &Path, cloud_shutdown_is_error: bool) -> Vec<(String, String)> {
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(log_dir) else {
            debug!(dir = %log_dir.display(), "sandbox directory not readable, nothing to scan");
            return found;
        };

        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.contains("stdout") || n.contains("stderr"))
            })
            .collect();
        paths.sort();

        for path in paths {
            let Ok(file) = File::open(&path) else {
                continue;
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for line in BufReader::new(file).split(b'\n').map_while(Result::ok) {
                let line = String::from_utf8_lossy(&line);
                if self.is_failure(&line, cloud_shutdown_is_error) {
                    found.push((name.clone(), line.trim_end().to_string()));
                }
            }
        }
        found
    }
}

impl Default for LogPatternScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorScanner for LogPatternScanner {
    fn scan_for_errors(
        &self,
        log_dir: &Path,
        ignore_errors: bool,
        cloud_shutdown_is_error: bool,
        test_name: &str,
    ) -> bool {
        let failures = self.find_failures(log_dir, cloud_shutdown_is_error);
        if failures.is_empty() {
            return false;
        }
        for (file, line) in failures.iter().take(MAX_REPORTED_LINES) {
            if ignore_errors {
                warn!(test = test_name, file = %file, "ignored sandbox error: {line}");
            } else {
                error!(test = test_name, file = %file, "sandbox error: {line}");
            }
        }
        true
    }
}
