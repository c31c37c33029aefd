//! Tracing initialisation.
//!
//! Diagnostics go through `tracing`. The stderr layer uses the configured
//! format; an optional daily-rotated file layer always writes JSON lines.
//! The sandbox's `commands.log`/`rest.log` are separate artefacts and are not
//! routed through here.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::env::EnvParser;
use crate::errors::{HarnessError, HarnessResult};

/// File name prefix of the rotated log files.
pub const LOG_FILE_PREFIX: &str = "clh.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(HarnessError::Configuration(format!(
                "unknown log format {other:?} (expected pretty, compact or json)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `clh_common=debug,info`.
    pub level: String,
    pub format: LogFormat,
    /// Directory for rotated JSON log files.
    pub log_dir: Option<PathBuf>,
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            log_dir: None,
            stderr: true,
        }
    }
}

impl LogConfig {
    /// `CLH_LOG_LEVEL`, `CLH_LOG_FORMAT` and `CLH_LOG_DIR`.
    pub fn from_env(default_level: &str) -> HarnessResult<Self> {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level);
        let format = parser
            .get_optional_string("LOG_FORMAT")
            .map(|f| f.parse())
            .transpose()?
            .unwrap_or_default();
        let log_dir = parser
            .get_optional_string("LOG_DIR")
            .map(|d| crate::config::env::expand_home(&d));
        if parser.has_errors() {
            let joined = parser
                .take_errors()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HarnessError::Configuration(joined));
        }
        Ok(Self {
            level,
            format,
            log_dir,
            stderr: true,
        })
    }
}

/// Keeps the non-blocking file writer flushing; drop it last.
#[derive(Debug, Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> HarnessResult<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| HarnessError::Configuration(format!("invalid log filter {:?}: {e}", config.level)))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.stderr {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
        layers.push(match config.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        });
    }

    let mut guards = LoggingGuards::default();
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .boxed(),
        );
        guards._file = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| HarnessError::Configuration(format!("logging already initialised: {e}")))?;
    Ok(guards)
}

static TEST_LOGGING: Once = Once::new();

/// Compact logging into the test writer, once per process.
///
/// The level comes from `CLH_TEST_LOG_LEVEL` (default `info`). Safe to call
/// from every test.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let level = std::env::var("CLH_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = EnvFilter::try_new(format!("clh_common={level},clh={level}"))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let layer = fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();
        let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
    });
}
