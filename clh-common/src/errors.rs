//! Error taxonomy for the cluster harness.
//!
//! Every fallible operation in this crate returns [`HarnessResult`]. The
//! variants follow the failure categories callers need to react to:
//! configuration mistakes surface at construction, connection failures may be
//! downgraded to "not alive" by reachability probes, protocol and decode
//! failures are always fatal, and remote application errors can be ignored on
//! request.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by node lifecycle, stabilization and request handling.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid configuration (heap out of range, missing persisted keys, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Remote session or authentication failure, or an unreachable node.
    #[error("connection error: {0}")]
    Connection(String),

    /// An HTTP exchange produced no usable response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The response body could not be decoded as a JSON collection.
    #[error("decode error: {message}")]
    Decode { message: String, body: String },

    /// The node reported an application-level error in its response.
    #[error("remote error from {url}: {value}")]
    Remote { url: String, value: serde_json::Value },

    /// A stabilization bound was exceeded.
    #[error("{message}")]
    Timeout {
        message: String,
        elapsed: Duration,
        retries: u32,
    },

    /// The operation is not valid for this kind of node.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// HTTP transport failure (refused, reset, timed out).
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    /// SSH session failure.
    #[cfg(unix)]
    #[error("ssh error: {0}")]
    Ssh(#[from] openssh::Error),

    /// The sandbox log scanner found a latent failure.
    #[error("errors found in sandbox logs under {0}")]
    SandboxErrors(std::path::PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Whether a reachability probe should treat this as "not alive".
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Transport { .. } | Self::Io(_) => true,
            #[cfg(unix)]
            Self::Ssh(_) => true,
            _ => false,
        }
    }

    /// Whether this error came out of a stabilization timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
