//! Cluster harness core.
//!
//! Brings up clusters of worker processes (locally, on remote hosts, or by
//! adopting a running cluster), waits for them to accept connections, talks
//! to them over JSON/HTTP and tears them down while scanning their logs for
//! latent failures.

pub mod config;
pub mod drain;
pub mod errors;
pub mod logging;
pub mod node;
pub mod remote;
pub mod request;
pub mod sandbox;
pub mod scanner;
pub mod stabilize;
pub mod supervisor;

pub use config::{ClusterFile, GlobalOverrides};
pub use errors::{HarnessError, HarnessResult};
pub use node::{
    ClusterNode, ClusterStateFile, Endpoint, ExternalNode, LocalNode, NodeConfig, NodeKind,
    PersistedNodeState, RemoteNode,
};
pub use remote::{RemoteCredentials, RemoteHost};
pub use request::{Method, RequestClient, RequestOptions};
pub use sandbox::{Sandbox, SandboxOptions, SandboxState};
pub use stabilize::{stabilize, StabilizeRequest};
pub use supervisor::ClusterSupervisor;
