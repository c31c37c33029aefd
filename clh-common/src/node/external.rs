//! Nodes adopted from another session's exported cluster state.

use std::sync::Arc;

use tracing::debug;

use super::{ClusterNode, Endpoint, NodeKind, PersistedNodeState, PROBE_TIMEOUT, SHUTDOWN_TIMEOUT};
use crate::errors::{HarnessError, HarnessResult};
use crate::request::RequestClient;

/// A node this process did not start. It has no process or channel, so
/// everything goes through HTTP.
#[derive(Debug)]
pub struct ExternalNode {
    state: PersistedNodeState,
    endpoint: Endpoint,
    client: Arc<RequestClient>,
}

impl ExternalNode {
    pub fn from_state(state: PersistedNodeState, client: Arc<RequestClient>) -> Self {
        Self {
            endpoint: state.endpoint(),
            state,
            client,
        }
    }

    pub fn state(&self) -> &PersistedNodeState {
        &self.state
    }
}

impl ClusterNode for ExternalNode {
    fn kind(&self) -> NodeKind {
        NodeKind::External
    }

    fn node_id(&self) -> Option<u32> {
        self.state.node_id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_alive(&mut self) -> bool {
        match self.client.get_cloud(&self.endpoint, PROBE_TIMEOUT, false) {
            Ok(_) => true,
            Err(err) => {
                debug!(endpoint = %self.endpoint, error = %err, "external node probe failed");
                false
            }
        }
    }

    fn terminate_self_only(&mut self) -> HarnessResult<Option<i32>> {
        Err(HarnessError::Unsupported(
            "terminate_self_only() is not supported for external nodes".to_string(),
        ))
    }

    /// Shutdown request only; its failure is returned.
    fn terminate(&mut self) -> HarnessResult<()> {
        self.client.shutdown_all(&self.endpoint, SHUTDOWN_TIMEOUT)
    }

    fn artifact_path(&self) -> Option<&str> {
        self.state.artifact.as_deref()
    }

    fn flat_file_path(&self) -> Option<&str> {
        self.state.flatfile.as_deref()
    }

    fn working_directory(&self) -> Option<&str> {
        self.state.ice_dir.as_deref()
    }

    fn persisted_state(&self) -> PersistedNodeState {
        self.state.clone()
    }
}
