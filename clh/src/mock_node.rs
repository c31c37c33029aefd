//! Stand-in node process.
//!
//! Answers the JSON/HTTP endpoints the harness relies on so clusters can be
//! exercised without the real runtime. Launched as
//! `clh mock-node -- <node flags>`; flags it does not know are ignored.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, info};

const DEFAULT_PORT: u16 = 54321;

/// What the mock takes from the node command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockNodeOptions {
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub cloud_name: String,
    pub flatfile: Option<PathBuf>,
}

impl MockNodeOptions {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut options = Self {
            ip: None,
            port: DEFAULT_PORT,
            cloud_name: "mock".to_string(),
            flatfile: None,
        };
        for arg in args {
            let Some((flag, value)) = arg.split_once('=') else {
                debug!(arg = %arg, "ignoring flag");
                continue;
            };
            match flag {
                "--port" => {
                    options.port = value
                        .parse()
                        .with_context(|| format!("invalid --port value {value:?}"))?;
                }
                "--ip" => {
                    options.ip = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid --ip value {value:?}"))?,
                    );
                }
                "--name" => options.cloud_name = value.to_string(),
                "--flatfile" => options.flatfile = Some(PathBuf::from(value)),
                _ => debug!(arg = %arg, "ignoring flag"),
            }
        }
        Ok(options)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)), self.port)
    }

    /// Members listed in the flat-file, or 1 without one.
    pub fn cloud_size(&self) -> usize {
        self.flatfile
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|text| text.lines().filter(|l| !l.trim().is_empty()).count())
            .filter(|&n| n > 0)
            .unwrap_or(1)
    }
}

struct NodeState {
    options: MockNodeOptions,
    stop: Notify,
}

fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/3/Cloud.json", get(cloud_handler))
        .route("/3/Shutdown.json", post(stop_handler))
        .route("/3/LogAndEcho.json", get(log_and_echo_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn cloud_handler(State(state): State<Arc<NodeState>>) -> Json<Value> {
    Json(json!({
        "cloud_name": state.options.cloud_name,
        "cloud_size": state.options.cloud_size(),
        "consensus": true,
        "locked": false,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stop_handler(State(state): State<Arc<NodeState>>) -> Json<Value> {
    info!(port = state.options.port, "stop requested");
    state.stop.notify_one();
    Json(json!({}))
}

async fn log_and_echo_handler(
    State(state): State<Arc<NodeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let message = params.get("message").cloned().unwrap_or_default();
    info!(port = state.options.port, "{message}");
    Json(json!({ "message": message }))
}

async fn fallback_handler() -> Json<Value> {
    Json(json!({ "result": 42 }))
}

/// Serve until a stop request arrives.
pub async fn serve(options: MockNodeOptions) -> Result<()> {
    let addr = options.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let state = Arc::new(NodeState {
        options,
        stop: Notify::new(),
    });
    info!(%addr, cloud = %state.options.cloud_name, "mock node listening");

    let stopper = Arc::clone(&state);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stopper.stop.notified().await })
        .await?;
    info!(%addr, "mock node stopped");
    Ok(())
}
