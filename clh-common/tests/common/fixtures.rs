use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clh_common::config::GlobalOverrides;
use clh_common::node::NodeConfig;
use clh_common::sandbox::{Sandbox, SandboxOptions};
use clh_common::RequestClient;
use tempfile::TempDir;

/// A sandbox in a temp directory plus a client with a short error-check delay.
pub struct TestSandbox {
    pub dir: TempDir,
    pub client: Arc<RequestClient>,
}

impl TestSandbox {
    pub fn new(test_name: &str) -> Self {
        Self::with_options(SandboxOptions {
            test_name: test_name.to_string(),
            debug_rest: false,
            ignore_errors: false,
        })
    }

    pub fn with_options(options: SandboxOptions) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let overrides = GlobalOverrides {
            test_name: options.test_name.clone(),
            debug_rest: options.debug_rest,
            ..GlobalOverrides::default()
        };
        let sandbox = Sandbox::create(dir.path().join("sandbox"), options).expect("create sandbox");
        let client = RequestClient::new(Arc::new(sandbox), overrides)
            .with_error_check_delay(Duration::from_millis(10));
        Self {
            dir,
            client: Arc::new(client),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        self.client.sandbox()
    }

    pub fn root(&self) -> &Path {
        self.sandbox().root()
    }

    /// An empty file standing in for the node artifact.
    pub fn artifact(&self) -> PathBuf {
        let path = self.dir.path().join("node.jar");
        if !path.exists() {
            std::fs::write(&path, b"not really a jar").expect("write artifact");
        }
        path
    }

    /// Node configuration that runs `script` with `sh` on 127.0.0.1.
    pub fn script_node(&self, script: &Path, port: u16) -> NodeConfig {
        NodeConfig::builder()
            .node_id(0)
            .address("127.0.0.1")
            .port(port)
            .program("sh")
            .leading_args([script.display().to_string()])
            .artifact(self.artifact())
            .build()
            .expect("valid node config")
    }

    pub fn commands_log(&self) -> String {
        std::fs::read_to_string(self.sandbox().commands_log_path()).unwrap_or_default()
    }
}

/// Write a shell script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    path
}
