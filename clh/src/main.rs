//! Cluster harness CLI.
//!
//! Starts a cluster described by a TOML file, probes or stops a cluster
//! exported by another session, and provides the stand-in node used by the
//! end-to-end tests.

#![forbid(unsafe_code)]

mod commands;
mod mock_node;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clh_common::config::GlobalOverrides;
use clh_common::logging::{LogConfig, init_logging};
use tracing::debug;

use commands::RunOptions;
use mock_node::MockNodeOptions;

#[derive(Parser)]
#[command(name = "clh")]
#[command(author, version, about = "Cluster harness - start, probe and stop test clusters")]
struct Cli {
    /// Log filter, e.g. `debug` or `clh_common=trace` (overrides CLH_LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty, compact or json (overrides CLH_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster from a TOML description, exercise it, tear it down
    Run(RunArgs),

    /// Check which nodes of an exported cluster answer
    Probe(StateArgs),

    /// Shut down every node of an exported cluster
    Shutdown(StateArgs),

    /// Stand-in node process answering the node HTTP endpoints
    #[command(hide = true)]
    MockNode(MockNodeArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Cluster description
    #[arg(short, long, env = "CLH_CLUSTER_CONFIG")]
    config: PathBuf,

    /// Sandbox directory (default: CLH_SANDBOX_NAME)
    #[arg(long)]
    sandbox: Option<PathBuf>,

    /// Write the cluster state here once it is up
    #[arg(long)]
    export: Option<PathBuf>,

    /// GET this path on the first node and print the reply (repeatable)
    #[arg(long = "request")]
    requests: Vec<String>,

    /// Fail unless every node reports this many members
    #[arg(long)]
    expect_cloud_size: Option<usize>,

    /// Keep the cluster up this many seconds before teardown
    #[arg(long, default_value = "0")]
    hold_secs: u64,
}

#[derive(Args)]
struct StateArgs {
    /// Exported cluster state file
    #[arg(short, long)]
    state: PathBuf,

    /// Sandbox directory for this session's logs (not cleaned)
    #[arg(long)]
    sandbox: Option<PathBuf>,
}

#[derive(Args)]
struct MockNodeArgs {
    /// Node command line; unknown flags are ignored
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env(if cli.verbose { "debug" } else { "info" })?;
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format.parse()?;
    }
    let _guards = init_logging(&log_config)?;

    let verbose = cli.verbose;
    match cli.command {
        Commands::Run(args) => {
            let options = RunOptions {
                config: args.config,
                sandbox: args.sandbox,
                export: args.export,
                requests: args.requests,
                expect_cloud_size: args.expect_cloud_size,
                hold: Duration::from_secs(args.hold_secs),
            };
            commands::run(&options, overrides(verbose)?)
        }
        Commands::Probe(args) => {
            commands::probe(&args.state, args.sandbox.as_deref(), overrides(verbose)?)
        }
        Commands::Shutdown(args) => {
            commands::shutdown(&args.state, args.sandbox.as_deref(), overrides(verbose)?)
        }
        Commands::MockNode(args) => {
            let options = MockNodeOptions::parse(&args.args)?;
            debug!(?options, "starting mock node");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(mock_node::serve(options))
        }
    }
}

fn overrides(verbose: bool) -> Result<GlobalOverrides> {
    let mut overrides = GlobalOverrides::from_env()?;
    overrides.verbose |= verbose;
    Ok(overrides)
}
