//! Lokai Bridge console
//!
//! Supervises the agent worker and stands in for the chat UI on a terminal:
//! messages and commands come in on stdin, replies go to stdout, approval
//! prompts and diagnostics go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tracing::info;

use lokai_bridge::AgentBridge;
use lokai_bridge::console;
use lokai_core::config::{self, Config};

#[derive(Parser, Debug)]
#[command(name = "lokai-bridge")]
#[command(version, about = "Lokai bridge - drive the agent worker from a terminal")]
struct Args {
    /// Worker executable (default from config: python3)
    #[arg(long, env = "LOKAI_WORKER_PROGRAM")]
    worker_program: Option<PathBuf>,

    /// Argument passed to the worker; repeat for several. Replaces the
    /// configured arguments when given.
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Working directory for the worker
    #[arg(long, env = "LOKAI_WORKER_DIR")]
    worker_dir: Option<PathBuf>,

    /// Settings file to use instead of the global and project files
    #[arg(long, env = "LOKAI_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the bridge (e.g. "info", "debug", "warn").
    #[arg(long, env = "LOKAI_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LOKAI_LOG_JSON")]
    log_json: bool,

    /// Wait for whole replies instead of streaming tokens.
    #[arg(long, env = "LOKAI_NO_STREAM")]
    no_stream: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => config::load_config_from(path)?,
            None => config::load_config(std::env::current_dir().ok().as_deref())?,
        };
        if let Some(program) = &self.worker_program {
            config.worker.program.clone_from(program);
        }
        if !self.worker_args.is_empty() {
            config.worker.args.clone_from(&self.worker_args);
        }
        if let Some(dir) = &self.worker_dir {
            config.worker.working_directory = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        Ok(config)
    }
}

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    let log_filter = format!("lokai_bridge={0},lokai_core={0}", config.log_level);
    lokai_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        program = %config.worker.program.display(),
        args = ?config.worker.args,
        "Starting lokai-bridge"
    );

    let bridge = Arc::new(AgentBridge::from_config(&config));
    tokio::spawn(console::print_worker_events(bridge.subscribe_worker_events()));
    tokio::spawn(console::print_approval_events(bridge.subscribe_approvals()));

    bridge.start().await?;
    eprintln!(
        "[Worker ready (pid {})] Type a message, or /help for commands.",
        bridge.supervisor().pid().unwrap_or_default()
    );

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let input = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console::run(Arc::clone(&bridge), input, !args.no_stream) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    bridge.stop().await;
    info!("Bridge stopped");
    Ok(())
}
