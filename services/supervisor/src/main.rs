//! nodetree - process supervision tree
//!
//! `nodetree run` starts a Supervisor, which re-executes this binary as
//! `nodetree stem` to get a Stem. Nodes are forked from the Stem and run the
//! default node body.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use nodetree_proto::{NodeConfig, Target};
use nodetree_supervisor::stem::{self, StemOutcome};
use nodetree_supervisor::{logging, node, Config, EventLoop, StemSettings, Supervisor};
use tracing::{error, info, warn};

/// Process supervision tree.
#[derive(Debug, Parser)]
#[command(name = "nodetree", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the Supervisor and the nodes listed in a file.
    Run(RunArgs),

    /// Check a node list without starting anything.
    Validate(ValidateArgs),

    /// Run as a Stem. Started by the Supervisor.
    #[command(hide = true)]
    Stem(StemArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// JSON file holding an array of node configs.
    #[arg(long, env = "NODETREE_NODES")]
    nodes: Option<PathBuf>,

    /// Seconds between status reports (0 disables them).
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// JSON file holding an array of node configs.
    #[arg(long)]
    nodes: PathBuf,
}

#[derive(Debug, Args)]
struct StemArgs {
    /// Inherited descriptor carrying Supervisor requests.
    #[arg(long)]
    read_fd: i32,

    /// Inherited descriptor for replies.
    #[arg(long)]
    write_fd: i32,

    /// Pid of the Supervisor.
    #[arg(long)]
    parent_pid: i32,

    /// Stem settings as JSON.
    #[arg(long)]
    settings: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Stem(args) => run_stem(args),
        Command::Run(args) => report(run_supervisor(args)),
        Command::Validate(args) => report(validate(args)),
    }
}

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("nodetree failed: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_stem(args: StemArgs) -> ExitCode {
    if let Err(e) = logging::init_from_env() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let settings = match StemSettings::from_arg(&args.settings) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid stem settings");
            return ExitCode::FAILURE;
        }
    };

    // The descriptors were opened by the Supervisor for this process only.
    let outcome = unsafe {
        stem::run_from_fds(args.read_fd, args.write_fd, args.parent_pid, settings)
    };

    match outcome {
        Ok(StemOutcome::Node(supervised)) => node::run(supervised),
        Ok(StemOutcome::Exit(code)) => {
            info!(code, "stem exiting");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "stem failed");
            ExitCode::FAILURE
        }
    }
}

fn run_supervisor(args: RunArgs) -> Result<()> {
    let config = Config::from_env()?;
    logging::init(&config.log_level, config.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        stem_exe = %config.stem_exe_path.display(),
        "nodetree starting"
    );

    let nodes = match &args.nodes {
        Some(path) => load_nodes(path)?,
        None => Vec::new(),
    };

    let mut supervisor = Supervisor::launch(config)?;
    for config in nodes {
        let name = config.name.clone();
        let err = supervisor.create(config);
        if err.is_empty() {
            info!(node = %name, "node configured");
        } else {
            error!(node = %name, error = %err, "failed to create node");
        }
    }

    let event_loop = EventLoop::default();
    let status_interval = Duration::from_secs(args.status_interval_secs);
    let mut next_report = Instant::now() + status_interval;

    while !supervisor.termination_requested() {
        event_loop.run_once(&mut supervisor)?;

        if !status_interval.is_zero() && Instant::now() >= next_report {
            log_status(&mut supervisor);
            next_report = Instant::now() + status_interval;
        }
    }

    info!("shutting down");
    supervisor.shutdown();
    Ok(())
}

fn log_status(supervisor: &mut Supervisor) {
    let status = supervisor.status(Target::All);
    if !status.health.is_healthy() {
        warn!(health = ?status.health, "stem is not healthy");
    }
    for (name, node) in &status.nodes {
        info!(
            node = %name,
            state = %node.state,
            pid = node.pid,
            revival_attempts = node.revival_attempts,
            "node status"
        );
    }
}

fn validate(args: ValidateArgs) -> Result<()> {
    let nodes = load_nodes(&args.nodes)?;
    let rendered =
        serde_json::to_string_pretty(&nodes).context("failed to render node configs")?;
    println!("{}", rendered);
    Ok(())
}

/// Read a JSON array of node configs, rejecting invalid entries and
/// duplicate names.
fn load_nodes(path: &Path) -> Result<Vec<NodeConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let values: Vec<serde_json::Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{} must hold a JSON array", path.display()))?;

    let mut seen = BTreeSet::new();
    let mut nodes = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        let config = NodeConfig::from_value(value)
            .with_context(|| format!("node #{} in {}", index, path.display()))?;
        config
            .validate()
            .with_context(|| format!("node #{} in {}", index, path.display()))?;
        if !seen.insert(config.name.clone()) {
            bail!("duplicate node name '{}' in {}", config.name, path.display());
        }
        nodes.push(config);
    }
    Ok(nodes)
}
