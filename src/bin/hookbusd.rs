//! hookbusd - event bus server and lifecycle control
//!
//! # Usage
//!
//! ```bash
//! # Start the bus in the background
//! hookbusd start
//!
//! # Run attached to the terminal (debug)
//! hookbusd start -f
//!
//! # Stop, restart, inspect
//! hookbusd stop
//! hookbusd restart
//! hookbusd status
//! hookbusd list
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hookbusd::config::{parse_range, BusConfig, RuntimePaths};
use hookbusd::daemon::{DaemonManager, DaemonState, LaunchOutcome, StartOptions, StopOutcome};
use hookbusd::instances::LaunchMode;
use hookbusd::runtime::{self, RuntimeError, ServeOptions};

/// hookbus daemon - real-time event bus for agent hooks
#[derive(Parser, Debug)]
#[command(name = "hookbusd", version, about)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/hookbus/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone, Default)]
struct StartArgs {
    /// Stay attached to the terminal instead of detaching
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Preferred port
    #[arg(short, long)]
    port: Option<u16>,

    /// Port range to scan, START-END
    #[arg(long, value_name = "START-END")]
    port_range: Option<String>,

    /// Also reclaim ports held by our own daemons
    #[arg(long)]
    force: bool,

    /// Never reclaim ports, even from our own debug servers
    #[arg(long)]
    no_reclaim: bool,

    /// Seconds between heartbeats
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Events kept for replay
    #[arg(long)]
    history_capacity: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the bus (background unless -f)
    Start(StartArgs),
    /// Stop the background bus
    Stop,
    /// Stop, then start again
    Restart(StartArgs),
    /// Show whether the bus is running
    Status,
    /// List every registered bus instance
    List,
    /// Run in the foreground on exactly one port (no scanning)
    Run {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match execute(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("hookbusd=info".parse().unwrap_or_default())
        .add_directive("hookbus_core=info".parse().unwrap_or_default())
        .add_directive("hookbus_protocol=info".parse().unwrap_or_default());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn execute(cli: Cli) -> Result<i32> {
    let mut config = BusConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let paths = RuntimePaths::from_env();

    match cli.command.unwrap_or(Command::Start(StartArgs::default())) {
        Command::Start(args) => {
            apply_start_args(&mut config, &args)?;
            let manager = DaemonManager::system(paths.clone(), config.clone());
            let outcome = manager.start(start_options(&args))?;
            launch(outcome, config, paths)
        }
        Command::Restart(args) => {
            apply_start_args(&mut config, &args)?;
            let manager = DaemonManager::system(paths.clone(), config.clone());
            let outcome = manager.restart(start_options(&args))?;
            launch(outcome, config, paths)
        }
        Command::Stop => {
            let manager = DaemonManager::system(paths, config);
            match manager.stop()? {
                StopOutcome::Stopped { pid } => println!("Stopped hookbusd (PID {pid})."),
                StopOutcome::NotRunning => println!("hookbusd is not running."),
            }
            Ok(0)
        }
        Command::Status => {
            let manager = DaemonManager::system(paths, config);
            Ok(print_status(&manager))
        }
        Command::List => {
            let manager = DaemonManager::system(paths, config);
            let instances = manager.list()?;
            if instances.is_empty() {
                println!("No running instances.");
                return Ok(0);
            }
            println!("{:<8} {:<8} {:<11} {:<26} PROJECT", "PORT", "PID", "MODE", "STARTED");
            for entry in instances {
                println!(
                    "{:<8} {:<8} {:<11} {:<26} {}",
                    entry.port,
                    entry.pid,
                    entry.mode,
                    entry.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    entry.project_root.display()
                );
            }
            Ok(0)
        }
        Command::Run { port } => {
            let options = ServeOptions {
                port: port.unwrap_or(config.port_range_start),
                mode: LaunchMode::Foreground,
                project_root: std::env::current_dir().context("Failed to read current directory")?,
            };
            serve(config, paths, options)
        }
    }
}

fn apply_start_args(config: &mut BusConfig, args: &StartArgs) -> Result<()> {
    if let Some(range) = &args.port_range {
        let (start, end) = parse_range(range)?;
        config.port_range_start = start;
        config.port_range_end = end;
    }
    if args.no_reclaim {
        config.reclaim = false;
    }
    if let Some(secs) = args.heartbeat_interval {
        config.heartbeat_interval_secs = secs;
    }
    if let Some(capacity) = args.history_capacity {
        config.history_capacity = capacity;
    }
    config.validate()?;
    Ok(())
}

fn start_options(args: &StartArgs) -> StartOptions {
    StartOptions {
        port: args.port,
        force: args.force,
        foreground: args.foreground,
    }
}

/// Acts on a start outcome. `Serve` runs the server in this process.
fn launch(outcome: LaunchOutcome, config: BusConfig, paths: RuntimePaths) -> Result<i32> {
    match outcome {
        LaunchOutcome::AlreadyRunning { pid, port } => {
            match port {
                Some(port) => println!("hookbusd is already running (PID {pid}, port {port})."),
                None => println!("hookbusd is already running (PID {pid})."),
            }
            Ok(0)
        }
        LaunchOutcome::Started { pid, port } => {
            println!("Started hookbusd (PID {pid}) on port {port}.");
            println!("Log: {}", paths.log_file.display());
            Ok(0)
        }
        LaunchOutcome::Serve(options) => serve(config, paths, options),
    }
}

/// Runs the server until SIGTERM/SIGINT. Starts its own runtime so that
/// daemonizing happens before any runtime threads exist.
fn serve(config: BusConfig, paths: RuntimePaths, options: ServeOptions) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            port = options.port,
            mode = %options.mode,
            project = %options.project_root.display(),
            "hookbusd starting"
        );

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime::shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            info!("Shutdown signal received");
            signal_token.cancel();
        });

        match runtime::serve(config, paths, options, shutdown).await {
            Ok(()) => {
                info!("hookbusd stopped");
                Ok(0)
            }
            Err(e @ RuntimeError::PortUnavailable { .. }) => {
                error!(error = %e, "Bind failed");
                eprintln!("Error: {e}");
                Ok(1)
            }
            Err(e) => Err(e.into()),
        }
    })
}

fn print_status<T: hookbusd::ports::ProcessTable>(manager: &DaemonManager<T>) -> i32 {
    let status = manager.status();
    let pid = status.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
    let port = status.port.map_or_else(|| "-".to_string(), |p| p.to_string());

    match status.state {
        DaemonState::Running => {
            println!("hookbusd is running (PID {pid}, port {port}).");
            if let Some(health) = &status.health {
                println!("  server id:   {}", health.server_id);
                println!("  uptime:      {}s", health.uptime_seconds);
                println!("  connections: {}", health.connections);
                println!("  events:      {}", health.events_received);
            }
            if let Some(conflict) = &status.conflict {
                println!("  warning:     {conflict}");
            }
            0
        }
        DaemonState::Ghost => {
            println!("hookbusd process {pid} is alive but port {port} is not accepting connections.");
            println!("Try `hookbusd restart`.");
            1
        }
        DaemonState::Crashed => {
            println!("hookbusd is not running (stale PID file for {pid}).");
            1
        }
        DaemonState::Stopped => {
            println!("hookbusd is not running.");
            1
        }
    }
}
