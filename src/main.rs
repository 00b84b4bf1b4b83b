// resmon-agent - version 0.1.0
// Per-worker resource telemetry agent with tracing logging
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use resmon_agent::config::{load_config, validate_effective_config, DEFAULT_BIND_ADDR};
use resmon_agent::resolver::process_exists;
use resmon_agent::{Agent, Config, JsonLinesChannel};
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};
use tokio::{
    net::TcpListener,
    signal,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};

mod cli;
mod commands;
mod handlers;
mod metrics;
mod state;

use cli::{Args, Commands, ConfigFormat};
use commands::{command_check, command_config, command_sample};
use handlers::{doc_handler, health_handler, metrics_handler, snapshot_handler};
use state::AppState;

/// How often the launcher process is checked when exiting with the workload.
const WORKLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// -------------------------------------------------------------------
/// CONFIGURATION MANAGEMENT
/// -------------------------------------------------------------------

/// Resolves configuration from CLI args, config file, and defaults.
/// Precedence: CLI (if provided) > config file > default.
fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(identity) = &args.identity {
        config.identity = Some(identity.clone());
    }
    if let Some(gpus) = &args.gpus {
        config.gpus = Some(gpus.clone());
    }
    if args.launcher_pid.is_some() {
        config.launcher_pid = args.launcher_pid;
    }
    if args.pid.is_some() {
        config.pid = args.pid;
    }
    if let Some(output) = &args.output {
        config.output = Some(output.clone());
    }
    if let Some(proc_root) = &args.proc_root {
        config.proc_root = Some(proc_root.clone());
    }

    // Timing
    if args.sample_interval_ms.is_some() {
        config.sample_interval_ms = args.sample_interval_ms;
    }
    if args.report_interval_ms.is_some() {
        config.report_interval_ms = args.report_interval_ms;
    }

    // Status server
    if let Some(port) = args.status_port {
        config.status_port = Some(port);
    }
    if let Some(bind_ip) = args.bind {
        config.status_bind = Some(bind_ip.to_string());
    }

    // Feature flags
    if args.no_gpu_restart {
        config.gpu_restart = Some(false);
    }
    if args.keep_running {
        config.exit_with_workload = Some(false);
    }
    if let Some(level) = &args.log_level {
        config.log_level = Some(level.as_str().to_string());
    }

    Ok(config)
}

/// Shows configuration in requested format
fn show_config(config: &Config, format: ConfigFormat) -> Result<()> {
    let output = commands::config::render_config(config, format, false)?;
    println!("{output}");
    Ok(())
}

/// Initializes tracing logging subsystem with configured log level.
/// Logs go to stderr; stdout carries the JSON-lines reports.
fn setup_logging(config: &Config) -> Result<()> {
    let level = config.log_level.as_deref().unwrap_or("info");
    let filter = level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Unknown log level '{}', using info", level);
        LevelFilter::INFO
    });

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Logging initialized with level: {}", filter);
    Ok(())
}

/// -------------------------------------------------------------------
/// SHUTDOWN TRIGGERS
/// -------------------------------------------------------------------

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Resolves once `pid` disappears from `proc_root`, or never when `pid` is
/// `None`.
async fn workload_exit(proc_root: PathBuf, pid: Option<u32>) {
    let Some(pid) = pid else {
        return std::future::pending::<()>().await;
    };

    let mut tick = interval(WORKLOAD_POLL_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Watching pid {} for workload exit", pid);

    loop {
        tick.tick().await;
        if !process_exists(&proc_root, pid) {
            info!("Process {} exited, shutting down", pid);
            return;
        }
    }
}

/// -------------------------------------------------------------------
/// STATUS SERVER
/// -------------------------------------------------------------------

/// Binds the status server and serves it until `cancel` fires.
async fn spawn_status_server(
    state: Arc<AppState>,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("Invalid status address {}:{}", bind, port))?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/doc", get(doc_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status server to {}", addr))?;
    info!("Status server listening on http://{}", addr);

    Ok(tokio::spawn(async move {
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = server.await {
            error!("Status server error: {}", e);
        }
    }))
}

/// -------------------------------------------------------------------
/// AGENT MODE
/// -------------------------------------------------------------------

async fn run_agent(config: Config) -> Result<()> {
    let identity = config.identity.clone().unwrap_or_default();
    let launcher_token = config
        .launcher_pid
        .map(|pid| pid.to_string())
        .unwrap_or_default();

    let channel = JsonLinesChannel::for_output(config.output())
        .with_context(|| format!("Failed to open report output '{}'", config.output()))?;

    let agent = Agent::new(
        Arc::new(channel),
        &config,
        identity.clone(),
        config.gpus(),
        &launcher_token,
    )?;
    let gpu_enabled = agent.gpu_enabled();
    let handle = agent.start();

    let server_task = match config.status_port {
        Some(port) => {
            let state = Arc::new(AppState::new(
                handle.metrics(),
                handle.health(),
                Arc::new(config.clone()),
                identity,
                gpu_enabled,
            )?);
            let bind = config.status_bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
            match spawn_status_server(state, bind, port, handle.cancellation_token()).await {
                Ok(task) => Some(task),
                Err(e) => {
                    handle.shutdown(config.shutdown_timeout()).await;
                    return Err(e);
                }
            }
        }
        None => {
            debug!("No status port configured; status server disabled");
            None
        }
    };

    let watched = if config.exit_with_workload.unwrap_or(true) {
        config.launcher_pid.or(config.pid)
    } else {
        None
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = workload_exit(config.proc_root(), watched) => {}
    }

    handle.shutdown(config.shutdown_timeout()).await;

    if let Some(task) = server_task {
        if tokio::time::timeout(config.shutdown_timeout(), task).await.is_err() {
            warn!("Status server did not stop in time");
        }
    }

    info!("resmon-agent stopped gracefully");
    Ok(())
}

/// -------------------------------------------------------------------
/// MAIN APPLICATION ENTRY POINT
/// -------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config, false) {
                eprintln!("Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format.clone());
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        let config = resolve_config(&args)?;
        if let Err(e) = validate_effective_config(&config, false) {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
        setup_logging(&config)?;

        return match command {
            Commands::Check { proc, gpu } => command_check(*proc, *gpu, &config).await,
            Commands::Config {
                output,
                format,
                commented,
            } => command_config(output.clone(), format.clone(), *commented),
            Commands::Sample { pid, iterations } => {
                command_sample(*pid, *iterations, &config).await
            }
        };
    }

    // Load configuration for agent mode
    let config = resolve_config(&args)?;

    // Validate config before starting the agent
    if let Err(e) = validate_effective_config(&config, true) {
        eprintln!("Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config)?;

    info!(
        "Starting resmon-agent {} for '{}'",
        env!("CARGO_PKG_VERSION"),
        config.identity.as_deref().unwrap_or("")
    );

    run_agent(config).await
}
