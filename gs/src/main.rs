//! GatherScatter - rendezvous barrier CLI
//!
//! Each role runs as its own process against the broker socket; `demo`
//! runs a whole round in-process.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use gatherscatter::cli::{Cli, Command, default_monitor_name};
use gatherscatter::config::Config;
use gatherscatter::{AgentService, Gatherer, Monitor, RendezvousError, RoundReport, Workload, run_round};
use serialexec::{MemoryBroker, SocketBroker, SocketConnector};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatherscatter")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("gs.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_thread_names(true)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

// Not #[tokio::main]: the socket client drives its own runtime and must not
// be created from inside another one.
fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let socket_path = cli.socket.clone().unwrap_or_else(|| config.broker.socket_path());
    info!(?socket_path, exchange = %config.broker.exchange, "GatherScatter loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Broker => cmd_broker(socket_path),
        Command::Gatherer { agents, count } => cmd_gatherer(&config, socket_path, agents, count),
        Command::Monitor { name } => cmd_monitor(&config, socket_path, name.unwrap_or_else(default_monitor_name)),
        Command::Workload { hold_ms } => cmd_workload(&config, socket_path, Duration::from_millis(hold_ms)),
        Command::Demo { agents, hold_ms, json } => cmd_demo(&config, &agents, Duration::from_millis(hold_ms), json),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")
}

/// Block until Ctrl-C (true) or until `is_running` turns false (false)
fn wait_for_interrupt(is_running: impl Fn() -> bool) -> Result<bool> {
    runtime()?.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    return result.map(|()| true).context("Failed to listen for Ctrl-C");
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    if !is_running() {
                        return Ok(false);
                    }
                }
            }
        }
    })
}

fn connector(config: &Config, socket_path: PathBuf) -> Result<SocketConnector> {
    let connector = SocketConnector::new(socket_path).with_timeout(config.timing.submit_timeout());
    if !connector.socket_exists() {
        eyre::bail!("Broker socket not found; start one with `gs broker`");
    }
    Ok(connector)
}

fn cmd_broker(socket_path: PathBuf) -> Result<()> {
    debug!(?socket_path, "cmd_broker: called");
    println!("{} {}", "Broker listening on".bright_cyan().bold(), socket_path.display());
    let broker = SocketBroker::new(socket_path);
    runtime()?.block_on(broker.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
        }
    }))?;
    println!("Broker stopped");
    Ok(())
}

fn cmd_gatherer(config: &Config, socket_path: PathBuf, agents: Vec<String>, count: Option<usize>) -> Result<()> {
    debug!(?agents, ?count, "cmd_gatherer: called");
    let mut barrier_config = config.gatherer.clone();
    if !agents.is_empty() {
        barrier_config.agents = agents;
    }
    if count.is_some() {
        barrier_config.required_count = count;
    }

    let connector = connector(config, socket_path)?;
    let gatherer = AgentService::start(&connector, Gatherer::new(&barrier_config), config.service_config())?;
    println!(
        "{} waiting on {:?} (Ctrl-C to quit)",
        "Gatherer running,".bright_cyan().bold(),
        barrier_config.readiness()
    );

    if !wait_for_interrupt(|| gatherer.is_running())? {
        warn!("Gatherer loop ended on its own");
        eprintln!("{} connection to broker lost", "Error:".red());
    }
    let stats = gatherer.stats();
    gatherer.stop(config.timing.stop_timeout())?;
    println!(
        "Rounds: {}  go: {}  stop: {}  duplicates: {}  late: {}",
        stats.round, stats.go_emitted, stats.stop_emitted, stats.duplicate_reports, stats.late_joiners
    );
    Ok(())
}

fn cmd_monitor(config: &Config, socket_path: PathBuf, name: String) -> Result<()> {
    debug!(%name, "cmd_monitor: called");
    let connector = connector(config, socket_path)?;
    let monitor = AgentService::start(&connector, Monitor::new(name.as_str()), config.service_config())?;
    println!("{} {}", "Monitor".bright_cyan().bold(), name);

    let outcome = (|| {
        monitor.announce_ready_when_local_condition_met()?;
        monitor.wait_for_go(config.timing.go_timeout())?;
        println!("{} {}", "go".green().bold(), name);
        monitor.wait_for_completion(config.timing.completion_timeout())?;
        println!("{} {}", "stop".yellow().bold(), name);
        Ok::<_, RendezvousError>(())
    })();

    monitor.stop(config.timing.stop_timeout())?;
    outcome?;
    Ok(())
}

fn cmd_workload(config: &Config, socket_path: PathBuf, hold: Duration) -> Result<()> {
    debug!(?hold, "cmd_workload: called");
    let connector = connector(config, socket_path)?;
    let workload = AgentService::start(&connector, Workload::manual(), config.service_config())?;

    let outcome = (|| {
        workload.announce_ready()?;
        println!("{}", "Workload ready, waiting for go".bright_cyan().bold());
        workload.wait_for_go(config.timing.go_timeout())?;
        println!("{} holding for {:?}", "go".green().bold(), hold);
        thread::sleep(hold);
        workload.announce_completed()?;
        workload.wait_for_stop(config.timing.completion_timeout())?;
        println!("{}", "Workload completed".yellow().bold());
        Ok::<_, RendezvousError>(())
    })();

    workload.stop(config.timing.stop_timeout())?;
    outcome?;
    Ok(())
}

fn cmd_demo(config: &Config, agents: &[String], hold: Duration, json: bool) -> Result<()> {
    debug!(?agents, ?hold, json, "cmd_demo: called");
    let broker = MemoryBroker::new();
    let report = run_round(&broker, config, agents, hold)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RoundReport) {
    println!("{}", "Round complete".bright_cyan().bold());
    if report.agents.is_empty() {
        println!("  agents:    (none, unconditional)");
    } else {
        println!("  agents:    {}", report.agents.join(", "));
    }
    println!("  started:   {}", report.started_at.format("%Y-%m-%d %H:%M:%S%.3f"));
    println!("  go after:  {} ms", report.go_latency_ms);
    println!("  held:      {} ms", report.held_ms);
    println!("  elapsed:   {} ms", report.elapsed().num_milliseconds());
    println!(
        "  {} go, {} stop, {} of {} monitors stopped",
        report.stats.go_emitted.to_string().green(),
        report.stats.stop_emitted.to_string().yellow(),
        report.monitors_stopped,
        report.agents.len()
    );
}
