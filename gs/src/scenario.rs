//! One complete rendezvous round, every role hosted in this process

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serialexec::{Connector, Transport};
use tracing::{debug, info, warn};

use crate::agents::{AgentService, Gatherer, Monitor, Workload};
use crate::barrier::BarrierStats;
use crate::config::{Config, TimingConfig};
use crate::error::RendezvousError;

/// What happened during a round
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub agents: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// From the workload's readiness to its `go`
    pub go_latency_ms: u64,
    /// How long the workload held its critical section
    pub held_ms: u64,
    /// Monitors that saw `stop`
    pub monitors_stopped: usize,
    pub stats: BarrierStats,
}

impl RoundReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Run a gatherer, one monitor per agent, and a workload over `connector`.
///
/// `agents` replaces the configured whitelist when non-empty. The workload
/// holds its critical section for `hold` between `go` and completion.
pub fn run_round<C, T>(connector: &C, config: &Config, agents: &[String], hold: Duration) -> Result<RoundReport, RendezvousError>
where
    C: Connector<Transport = T>,
    T: Transport,
{
    debug!(?agents, ?hold, "run_round: called");
    let service_config = config.service_config();
    let mut barrier_config = config.gatherer.clone();
    if !agents.is_empty() {
        barrier_config.agents = agents.to_vec();
    }

    let gatherer = AgentService::start(connector, Gatherer::new(&barrier_config), service_config.clone())?;
    let monitors = barrier_config
        .agents
        .iter()
        .map(|name| AgentService::start(connector, Monitor::new(name.as_str()), service_config.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    let workload = AgentService::start(connector, Workload::manual(), service_config)?;

    let started_at = Utc::now();
    let outcome = drive(&workload, &monitors, &config.timing, hold);
    let stats = gatherer.stats();

    let stop_timeout = config.timing.stop_timeout();
    if let Err(e) = workload.stop(stop_timeout) {
        warn!(error = %e, "Workload did not stop cleanly");
    }
    for monitor in &monitors {
        if let Err(e) = monitor.stop(stop_timeout) {
            warn!(identity = monitor.agent().identity(), error = %e, "Monitor did not stop cleanly");
        }
    }
    if let Err(e) = gatherer.stop(stop_timeout) {
        warn!(error = %e, "Gatherer did not stop cleanly");
    }

    let (go_latency, monitors_stopped) = outcome?;
    let report = RoundReport {
        agents: barrier_config.agents,
        started_at,
        completed_at: Utc::now(),
        go_latency_ms: go_latency.as_millis() as u64,
        held_ms: hold.as_millis() as u64,
        monitors_stopped,
        stats,
    };
    info!(go_latency_ms = report.go_latency_ms, round = report.stats.round, "Round complete");
    Ok(report)
}

fn drive<T: Transport>(
    workload: &AgentService<Workload, T>,
    monitors: &[AgentService<Monitor, T>],
    timing: &TimingConfig,
    hold: Duration,
) -> Result<(Duration, usize), RendezvousError> {
    let announced = Instant::now();
    workload.announce_ready()?;
    for monitor in monitors {
        monitor.announce_ready_when_local_condition_met()?;
    }

    workload.wait_for_go(timing.go_timeout())?;
    let go_latency = announced.elapsed();
    for monitor in monitors {
        monitor.wait_for_go(timing.go_timeout())?;
    }

    debug!(?hold, "drive: holding critical section");
    thread::sleep(hold);

    workload.announce_completed()?;
    workload.wait_for_stop(timing.completion_timeout())?;
    for monitor in monitors {
        monitor.wait_for_completion(timing.completion_timeout())?;
    }
    let stopped = monitors.iter().filter(|m| m.agent().received_stop()).count();
    Ok((go_latency, stopped))
}
