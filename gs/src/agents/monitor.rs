//! Monitor - a participant in the rendezvous
//!
//! A monitor reports ready once, and only when both its own local condition
//! holds and it has seen the workload's readiness. Whichever of the two
//! arrives last triggers the report.

use std::sync::Mutex;
use std::time::Duration;

use serialexec::{Signal, Transport, lock};
use tracing::{debug, error, info};

use super::service::{Agent, AgentContext, AgentService};
use crate::error::RendezvousError;
use crate::messages::{BarrierMessage, ReplayPhase};

type Readiness = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Default)]
struct MonitorState {
    local_ready: bool,
    producer_seen: bool,
    sent_ready: bool,
}

impl MonitorState {
    /// Claim the single report if both conditions now hold
    fn claim_report(&mut self) -> bool {
        if self.local_ready && self.producer_seen && !self.sent_ready {
            self.sent_ready = true;
            true
        } else {
            false
        }
    }
}

pub struct Monitor {
    identity: String,
    local_readiness: Readiness,
    state: Mutex<MonitorState>,
    received_go: Signal,
    received_stop: Signal,
}

impl Monitor {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            local_readiness: Box::new(|| true),
            state: Mutex::new(MonitorState::default()),
            received_go: Signal::new(),
            received_stop: Signal::new(),
        }
    }

    /// Gate the report on a local check, evaluated each time readiness is announced
    pub fn with_local_readiness<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.local_readiness = Box::new(check);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn has_reported(&self) -> bool {
        lock(&self.state).sent_ready
    }

    pub fn received_go(&self) -> bool {
        self.received_go.is_set()
    }

    pub fn received_stop(&self) -> bool {
        self.received_stop.is_set()
    }

    fn participant_ready(&self) -> BarrierMessage {
        BarrierMessage::ParticipantReady {
            id: self.identity.clone(),
        }
    }

    fn observe_producer<T: Transport>(&self, ctx: &mut AgentContext<'_, T>) {
        let report = {
            let mut state = lock(&self.state);
            state.producer_seen = true;
            state.claim_report()
        };
        if report {
            info!(identity = %self.identity, "Workload is ready, reporting ready");
            if let Err(e) = ctx.publish(&self.participant_ready()) {
                error!(identity = %self.identity, error = %e, "Failed to report ready");
            }
        }
    }

    fn observe_go(&self) {
        info!(identity = %self.identity, "Monitor was given the go signal");
        self.received_go.set();
    }
}

impl Agent for Monitor {
    fn name(&self) -> &str {
        &self.identity
    }

    fn on_start<T: Transport>(&self, ctx: &mut AgentContext<'_, T>) -> Result<(), RendezvousError> {
        ctx.publish(&BarrierMessage::Identify {
            id: self.identity.clone(),
        })
    }

    fn on_message<T: Transport>(&self, message: BarrierMessage, ctx: &mut AgentContext<'_, T>) {
        match message {
            BarrierMessage::Ready => self.observe_producer(ctx),
            BarrierMessage::Go => self.observe_go(),
            BarrierMessage::Stop => {
                info!(identity = %self.identity, "Monitor was told to stop");
                self.received_stop.set();
                ctx.stop_consuming();
            }
            BarrierMessage::Replay { id, phase } if id == self.identity => match phase {
                ReplayPhase::Ready => self.observe_producer(ctx),
                ReplayPhase::Go => self.observe_go(),
            },
            other => debug!(identity = %self.identity, kind = other.kind(), "Monitor: ignoring"),
        }
    }
}

impl<T: Transport> AgentService<Monitor, T> {
    /// Record that the local condition holds and report ready if the workload
    /// is already known to be ready. Returns whether the local condition held.
    ///
    /// Only the first successful report is sent; later calls are no-ops.
    pub fn announce_ready_when_local_condition_met(&self) -> Result<bool, RendezvousError> {
        let monitor = self.agent();
        if !(monitor.local_readiness)() {
            debug!(identity = %monitor.identity, "Monitor: local condition not met");
            return Ok(false);
        }
        let report = {
            let mut state = lock(&monitor.state);
            state.local_ready = true;
            state.claim_report()
        };
        if report {
            info!(identity = %monitor.identity, "Local condition met, reporting ready");
            self.publish(monitor.participant_ready())?;
        }
        Ok(true)
    }

    pub fn wait_for_go(&self, timeout: Duration) -> Result<(), RendezvousError> {
        debug!(identity = %self.agent().identity, ?timeout, "Monitor::wait_for_go: called");
        if self.agent().received_go.wait(timeout) {
            Ok(())
        } else {
            Err(RendezvousError::aborted("go", timeout))
        }
    }

    pub fn wait_for_completion(&self, timeout: Duration) -> Result<(), RendezvousError> {
        debug!(identity = %self.agent().identity, ?timeout, "Monitor::wait_for_completion: called");
        if self.agent().received_stop.wait(timeout) {
            Ok(())
        } else {
            Err(RendezvousError::aborted("stop", timeout))
        }
    }
}
