//! Workload - the producer side of the rendezvous

use std::time::Duration;

use serialexec::{Signal, Transport};
use tracing::{debug, info};

use super::service::{Agent, AgentContext, AgentService};
use crate::error::RendezvousError;
use crate::messages::BarrierMessage;

/// Producer role: announces readiness, waits for `go`, announces completion
#[derive(Debug)]
pub struct Workload {
    announce_on_start: bool,
    received_go: Signal,
    round_closed: Signal,
}

impl Default for Workload {
    fn default() -> Self {
        Self::new()
    }
}

impl Workload {
    /// A workload that announces readiness as soon as it starts
    pub fn new() -> Self {
        Self {
            announce_on_start: true,
            received_go: Signal::new(),
            round_closed: Signal::new(),
        }
    }

    /// A workload that waits for an explicit `announce_ready`
    pub fn manual() -> Self {
        Self {
            announce_on_start: false,
            received_go: Signal::new(),
            round_closed: Signal::new(),
        }
    }

    pub fn received_go(&self) -> bool {
        self.received_go.is_set()
    }
}

impl Agent for Workload {
    fn name(&self) -> &str {
        "workload"
    }

    fn on_start<T: Transport>(&self, ctx: &mut AgentContext<'_, T>) -> Result<(), RendezvousError> {
        if self.announce_on_start {
            debug!("Workload::on_start: announcing readiness");
            ctx.publish(&BarrierMessage::ProducerReady)?;
        }
        Ok(())
    }

    fn on_message<T: Transport>(&self, message: BarrierMessage, _ctx: &mut AgentContext<'_, T>) {
        match message {
            BarrierMessage::Go => {
                info!("Workload was given the go signal");
                self.received_go.set();
            }
            // the gatherer's stop confirms it saw our completion
            BarrierMessage::Stop => self.round_closed.set(),
            _ => {}
        }
    }
}

impl<T: Transport> AgentService<Workload, T> {
    /// Announce readiness for a new round
    pub fn announce_ready(&self) -> Result<(), RendezvousError> {
        self.agent().received_go.reset();
        self.agent().round_closed.reset();
        self.publish(BarrierMessage::ProducerReady)
    }

    /// Block until `go` arrives. A timeout is final: the round is treated as aborted.
    pub fn wait_for_go(&self, timeout: Duration) -> Result<(), RendezvousError> {
        debug!(?timeout, "Workload::wait_for_go: called");
        if self.agent().received_go.wait(timeout) {
            Ok(())
        } else {
            Err(RendezvousError::aborted("go", timeout))
        }
    }

    pub fn announce_completed(&self) -> Result<(), RendezvousError> {
        debug!("Workload::announce_completed: called");
        self.publish(BarrierMessage::ProducerCompleted)
    }

    /// Block until the gatherer has broadcast `stop` for this round
    pub fn wait_for_stop(&self, timeout: Duration) -> Result<(), RendezvousError> {
        debug!(?timeout, "Workload::wait_for_stop: called");
        if self.agent().round_closed.wait(timeout) {
            Ok(())
        } else {
            Err(RendezvousError::aborted("stop", timeout))
        }
    }
}
