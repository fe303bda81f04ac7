//! Gatherer - the coordinator that aggregates readiness and broadcasts go/stop

use std::sync::Mutex;

use serialexec::{Transport, lock};
use tracing::{debug, error, warn};

use super::service::{Agent, AgentContext, AgentService};
use crate::barrier::{Barrier, BarrierConfig, BarrierStats};
use crate::messages::BarrierMessage;

pub struct Gatherer {
    barrier: Mutex<Barrier>,
}

impl Gatherer {
    pub fn new(config: &BarrierConfig) -> Self {
        debug!(?config, "Gatherer::new: called");
        Self {
            barrier: Mutex::new(Barrier::new(config)),
        }
    }

    pub fn stats(&self) -> BarrierStats {
        lock(&self.barrier).stats()
    }
}

impl Agent for Gatherer {
    fn name(&self) -> &str {
        "gatherer"
    }

    fn on_message<T: Transport>(&self, message: BarrierMessage, ctx: &mut AgentContext<'_, T>) {
        let outbound = lock(&self.barrier).handle(&message);
        for reply in outbound {
            if let Err(e) = ctx.publish(&reply) {
                error!(kind = reply.kind(), error = %e, "Gatherer failed to broadcast");
            }
        }
    }

    fn on_unhandled(&self, body: &str) {
        warn!(%body, "Gatherer received an unhandled message");
        lock(&self.barrier).record_unhandled();
    }
}

impl<T: Transport> AgentService<Gatherer, T> {
    pub fn stats(&self) -> BarrierStats {
        self.agent().stats()
    }
}
