//! The owning thread's consume loop

use std::time::Duration;

use tracing::{debug, info};

use crate::channel::Channel;
use crate::error::ExecError;
use crate::queue::TaskQueue;
use crate::transport::Transport;

/// Counters reported when a consume loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub tasks_run: u64,
    pub deliveries: u64,
}

impl<T: Transport> Channel<T> {
    /// Interleave queued tasks with inbound dispatch until no consumers
    /// remain or the connection closes.
    ///
    /// Every task queued before a drain runs before the next poll. Fails
    /// with `Reentrancy` when called from inside a consumer callback.
    pub fn start_consuming(&mut self, queue: &TaskQueue<T>, poll_interval: Duration) -> Result<LoopStats, ExecError> {
        if self.is_dispatching() {
            return Err(ExecError::Reentrancy("start_consuming"));
        }
        debug!(consumers = self.consumer_count(), ?poll_interval, "Channel::start_consuming: called");
        queue.claim_owner();

        let mut stats = LoopStats::default();
        while self.is_live() {
            stats.tasks_run += queue.drain_and_run(self) as u64;
            if !self.is_live() {
                break;
            }
            match self.process_events(poll_interval) {
                Ok(count) => stats.deliveries += count as u64,
                Err(ExecError::Transport(e)) if e.is_connection_closed() => {
                    debug!("Channel::start_consuming: connection closed during poll");
                    break;
                }
                Err(e) => return Err(e),
            }
            stats.iterations += 1;
        }

        info!(
            iterations = stats.iterations,
            tasks_run = stats.tasks_run,
            deliveries = stats.deliveries,
            "Consume loop finished"
        );
        Ok(stats)
    }

    fn is_live(&self) -> bool {
        self.is_open() && self.has_consumers()
    }
}
