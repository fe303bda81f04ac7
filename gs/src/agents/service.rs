//! AgentService - hosts one agent on its own owning thread
//!
//! Setup (exchange, exclusive queue, `*` binding, consumer) runs on the
//! caller's thread before the owning thread exists. From then on the
//! connection is reached only through submitted tasks, and the agent's
//! callbacks run on the owning thread.

use std::sync::Arc;
use std::time::Duration;

use serialexec::{Channel, Connector, ExecError, ExecutorConfig, SerializedExecutor, Transport};
use tracing::{debug, info, warn};

use crate::error::RendezvousError;
use crate::messages::{BIND_ALL, BarrierMessage, DEFAULT_EXCHANGE};

/// Settings shared by every agent role
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub exchange: String,
    pub poll_interval: Duration,
    /// How long a publish from a foreign thread waits for the owning thread
    pub submit_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        debug!("ServiceConfig::default: called");
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            poll_interval: Duration::from_millis(10),
            submit_timeout: Duration::from_secs(3),
        }
    }
}

/// One role in the rendezvous.
///
/// Callbacks run on the owning thread, except `on_start`, which runs on the
/// thread calling [`AgentService::start`] once the consumer is registered.
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn on_start<T: Transport>(&self, _ctx: &mut AgentContext<'_, T>) -> Result<(), RendezvousError> {
        Ok(())
    }

    fn on_message<T: Transport>(&self, message: BarrierMessage, ctx: &mut AgentContext<'_, T>);

    /// Called with bodies that are not barrier messages
    fn on_unhandled(&self, body: &str) {
        warn!(agent = self.name(), %body, "Unhandled message");
    }

    /// Called on the owning thread after the consume loop has ended
    fn on_stop(&self) {}
}

/// What an agent callback may do with the connection
pub struct AgentContext<'a, T: Transport> {
    channel: &'a mut Channel<T>,
    exchange: &'a str,
}

impl<'a, T: Transport> AgentContext<'a, T> {
    pub fn new(channel: &'a mut Channel<T>, exchange: &'a str) -> Self {
        Self { channel, exchange }
    }

    pub fn publish(&mut self, message: &BarrierMessage) -> Result<(), RendezvousError> {
        let body = message.encode()?;
        self.channel.publish(self.exchange, message.routing_key(), &body)?;
        Ok(())
    }

    /// End the consume loop once the current callback returns
    pub fn stop_consuming(&mut self) {
        self.channel.stop_consuming();
    }
}

/// A running agent: its role state plus the executor that owns its connection
pub struct AgentService<A: Agent, T: Transport> {
    agent: Arc<A>,
    executor: SerializedExecutor<T>,
    config: ServiceConfig,
}

impl<A: Agent, T: Transport> AgentService<A, T> {
    pub fn start<C>(connector: &C, agent: A, config: ServiceConfig) -> Result<Self, RendezvousError>
    where
        C: Connector<Transport = T>,
    {
        debug!(agent = agent.name(), exchange = %config.exchange, "AgentService::start: called");
        let agent = Arc::new(agent);

        let mut channel = Channel::new(connector.open_connection()?);
        channel.declare_topic_exchange(&config.exchange)?;
        let queue = channel.declare_exclusive_queue()?;
        channel.bind_queue(&config.exchange, &queue, BIND_ALL)?;

        let handler = Arc::clone(&agent);
        let exchange = config.exchange.clone();
        channel.consume(&queue, true, move |channel, delivery| {
            match BarrierMessage::decode(&delivery.body) {
                Ok(message) => {
                    debug!(agent = handler.name(), kind = message.kind(), "AgentService: inbound message");
                    let mut ctx = AgentContext::new(channel, &exchange);
                    handler.on_message(message, &mut ctx);
                }
                Err(_) => handler.on_unhandled(&delivery.body),
            }
        })?;

        agent.on_start(&mut AgentContext::new(&mut channel, &config.exchange))?;

        let executor_config = ExecutorConfig {
            name: format!("gs-{}", agent.name()),
            poll_interval: config.poll_interval,
        };
        let finisher = Arc::clone(&agent);
        let executor = SerializedExecutor::start(channel, executor_config, move || finisher.on_stop())?;

        info!(agent = agent.name(), %queue, "Agent started");
        Ok(Self {
            agent,
            executor,
            config,
        })
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Publish from any thread through the owning thread
    pub fn publish(&self, message: BarrierMessage) -> Result<(), RendezvousError> {
        debug!(agent = self.agent.name(), kind = message.kind(), "AgentService::publish: called");
        let body = message.encode()?;
        let exchange = self.config.exchange.clone();
        let routing_key = message.routing_key();
        self.executor.submit(
            move |channel| Ok(channel.publish(&exchange, routing_key, &body)?),
            self.config.submit_timeout,
        )?;
        Ok(())
    }

    /// Run arbitrary work against the connection on the owning thread
    pub fn submit<R, F>(&self, action: F, timeout: Duration) -> Result<R, ExecError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Channel<T>) -> Result<R, ExecError> + Send + 'static,
    {
        self.executor.submit(action, timeout)
    }

    pub fn is_running(&self) -> bool {
        self.executor.is_running()
    }

    /// Block until the consume loop has ended on its own, or `timeout` elapses
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.executor.wait_finished(timeout)
    }

    /// Close the connection and join the owning thread
    pub fn stop(&self, timeout: Duration) -> Result<(), RendezvousError> {
        debug!(agent = self.agent.name(), ?timeout, "AgentService::stop: called");
        self.executor.stop(timeout)?;
        Ok(())
    }
}
