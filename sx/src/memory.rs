//! In-process topic broker
//!
//! Connections share one routing table. Each connection has an inbox that
//! `poll_once` blocks on, so an idle owning thread sleeps instead of spinning.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::TransportError;
use crate::router::{ConnectionId, Routed, TopicRouter};
use crate::sync::lock;
use crate::transport::{Connector, Delivery, Transport};

#[derive(Default)]
struct Inbox {
    deliveries: Mutex<VecDeque<Delivery>>,
    arrived: Condvar,
}

impl Inbox {
    fn push(&self, batch: impl IntoIterator<Item = Delivery>) {
        let mut deliveries = lock(&self.deliveries);
        deliveries.extend(batch);
        self.arrived.notify_all();
    }
}

#[derive(Default)]
struct BrokerState {
    router: TopicRouter,
    inboxes: HashMap<ConnectionId, Arc<Inbox>>,
    next_connection: ConnectionId,
}

impl BrokerState {
    fn deliver(&self, routed: Vec<Routed>) {
        for Routed { owner, delivery } in routed {
            if let Some(inbox) = self.inboxes.get(&owner) {
                inbox.push([delivery]);
            }
        }
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryTransport {
        let inbox = Arc::new(Inbox::default());
        let id = {
            let mut state = lock(&self.state);
            state.next_connection += 1;
            let id = state.next_connection;
            state.inboxes.insert(id, Arc::clone(&inbox));
            id
        };
        debug!(connection = id, "MemoryBroker::connect: opened");
        MemoryTransport {
            broker: self.clone(),
            id,
            inbox,
            open: true,
        }
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).inboxes.len()
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.state).router.queue_count()
    }
}

impl Connector for MemoryBroker {
    type Transport = MemoryTransport;

    fn open_connection(&self) -> Result<MemoryTransport, TransportError> {
        Ok(self.connect())
    }
}

/// One connection to a [`MemoryBroker`].
///
/// Deliveries count as acknowledged on receipt. Dropping the transport
/// closes it and deletes its exclusive queues.
pub struct MemoryTransport {
    broker: MemoryBroker,
    id: ConnectionId,
    inbox: Arc<Inbox>,
    open: bool,
}

impl MemoryTransport {
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }
}

impl Transport for MemoryTransport {
    fn declare_topic_exchange(&mut self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state).router.declare_exchange(name);
        Ok(())
    }

    fn declare_exclusive_queue(&mut self) -> Result<String, TransportError> {
        self.ensure_open()?;
        Ok(lock(&self.broker.state).router.declare_queue(self.id))
    }

    fn bind_queue(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state).router.bind(exchange, queue, pattern)
    }

    fn basic_consume(&mut self, queue: &str, _auto_ack: bool) -> Result<String, TransportError> {
        self.ensure_open()?;
        let (tag, backlog) = lock(&self.broker.state).router.consume(self.id, queue)?;
        if !backlog.is_empty() {
            self.inbox.push(backlog);
        }
        Ok(tag)
    }

    fn basic_cancel(&mut self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state).router.cancel(self.id, consumer_tag)
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, body: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);
        let routed = state.router.route(exchange, routing_key, body)?;
        state.deliver(routed);
        Ok(())
    }

    fn poll_once(&mut self, time_limit: Duration) -> Result<Vec<Delivery>, TransportError> {
        self.ensure_open()?;
        let guard = lock(&self.inbox.deliveries);
        let (mut deliveries, _) = self
            .inbox
            .arrived
            .wait_timeout_while(guard, time_limit, |pending| pending.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        Ok(deliveries.drain(..).collect())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.open = false;
        let mut state = lock(&self.broker.state);
        state.router.drop_connection(self.id);
        state.inboxes.remove(&self.id);
        debug!(connection = self.id, "MemoryTransport::close: closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if self.open {
            let _ = self.close();
        }
    }
}
