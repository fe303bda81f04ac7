//! The narrow pub/sub surface the owning thread drives
//!
//! Implementations are blocking and not safe for concurrent use: every call
//! is made from the single thread that owns the connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// One message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: String,
}

/// A blocking, non-reentrant broker connection with a single channel
pub trait Transport: Send + 'static {
    fn declare_topic_exchange(&mut self, name: &str) -> Result<(), TransportError>;

    /// Declare a server-named queue that is deleted with this connection
    fn declare_exclusive_queue(&mut self) -> Result<String, TransportError>;

    fn bind_queue(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<(), TransportError>;

    /// Start consuming `queue`; deliveries carry the returned consumer tag
    fn basic_consume(&mut self, queue: &str, auto_ack: bool) -> Result<String, TransportError>;

    fn basic_cancel(&mut self, consumer_tag: &str) -> Result<(), TransportError>;

    fn publish(&mut self, exchange: &str, routing_key: &str, body: &str) -> Result<(), TransportError>;

    /// Wait at most `time_limit` for inbound traffic and return whatever arrived
    fn poll_once(&mut self, time_limit: Duration) -> Result<Vec<Delivery>, TransportError>;

    /// Close the connection. Closing twice fails with `ConnectionClosed`.
    fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Opens connections to a broker
pub trait Connector {
    type Transport: Transport;

    fn open_connection(&self) -> Result<Self::Transport, TransportError>;
}
