//! Serialized execution over a blocking, non-reentrant pub/sub client
//!
//! A [`Channel`] wraps a [`Transport`] that must only ever be touched from
//! one thread. [`SerializedExecutor`] moves the channel onto a dedicated
//! owning thread whose loop alternates between running queued
//! [`DeferredTask`]s and dispatching inbound deliveries. Any other thread
//! reaches the connection by submitting a task and blocking on its
//! [`Promise`].
//!
//! Two brokers are bundled: [`MemoryBroker`] for in-process use and
//! [`socket::SocketBroker`] for use across processes.

pub mod channel;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod memory;
pub mod promise;
pub mod queue;
pub mod router;
pub mod socket;
pub mod sync;
pub mod transport;

pub use channel::{Channel, ConsumerCallback, close_connection_suppressed};
pub use error::{ExecError, TransportError};
pub use event_loop::LoopStats;
pub use executor::{ExecutorConfig, ExecutorHandle, SerializedExecutor};
pub use memory::{MemoryBroker, MemoryTransport};
pub use promise::{DeferredTask, Promise};
pub use queue::TaskQueue;
pub use router::{TopicRouter, topic_matches};
pub use socket::{SocketBroker, SocketConnector, SocketTransport};
pub use sync::{Signal, lock};
pub use transport::{Connector, Delivery, Transport};
