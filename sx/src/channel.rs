//! Channel: a transport plus the consumer callbacks registered on it

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{ExecError, TransportError};
use crate::promise::panic_message;
use crate::transport::{Delivery, Transport};

/// Callback invoked on the owning thread for each delivery
pub type ConsumerCallback<T> = Box<dyn FnMut(&mut Channel<T>, Delivery) + Send>;

/// Owns a transport and dispatches its deliveries to consumer callbacks.
///
/// Before the event loop starts the caller uses a channel directly for setup;
/// afterwards it belongs to the owning thread and is reached only through
/// submitted tasks.
pub struct Channel<T: Transport> {
    transport: T,
    // a slot is empty while its callback is running
    consumers: BTreeMap<String, Option<ConsumerCallback<T>>>,
    dispatching: bool,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T) -> Self {
        debug!("Channel::new: called");
        Self {
            transport,
            consumers: BTreeMap::new(),
            dispatching: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// True while an inbound callback is running on this channel
    pub fn is_dispatching(&self) -> bool {
        self.dispatching
    }

    pub fn declare_topic_exchange(&mut self, name: &str) -> Result<(), TransportError> {
        debug!(%name, "Channel::declare_topic_exchange: called");
        self.transport.declare_topic_exchange(name)
    }

    pub fn declare_exclusive_queue(&mut self) -> Result<String, TransportError> {
        let queue = self.transport.declare_exclusive_queue()?;
        debug!(%queue, "Channel::declare_exclusive_queue: declared");
        Ok(queue)
    }

    pub fn bind_queue(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<(), TransportError> {
        debug!(%exchange, %queue, %pattern, "Channel::bind_queue: called");
        self.transport.bind_queue(exchange, queue, pattern)
    }

    pub fn publish(&mut self, exchange: &str, routing_key: &str, body: &str) -> Result<(), TransportError> {
        debug!(%exchange, %routing_key, "Channel::publish: called");
        self.transport.publish(exchange, routing_key, body)
    }

    /// Register `on_message` for deliveries from `queue`. Returns the consumer tag.
    pub fn consume<F>(&mut self, queue: &str, auto_ack: bool, on_message: F) -> Result<String, TransportError>
    where
        F: FnMut(&mut Channel<T>, Delivery) + Send + 'static,
    {
        let tag = self.transport.basic_consume(queue, auto_ack)?;
        debug!(%queue, %tag, "Channel::consume: registered consumer");
        self.consumers.insert(tag.clone(), Some(Box::new(on_message)));
        Ok(tag)
    }

    pub fn cancel(&mut self, consumer_tag: &str) -> Result<(), TransportError> {
        if self.consumers.remove(consumer_tag).is_none() {
            return Err(TransportError::UnknownConsumer {
                tag: consumer_tag.to_string(),
            });
        }
        match self.transport.basic_cancel(consumer_tag) {
            Err(e) if e.is_connection_closed() => Ok(()),
            other => other,
        }
    }

    /// Cancel every consumer. The event loop exits once none remain.
    pub fn stop_consuming(&mut self) {
        debug!(consumers = self.consumers.len(), "Channel::stop_consuming: called");
        let tags: Vec<String> = self.consumers.keys().cloned().collect();
        self.consumers.clear();
        for tag in tags {
            if let Err(e) = self.transport.basic_cancel(&tag)
                && !e.is_connection_closed()
            {
                warn!(%tag, error = %e, "Failed to cancel consumer");
            }
        }
    }

    /// Close the transport and drop all consumers
    pub fn close(&mut self) -> Result<(), TransportError> {
        debug!("Channel::close: called");
        self.consumers.clear();
        self.transport.close()
    }

    /// Close, treating an already-closed connection as success
    pub fn close_suppressed(&mut self) -> Result<(), TransportError> {
        close_connection_suppressed(self)
    }

    /// Poll the transport once and dispatch what arrived.
    ///
    /// Fails with `Reentrancy` when called from inside a consumer callback.
    pub fn process_events(&mut self, time_limit: Duration) -> Result<usize, ExecError> {
        if self.dispatching {
            return Err(ExecError::Reentrancy("process_events"));
        }
        if !self.transport.is_open() {
            return Ok(0);
        }
        let deliveries = self.transport.poll_once(time_limit)?;
        Ok(self.dispatch(deliveries))
    }

    fn dispatch(&mut self, deliveries: Vec<Delivery>) -> usize {
        let mut dispatched = 0;
        self.dispatching = true;
        for delivery in deliveries {
            let tag = delivery.consumer_tag.clone();
            let Some(mut callback) = self.consumers.get_mut(&tag).and_then(Option::take) else {
                debug!(%tag, "Channel::dispatch: no consumer for delivery, dropping");
                continue;
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self, delivery))) {
                error!(%tag, reason = %panic_message(payload.as_ref()), "Consumer callback panicked");
            }
            // the callback may have cancelled itself
            if let Some(slot) = self.consumers.get_mut(&tag) {
                *slot = Some(callback);
            }
            dispatched += 1;
        }
        self.dispatching = false;
        dispatched
    }
}

/// Close a channel's connection, ignoring the error from closing it twice
pub fn close_connection_suppressed<T: Transport>(channel: &mut Channel<T>) -> Result<(), TransportError> {
    match channel.close() {
        Err(e) if e.is_connection_closed() => {
            debug!("close_connection_suppressed: connection already closed");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::sync::{Arc, Mutex};

    fn subscribed(broker: &MemoryBroker) -> (Channel<crate::memory::MemoryTransport>, String) {
        let mut channel = Channel::new(broker.connect());
        channel.declare_topic_exchange("ex").unwrap();
        let queue = channel.declare_exclusive_queue().unwrap();
        channel.bind_queue("ex", &queue, "*").unwrap();
        (channel, queue)
    }

    #[test]
    fn test_process_events_dispatches_to_consumer() {
        let broker = MemoryBroker::new();
        let (mut channel, queue) = subscribed(&broker);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel
            .consume(&queue, true, move |_, delivery| sink.lock().unwrap().push(delivery.body))
            .unwrap();

        let mut publisher = Channel::new(broker.connect());
        publisher.publish("ex", "key", "hello").unwrap();

        let count = channel.process_events(Duration::from_millis(100)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_nested_process_events_is_refused() {
        let broker = MemoryBroker::new();
        let (mut channel, queue) = subscribed(&broker);
        let nested = Arc::new(Mutex::new(None));
        let record = Arc::clone(&nested);
        channel
            .consume(&queue, true, move |channel, _| {
                let result = channel.process_events(Duration::ZERO);
                *record.lock().unwrap() = Some(matches!(result, Err(ExecError::Reentrancy(_))));
            })
            .unwrap();

        channel.publish("ex", "key", "hello").unwrap();
        channel.process_events(Duration::from_millis(100)).unwrap();

        assert_eq!(*nested.lock().unwrap(), Some(true));
        assert!(!channel.is_dispatching());
    }

    #[test]
    fn test_stop_consuming_from_callback_drops_remaining() {
        let broker = MemoryBroker::new();
        let (mut channel, queue) = subscribed(&broker);
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        channel
            .consume(&queue, true, move |channel, _| {
                *counter.lock().unwrap() += 1;
                channel.stop_consuming();
            })
            .unwrap();

        channel.publish("ex", "key", "one").unwrap();
        channel.publish("ex", "key", "two").unwrap();
        channel.process_events(Duration::from_millis(100)).unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(!channel.has_consumers());
    }

    #[test]
    fn test_panicking_callback_keeps_consumer() {
        let broker = MemoryBroker::new();
        let (mut channel, queue) = subscribed(&broker);
        channel.consume(&queue, true, |_, _| panic!("callback failure")).unwrap();

        channel.publish("ex", "key", "boom").unwrap();
        channel.process_events(Duration::from_millis(100)).unwrap();

        assert!(channel.has_consumers());
        assert!(!channel.is_dispatching());
    }

    #[test]
    fn test_close_suppressed_is_idempotent() {
        let broker = MemoryBroker::new();
        let mut channel = Channel::new(broker.connect());
        assert!(channel.close_suppressed().is_ok());
        assert!(channel.close_suppressed().is_ok());
        assert!(matches!(channel.close(), Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn test_cancel_unknown_consumer() {
        let broker = MemoryBroker::new();
        let mut channel = Channel::new(broker.connect());
        assert!(matches!(
            channel.cancel("ctag-missing"),
            Err(TransportError::UnknownConsumer { .. })
        ));
    }
}
