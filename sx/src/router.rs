//! Topic-exchange routing table shared by the bundled brokers

use std::collections::{HashMap, VecDeque};

use tracing::debug;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::Delivery;

/// Connection identifier assigned by a broker
pub type ConnectionId = u64;

/// A published message before it is matched to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: String,
}

/// A message matched to a consuming connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub owner: ConnectionId,
    pub delivery: Delivery,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug)]
struct RoutedQueue {
    owner: ConnectionId,
    consumer: Option<String>,
    backlog: VecDeque<Message>,
}

/// Exchanges, exclusive queues, bindings and consumers.
///
/// Messages routed to a queue with no consumer wait in its backlog until
/// one attaches.
#[derive(Debug, Default)]
pub struct TopicRouter {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, RoutedQueue>,
    consumers: HashMap<String, String>,
    next_tag: u64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_exchange(&mut self, name: &str) {
        self.exchanges.entry(name.to_string()).or_default();
    }

    pub fn declare_queue(&mut self, owner: ConnectionId) -> String {
        let name = format!("amq.gen-{}", Uuid::now_v7().simple());
        debug!(%name, owner, "TopicRouter::declare_queue: declared");
        self.queues.insert(
            name.clone(),
            RoutedQueue {
                owner,
                consumer: None,
                backlog: VecDeque::new(),
            },
        );
        name
    }

    pub fn bind(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<(), TransportError> {
        if !self.queues.contains_key(queue) {
            return Err(TransportError::UnknownQueue { name: queue.to_string() });
        }
        let bindings = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::UnknownExchange {
                name: exchange.to_string(),
            })?;
        if !bindings.iter().any(|b| b.queue == queue && b.pattern == pattern) {
            bindings.push(Binding {
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    /// Attach a consumer and hand back whatever was waiting in the backlog
    pub fn consume(&mut self, owner: ConnectionId, queue: &str) -> Result<(String, Vec<Delivery>), TransportError> {
        let entry = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue { name: queue.to_string() })?;
        if entry.owner != owner {
            return Err(TransportError::Broker(format!("queue {queue} is exclusive to another connection")));
        }
        if entry.consumer.is_some() {
            return Err(TransportError::Broker(format!("queue {queue} already has a consumer")));
        }

        self.next_tag += 1;
        let tag = format!("ctag-{}", self.next_tag);
        entry.consumer = Some(tag.clone());
        let backlog = entry
            .backlog
            .drain(..)
            .map(|message| into_delivery(&tag, message))
            .collect();
        self.consumers.insert(tag.clone(), queue.to_string());
        Ok((tag, backlog))
    }

    pub fn cancel(&mut self, owner: ConnectionId, tag: &str) -> Result<(), TransportError> {
        let queue = self
            .consumers
            .get(tag)
            .ok_or_else(|| TransportError::UnknownConsumer { tag: tag.to_string() })?;
        match self.queues.get_mut(queue) {
            Some(entry) if entry.owner == owner => entry.consumer = None,
            _ => return Err(TransportError::UnknownConsumer { tag: tag.to_string() }),
        }
        self.consumers.remove(tag);
        Ok(())
    }

    /// Match a published message against the exchange's bindings.
    ///
    /// A queue receives one copy however many of its bindings match.
    pub fn route(&mut self, exchange: &str, routing_key: &str, body: &str) -> Result<Vec<Routed>, TransportError> {
        let bindings = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::UnknownExchange {
                name: exchange.to_string(),
            })?;

        let mut targets: Vec<&str> = Vec::new();
        for binding in bindings {
            if topic_matches(&binding.pattern, routing_key) && !targets.contains(&binding.queue.as_str()) {
                targets.push(&binding.queue);
            }
        }
        let targets: Vec<String> = targets.into_iter().map(str::to_string).collect();

        let mut routed = Vec::new();
        for queue in targets {
            let Some(entry) = self.queues.get_mut(&queue) else {
                continue;
            };
            let message = Message {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_string(),
            };
            match &entry.consumer {
                Some(tag) => routed.push(Routed {
                    owner: entry.owner,
                    delivery: into_delivery(tag, message),
                }),
                None => entry.backlog.push_back(message),
            }
        }
        Ok(routed)
    }

    /// Delete the connection's exclusive queues with their bindings and consumers
    pub fn drop_connection(&mut self, owner: ConnectionId) {
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(name, _)| name.clone())
            .collect();
        if owned.is_empty() {
            return;
        }
        debug!(owner, queues = owned.len(), "TopicRouter::drop_connection: deleting queues");
        for name in &owned {
            if let Some(entry) = self.queues.remove(name)
                && let Some(tag) = entry.consumer
            {
                self.consumers.remove(&tag);
            }
        }
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|b| !owned.contains(&b.queue));
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }
}

fn into_delivery(tag: &str, message: Message) -> Delivery {
    Delivery {
        consumer_tag: tag.to_string(),
        exchange: message.exchange,
        routing_key: message.routing_key,
        body: message.body,
    }
}

/// AMQP topic matching: words are dot-separated, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
