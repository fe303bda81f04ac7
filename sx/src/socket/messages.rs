//! Frames exchanged between socket clients and the broker
//!
//! One JSON object per line. Every client frame is answered by exactly one
//! reply frame; `Deliver` frames may arrive at any time in between.

use serde::{Deserialize, Serialize};

use crate::transport::Delivery;

/// Requests sent by a client connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    DeclareExchange {
        exchange: String,
    },
    DeclareQueue,
    BindQueue {
        exchange: String,
        queue: String,
        pattern: String,
    },
    Consume {
        queue: String,
        #[serde(rename = "auto-ack")]
        auto_ack: bool,
    },
    Cancel {
        #[serde(rename = "consumer-tag")]
        consumer_tag: String,
    },
    Publish {
        exchange: String,
        #[serde(rename = "routing-key")]
        routing_key: String,
        body: String,
    },
    Close,
}

/// Replies and deliveries sent by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    Ok,
    QueueDeclared {
        queue: String,
    },
    ConsumeOk {
        #[serde(rename = "consumer-tag")]
        consumer_tag: String,
    },
    Deliver {
        #[serde(rename = "consumer-tag")]
        consumer_tag: String,
        exchange: String,
        #[serde(rename = "routing-key")]
        routing_key: String,
        body: String,
    },
    Error {
        message: String,
    },
}

impl From<Delivery> for ServerFrame {
    fn from(delivery: Delivery) -> Self {
        ServerFrame::Deliver {
            consumer_tag: delivery.consumer_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            body: delivery.body,
        }
    }
}
