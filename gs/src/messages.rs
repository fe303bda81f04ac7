//! Barrier protocol vocabulary
//!
//! Every body on the exchange is a JSON object tagged by `type`, so no
//! field is ever recovered by slicing a string.

use serde::{Deserialize, Serialize};

/// Exchange used when none is configured
pub const DEFAULT_EXCHANGE: &str = "gather_scatter";

/// Routing key for messages sent by the workload
pub const WORKLOAD_ROUTING_KEY: &str = "workload";

/// Routing key for messages sent by the gatherer and monitors
pub const GATHERER_ROUTING_KEY: &str = "gatherer";

/// Binding every agent uses on its own queue
pub const BIND_ALL: &str = "*";

/// Which prompt a replay repeats for a late participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayPhase {
    Ready,
    Go,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BarrierMessage {
    /// Workload is ready to start its critical section
    ProducerReady,
    /// Workload has finished its critical section
    ProducerCompleted,
    ParticipantReady {
        id: String,
    },
    /// Participant announcing itself on start
    Identify {
        id: String,
    },
    /// Producer readiness broadcast, prompting participants to report
    Ready,
    Go,
    Stop,
    /// Directed repeat of a prompt a late participant missed
    Replay {
        id: String,
        phase: ReplayPhase,
    },
}

impl BarrierMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            BarrierMessage::ProducerReady => "producer-ready",
            BarrierMessage::ProducerCompleted => "producer-completed",
            BarrierMessage::ParticipantReady { .. } => "participant-ready",
            BarrierMessage::Identify { .. } => "identify",
            BarrierMessage::Ready => "ready",
            BarrierMessage::Go => "go",
            BarrierMessage::Stop => "stop",
            BarrierMessage::Replay { .. } => "replay",
        }
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            BarrierMessage::ProducerReady | BarrierMessage::ProducerCompleted => WORKLOAD_ROUTING_KEY,
            _ => GATHERER_ROUTING_KEY,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}
