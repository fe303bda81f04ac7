//! Barrier configuration

use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the gatherer does for a participant that reports after `go`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LateJoinPolicy {
    /// Send the late participant a directed replay of the prompt it missed
    #[default]
    Replay,
    /// Log the miss; the participant waits for the next round
    Ignore,
}

/// When participants count as ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessCondition {
    /// Every named participant must report; others may report too
    Whitelist(Vec<String>),
    /// Any `n` distinct participants
    FirstN(usize),
    /// The producer alone opens the barrier
    Unconditional,
}

/// Gatherer barrier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierConfig {
    /// Participants that must report before `go`
    #[serde(default)]
    pub agents: Vec<String>,

    /// Without a whitelist, how many participants must report
    #[serde(default, rename = "required-count")]
    pub required_count: Option<usize>,

    #[serde(default = "default_late_join", rename = "late-join")]
    pub late_join: LateJoinPolicy,
}

fn default_late_join() -> LateJoinPolicy {
    debug!("default_late_join: called");
    LateJoinPolicy::Replay
}

impl Default for BarrierConfig {
    fn default() -> Self {
        debug!("BarrierConfig::default: called");
        Self {
            agents: Vec::new(),
            required_count: None,
            late_join: LateJoinPolicy::Replay,
        }
    }
}

impl BarrierConfig {
    pub fn with_agents<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agents: agents.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A whitelist takes precedence over a count
    pub fn readiness(&self) -> ReadinessCondition {
        debug!(agents = self.agents.len(), required_count = ?self.required_count, "BarrierConfig::readiness: called");
        if !self.agents.is_empty() {
            ReadinessCondition::Whitelist(self.agents.clone())
        } else if let Some(n) = self.required_count {
            ReadinessCondition::FirstN(n)
        } else {
            ReadinessCondition::Unconditional
        }
    }
}
