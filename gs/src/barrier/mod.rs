//! Gatherer-side barrier aggregation
//!
//! The barrier opens once per round: when the producer is ready and the
//! readiness condition holds, it broadcasts `go` exactly once. The
//! producer's completion always broadcasts `stop` and starts a new round.
//!
//! - `Barrier`: the state machine
//! - `BarrierConfig`: whitelist, count and late-join policy
//! - `BarrierStats`: counters for reporting

mod config;
mod core;

pub use config::{BarrierConfig, LateJoinPolicy, ReadinessCondition};
pub use core::{Barrier, BarrierStats, ParticipantStatus};
