//! GatherScatter - a rendezvous barrier over a topic exchange
//!
//! A workload announces it is ready, every monitor that must watch it
//! reports ready, and the gatherer then broadcasts `go` once. When the
//! workload completes, the gatherer broadcasts `stop` and a new round begins.

pub mod agents;
pub mod barrier;
pub mod cli;
pub mod config;
pub mod error;
pub mod messages;
pub mod scenario;
pub mod whitelist;

pub use agents::{Agent, AgentContext, AgentService, Gatherer, Monitor, ServiceConfig, Workload};
pub use barrier::{Barrier, BarrierConfig, BarrierStats, LateJoinPolicy, ParticipantStatus, ReadinessCondition};
pub use config::{BrokerConfig, Config, TimingConfig, get_socket_path};
pub use error::RendezvousError;
pub use messages::{BarrierMessage, ReplayPhase};
pub use scenario::{RoundReport, run_round};
pub use whitelist::AgentWhitelist;
