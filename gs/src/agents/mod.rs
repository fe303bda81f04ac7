//! Agent roles and the service that hosts them
//!
//! - `Gatherer`: aggregates readiness and broadcasts `go` and `stop`
//! - `Workload`: the producer whose critical section the round brackets
//! - `Monitor`: a participant that must be ready before `go`
//!
//! Each role runs inside an `AgentService`, which owns the connection on a
//! dedicated thread and serializes every publish through it.

mod gatherer;
mod monitor;
mod service;
mod workload;

pub use gatherer::Gatherer;
pub use monitor::Monitor;
pub use service::{Agent, AgentContext, AgentService, ServiceConfig};
pub use workload::Workload;
