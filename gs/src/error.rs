//! Rendezvous errors surfaced to agent callers

use std::time::Duration;

use serialexec::{ExecError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendezvousError {
    /// A wait ended without the signal. Most often the gatherer is not
    /// running or the round was abandoned; waits are never retried.
    #[error("No {signal} signal within {timeout:?}; rendezvous aborted")]
    AbortedRendezvous { signal: &'static str, timeout: Duration },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Message encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RendezvousError {
    pub fn aborted(signal: &'static str, timeout: Duration) -> Self {
        RendezvousError::AbortedRendezvous { signal, timeout }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RendezvousError::AbortedRendezvous { .. })
    }
}
