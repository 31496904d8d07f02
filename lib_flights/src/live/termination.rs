//! # Termination Signal
//!
//! A single-slot, first-writer-wins handoff of a session's outcome. Every
//! activity that can end the session holds a clone and calls [`fire`]; only
//! the first call reaches the owner, later ones are no-ops.
//!
//! If every holder is dropped without firing, the owner's receiver resolves
//! with an error, so a crashed activity cannot leave the owner waiting forever.
//!
//! [`fire`]: TerminationSignal::fire

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client closed its side of the stream.
    ClientClosed,
    /// The server is shutting down.
    ServerStopped,
    /// The credential was refused; the session never started.
    Unauthorized(String),
    /// Anything else that made the session impossible to continue.
    InternalError(String),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::ClientClosed => write!(f, "client closed"),
            SessionOutcome::ServerStopped => write!(f, "server stopped"),
            SessionOutcome::Unauthorized(reason) => write!(f, "unauthorized: {}", reason),
            SessionOutcome::InternalError(reason) => write!(f, "internal error: {}", reason),
        }
    }
}

pub struct TerminationSignal {
    slot: Mutex<Option<oneshot::Sender<SessionOutcome>>>,
}

impl TerminationSignal {
    /// Creates the signal and the receiver the owning activity waits on.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<SessionOutcome>) {
        let (tx, rx) = oneshot::channel();
        let signal = Arc::new(Self {
            slot: Mutex::new(Some(tx)),
        });
        (signal, rx)
    }

    /// Offers `outcome` as the session's outcome. Returns `true` if it won.
    pub fn fire(&self, outcome: SessionOutcome) -> bool {
        let sender = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}
