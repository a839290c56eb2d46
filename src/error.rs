//! Error taxonomy for the stack core.

use thiserror::Error;

/// Kinds of failure the core can produce, per the propagation policy: the stack
/// lock is never held across an error-reporting callback, and only these kinds
/// ever cross the handler boundary.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("packet rejected: {0}")]
    PacketRejected(&'static str),

    #[error("stack is closed")]
    StackClosed,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("pipe closed")]
    PipeClosed,

    #[error("operation would block, try again")]
    TryAgain,

    #[error("handler error: {0}")]
    HandlerError(#[source] anyhow::Error),

    #[error("allocation failure: {0}")]
    AllocationFailure(&'static str),
}

impl StackError {
    pub fn is_try_again(&self) -> bool {
        matches!(self, StackError::TryAgain)
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            StackError::ConnectionClosed | StackError::PipeClosed | StackError::StackClosed
        )
    }
}

/// Status codes legal as a return from a stack callback (`recv`/`sent`/`err`
/// equivalents): `OK`, `MEM` (try again), `CONN` (try later), `CLSD`
/// (shut down the receive side), `ABRT` (abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Ok,
    TryAgain,
    TryLater,
    Closed,
    Abort,
}

pub type StackResult<T> = Result<T, StackError>;
