//! Rejection errors.

use std::error::Error;
use std::fmt;

/// A push was rejected; the rejected input is handed back to the caller.
///
/// For [`Queue::push`](crate::Queue::push) the payload is the message itself;
/// for [`Queue::push_with`](crate::Queue::push_with) it is the unused
/// factory, which never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError<X> {
    /// The ring had no free slot and the queue uses the discard policy.
    Full(X),
    /// The queue is shutting down; nothing gets accepted anymore.
    ShutDown(X),
}

impl<X> PushError<X> {
    /// Recovers the rejected message or factory.
    pub fn into_inner(self) -> X {
        match self {
            PushError::Full(inner) | PushError::ShutDown(inner) => inner,
        }
    }

    /// `true` for an overflow rejection.
    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }

    /// `true` for a shutdown rejection.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, PushError::ShutDown(_))
    }
}

impl<X> fmt::Display for PushError<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "queue is full"),
            PushError::ShutDown(_) => write!(f, "queue is shut down"),
        }
    }
}

impl<X: fmt::Debug> Error for PushError<X> {}
