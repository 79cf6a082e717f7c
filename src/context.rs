//! Cooperative cancellation passed to context-aware driver operations.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Cancellation signal and optional deadline for a single database call.
///
/// Context-aware driver operations receive the context directly and may
/// abort promptly. Legacy operations cannot be interrupted; callers can only
/// check [`Context::err`] once they return.
///
/// # Example
///
/// ```rust
/// use sql_annotator::Context;
/// use std::time::Duration;
///
/// let ctx = Context::new().with_timeout(Duration::from_secs(5));
/// let child = ctx.child();
/// ctx.cancel();
/// assert!(child.is_done());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done until cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set a deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A derived context cancelled together with this one, but which can be
    /// cancelled on its own without affecting the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Non-blocking check of the cancellation signal and the deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }
}
