//! Per-request context.
//!
//! There is no process-wide "active branch": every caller passes a
//! [`RequestContext`] naming the branch it works on, the session it belongs to,
//! and a cancellation token checked before any commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::branch::MAIN_BRANCH;
use crate::error::{ExecutionError, KyroMemResult};

/// Cooperative cancellation flag shared between a caller and a running operation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with `ExecutionError::Cancelled` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `MemError::Execution(Cancelled)` when cancelled.
    pub fn check(&self) -> KyroMemResult<()> {
        if self.is_cancelled() {
            return Err(ExecutionError::Cancelled.into());
        }
        Ok(())
    }
}

/// Who is calling and on which branch.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Branch reads and writes default to.
    pub branch: String,
    /// Session the request belongs to.
    pub session_id: Option<String>,
    /// Agent issuing the request.
    pub agent_id: Option<String>,
    /// Cancellation flag for this request.
    pub cancel: CancellationToken,
}

impl RequestContext {
    /// Context bound to `branch`.
    #[must_use]
    pub fn on_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            session_id: None,
            agent_id: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Context bound to `main`.
    #[must_use]
    pub fn main() -> Self {
        Self::on_branch(MAIN_BRANCH)
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the agent id.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Same request on another branch, sharing the cancellation token.
    #[must_use]
    pub fn for_branch(&self, branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            ..self.clone()
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::main()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_shared_between_clones() {
        let ctx = RequestContext::on_branch("t1").with_agent("planner");
        let other = ctx.for_branch("t2");
        assert!(ctx.cancel.check().is_ok());
        other.cancel.cancel();
        assert!(ctx.cancel.is_cancelled());
        assert!(ctx.cancel.check().is_err());
        assert_eq!(other.agent_id.as_deref(), Some("planner"));
    }
}
