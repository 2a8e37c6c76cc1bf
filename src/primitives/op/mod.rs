#![forbid(unsafe_code)]
//! Completion object for storage operations.
//!
//! Operations execute synchronously once their lock is held, but report
//! through an [`Op`] so callers inside a cooperative scheduler can poll or
//! await the outcome instead of blocking a worker.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::types::{Result, StoreError};

/// Observable state of an [`Op`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    /// Created, not started.
    Init,
    /// Running.
    Active,
    /// Finished with a value.
    Success,
    /// Finished with an error.
    Failure,
}

/// Completion handle carrying the outcome of one operation.
#[must_use = "an op carries the operation outcome"]
#[derive(Debug)]
pub struct Op<T> {
    name: &'static str,
    state: OpState,
    outcome: Option<Result<T>>,
}

impl<T> Op<T> {
    /// Creates an op in the [`OpState::Init`] state.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: OpState::Init,
            outcome: None,
        }
    }

    /// Runs `body` to completion, walking the op through every state.
    pub fn run(name: &'static str, body: impl FnOnce() -> Result<T>) -> Self {
        let mut op = Self::new(name);
        op.active();
        op.complete(body());
        op
    }

    /// Moves to [`OpState::Active`].
    pub fn active(&mut self) {
        debug_assert_eq!(self.state, OpState::Init, "op {} activated twice", self.name);
        self.state = OpState::Active;
        tracing::trace!(target: "segstore::op", op = self.name, "active");
    }

    /// Records the outcome and moves to a terminal state.
    pub fn complete(&mut self, outcome: Result<T>) {
        debug_assert_eq!(self.state, OpState::Active, "op {} completed while not active", self.name);
        self.state = if outcome.is_ok() {
            OpState::Success
        } else {
            OpState::Failure
        };
        tracing::trace!(target: "segstore::op", op = self.name, state = ?self.state, "done");
        self.outcome = Some(outcome);
    }

    /// Operation name used in traces.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    pub fn state(&self) -> OpState {
        self.state
    }

    /// Reports whether the op reached a terminal state.
    pub fn is_done(&self) -> bool {
        matches!(self.state, OpState::Success | OpState::Failure)
    }

    /// Returns the outcome, failing if the op has not completed.
    pub fn wait(self) -> Result<T> {
        self.into_result()
    }

    /// Consumes the op and returns its outcome.
    pub fn into_result(mut self) -> Result<T> {
        self.outcome
            .take()
            .unwrap_or(Err(StoreError::Invalid("op has not completed")))
    }
}

impl<T: Unpin> Future for Op<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.is_done() {
            return Poll::Pending;
        }
        Poll::Ready(
            this.outcome
                .take()
                .unwrap_or(Err(StoreError::Invalid("op polled after completion"))),
        )
    }
}
