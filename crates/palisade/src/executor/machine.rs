//! Per-action state machine.
//!
//! ```text
//! Proposed -> Validated -> Approved | AutoCleared -> Dispatched -> Observed -> Terminal
//!                                                      ^    |
//!                                                      +-Retry
//! ```
//!
//! Every state may jump straight to `Terminal`; nothing leaves `Terminal`.

use serde::{Deserialize, Serialize};
use tracing::error;

/// How an action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    /// Ran to completion
    Completed,
    /// Killed after the wall-clock timeout
    TimedOut,
    /// Cancelled before or during the run
    Cancelled,
    /// Refused by the validator, the policy or a human
    Rejected,
    /// Sandbox infrastructure failed after all retries
    InfraFailure,
}

/// Where an action is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Received from the planner
    Proposed,
    /// Screened by the validator
    Validated,
    /// Cleared by a human
    Approved,
    /// Cleared by the policy without a human
    AutoCleared,
    /// Handed to the sandbox runtime
    Dispatched,
    /// Result in hand
    Observed,
    /// Waiting to retry after an infrastructure failure
    Retry,
    /// Done
    Terminal(Terminal),
}

impl ActionState {
    fn can_move_to(self, next: ActionState) -> bool {
        use ActionState as S;
        if let S::Terminal(_) = self {
            return false;
        }
        matches!(
            (self, next),
            (_, S::Terminal(_))
                | (S::Proposed, S::Validated)
                | (S::Validated, S::Approved | S::AutoCleared)
                | (S::AutoCleared, S::Approved)
                | (S::Approved | S::AutoCleared, S::Dispatched)
                | (S::Dispatched, S::Observed | S::Retry)
                | (S::Retry, S::Dispatched)
        )
    }
}

/// Tracks one action's state and the path it took.
#[derive(Debug, Clone)]
pub(crate) struct ActionMachine {
    state: ActionState,
    path: Vec<ActionState>,
}

impl ActionMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: ActionState::Proposed,
            path: vec![ActionState::Proposed],
        }
    }

    pub(crate) fn state(&self) -> ActionState {
        self.state
    }

    /// Move to `next`. Illegal moves are logged and ignored.
    pub(crate) fn advance(&mut self, next: ActionState) -> bool {
        if !self.state.can_move_to(next) {
            error!(from = ?self.state, to = ?next, "Illegal action state transition");
            return false;
        }
        self.state = next;
        self.path.push(next);
        true
    }

    pub(crate) fn into_path(self) -> Vec<ActionState> {
        self.path
    }
}
