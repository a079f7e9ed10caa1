//! The human approval seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::validator::ValidationVerdict;

/// A human's answer to an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResponse {
    /// Run this action
    Approve,
    /// Run this action, and later clean actions of the same kind from the
    /// same agent without asking again
    ApproveForSession,
    /// Do not run it
    Deny(String),
}

/// Asks a human whether an action may run.
///
/// Implementations may take as long as they like; the executor applies the
/// configured approval timeout and cancellation around the call.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Present `action` and its verdict to a human and wait for the answer.
    async fn request_approval(&self, action: &Action, verdict: &ValidationVerdict)
    -> ApprovalResponse;
}

/// Approves everything. For tests and trusted local use.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn request_approval(&self, _: &Action, _: &ValidationVerdict) -> ApprovalResponse {
        ApprovalResponse::Approve
    }
}

/// Denies everything. Used when no human is reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

#[async_trait]
impl ApprovalGate for AutoDeny {
    async fn request_approval(&self, _: &Action, _: &ValidationVerdict) -> ApprovalResponse {
        ApprovalResponse::Deny("no approver available".to_string())
    }
}
