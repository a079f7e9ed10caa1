//! Error taxonomy for the execution core.
//!
//! Every boundary call (validator, sandbox runtime, slot acquisition, approval
//! wait) returns an explicit `Result`. The executor folds these into
//! [`ExecError`], whose [`kind`](ExecError::kind) is what the planner sees on
//! the final [`ExecutionResult`](crate::ExecutionResult).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{AgentId, SandboxId};

/// Errors surfaced by the agentic executor.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The validator denied the action. Never retried.
    #[error("validation violation: {}", reasons.join("; "))]
    ValidationViolation {
        /// Reasons reported by the validator
        reasons: Vec<String>,
    },
    /// A human denied the action, approval timed out, or the kill switch
    /// intervened.
    #[error("policy rejection: {0}")]
    PolicyRejection(String),
    /// Transient infrastructure failure while provisioning or starting a sandbox.
    #[error("sandbox provisioning failure: {0}")]
    SandboxProvisioning(String),
    /// The action ran past its wall-clock timeout and was killed.
    #[error("execution timed out")]
    ExecutionTimeout,
    /// The sandbox pool stayed at capacity.
    #[error("sandbox capacity exhausted")]
    ResourceExhaustion,
    /// A sandbox leased to one agent was touched by another.
    #[error("swarm isolation breach by agent {agent}")]
    SwarmIsolationBreach {
        /// The offending agent
        agent: AgentId,
    },
    /// The action was cancelled while waiting or running.
    #[error("action cancelled")]
    Cancelled,
    /// The agent task exhausted its iteration cap or wall-clock budget.
    #[error("agent task budget exceeded after {iterations} actions in {elapsed:?}")]
    BudgetExceeded {
        /// Actions proposed in the current task
        iterations: u32,
        /// Time since the task started
        elapsed: Duration,
    },
    /// No session is registered for the proposing agent.
    #[error("no session registered for agent {0}")]
    UnknownSession(AgentId),
    /// The executor configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Whether the executor may retry the action automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::SandboxProvisioning(_))
    }

    /// The serialisable failure kind reported to the planner.
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecError::ValidationViolation { .. } => FailureKind::ValidationViolation,
            ExecError::PolicyRejection(_) => FailureKind::PolicyRejection,
            ExecError::SandboxProvisioning(_) | ExecError::Io(_) | ExecError::Config(_) => {
                FailureKind::SandboxProvisioningFailure
            }
            ExecError::ExecutionTimeout => FailureKind::ExecutionTimeout,
            ExecError::ResourceExhaustion => FailureKind::ResourceExhaustion,
            ExecError::SwarmIsolationBreach { .. } => FailureKind::SwarmIsolationBreach,
            ExecError::Cancelled => FailureKind::Cancelled,
            ExecError::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
            ExecError::UnknownSession(_) => FailureKind::UnknownSession,
        }
    }
}

/// Failure categories carried on an [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Validator returned `Deny`
    ValidationViolation,
    /// Human or kill switch rejected the action
    PolicyRejection,
    /// Infrastructure failed after all retries
    SandboxProvisioningFailure,
    /// Killed after the wall-clock timeout
    ExecutionTimeout,
    /// Sandbox pool at capacity
    ResourceExhaustion,
    /// Cross-agent isolation breach
    SwarmIsolationBreach,
    /// Cancelled by the caller or a lineage kill switch
    Cancelled,
    /// Agent task budget exhausted
    BudgetExceeded,
    /// Agent has no session
    UnknownSession,
}

/// Errors from the sandbox runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox volume could not be created or prepared.
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    /// Provisioning did not finish within the cold-start budget.
    #[error("cold start exceeded budget of {0:?}")]
    ColdStartExceeded(Duration),
    /// The action process could not be started.
    #[error("failed to spawn action process: {0}")]
    Spawn(String),
    /// The sandbox is not in a state that can accept an action.
    #[error("sandbox {id} is not ready (state: {state})")]
    NotReady {
        /// Sandbox identifier
        id: SandboxId,
        /// Current state
        state: String,
    },
    /// The sandbox outlived its deadline.
    #[error("sandbox {0} passed its deadline")]
    Expired(SandboxId),
    /// The action belongs to a different agent than the sandbox owner.
    #[error("sandbox {sandbox} is owned by {owner}, not {requester}")]
    OwnerMismatch {
        /// Sandbox identifier
        sandbox: SandboxId,
        /// Owning agent
        owner: AgentId,
        /// Agent that tried to use it
        requester: AgentId,
    },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether this error is a transient infrastructure failure.
    pub fn is_infra(&self) -> bool {
        matches!(
            self,
            SandboxError::Provisioning(_)
                | SandboxError::ColdStartExceeded(_)
                | SandboxError::Spawn(_)
                | SandboxError::Io(_)
        )
    }
}

impl From<SandboxError> for ExecError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::OwnerMismatch { requester, .. } => {
                ExecError::SwarmIsolationBreach { agent: requester }
            }
            other => ExecError::SandboxProvisioning(other.to_string()),
        }
    }
}

/// Errors from the swarm isolation guard.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The wait for a slot was cancelled.
    #[error("slot wait cancelled")]
    Cancelled,
    /// The slot semaphore was closed.
    #[error("slot pool closed")]
    Closed,
    /// The lease token is not known to the guard.
    #[error("unknown lease {0}")]
    UnknownLease(u64),
    /// A lease was used by an agent other than its holder.
    #[error("isolation breach: agent {agent} used a lease held by {holder}")]
    Breach {
        /// Offending agent
        agent: AgentId,
        /// Agent holding the lease
        holder: AgentId,
    },
    /// The agent has no registered session.
    #[error("no session registered for agent {0}")]
    UnknownSession(AgentId),
    /// A session with this agent identifier already exists.
    #[error("agent {0} already has a session")]
    DuplicateSession(AgentId),
}

impl From<GuardError> for ExecError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Cancelled => ExecError::Cancelled,
            GuardError::Closed => ExecError::ResourceExhaustion,
            GuardError::UnknownLease(id) => {
                ExecError::SandboxProvisioning(format!("unknown lease {id}"))
            }
            GuardError::Breach { agent, .. } => ExecError::SwarmIsolationBreach { agent },
            GuardError::UnknownSession(agent) => ExecError::UnknownSession(agent),
            GuardError::DuplicateSession(agent) => {
                ExecError::PolicyRejection(format!("agent {agent} already has a session"))
            }
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that was read
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },
    /// The configuration is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration parsed but contains unusable values.
    #[error("invalid config: {0}")]
    Invalid(String),
}
