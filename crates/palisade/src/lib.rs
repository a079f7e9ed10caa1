//! Palisade: Autonomous Execution Sandbox
//!
//! Palisade sits between an agent planner and the host. Every action the
//! planner proposes (a shell command, a file write, a fetch, a package
//! install) is screened by the [`Validator`], cleared by the
//! [`SafetyPolicyEngine`] or a human through an [`ApprovalGate`], given one of
//! `C` sandbox slots by the [`SwarmIsolationGuard`], and finally run in a
//! private, throwaway [`Sandbox`] by a [`SandboxProvider`] such as
//! [`SandboxRuntime`]. The [`AgenticExecutor`] ties these together and always
//! returns an [`ExecutionResult`].
//!
//! ```rust,ignore
//! use palisade::{Action, ActionKind, AgenticExecutor, Config, SafetyLevel};
//!
//! let executor = AgenticExecutor::builder().config(Config::default()).build()?;
//! executor.start_session("planner", Some(SafetyLevel::Safe))?;
//! let result = executor
//!     .propose(Action::new("planner", ActionKind::Shell, "ls -la"))
//!     .await?;
//! println!("{}", result.stdout);
//! ```

mod action;
mod config;
mod error;
mod executor;
mod limits;
mod policy;
mod redact;
mod sandbox;
mod session;
mod swarm;
mod validator;

pub use action::{
    Action, ActionBuilder, ActionId, ActionKind, AgentId, RiskClass, RiskHints, RiskTable,
    SandboxId,
};
pub use config::{Config, ExecutorConfig, SandboxConfig, SwarmConfig};
pub use error::{ConfigError, ExecError, FailureKind, GuardError, SandboxError};
pub use executor::{
    ActionState, AgenticExecutor, ApprovalGate, ApprovalResponse, AuditDisposition, AuditRecord,
    AuditSink, AutoApprove, AutoDeny, ExecutorBuilder, JsonlAuditSink, MemoryAuditSink, Terminal,
    TracingAuditSink,
};
pub use limits::{ExecutionLimits, LimitedBuffer, ResourceQuota};
pub use policy::{
    Decision, HumanConfirmation, KillSwitch, PolicyOutcome, SafetyLevel, SafetyPolicyEngine,
    decide,
};
pub use redact::{contains_secret, scrub_secrets};
pub use sandbox::{
    ExecutionResult, ExecutionStatus, NetworkPolicy, ResourceUsage, RuntimeStats, Sandbox,
    SandboxProvider, SandboxRuntime, SandboxState, network_isolation_supported,
};
pub use session::{AgentSession, SessionRegistry, SessionSnapshot};
pub use swarm::{LineageTrip, SandboxLeaseToken, SwarmIsolationGuard, TripReason};
pub use validator::{
    Finding, HostAllowlist, NetworkRules, Outcome, Screen, Severity, ValidationVerdict, Validator,
};
