//! Ephemeral sandboxes that actions run in.
//!
//! A [`Sandbox`] is a private working volume plus the quota, network policy
//! and deadline that bound everything run inside it. The executor only sees
//! the [`SandboxProvider`] trait; [`SandboxRuntime`] is the host
//! implementation built on process groups, resource limits and throwaway
//! directories.
//!
//! ## Lifecycle
//!
//! ```text
//! Provisioning -> Ready <-> Running
//!       |           |          |
//!       +-----------+----------+--> TearingDown -> Closed
//! ```

mod egress;
#[cfg(target_os = "linux")]
mod netns;
mod process;
mod runtime;
mod volume;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::action::{Action, ActionId, AgentId, SandboxId};
use crate::error::{FailureKind, SandboxError};
use crate::limits::{ExecutionLimits, ResourceQuota};

pub use runtime::{RuntimeStats, SandboxRuntime};
pub(crate) use volume::Volume;

/// Whether this host can run sandboxed processes in an empty network
/// namespace. Requires Linux with unprivileged user namespaces enabled.
pub fn network_isolation_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        netns::supported()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Volume being prepared
    Provisioning,
    /// Bound to an owner, idle
    Ready,
    /// Running an action
    Running,
    /// Being wiped or destroyed
    TearingDown,
    /// Gone
    Closed,
}

impl SandboxState {
    fn can_move_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Provisioning, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Provisioning | Ready | Running, TearingDown)
                | (TearingDown, Closed)
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SandboxState::Provisioning => "provisioning",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::TearingDown => "tearing_down",
            SandboxState::Closed => "closed",
        })
    }
}

/// Network egress policy for a sandbox. The default allows nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Hosts (or glob patterns) the sandbox may reach
    pub allowlist: Vec<String>,
}

impl NetworkPolicy {
    /// A policy that permits no egress.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// A policy permitting the given hosts.
    pub fn allow(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowlist: hosts.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether no egress is permitted.
    pub fn is_deny_all(&self) -> bool {
        self.allowlist.is_empty()
    }
}

/// An isolated execution context, owned by exactly one agent.
pub struct Sandbox {
    id: SandboxId,
    owner: AgentId,
    quota: ResourceQuota,
    network: NetworkPolicy,
    mount_path: PathBuf,
    created_at: DateTime<Utc>,
    deadline: Instant,
    state: SandboxState,
    pub(crate) volume: Option<Volume>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("mount_path", &self.mount_path)
            .field("quota", &self.quota)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Describe a new sandbox in the `Provisioning` state.
    ///
    /// Providers call this once the backing environment exists at
    /// `mount_path`; the sandbox expires `lifetime` from now.
    pub fn new(
        owner: AgentId,
        quota: ResourceQuota,
        network: NetworkPolicy,
        mount_path: impl Into<PathBuf>,
        lifetime: Duration,
    ) -> Self {
        Self {
            id: SandboxId::new(),
            owner,
            quota,
            network,
            mount_path: mount_path.into(),
            created_at: Utc::now(),
            deadline: Instant::now() + lifetime,
            state: SandboxState::Provisioning,
            volume: None,
        }
    }

    /// Sandbox identifier.
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Owning agent.
    pub fn owner(&self) -> &AgentId {
        &self.owner
    }

    /// Resource quota.
    pub fn quota(&self) -> &ResourceQuota {
        &self.quota
    }

    /// Network egress policy.
    pub fn network(&self) -> &NetworkPolicy {
        &self.network
    }

    /// Root of the sandbox volume on the host.
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Instant after which the sandbox must not run anything.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Current state.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: SandboxState) -> Result<(), SandboxError> {
        if !self.state.can_move_to(next) {
            return Err(SandboxError::NotReady {
                id: self.id,
                state: format!("{} (cannot move to {next})", self.state),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// How an action run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The action ran to completion (any exit code)
    Completed,
    /// Killed after the wall-clock timeout
    TimedOut,
    /// Cancelled before or during the run
    Cancelled,
    /// Refused by the validator, the policy or a human
    Denied,
    /// The sandbox could not be provided
    InfraFailure,
}

/// Resources one run consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Wall-clock time of the run in milliseconds
    pub wall_time_ms: u64,
    /// Bytes written to stdout, captured or not
    pub stdout_bytes: u64,
    /// Bytes written to stderr, captured or not
    pub stderr_bytes: u64,
    /// Bytes stored in the sandbox volume after the run
    pub disk_bytes: u64,
    /// Whether disk usage exceeded the quota
    pub disk_quota_exceeded: bool,
}

/// What the planner gets back for every proposed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The action this result belongs to
    pub action_id: ActionId,
    /// Sandbox the action ran in, if it got that far
    pub sandbox_id: Option<SandboxId>,
    /// Process exit code; signal deaths are reported as 128 + signal
    pub exit_code: Option<i32>,
    /// Captured standard output (lossy UTF-8)
    pub stdout: String,
    /// Captured standard error (lossy UTF-8)
    pub stderr: String,
    /// Whether either stream hit the capture cap
    pub truncated: bool,
    /// Wall-clock time of the run in milliseconds
    pub wall_clock_ms: u64,
    /// Resources consumed
    pub resource_usage: ResourceUsage,
    /// How the run ended
    pub status: ExecutionStatus,
    /// Why the action ended the way it did
    pub reasons: Vec<String>,
    /// Failure category, when the action did not complete
    pub failure: Option<FailureKind>,
    /// Sandbox attempts made, including retries
    pub attempts: u32,
}

impl ExecutionResult {
    /// A result for an action that never produced output.
    pub fn not_run(
        action_id: ActionId,
        status: ExecutionStatus,
        failure: FailureKind,
        reasons: Vec<String>,
    ) -> Self {
        Self {
            action_id,
            sandbox_id: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            wall_clock_ms: 0,
            resource_usage: ResourceUsage::default(),
            status,
            reasons,
            failure: Some(failure),
            attempts: 0,
        }
    }

    /// Completed with exit code zero.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.exit_code == Some(0)
    }
}

/// Provides sandboxes to the executor.
///
/// Implementations must never hand a sandbox to a different owner without a
/// full wipe, and must honour `cancel` by killing whatever is running.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision (or take from a warm pool) a sandbox bound to `owner`.
    async fn acquire(
        &self,
        owner: &AgentId,
        quota: ResourceQuota,
        network: NetworkPolicy,
    ) -> Result<Sandbox, SandboxError>;

    /// Run one action. The sandbox must be `Ready` and owned by the action's agent.
    async fn run(
        &self,
        sandbox: &mut Sandbox,
        action: &Action,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;

    /// Tear the sandbox down, returning reusable parts to the pool.
    async fn release(&self, sandbox: Sandbox);
}
