//! The agentic execution loop.
//!
//! [`AgenticExecutor::propose`] drives one planner action through the
//! validator, the safety policy, the approval gate, the swarm guard and the
//! sandbox runtime, and always hands back an [`ExecutionResult`] describing
//! how it ended. Only a missing session or an exhausted task budget surface as
//! `Err`; everything else is a terminal state the planner can react to.
//!
//! Actions from one agent are processed strictly one at a time. Every wait
//! (session turn, approval, slot, provisioning, process) is cancellable
//! through [`AgenticExecutor::cancel`], the caller's token, or the session's
//! own token when its lineage is shut down.

mod approval;
mod audit;
mod backoff;
mod machine;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{Action, ActionId, ActionKind, AgentId};
use crate::config::{Config, ExecutorConfig};
use crate::error::{ExecError, FailureKind, GuardError, SandboxError};
use crate::limits::{ExecutionLimits, ResourceQuota};
use crate::policy::{Decision, HumanConfirmation, KillSwitch, SafetyLevel, SafetyPolicyEngine};
use crate::sandbox::{
    ExecutionResult, ExecutionStatus, NetworkPolicy, SandboxProvider, SandboxRuntime,
};
use crate::session::{SessionRegistry, SessionSnapshot, lock};
use crate::swarm::{SandboxLeaseToken, SwarmIsolationGuard};
use crate::validator::{NetworkRules, ValidationVerdict, Validator};

pub use approval::{ApprovalGate, ApprovalResponse, AutoApprove, AutoDeny};
pub use audit::{
    AuditDisposition, AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink, TracingAuditSink,
};
pub use machine::{ActionState, Terminal};

use backoff::Backoff;
use machine::ActionMachine;

/// Outcome of asking a human.
enum Approval {
    Granted,
    Refused(String),
    Cancelled,
}

/// Builder for an [`AgenticExecutor`].
///
/// Everything not set explicitly is derived from the [`Config`]: the
/// validator from `[network]`, the policy engine from `[risk]`, the guard
/// from `[sandbox]` and `[swarm]`, and a host [`SandboxRuntime`].
///
/// # Example
///
/// ```rust,ignore
/// let executor = AgenticExecutor::builder()
///     .config(Config::load("palisade.toml")?)
///     .approval(my_review_ui)
///     .build()?;
/// executor.start_session("planner", Some(SafetyLevel::Safe))?;
/// let result = executor.propose(Action::new("planner", ActionKind::Shell, "cargo test")).await?;
/// ```
pub struct ExecutorBuilder {
    config: Config,
    validator: Option<Validator>,
    sessions: Option<Arc<SessionRegistry>>,
    kill_switch: Option<KillSwitch>,
    provider: Option<Arc<dyn SandboxProvider>>,
    approval: Option<Arc<dyn ApprovalGate>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl fmt::Debug for ExecutorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorBuilder")
            .field("config", &self.config)
            .field("has_validator", &self.validator.is_some())
            .field("has_provider", &self.provider.is_some())
            .field("has_approval", &self.approval.is_some())
            .field("has_audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            validator: None,
            sessions: None,
            kill_switch: None,
            provider: None,
            approval: None,
            audit: None,
        }
    }

    /// Use this configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a custom validator instead of one built from `[network]`.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Share an existing session registry.
    pub fn sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Share an externally owned kill switch.
    pub fn kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    /// Run actions with a custom sandbox provider.
    pub fn provider(mut self, provider: impl SandboxProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Run actions with a shared sandbox provider.
    pub fn provider_arc(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Ask this gate for approvals. Defaults to [`AutoDeny`].
    pub fn approval(mut self, gate: impl ApprovalGate + 'static) -> Self {
        self.approval = Some(Arc::new(gate));
        self
    }

    /// Send audit records here. Defaults to a [`JsonlAuditSink`] when
    /// `executor.audit_log` is set, otherwise [`TracingAuditSink`].
    pub fn audit(mut self, sink: impl AuditSink + 'static) -> Self {
        self.audit = Some(Arc::new(sink));
        self
    }

    /// Build the executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the default
    /// sandbox runtime cannot create its volume root.
    pub fn build(self) -> Result<AgenticExecutor, ExecError> {
        self.config.validate()?;
        let Config {
            sandbox,
            network,
            risk,
            executor,
            swarm,
        } = self.config;

        let sessions = self.sessions.unwrap_or_default();
        let mut engine = SafetyPolicyEngine::new(Arc::clone(&sessions), risk);
        if let Some(kill_switch) = self.kill_switch {
            engine = engine.with_kill_switch(kill_switch);
        }
        let engine = Arc::new(engine);
        let default_level = swarm.default_level;
        let guard = SwarmIsolationGuard::new(
            sandbox.capacity,
            swarm,
            Arc::clone(&sessions),
            Arc::clone(&engine),
        );
        let validator = self.validator.unwrap_or_else(|| Validator::new(&network));
        let limits = sandbox.limits;
        let quota = sandbox.quota;
        let provider: Arc<dyn SandboxProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(SandboxRuntime::new(sandbox)?),
        };
        let audit: Arc<dyn AuditSink> = match (self.audit, &executor.audit_log) {
            (Some(audit), _) => audit,
            (None, Some(path)) => Arc::new(JsonlAuditSink::open(path)?),
            (None, None) => Arc::new(TracingAuditSink),
        };
        let watcher = tokio::runtime::Handle::try_current()
            .is_ok()
            .then(|| engine.spawn_kill_switch_watcher());

        Ok(AgenticExecutor {
            validator,
            engine,
            guard,
            provider,
            approval: self.approval.unwrap_or_else(|| Arc::new(AutoDeny)),
            audit,
            config: executor,
            limits,
            quota,
            network,
            default_level,
            in_flight: Mutex::new(HashMap::new()),
            watcher,
        })
    }
}

/// Drives planner actions to a terminal state.
pub struct AgenticExecutor {
    validator: Validator,
    engine: Arc<SafetyPolicyEngine>,
    guard: SwarmIsolationGuard,
    provider: Arc<dyn SandboxProvider>,
    approval: Arc<dyn ApprovalGate>,
    audit: Arc<dyn AuditSink>,
    config: ExecutorConfig,
    limits: ExecutionLimits,
    quota: ResourceQuota,
    network: NetworkRules,
    default_level: SafetyLevel,
    in_flight: Mutex<HashMap<ActionId, CancellationToken>>,
    watcher: Option<JoinHandle<()>>,
}

impl fmt::Debug for AgenticExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgenticExecutor")
            .field("validator", &self.validator)
            .field("guard", &self.guard)
            .field("config", &self.config)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Drop for AgenticExecutor {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Removes an action from the in-flight table and stops the cancellation
/// link when the proposal finishes, however it finishes.
struct InFlight<'a> {
    table: &'a Mutex<HashMap<ActionId, CancellationToken>>,
    id: ActionId,
    link: JoinHandle<()>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.link.abort();
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Authorisation carried from the policy step to the audit record.
#[derive(Clone, Copy)]
struct Clearance {
    decision: Decision,
    level: SafetyLevel,
    disposition: AuditDisposition,
}

impl AgenticExecutor {
    /// Create a builder.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    /// The policy engine.
    pub fn engine(&self) -> &Arc<SafetyPolicyEngine> {
        &self.engine
    }

    /// The swarm guard.
    pub fn guard(&self) -> &SwarmIsolationGuard {
        &self.guard
    }

    /// The validator.
    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.engine.sessions()
    }

    /// Register a top-level agent. `None` uses the configured default level.
    pub fn start_session(
        &self,
        agent: impl Into<AgentId>,
        level: Option<SafetyLevel>,
    ) -> Result<SessionSnapshot, ExecError> {
        Ok(self
            .sessions()
            .spawn_root(agent, level.unwrap_or(self.default_level))?)
    }

    /// Register a sub-agent under `parent`.
    pub fn spawn_child(
        &self,
        parent: &AgentId,
        child: impl Into<AgentId>,
        requested: SafetyLevel,
    ) -> Result<SessionSnapshot, ExecError> {
        Ok(self.guard.register_child(parent, child, requested)?)
    }

    /// End a session, cancelling whatever it has in flight.
    pub fn end_session(&self, agent: &AgentId) -> Option<SessionSnapshot> {
        self.sessions().end(agent)
    }

    /// Raise or lower a session's level on a human's say-so.
    pub fn escalate(
        &self,
        agent: &AgentId,
        level: SafetyLevel,
        confirmation: &HumanConfirmation,
    ) -> Result<SafetyLevel, ExecError> {
        self.engine.escalate(agent, level, confirmation)
    }

    /// Lift or lower a sub-agent's ceiling on a human's say-so.
    pub fn raise_ceiling(
        &self,
        agent: &AgentId,
        ceiling: SafetyLevel,
        confirmation: &HumanConfirmation,
    ) -> Result<SafetyLevel, ExecError> {
        self.engine.raise_ceiling(agent, ceiling, confirmation)
    }

    /// Start a new task for `agent`, resetting its iteration count and
    /// wall-clock budget.
    pub fn begin_task(&self, agent: &AgentId) -> Result<(), ExecError> {
        self.sessions().with(agent, |s| s.begin_task())?;
        debug!(agent_id = %agent, "Agent task started");
        Ok(())
    }

    /// Cancel an in-flight action. Returns whether it was found.
    pub fn cancel(&self, action: ActionId) -> bool {
        let token = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&action)
            .cloned();
        match token {
            Some(token) => {
                info!(action_id = %action, "Cancelling action");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Propose an action and wait for its result.
    pub async fn propose(&self, action: Action) -> Result<ExecutionResult, ExecError> {
        self.propose_with_cancel(action, CancellationToken::new())
            .await
    }

    /// Propose an action that `cancel` can interrupt at any wait.
    ///
    /// # Errors
    ///
    /// [`ExecError::UnknownSession`] if the agent has no session, and
    /// [`ExecError::BudgetExceeded`] once the agent's task has used up its
    /// iteration cap or wall-clock budget. Every other outcome is reported
    /// through the returned [`ExecutionResult`].
    pub async fn propose_with_cancel(
        &self,
        action: Action,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let agent = action.agent_id().clone();
        let session = self
            .sessions()
            .get(&agent)
            .ok_or_else(|| ExecError::UnknownSession(agent.clone()))?;
        let (turn, session_cancel) = {
            let s = lock(&session);
            (s.turn(), s.cancel_token())
        };

        let token = session_cancel.child_token();
        let _in_flight = self.track(action.id(), &token, cancel);
        let mut machine = ActionMachine::new();
        debug!(action_id = %action.id(), agent_id = %agent, kind = %action.kind(), "Action proposed");

        let _turn = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let verdict = ValidationVerdict::allow();
                return Ok(self.finish_cancelled(&action, &verdict, None, machine, 0));
            }
            turn = turn.lock_owned() => turn,
        };

        let (iterations, elapsed) = {
            let s = lock(&session);
            (s.iterations(), s.task_elapsed())
        };
        if iterations >= self.config.max_iterations || elapsed >= self.config.task_budget {
            warn!(
                agent_id = %agent,
                iterations,
                elapsed_ms = elapsed.as_millis() as u64,
                "Agent task budget exceeded; stopping"
            );
            return Err(ExecError::BudgetExceeded {
                iterations,
                elapsed,
            });
        }
        lock(&session).record_action();

        // Validate
        let verdict = self.validator.check(&action);
        machine.advance(ActionState::Validated);
        if verdict.is_deny() {
            warn!(
                action_id = %action.id(),
                agent_id = %agent,
                reasons = ?verdict.reasons,
                "Action denied by validator"
            );
            if let Err(e) = self.guard.record_deny(&agent) {
                error!(agent_id = %agent, error = %e, "Failed to record deny");
            }
            let result = ExecutionResult::not_run(
                action.id(),
                ExecutionStatus::Denied,
                FailureKind::ValidationViolation,
                verdict.reasons.clone(),
            );
            machine.advance(ActionState::Terminal(Terminal::Rejected));
            let clearance = (Decision::Reject, self.level_of(&agent));
            self.audit(
                &action,
                &verdict,
                Some(clearance),
                AuditDisposition::Rejected,
                machine,
                &result,
            );
            return Ok(result);
        }

        // Decide
        let outcome = self.engine.decide_for(&action, &verdict)?;
        let mut clearance = Clearance {
            decision: outcome.decision,
            level: outcome.level,
            disposition: AuditDisposition::RiskAbsent,
        };
        match outcome.decision {
            Decision::AutoRun => {
                machine.advance(ActionState::AutoCleared);
            }
            Decision::AcceptRisk => {
                warn!(
                    action_id = %action.id(),
                    agent_id = %agent,
                    level = %outcome.level,
                    reasons = ?verdict.reasons,
                    "Validator warning accepted without review"
                );
                clearance.disposition = AuditDisposition::RiskAccepted;
                machine.advance(ActionState::AutoCleared);
            }
            Decision::RequireApproval
                if verdict.is_allow()
                    && self
                        .sessions()
                        .with(&agent, |s| s.is_session_approved(action.kind()))
                        .unwrap_or(false) =>
            {
                debug!(action_id = %action.id(), kind = %action.kind(), "Covered by session approval");
                clearance.disposition = AuditDisposition::SessionApproved;
                machine.advance(ActionState::AutoCleared);
            }
            Decision::RequireApproval => {
                match self.seek_approval(&action, &verdict, &token).await {
                    Approval::Granted => {
                        clearance.disposition = AuditDisposition::HumanApproved;
                        machine.advance(ActionState::Approved);
                    }
                    Approval::Refused(reason) => {
                        return Ok(self.finish_refused(&action, &verdict, clearance, machine, reason));
                    }
                    Approval::Cancelled => {
                        return Ok(self.finish_cancelled(&action, &verdict, Some(clearance), machine, 0));
                    }
                }
            }
            Decision::Reject => {
                let reason = "rejected by safety policy".to_string();
                return Ok(self.finish_refused(&action, &verdict, clearance, machine, reason));
            }
        }

        // Slot
        let lease = loop {
            let lease = match self.guard.acquire_slot(&agent, &token).await {
                Ok(lease) => lease,
                Err(GuardError::Cancelled) => {
                    return Ok(self.finish_cancelled(&action, &verdict, Some(clearance), machine, 0));
                }
                Err(GuardError::UnknownSession(agent)) => {
                    return Err(ExecError::UnknownSession(agent));
                }
                Err(e) => {
                    let result = ExecutionResult::not_run(
                        action.id(),
                        ExecutionStatus::InfraFailure,
                        FailureKind::ResourceExhaustion,
                        vec![e.to_string()],
                    );
                    machine.advance(ActionState::Terminal(Terminal::InfraFailure));
                    self.audit(
                        &action,
                        &verdict,
                        Some((clearance.decision, clearance.level)),
                        AuditDisposition::Failed,
                        machine,
                        &result,
                    );
                    return Ok(result);
                }
            };
            // only an answer given for this very action counts as attended
            let unattended = clearance.disposition != AuditDisposition::HumanApproved;
            if !(unattended && self.engine.kill_switch().is_engaged()) {
                break lease;
            }
            // kill switch engaged while queued: a human has to clear it now
            self.guard.release_slot(lease);
            warn!(
                action_id = %action.id(),
                agent_id = %agent,
                "Kill switch engaged before dispatch; asking for approval"
            );
            clearance.level = SafetyLevel::AskFirst;
            clearance.decision = Decision::RequireApproval;
            match self.seek_approval(&action, &verdict, &token).await {
                Approval::Granted => {
                    clearance.disposition = AuditDisposition::HumanApproved;
                    machine.advance(ActionState::Approved);
                }
                Approval::Refused(reason) => {
                    return Ok(self.finish_refused(&action, &verdict, clearance, machine, reason));
                }
                Approval::Cancelled => {
                    return Ok(self.finish_cancelled(&action, &verdict, Some(clearance), machine, 0));
                }
            }
        };

        // Dispatch, retrying infrastructure failures
        machine.advance(ActionState::Dispatched);
        let mut backoff = Backoff::from_config(&self.config);
        let outcome = loop {
            match self.dispatch(&action, &lease, &token).await {
                Ok(result) => break Ok(result),
                Err(e)
                    if e.is_retryable()
                        && !backoff.exceeded_max_attempts(self.config.max_retries) =>
                {
                    let delay = backoff.next_delay();
                    warn!(
                        action_id = %action.id(),
                        agent_id = %agent,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sandbox infrastructure failure; retrying"
                    );
                    machine.advance(ActionState::Retry);
                    let cancelled = tokio::select! {
                        biased;
                        _ = token.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        break Err(ExecError::Cancelled);
                    }
                    machine.advance(ActionState::Dispatched);
                }
                Err(e) => break Err(e),
            }
        };
        let attempts = backoff.attempt() + 1;
        self.guard.release_slot(lease);

        let decision = Some((clearance.decision, clearance.level));
        let mut result = match outcome {
            Ok(mut result) => {
                machine.advance(ActionState::Observed);
                result.attempts = attempts;
                result
            }
            Err(ExecError::Cancelled) => {
                return Ok(self.finish_cancelled(
                    &action,
                    &verdict,
                    Some(clearance),
                    machine,
                    attempts,
                ));
            }
            Err(ExecError::SwarmIsolationBreach { agent: offender }) => {
                let mut result = ExecutionResult::not_run(
                    action.id(),
                    ExecutionStatus::Denied,
                    FailureKind::SwarmIsolationBreach,
                    vec![format!("sandbox isolation breach by {offender}")],
                );
                result.attempts = attempts;
                machine.advance(ActionState::Terminal(Terminal::Rejected));
                self.audit(
                    &action,
                    &verdict,
                    decision,
                    AuditDisposition::Rejected,
                    machine,
                    &result,
                );
                return Ok(result);
            }
            Err(ExecError::UnknownSession(agent)) => {
                return Err(ExecError::UnknownSession(agent));
            }
            Err(e) => {
                error!(
                    action_id = %action.id(),
                    agent_id = %agent,
                    attempts,
                    error = %e,
                    "Sandbox unavailable; giving up"
                );
                let mut result = ExecutionResult::not_run(
                    action.id(),
                    ExecutionStatus::InfraFailure,
                    e.kind(),
                    vec![e.to_string(), format!("gave up after {attempts} attempts")],
                );
                result.attempts = attempts;
                machine.advance(ActionState::Terminal(Terminal::InfraFailure));
                self.audit(
                    &action,
                    &verdict,
                    decision,
                    AuditDisposition::Failed,
                    machine,
                    &result,
                );
                return Ok(result);
            }
        };

        if !verdict.is_allow() {
            let mut reasons = verdict.reasons.clone();
            reasons.append(&mut result.reasons);
            result.reasons = reasons;
        }
        let (terminal, disposition) = match result.status {
            ExecutionStatus::Completed => (Terminal::Completed, clearance.disposition),
            ExecutionStatus::TimedOut => (Terminal::TimedOut, clearance.disposition),
            ExecutionStatus::Cancelled => (Terminal::Cancelled, AuditDisposition::Cancelled),
            ExecutionStatus::Denied => (Terminal::Rejected, AuditDisposition::Rejected),
            ExecutionStatus::InfraFailure => (Terminal::InfraFailure, AuditDisposition::Failed),
        };
        machine.advance(ActionState::Terminal(terminal));
        self.audit(&action, &verdict, decision, disposition, machine, &result);
        Ok(result)
    }

    fn track(
        &self,
        id: ActionId,
        token: &CancellationToken,
        caller: CancellationToken,
    ) -> InFlight<'_> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        if caller.is_cancelled() {
            token.cancel();
        }
        let linked = token.clone();
        let link = tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        InFlight {
            table: &self.in_flight,
            id,
            link,
        }
    }

    /// Egress a sandbox gets for one kind of action. Only fetches and
    /// installs reach the network, and only the hosts they need.
    fn network_for(&self, kind: ActionKind) -> NetworkPolicy {
        match kind {
            ActionKind::Shell | ActionKind::FileWrite | ActionKind::FileDelete => {
                NetworkPolicy::deny_all()
            }
            ActionKind::PackageInstall => {
                NetworkPolicy::allow(self.network.registry_hosts.iter().cloned())
            }
            ActionKind::NetworkFetch => NetworkPolicy::allow(self.network.allowlist.iter().cloned()),
        }
    }

    fn level_of(&self, agent: &AgentId) -> SafetyLevel {
        self.engine
            .effective_level(agent)
            .unwrap_or(SafetyLevel::AskFirst)
    }

    async fn seek_approval(
        &self,
        action: &Action,
        verdict: &ValidationVerdict,
        cancel: &CancellationToken,
    ) -> Approval {
        info!(
            action_id = %action.id(),
            agent_id = %action.agent_id(),
            kind = %action.kind(),
            "Waiting for approval"
        );
        let request = self.approval.request_approval(action, verdict);
        let response = match self.config.approval_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Approval::Cancelled,
                response = tokio::time::timeout(limit, request) => match response {
                    Ok(response) => response,
                    Err(_) => {
                        warn!(action_id = %action.id(), timeout_ms = limit.as_millis() as u64, "Approval timed out");
                        return Approval::Refused(format!("approval timed out after {} ms", limit.as_millis()));
                    }
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Approval::Cancelled,
                response = request => response,
            },
        };
        match response {
            ApprovalResponse::Approve => Approval::Granted,
            ApprovalResponse::ApproveForSession => {
                match self
                    .sessions()
                    .with(action.agent_id(), |s| s.approve_for_session(action.kind()))
                {
                    Ok(()) => info!(
                        agent_id = %action.agent_id(),
                        kind = %action.kind(),
                        "Kind approved for the rest of the session"
                    ),
                    Err(e) => warn!(
                        agent_id = %action.agent_id(),
                        kind = %action.kind(),
                        error = %e,
                        "Session approval not recorded; approving this action only"
                    ),
                }
                Approval::Granted
            }
            ApprovalResponse::Deny(reason) => {
                info!(action_id = %action.id(), %reason, "Approval denied");
                Approval::Refused(reason)
            }
        }
    }

    async fn dispatch(
        &self,
        action: &Action,
        lease: &SandboxLeaseToken,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let network = self.network_for(action.kind());
        let acquire = self.provider.acquire(action.agent_id(), self.quota, network);
        let mut sandbox = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            sandbox = acquire => sandbox?,
        };
        let run = async {
            self.guard.bind(lease, sandbox.id())?;
            self.guard.authorize(lease, action.agent_id(), sandbox.id())?;
            match self
                .provider
                .run(&mut sandbox, action, &self.limits, cancel.clone())
                .await
            {
                Ok(result) => Ok(result),
                Err(e @ SandboxError::OwnerMismatch { .. }) => {
                    if let Err(err) = self.guard.record_breach(action.agent_id()) {
                        error!(agent_id = %action.agent_id(), error = %err, "Failed to record breach");
                    }
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            }
        }
        .await;
        self.provider.release(sandbox).await;
        run
    }

    fn finish_refused(
        &self,
        action: &Action,
        verdict: &ValidationVerdict,
        clearance: Clearance,
        mut machine: ActionMachine,
        reason: String,
    ) -> ExecutionResult {
        let result = ExecutionResult::not_run(
            action.id(),
            ExecutionStatus::Denied,
            FailureKind::PolicyRejection,
            vec![reason],
        );
        machine.advance(ActionState::Terminal(Terminal::Rejected));
        self.audit(
            action,
            verdict,
            Some((clearance.decision, clearance.level)),
            AuditDisposition::Rejected,
            machine,
            &result,
        );
        result
    }

    fn finish_cancelled(
        &self,
        action: &Action,
        verdict: &ValidationVerdict,
        clearance: Option<Clearance>,
        mut machine: ActionMachine,
        attempts: u32,
    ) -> ExecutionResult {
        debug!(action_id = %action.id(), state = ?machine.state(), "Action cancelled");
        let mut result = ExecutionResult::not_run(
            action.id(),
            ExecutionStatus::Cancelled,
            FailureKind::Cancelled,
            vec!["action cancelled".to_string()],
        );
        result.attempts = attempts;
        machine.advance(ActionState::Terminal(Terminal::Cancelled));
        self.audit(
            action,
            verdict,
            clearance.map(|c| (c.decision, c.level)),
            AuditDisposition::Cancelled,
            machine,
            &result,
        );
        result
    }

    fn audit(
        &self,
        action: &Action,
        verdict: &ValidationVerdict,
        decision: Option<(Decision, SafetyLevel)>,
        disposition: AuditDisposition,
        machine: ActionMachine,
        result: &ExecutionResult,
    ) {
        let record = AuditRecord::new(
            action,
            verdict,
            decision,
            disposition,
            machine.into_path(),
            result,
        );
        self.audit.record(&record);
    }
}
