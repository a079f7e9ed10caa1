//! Integration tests for the agentic executor.
//!
//! These run the full propose pipeline against an in-memory sandbox provider
//! so that slot arbitration, approvals, retries and cancellation can be
//! observed without spawning processes:
//! - validator denies never reach a sandbox
//! - approval gating per safety level
//! - FIFO slot arbitration under a global cap
//! - lineage kill switch after repeated denies
//! - cancellation at every wait

use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use palisade::{
    Action, ActionKind, ActionState, AgentId, AgenticExecutor, ApprovalGate, ApprovalResponse,
    AuditDisposition, Config, ExecError, ExecutionLimits, ExecutionResult, ExecutionStatus,
    FailureKind, HumanConfirmation, KillSwitch, MemoryAuditSink, NetworkPolicy, ResourceQuota,
    ResourceUsage, SafetyLevel, Sandbox, SandboxError, SandboxProvider, SandboxState,
    SessionRegistry, Terminal, ValidationVerdict,
};

// =============================================================================
// Fakes
// =============================================================================

/// Sandbox provider that never spawns anything.
///
/// Runs block on `gate` until the test hands out permits, so tests control
/// exactly when slots free up. Clones share all counters.
#[derive(Clone)]
struct FakeProvider {
    acquired: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<AgentId>>>,
    networks: Arc<Mutex<Vec<NetworkPolicy>>>,
    failures_left: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
    foreign_owner: bool,
}

impl FakeProvider {
    /// Every run completes immediately.
    fn open() -> Self {
        let provider = Self::gated();
        provider.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        provider
    }

    /// Runs wait for [`release`](Self::release).
    fn gated() -> Self {
        Self {
            acquired: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
            networks: Arc::new(Mutex::new(Vec::new())),
            failures_left: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Semaphore::new(0)),
            foreign_owner: false,
        }
    }

    /// The first `n` acquires fail with a provisioning error.
    fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Hands out sandboxes owned by somebody else.
    fn foreign(mut self) -> Self {
        self.foreign_owner = true;
        self
    }

    fn release(&self, runs: usize) {
        self.gate.add_permits(runs);
    }

    fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn started(&self) -> Vec<AgentId> {
        self.started.lock().unwrap().clone()
    }

    /// Network policy of every sandbox handed out, in order.
    fn networks(&self) -> Vec<NetworkPolicy> {
        self.networks.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn acquire(
        &self,
        owner: &AgentId,
        quota: ResourceQuota,
        network: NetworkPolicy,
    ) -> Result<Sandbox, SandboxError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SandboxError::Provisioning("volume host offline".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.networks.lock().unwrap().push(network.clone());
        let owner = if self.foreign_owner {
            AgentId::from("someone-else")
        } else {
            owner.clone()
        };
        let mut sandbox = Sandbox::new(owner, quota, network, "/nonexistent", Duration::from_secs(60));
        sandbox.transition(SandboxState::Ready)?;
        Ok(sandbox)
    }

    async fn run(
        &self,
        sandbox: &mut Sandbox,
        action: &Action,
        _limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if sandbox.owner() != action.agent_id() {
            return Err(SandboxError::OwnerMismatch {
                sandbox: sandbox.id(),
                owner: sandbox.owner().clone(),
                requester: action.agent_id().clone(),
            });
        }
        self.started.lock().unwrap().push(action.agent_id().clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            permit = self.gate.acquire() => {
                permit.expect("gate closed").forget();
                false
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        let (status, failure) = if cancelled {
            (ExecutionStatus::Cancelled, Some(FailureKind::Cancelled))
        } else {
            (ExecutionStatus::Completed, None)
        };
        Ok(ExecutionResult {
            action_id: action.id(),
            sandbox_id: Some(sandbox.id()),
            exit_code: (!cancelled).then_some(0),
            stdout: format!("ran: {}", action.payload()),
            stderr: String::new(),
            truncated: false,
            wall_clock_ms: 1,
            resource_usage: ResourceUsage::default(),
            status,
            reasons: Vec::new(),
            failure,
            attempts: 1,
        })
    }

    async fn release(&self, _sandbox: Sandbox) {}
}

/// Approval gate that counts requests and always answers the same way.
#[derive(Clone)]
struct RecordingGate {
    asked: Arc<AtomicUsize>,
    response: ApprovalResponse,
}

impl RecordingGate {
    fn new(response: ApprovalResponse) -> Self {
        Self {
            asked: Arc::new(AtomicUsize::new(0)),
            response,
        }
    }

    fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalGate for RecordingGate {
    async fn request_approval(&self, _: &Action, _: &ValidationVerdict) -> ApprovalResponse {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }
}

/// Approval gate that ends the requester's session before approving the
/// kind for the rest of it.
struct EndingGate {
    sessions: Arc<SessionRegistry>,
    asked: Arc<AtomicUsize>,
}

#[async_trait]
impl ApprovalGate for EndingGate {
    async fn request_approval(&self, action: &Action, _: &ValidationVerdict) -> ApprovalResponse {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.sessions.end(action.agent_id());
        ApprovalResponse::ApproveForSession
    }
}

/// Approval gate nobody ever answers.
struct SilentGate;

#[async_trait]
impl ApprovalGate for SilentGate {
    async fn request_approval(&self, _: &Action, _: &ValidationVerdict) -> ApprovalResponse {
        pending().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config(capacity: usize) -> Config {
    let mut config = Config::default();
    config.sandbox.capacity = capacity;
    config.executor.retry_initial_delay = Duration::from_millis(1);
    config.executor.retry_max_delay = Duration::from_millis(5);
    config
}

struct Harness {
    executor: Arc<AgenticExecutor>,
    provider: FakeProvider,
    gate: RecordingGate,
    audit: Arc<MemoryAuditSink>,
}

fn harness(config: Config, provider: FakeProvider, gate: RecordingGate) -> Harness {
    let audit = Arc::new(MemoryAuditSink::new());
    let executor = AgenticExecutor::builder()
        .config(config)
        .provider(provider.clone())
        .approval(gate.clone())
        .audit(Arc::clone(&audit))
        .build()
        .expect("build executor");
    Harness {
        executor: Arc::new(executor),
        provider,
        gate,
        audit,
    }
}

fn approving(capacity: usize) -> Harness {
    harness(
        config(capacity),
        FakeProvider::open(),
        RecordingGate::new(ApprovalResponse::Approve),
    )
}

fn shell(agent: &str, payload: &str) -> Action {
    Action::new(agent, ActionKind::Shell, payload)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn level(h: &Harness, agent: &str) -> SafetyLevel {
    h.executor
        .sessions()
        .level_of(&AgentId::from(agent))
        .expect("session exists")
}

// =============================================================================
// Validation and policy
// =============================================================================

mod gating {
    use super::*;

    #[tokio::test]
    async fn test_root_delete_denied_even_at_yolo() {
        let h = approving(2);
        h.executor.start_session("a", Some(SafetyLevel::Yolo)).unwrap();

        let result = h.executor.propose(shell("a", "rm -rf /")).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Denied);
        assert_eq!(result.failure, Some(FailureKind::ValidationViolation));
        assert!(!result.reasons.is_empty());
        assert_eq!(h.provider.acquired(), 0, "a denied action never reaches a sandbox");
        assert_eq!(h.gate.asked(), 0);

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].disposition, AuditDisposition::Rejected);
        assert_eq!(
            records[0].path,
            vec![
                ActionState::Proposed,
                ActionState::Validated,
                ActionState::Terminal(Terminal::Rejected),
            ]
        );
    }

    #[tokio::test]
    async fn test_pinned_package_runs_and_unpinned_asks() {
        let h = harness(
            config(2),
            FakeProvider::open(),
            RecordingGate::new(ApprovalResponse::Deny("not today".to_string())),
        );
        h.executor.start_session("a", Some(SafetyLevel::Moderate)).unwrap();

        let pinned = Action::new("a", ActionKind::PackageInstall, "left-pad@1.0.0");
        let result = h.executor.propose(pinned).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(h.gate.asked(), 0);

        let unpinned = Action::new("a", ActionKind::PackageInstall, "left-pad");
        let result = h.executor.propose(unpinned).await.unwrap();
        assert_eq!(h.gate.asked(), 1, "a warning at moderate needs a human");
        assert_eq!(result.status, ExecutionStatus::Denied);
        assert_eq!(result.failure, Some(FailureKind::PolicyRejection));
        assert!(result.reasons.iter().any(|r| r.contains("not today")));
        assert_eq!(h.provider.acquired(), 1);
    }

    #[tokio::test]
    async fn test_clean_action_auto_runs_with_full_path() {
        let h = approving(2);
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();

        let result = h.executor.propose(shell("a", "git status")).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.stdout, "ran: git status");
        assert_eq!(result.attempts, 1);
        let records = h.audit.records();
        assert_eq!(records[0].disposition, AuditDisposition::RiskAbsent);
        assert_eq!(
            records[0].path,
            vec![
                ActionState::Proposed,
                ActionState::Validated,
                ActionState::AutoCleared,
                ActionState::Dispatched,
                ActionState::Observed,
                ActionState::Terminal(Terminal::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_ask_first_always_asks() {
        let h = approving(2);
        h.executor.start_session("a", Some(SafetyLevel::AskFirst)).unwrap();

        let result = h.executor.propose(shell("a", "git status")).await.unwrap();

        assert!(result.is_success());
        assert_eq!(h.gate.asked(), 1);
        assert_eq!(h.audit.records()[0].disposition, AuditDisposition::HumanApproved);
    }

    #[tokio::test]
    async fn test_yolo_accepts_warning_without_asking() {
        let h = approving(2);
        h.executor.start_session("a", Some(SafetyLevel::Yolo)).unwrap();

        let action = Action::new("a", ActionKind::PackageInstall, "left-pad");
        let result = h.executor.propose(action).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(h.gate.asked(), 0);
        assert!(!result.reasons.is_empty(), "the accepted warning is reported");
        assert_eq!(h.audit.records()[0].disposition, AuditDisposition::RiskAccepted);
    }

    #[tokio::test]
    async fn test_session_approval_is_remembered_until_a_violation() {
        let h = harness(
            config(2),
            FakeProvider::open(),
            RecordingGate::new(ApprovalResponse::ApproveForSession),
        );
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();

        let delete = |path: &str| Action::new("a", ActionKind::FileDelete, path);
        h.executor.propose(delete("notes.txt")).await.unwrap();
        assert_eq!(h.gate.asked(), 1);

        let result = h.executor.propose(delete("draft.txt")).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(h.gate.asked(), 1, "covered by the session approval");
        assert_eq!(h.audit.records()[1].disposition, AuditDisposition::SessionApproved);

        h.executor.propose(shell("a", "rm -rf /")).await.unwrap();
        h.executor.propose(delete("old.txt")).await.unwrap();
        assert_eq!(h.gate.asked(), 2, "a deny forgets session approvals");
    }

    #[tokio::test]
    async fn test_session_approval_for_an_ended_session_is_not_kept() {
        let sessions = Arc::new(SessionRegistry::new());
        let asked = Arc::new(AtomicUsize::new(0));
        let provider = FakeProvider::open();
        let executor = AgenticExecutor::builder()
            .config(config(1))
            .sessions(Arc::clone(&sessions))
            .provider(provider.clone())
            .approval(EndingGate {
                sessions: Arc::clone(&sessions),
                asked: Arc::clone(&asked),
            })
            .build()
            .unwrap();
        executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();

        let delete = |path: &str| Action::new("a", ActionKind::FileDelete, path);
        let err = executor.propose(delete("notes.txt")).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownSession(_)));
        assert_eq!(provider.acquired(), 0);

        executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();
        let _ = executor.propose(delete("draft.txt")).await;
        assert_eq!(asked.load(Ordering::SeqCst), 2, "the new session starts without approvals");
    }

    #[tokio::test]
    async fn test_approval_timeout_denies() {
        let mut config = config(2);
        config.executor.approval_timeout = Some(Duration::from_millis(50));
        let provider = FakeProvider::open();
        let executor = AgenticExecutor::builder()
            .config(config)
            .provider(provider.clone())
            .approval(SilentGate)
            .build()
            .unwrap();
        executor.start_session("a", Some(SafetyLevel::AskFirst)).unwrap();

        let result = executor.propose(shell("a", "git status")).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Denied);
        assert_eq!(result.failure, Some(FailureKind::PolicyRejection));
        assert!(result.reasons[0].contains("timed out"));
        assert_eq!(provider.acquired(), 0);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_an_error() {
        let h = approving(1);
        let err = h.executor.propose(shell("ghost", "ls")).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_iteration_budget_stops_task() {
        let mut config = config(1);
        config.executor.max_iterations = 2;
        let h = harness(config, FakeProvider::open(), RecordingGate::new(ApprovalResponse::Approve));
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();

        h.executor.propose(shell("a", "ls")).await.unwrap();
        h.executor.propose(shell("a", "ls")).await.unwrap();
        let err = h.executor.propose(shell("a", "ls")).await.unwrap_err();
        assert!(matches!(err, ExecError::BudgetExceeded { iterations: 2, .. }));

        h.executor.begin_task(&AgentId::from("a")).unwrap();
        assert!(h.executor.propose(shell("a", "ls")).await.unwrap().is_success());
    }
}

// =============================================================================
// Sandbox egress
// =============================================================================

mod egress {
    use super::*;

    #[tokio::test]
    async fn test_sandbox_network_follows_action_kind() {
        let h = approving(1);
        h.executor.start_session("a", Some(SafetyLevel::Yolo)).unwrap();
        let rules = Config::default().network;

        let actions = [
            shell("a", "git status"),
            Action::new("a", ActionKind::FileWrite, "notes.txt"),
            Action::new("a", ActionKind::PackageInstall, "left-pad@1.0.0"),
            Action::new("a", ActionKind::NetworkFetch, "https://pypi.org/simple/"),
        ];
        for action in actions {
            let result = h.executor.propose(action).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.reasons);
        }

        assert_eq!(
            h.provider.networks(),
            vec![
                NetworkPolicy::deny_all(),
                NetworkPolicy::deny_all(),
                NetworkPolicy::allow(rules.registry_hosts.iter().cloned()),
                NetworkPolicy::allow(rules.allowlist.iter().cloned()),
            ]
        );
    }
}

// =============================================================================
// Swarm arbitration
// =============================================================================

mod swarm {
    use super::*;

    #[tokio::test]
    async fn test_ten_agents_five_slots_fifo() {
        let h = harness(
            config(5),
            FakeProvider::gated(),
            RecordingGate::new(ApprovalResponse::Approve),
        );
        let agents: Vec<String> = (0..10).map(|i| format!("agent-{i}")).collect();
        for agent in &agents {
            h.executor.start_session(agent.as_str(), Some(SafetyLevel::Safe)).unwrap();
        }

        let mut handles = Vec::new();
        for (i, agent) in agents.iter().enumerate() {
            let executor = Arc::clone(&h.executor);
            let action = shell(agent, "cargo build");
            handles.push(tokio::spawn(async move { executor.propose(action).await }));
            if i < 5 {
                wait_until(|| h.provider.running() == i + 1).await;
            } else {
                wait_until(|| h.executor.guard().queued() == i - 4).await;
            }
        }

        assert_eq!(h.provider.running(), 5, "exactly C run immediately");
        assert_eq!(h.executor.guard().in_use(), 5);
        assert_eq!(h.executor.guard().queued(), 5);

        // free one slot at a time; the queue drains in arrival order
        for served in 6..=10 {
            h.provider.release(1);
            wait_until(|| h.provider.started().len() == served).await;
        }
        h.provider.release(5);

        for joined in futures::future::join_all(handles).await {
            let result = joined.unwrap().unwrap();
            assert_eq!(result.status, ExecutionStatus::Completed);
        }
        let started = h.provider.started();
        let queued_order: Vec<String> = started[5..].iter().map(|a| a.to_string()).collect();
        assert_eq!(queued_order, agents[5..].to_vec());
        assert_eq!(h.provider.max_running(), 5, "the cap is never exceeded");
        assert_eq!(h.executor.guard().in_use(), 0);
    }

    #[tokio::test]
    async fn test_three_denies_trip_the_lineage() {
        let h = approving(2);
        h.executor.start_session("lead", Some(SafetyLevel::Moderate)).unwrap();
        h.executor
            .spawn_child(&AgentId::from("lead"), "worker", SafetyLevel::Moderate)
            .unwrap();
        h.executor.start_session("bystander", Some(SafetyLevel::Moderate)).unwrap();

        for _ in 0..2 {
            h.executor.propose(shell("worker", "rm -rf /")).await.unwrap();
        }
        assert_eq!(level(&h, "lead"), SafetyLevel::Moderate);
        assert_eq!(level(&h, "worker"), SafetyLevel::AskFirst);

        h.executor.propose(shell("worker", "rm -rf /")).await.unwrap();
        assert_eq!(level(&h, "lead"), SafetyLevel::AskFirst);
        assert_eq!(level(&h, "bystander"), SafetyLevel::Moderate);

        // an action that would have auto-run at moderate now needs a human
        let result = h.executor.propose(shell("lead", "git status")).await.unwrap();
        assert!(result.is_success());
        assert_eq!(h.gate.asked(), 1);
        let last = h.audit.records().pop().unwrap();
        assert_eq!(last.disposition, AuditDisposition::HumanApproved);

        let snapshot = h.executor.sessions().snapshot(&AgentId::from("lead")).unwrap();
        assert_eq!(snapshot.violation_count, 3);
    }

    #[tokio::test]
    async fn test_child_cannot_outrank_parent() {
        let h = approving(1);
        h.executor.start_session("lead", Some(SafetyLevel::Safe)).unwrap();
        let child = h
            .executor
            .spawn_child(&AgentId::from("lead"), "worker", SafetyLevel::Yolo)
            .unwrap();
        assert_eq!(child.safety_level, SafetyLevel::Safe);

        let granted = h
            .executor
            .escalate(&AgentId::from("worker"), SafetyLevel::Yolo, &HumanConfirmation::new("ops"))
            .unwrap();
        assert_eq!(granted, SafetyLevel::Safe);
    }

    #[tokio::test]
    async fn test_child_ceiling_survives_parent_escalation() {
        let h = approving(1);
        let (lead, worker) = (AgentId::from("lead"), AgentId::from("worker"));
        let human = HumanConfirmation::new("ops");
        h.executor.start_session("lead", Some(SafetyLevel::Safe)).unwrap();
        h.executor.spawn_child(&lead, "worker", SafetyLevel::Safe).unwrap();

        h.executor.escalate(&lead, SafetyLevel::Yolo, &human).unwrap();
        let granted = h.executor.escalate(&worker, SafetyLevel::Yolo, &human).unwrap();
        assert_eq!(granted, SafetyLevel::Safe, "the stamped ceiling holds");
        assert_eq!(level(&h, "worker"), SafetyLevel::Safe);

        h.executor.raise_ceiling(&worker, SafetyLevel::Moderate, &human).unwrap();
        let granted = h.executor.escalate(&worker, SafetyLevel::Yolo, &human).unwrap();
        assert_eq!(granted, SafetyLevel::Moderate);
    }

    #[tokio::test]
    async fn test_foreign_sandbox_is_a_breach() {
        let h = harness(
            config(2),
            FakeProvider::open().foreign(),
            RecordingGate::new(ApprovalResponse::Approve),
        );
        h.executor.start_session("a", Some(SafetyLevel::Moderate)).unwrap();

        let result = h.executor.propose(shell("a", "ls")).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Denied);
        assert_eq!(result.failure, Some(FailureKind::SwarmIsolationBreach));
        assert_eq!(level(&h, "a"), SafetyLevel::AskFirst);
        assert!(h.provider.started().is_empty());
    }
}

// =============================================================================
// Kill switch
// =============================================================================

mod kill_switch {
    use super::*;

    #[tokio::test]
    async fn test_engaged_switch_forces_approval_and_blocks_escalation() {
        let h = approving(1);
        h.executor.start_session("a", Some(SafetyLevel::Moderate)).unwrap();
        h.executor.engine().engage_kill_switch();

        let result = h.executor.propose(shell("a", "git status")).await.unwrap();
        assert!(result.is_success());
        assert_eq!(h.gate.asked(), 1);

        let err = h
            .executor
            .escalate(&AgentId::from("a"), SafetyLevel::Yolo, &HumanConfirmation::new("ops"))
            .unwrap_err();
        assert!(matches!(err, ExecError::PolicyRejection(_)));
    }

    #[tokio::test]
    async fn test_switch_engaged_while_queued_sends_action_to_a_human() {
        let switch = KillSwitch::new();
        let provider = FakeProvider::gated();
        let gate = RecordingGate::new(ApprovalResponse::Approve);
        let audit = Arc::new(MemoryAuditSink::new());
        let executor = Arc::new(
            AgenticExecutor::builder()
                .config(config(1))
                .kill_switch(switch.clone())
                .provider(provider.clone())
                .approval(gate.clone())
                .audit(Arc::clone(&audit))
                .build()
                .unwrap(),
        );
        executor.start_session("a", Some(SafetyLevel::Moderate)).unwrap();
        executor.start_session("b", Some(SafetyLevel::Moderate)).unwrap();

        let first = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.propose(shell("a", "cargo build")).await })
        };
        wait_until(|| provider.running() == 1).await;
        let second = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.propose(shell("b", "cargo test")).await })
        };
        wait_until(|| executor.guard().queued() == 1).await;
        assert_eq!(gate.asked(), 0, "auto-cleared before the switch");

        switch.engage();
        provider.release(2);
        assert!(first.await.unwrap().unwrap().is_success());
        assert!(second.await.unwrap().unwrap().is_success());

        assert_eq!(gate.asked(), 1);
        let record = audit
            .records()
            .into_iter()
            .find(|r| r.agent_id == AgentId::from("b"))
            .unwrap();
        assert_eq!(record.disposition, AuditDisposition::HumanApproved);
        assert!(record.path.contains(&ActionState::AutoCleared));
        assert!(record.path.contains(&ActionState::Approved));
    }
}

// =============================================================================
// Cancellation
// =============================================================================

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancel_before_dispatch_creates_nothing() {
        let h = approving(1);
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h
            .executor
            .propose_with_cancel(shell("a", "cargo build"), cancel)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(h.provider.acquired(), 0);
        assert_eq!(h.audit.records()[0].disposition, AuditDisposition::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_for_a_slot() {
        let h = harness(
            config(1),
            FakeProvider::gated(),
            RecordingGate::new(ApprovalResponse::Approve),
        );
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();
        h.executor.start_session("b", Some(SafetyLevel::Safe)).unwrap();

        let first = {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move { executor.propose(shell("a", "cargo build")).await })
        };
        wait_until(|| h.provider.running() == 1).await;

        let action = shell("b", "cargo test");
        let id = action.id();
        let second = {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move { executor.propose(action).await })
        };
        wait_until(|| h.executor.guard().queued() == 1).await;

        assert!(h.executor.cancel(id));
        let result = second.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(h.provider.acquired(), 1, "the cancelled action never got a sandbox");
        assert_eq!(h.executor.guard().queued(), 0);

        h.provider.release(1);
        assert!(first.await.unwrap().unwrap().is_success());
        assert!(!h.executor.cancel(id), "finished actions are forgotten");
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let h = harness(
            config(1),
            FakeProvider::gated(),
            RecordingGate::new(ApprovalResponse::Approve),
        );
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();
        let cancel = CancellationToken::new();

        let run = {
            let executor = Arc::clone(&h.executor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor
                    .propose_with_cancel(shell("a", "cargo build"), cancel)
                    .await
            })
        };
        wait_until(|| h.provider.running() == 1).await;
        cancel.cancel();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        let record = h.audit.records().pop().unwrap();
        assert_eq!(record.disposition, AuditDisposition::Cancelled);
        assert!(record.path.contains(&ActionState::Dispatched));
        assert_eq!(h.executor.guard().in_use(), 0);
    }

    #[tokio::test]
    async fn test_ending_session_cancels_in_flight() {
        let h = harness(
            config(1),
            FakeProvider::gated(),
            RecordingGate::new(ApprovalResponse::Approve),
        );
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();

        let run = {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move { executor.propose(shell("a", "cargo build")).await })
        };
        wait_until(|| h.provider.running() == 1).await;
        assert!(h.executor.end_session(&AgentId::from("a")).is_some());

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }
}

// =============================================================================
// Retries
// =============================================================================

mod retries {
    use super::*;

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = harness(
            config(1),
            FakeProvider::open().failing(2),
            RecordingGate::new(ApprovalResponse::Approve),
        );
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();

        let result = h.executor.propose(shell("a", "cargo build")).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        let path = &h.audit.records()[0].path;
        assert_eq!(path.iter().filter(|s| **s == ActionState::Retry).count(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let h = harness(
            config(1),
            FakeProvider::open().failing(100),
            RecordingGate::new(ApprovalResponse::Approve),
        );
        h.executor.start_session("a", Some(SafetyLevel::Safe)).unwrap();

        let result = h.executor.propose(shell("a", "cargo build")).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::InfraFailure);
        assert_eq!(result.failure, Some(FailureKind::SandboxProvisioningFailure));
        assert_eq!(result.attempts, 4);
        assert_eq!(h.audit.records()[0].disposition, AuditDisposition::Failed);
        assert_eq!(h.executor.guard().in_use(), 0);
    }
}
