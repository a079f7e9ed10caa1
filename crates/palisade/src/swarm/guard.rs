//! Slot leasing, sandbox namespace checks and lineage kill switches.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LineageTrip, TripReason};
use crate::action::{AgentId, SandboxId};
use crate::config::SwarmConfig;
use crate::error::GuardError;
use crate::policy::{SafetyLevel, SafetyPolicyEngine};
use crate::session::{SessionRegistry, SessionSnapshot};

#[derive(Debug)]
struct LeaseEntry {
    agent: AgentId,
    sandbox: Option<SandboxId>,
}

type LeaseTable = Mutex<HashMap<u64, LeaseEntry>>;

fn leases(table: &LeaseTable) -> std::sync::MutexGuard<'_, HashMap<u64, LeaseEntry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Proof that an agent holds one of the `C` sandbox slots.
///
/// Dropping the token frees the slot.
pub struct SandboxLeaseToken {
    id: u64,
    agent: AgentId,
    acquired_at: Instant,
    table: Arc<LeaseTable>,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for SandboxLeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLeaseToken")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("held_for", &self.acquired_at.elapsed())
            .finish_non_exhaustive()
    }
}

impl SandboxLeaseToken {
    /// Lease identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Agent holding the lease.
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Sandbox bound to this lease, if any.
    pub fn sandbox(&self) -> Option<SandboxId> {
        leases(&self.table).get(&self.id).and_then(|e| e.sandbox)
    }
}

impl Drop for SandboxLeaseToken {
    fn drop(&mut self) {
        leases(&self.table).remove(&self.id);
    }
}

struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Global sandbox capacity and cross-agent isolation.
pub struct SwarmIsolationGuard {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    config: SwarmConfig,
    sessions: Arc<SessionRegistry>,
    engine: Arc<SafetyPolicyEngine>,
    table: Arc<LeaseTable>,
    next_lease: AtomicU64,
    queued: AtomicUsize,
}

impl fmt::Debug for SwarmIsolationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmIsolationGuard")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl SwarmIsolationGuard {
    /// Create a guard allowing `capacity` concurrent sandboxes.
    pub fn new(
        capacity: usize,
        config: SwarmConfig,
        sessions: Arc<SessionRegistry>,
        engine: Arc<SafetyPolicyEngine>,
    ) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            config,
            sessions,
            engine,
            table: Arc::new(Mutex::new(HashMap::new())),
            next_lease: AtomicU64::new(1),
            queued: AtomicUsize::new(0),
        }
    }

    /// Configured capacity `C`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently leased.
    pub fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Wait for a free slot.
    ///
    /// Waiters are served in arrival order. Every `max_wait` spent queued is
    /// logged; the wait itself never jumps the queue or exceeds capacity.
    pub async fn acquire_slot(
        &self,
        agent: &AgentId,
        cancel: &CancellationToken,
    ) -> Result<SandboxLeaseToken, GuardError> {
        if !self.sessions.contains(agent) {
            return Err(GuardError::UnknownSession(agent.clone()));
        }

        let started = Instant::now();
        let permit = {
            let _queued = Queued::enter(&self.queued);
            let acquire = Arc::clone(&self.semaphore).acquire_owned();
            tokio::pin!(acquire);
            let period = self.config.max_wait.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(agent_id = %agent, "Slot wait cancelled");
                        return Err(GuardError::Cancelled);
                    }
                    permit = &mut acquire => break permit.map_err(|_| GuardError::Closed)?,
                    _ = ticker.tick() => {
                        warn!(
                            agent_id = %agent,
                            waited_ms = started.elapsed().as_millis() as u64,
                            in_use = self.in_use(),
                            capacity = self.capacity,
                            queued = self.queued(),
                            "Sandbox slot wait exceeded max wait; still queued"
                        );
                    }
                }
            }
        };

        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        leases(&self.table).insert(
            id,
            LeaseEntry {
                agent: agent.clone(),
                sandbox: None,
            },
        );
        debug!(
            agent_id = %agent,
            lease = id,
            waited_ms = started.elapsed().as_millis() as u64,
            in_use = self.in_use(),
            "Sandbox slot acquired"
        );
        Ok(SandboxLeaseToken {
            id,
            agent: agent.clone(),
            acquired_at: Instant::now(),
            table: Arc::clone(&self.table),
            _permit: permit,
        })
    }

    /// Return a slot to the pool.
    pub fn release_slot(&self, token: SandboxLeaseToken) {
        debug!(
            agent_id = %token.agent,
            lease = token.id,
            held_ms = token.acquired_at.elapsed().as_millis() as u64,
            "Sandbox slot released"
        );
        drop(token);
    }

    /// Record which sandbox a lease is using. A lease binds to one sandbox
    /// at a time; rebinding replaces the previous one.
    pub fn bind(&self, token: &SandboxLeaseToken, sandbox: SandboxId) -> Result<(), GuardError> {
        let mut table = leases(&self.table);
        let entry = table
            .get_mut(&token.id)
            .ok_or(GuardError::UnknownLease(token.id))?;
        entry.sandbox = Some(sandbox);
        Ok(())
    }

    /// Check that `agent` may use `sandbox` under `token`.
    ///
    /// Any mismatch is an isolation breach and is recorded against `agent`.
    pub fn authorize(
        &self,
        token: &SandboxLeaseToken,
        agent: &AgentId,
        sandbox: SandboxId,
    ) -> Result<(), GuardError> {
        let (holder, bound) = {
            let table = leases(&self.table);
            let entry = table
                .get(&token.id)
                .ok_or(GuardError::UnknownLease(token.id))?;
            (entry.agent.clone(), entry.sandbox)
        };
        if &holder == agent && bound == Some(sandbox) {
            return Ok(());
        }
        warn!(
            agent_id = %agent,
            holder = %holder,
            sandbox_id = %sandbox,
            lease = token.id,
            "Sandbox isolation breach"
        );
        if self.sessions.contains(agent) {
            self.record_breach(agent)?;
        }
        Err(GuardError::Breach {
            agent: agent.clone(),
            holder,
        })
    }

    /// Register a sub-agent. Its level and ceiling are clamped to the
    /// parent's current level.
    pub fn register_child(
        &self,
        parent: &AgentId,
        child: impl Into<AgentId>,
        requested: SafetyLevel,
    ) -> Result<SessionSnapshot, GuardError> {
        let snapshot = self.sessions.spawn_child(parent, child, requested)?;
        info!(
            agent_id = %snapshot.agent_id,
            parent = %parent,
            level = %snapshot.safety_level,
            ceiling = %snapshot.ceiling,
            "Sub-agent registered"
        );
        Ok(snapshot)
    }

    /// Record a validator deny against `agent` and every ancestor.
    ///
    /// Steps the session down one level; trips the lineage once any session
    /// in the chain has seen `deny_threshold` denies.
    pub fn record_deny(&self, agent: &AgentId) -> Result<Option<LineageTrip>, GuardError> {
        self.engine.record_deny(agent)?;
        let mut worst = self.sessions.with(agent, |s| s.record_deny(true))?;
        for ancestor in self.sessions.ancestors(agent) {
            if let Ok(count) = self.sessions.with(&ancestor, |s| s.record_deny(false)) {
                worst = worst.max(count);
            }
        }
        debug!(agent_id = %agent, lineage_denies = worst, "Deny recorded");
        if worst >= self.config.deny_threshold {
            Ok(Some(self.trip(agent, TripReason::RepeatedDenies)))
        } else {
            Ok(None)
        }
    }

    /// Record an isolation breach. One is enough to trip the lineage.
    pub fn record_breach(&self, agent: &AgentId) -> Result<LineageTrip, GuardError> {
        self.sessions.with(agent, |s| s.record_breach(true))?;
        for ancestor in self.sessions.ancestors(agent) {
            let _ = self.sessions.with(&ancestor, |s| s.record_breach(false));
        }
        Ok(self.trip(agent, TripReason::IsolationBreach))
    }

    fn trip(&self, agent: &AgentId, reason: TripReason) -> LineageTrip {
        let root = self.sessions.lineage_root(agent);
        let family = self.sessions.family(&root);
        self.engine.force_ask_first(&family);
        for member in &family {
            let _ = self.sessions.with(member, |s| s.cancel_in_flight());
        }
        warn!(
            agent_id = %agent,
            lineage_root = %root,
            sessions = family.len(),
            reason = ?reason,
            "Lineage kill switch tripped; sessions forced to ask_first"
        );
        LineageTrip {
            root,
            family,
            reason,
        }
    }
}
