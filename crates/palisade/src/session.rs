//! Agent sessions and the parent/child lineage between them.
//!
//! Each session sits behind its own lock; the registry lock only guards the
//! map itself. Never hold one session's lock while taking another's.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::action::{ActionKind, AgentId};
use crate::error::GuardError;
use crate::policy::SafetyLevel;

/// State of one running agent.
pub struct AgentSession {
    agent_id: AgentId,
    parent: Option<AgentId>,
    level: SafetyLevel,
    ceiling: SafetyLevel,
    spawned_at: DateTime<Utc>,
    action_count: u64,
    deny_count: u32,
    breach_count: u32,
    lineage_denies: u32,
    lineage_breaches: u32,
    iterations: u32,
    task_started_at: Instant,
    cancel: CancellationToken,
    approved_kinds: HashSet<ActionKind>,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.agent_id)
            .field("parent", &self.parent)
            .field("level", &self.level)
            .field("ceiling", &self.ceiling)
            .field("action_count", &self.action_count)
            .field("violation_count", &self.violation_count())
            .finish_non_exhaustive()
    }
}

impl AgentSession {
    fn new(agent_id: AgentId, parent: Option<AgentId>, level: SafetyLevel, ceiling: SafetyLevel) -> Self {
        Self {
            agent_id,
            parent,
            level,
            ceiling,
            spawned_at: Utc::now(),
            action_count: 0,
            deny_count: 0,
            breach_count: 0,
            lineage_denies: 0,
            lineage_breaches: 0,
            iterations: 0,
            task_started_at: Instant::now(),
            cancel: CancellationToken::new(),
            approved_kinds: HashSet::new(),
            turn: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Agent identifier.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Spawning agent, if any.
    pub fn parent(&self) -> Option<&AgentId> {
        self.parent.as_ref()
    }

    /// Current safety level.
    pub fn level(&self) -> SafetyLevel {
        self.level
    }

    /// Highest level this session may ever reach. Roots have no ceiling.
    pub fn ceiling(&self) -> SafetyLevel {
        self.ceiling
    }

    /// Actions proposed over the session's lifetime.
    pub fn action_count(&self) -> u64 {
        self.action_count
    }

    /// Denies and breaches recorded against this session and its descendants.
    pub fn violation_count(&self) -> u32 {
        self.lineage_denies + self.lineage_breaches
    }

    /// Denies recorded in this session and its descendants.
    pub fn lineage_denies(&self) -> u32 {
        self.lineage_denies
    }

    /// Breaches recorded in this session and its descendants.
    pub fn lineage_breaches(&self) -> u32 {
        self.lineage_breaches
    }

    /// Actions proposed in the current task.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Time since the current task started.
    pub fn task_elapsed(&self) -> Duration {
        self.task_started_at.elapsed()
    }

    /// Token cancelled when the session's in-flight work must stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether a human approved this kind of action for the rest of the session.
    pub fn is_session_approved(&self, kind: ActionKind) -> bool {
        self.approved_kinds.contains(&kind)
    }

    pub(crate) fn turn(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.turn)
    }

    pub(crate) fn set_level(&mut self, level: SafetyLevel) {
        if level < self.level {
            self.approved_kinds.clear();
        }
        self.level = level;
    }

    /// Move the ceiling. A level above the new ceiling drops to it.
    pub(crate) fn set_ceiling(&mut self, ceiling: SafetyLevel) {
        self.ceiling = ceiling;
        if self.level > ceiling {
            self.set_level(ceiling);
        }
    }

    /// Drop to `AskFirst` and forget every session-wide approval.
    pub(crate) fn force_ask_first(&mut self) {
        self.level = SafetyLevel::AskFirst;
        self.approved_kinds.clear();
    }

    pub(crate) fn record_action(&mut self) {
        self.action_count += 1;
        self.iterations += 1;
    }

    pub(crate) fn begin_task(&mut self) {
        self.iterations = 0;
        self.task_started_at = Instant::now();
    }

    pub(crate) fn approve_for_session(&mut self, kind: ActionKind) {
        self.approved_kinds.insert(kind);
    }

    pub(crate) fn record_deny(&mut self, own: bool) -> u32 {
        if own {
            self.deny_count += 1;
            self.approved_kinds.clear();
        }
        self.lineage_denies += 1;
        self.lineage_denies
    }

    pub(crate) fn record_breach(&mut self, own: bool) -> u32 {
        if own {
            self.breach_count += 1;
            self.approved_kinds.clear();
        }
        self.lineage_breaches += 1;
        self.lineage_breaches
    }

    /// Cancel everything in flight and arm a fresh token for later actions.
    pub(crate) fn cancel_in_flight(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.approved_kinds.clear();
    }

    /// Serialisable view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            agent_id: self.agent_id.clone(),
            parent_agent_id: self.parent.clone(),
            safety_level: self.level,
            ceiling: self.ceiling,
            spawned_at: self.spawned_at,
            action_count: self.action_count,
            violation_count: self.violation_count(),
            deny_count: self.deny_count,
            breach_count: self.breach_count,
            iterations: self.iterations,
        }
    }
}

/// Point-in-time copy of an [`AgentSession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Agent identifier
    pub agent_id: AgentId,
    /// Spawning agent
    pub parent_agent_id: Option<AgentId>,
    /// Current safety level
    pub safety_level: SafetyLevel,
    /// Highest reachable level
    pub ceiling: SafetyLevel,
    /// When the session was created
    pub spawned_at: DateTime<Utc>,
    /// Actions proposed so far
    pub action_count: u64,
    /// Denies and breaches in this session and its descendants
    pub violation_count: u32,
    /// Denies in this session only
    pub deny_count: u32,
    /// Breaches in this session only
    pub breach_count: u32,
    /// Actions in the current task
    pub iterations: u32,
}

/// All live agent sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<AgentId, Arc<Mutex<AgentSession>>>>,
}

pub(crate) fn lock(session: &Mutex<AgentSession>) -> MutexGuard<'_, AgentSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: AgentSession) -> Result<SessionSnapshot, GuardError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session.agent_id) {
            return Err(GuardError::DuplicateSession(session.agent_id));
        }
        let snapshot = session.snapshot();
        sessions.insert(session.agent_id.clone(), Arc::new(Mutex::new(session)));
        Ok(snapshot)
    }

    /// Register a top-level agent.
    pub fn spawn_root(
        &self,
        agent: impl Into<AgentId>,
        level: SafetyLevel,
    ) -> Result<SessionSnapshot, GuardError> {
        let agent = agent.into();
        info!(agent_id = %agent, level = %level, "Session started");
        self.insert(AgentSession::new(agent, None, level, SafetyLevel::Yolo))
    }

    /// Register a sub-agent. Its level and ceiling never exceed the parent's
    /// current level.
    pub fn spawn_child(
        &self,
        parent: &AgentId,
        child: impl Into<AgentId>,
        requested: SafetyLevel,
    ) -> Result<SessionSnapshot, GuardError> {
        let child = child.into();
        let parent_level = self
            .level_of(parent)
            .ok_or_else(|| GuardError::UnknownSession(parent.clone()))?;
        let level = requested.min(parent_level);
        if level < requested {
            info!(
                agent_id = %child,
                parent = %parent,
                requested = %requested,
                granted = %level,
                "Child safety level clamped to parent"
            );
        }
        self.insert(AgentSession::new(child, Some(parent.clone()), level, parent_level))
    }

    /// Look up a session.
    pub fn get(&self, agent: &AgentId) -> Option<Arc<Mutex<AgentSession>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .cloned()
    }

    /// Run `f` with the session locked.
    pub fn with<R>(
        &self,
        agent: &AgentId,
        f: impl FnOnce(&mut AgentSession) -> R,
    ) -> Result<R, GuardError> {
        let session = self
            .get(agent)
            .ok_or_else(|| GuardError::UnknownSession(agent.clone()))?;
        let mut guard = lock(&session);
        Ok(f(&mut guard))
    }

    /// Current safety level of a session.
    pub fn level_of(&self, agent: &AgentId) -> Option<SafetyLevel> {
        self.with(agent, |s| s.level()).ok()
    }

    /// Parent of a session.
    pub fn parent_of(&self, agent: &AgentId) -> Option<AgentId> {
        self.with(agent, |s| s.parent.clone()).ok().flatten()
    }

    /// Every live ancestor, nearest first.
    pub fn ancestors(&self, agent: &AgentId) -> Vec<AgentId> {
        let limit = self.len();
        let mut ancestors = Vec::new();
        let mut current = self.parent_of(agent);
        while let Some(parent) = current {
            if ancestors.len() >= limit || ancestors.contains(&parent) || !self.contains(&parent) {
                break;
            }
            current = self.parent_of(&parent);
            ancestors.push(parent);
        }
        ancestors
    }

    /// The top-most live ancestor of `agent` (the agent itself for roots).
    pub fn lineage_root(&self, agent: &AgentId) -> AgentId {
        self.ancestors(agent)
            .pop()
            .unwrap_or_else(|| agent.clone())
    }

    /// `root` followed by all of its live descendants, breadth first.
    pub fn family(&self, root: &AgentId) -> Vec<AgentId> {
        let links: Vec<(AgentId, Option<AgentId>)> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions
                .iter()
                .map(|(id, session)| (id.clone(), lock(session).parent.clone()))
                .collect()
        };
        let mut children: HashMap<&AgentId, Vec<&AgentId>> = HashMap::new();
        for (id, parent) in &links {
            if let Some(parent) = parent {
                children.entry(parent).or_default().push(id);
            }
        }
        for list in children.values_mut() {
            list.sort();
        }

        let mut family = vec![root.clone()];
        let mut queue = VecDeque::from([root]);
        while let Some(next) = queue.pop_front() {
            for child in children.get(next).into_iter().flatten() {
                if !family.contains(child) {
                    family.push((*child).clone());
                    queue.push_back(*child);
                }
            }
        }
        family
    }

    /// Whether a session exists.
    pub fn contains(&self, agent: &AgentId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent)
    }

    /// End a session, cancelling its in-flight work.
    pub fn end(&self, agent: &AgentId) -> Option<SessionSnapshot> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent)?;
        let guard = lock(&session);
        guard.cancel.cancel();
        debug!(agent_id = %agent, "Session ended");
        Some(guard.snapshot())
    }

    /// Snapshot of one session.
    pub fn snapshot(&self, agent: &AgentId) -> Option<SessionSnapshot> {
        self.with(agent, |s| s.snapshot()).ok()
    }

    /// Identifiers of every live session, sorted.
    pub fn agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        agents.sort();
        agents
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn id(s: &str) -> AgentId {
        AgentId::from(s)
    }

    #[test]
    fn test_child_level_clamped_to_parent() {
        let registry = SessionRegistry::new();
        registry.spawn_root("root", SafetyLevel::Safe).unwrap();
        let child = registry
            .spawn_child(&id("root"), "child", SafetyLevel::Yolo)
            .unwrap();
        assert_eq!(child.safety_level, SafetyLevel::Safe);
        assert_eq!(child.ceiling, SafetyLevel::Safe);

        let lower = registry
            .spawn_child(&id("root"), "lower", SafetyLevel::AskFirst)
            .unwrap();
        assert_eq!(lower.safety_level, SafetyLevel::AskFirst);
        assert_eq!(lower.ceiling, SafetyLevel::Safe);
    }

    #[test]
    fn test_spawn_errors() {
        let registry = SessionRegistry::new();
        registry.spawn_root("root", SafetyLevel::Safe).unwrap();
        assert!(matches!(
            registry.spawn_root("root", SafetyLevel::Safe),
            Err(GuardError::DuplicateSession(_))
        ));
        assert!(matches!(
            registry.spawn_child(&id("ghost"), "child", SafetyLevel::Safe),
            Err(GuardError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_lineage_queries() {
        let registry = SessionRegistry::new();
        registry.spawn_root("root", SafetyLevel::Yolo).unwrap();
        registry.spawn_child(&id("root"), "a", SafetyLevel::Yolo).unwrap();
        registry.spawn_child(&id("root"), "b", SafetyLevel::Yolo).unwrap();
        registry.spawn_child(&id("a"), "a1", SafetyLevel::Yolo).unwrap();
        registry.spawn_root("other", SafetyLevel::Yolo).unwrap();

        assert_eq!(registry.ancestors(&id("a1")), vec![id("a"), id("root")]);
        assert_eq!(registry.lineage_root(&id("a1")), id("root"));
        assert_eq!(registry.lineage_root(&id("other")), id("other"));
        assert_eq!(
            registry.family(&id("root")),
            vec![id("root"), id("a"), id("b"), id("a1")]
        );
        assert_eq!(registry.family(&id("other")), vec![id("other")]);
    }

    #[test]
    fn test_end_cancels_in_flight_work() {
        let registry = SessionRegistry::new();
        registry.spawn_root("root", SafetyLevel::Safe).unwrap();
        let token = registry.with(&id("root"), |s| s.cancel_token()).unwrap();
        let snapshot = registry.end(&id("root")).unwrap();
        assert_eq!(snapshot.agent_id, id("root"));
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_in_flight_rearms() {
        let registry = SessionRegistry::new();
        registry.spawn_root("root", SafetyLevel::Safe).unwrap();
        let before = registry.with(&id("root"), |s| s.cancel_token()).unwrap();
        registry.with(&id("root"), |s| s.cancel_in_flight()).unwrap();
        let after = registry.with(&id("root"), |s| s.cancel_token()).unwrap();
        assert!(before.is_cancelled());
        assert!(!after.is_cancelled());
    }

    #[test]
    fn test_step_down_forgets_session_approvals() {
        let registry = SessionRegistry::new();
        registry.spawn_root("root", SafetyLevel::Moderate).unwrap();
        registry
            .with(&id("root"), |s| s.approve_for_session(ActionKind::Shell))
            .unwrap();
        registry
            .with(&id("root"), |s| s.set_level(SafetyLevel::Safe))
            .unwrap();
        assert!(!registry
            .with(&id("root"), |s| s.is_session_approved(ActionKind::Shell))
            .unwrap());
    }
}
