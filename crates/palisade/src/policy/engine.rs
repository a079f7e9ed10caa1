//! The per-session policy state machine.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Decision, HumanConfirmation, KillSwitch, SafetyLevel, decide};
use crate::action::{Action, AgentId, RiskClass, RiskTable};
use crate::error::{ExecError, GuardError};
use crate::session::SessionRegistry;
use crate::validator::ValidationVerdict;

/// The policy's answer for one action, with the inputs that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyOutcome {
    /// What to do
    pub decision: Decision,
    /// Level the decision was taken at (`AskFirst` while the kill switch is engaged)
    pub level: SafetyLevel,
    /// Risk class of the action
    pub risk_class: RiskClass,
}

/// Decides whether actions run, and moves sessions between safety levels.
#[derive(Debug)]
pub struct SafetyPolicyEngine {
    sessions: Arc<SessionRegistry>,
    risk: RiskTable,
    kill_switch: KillSwitch,
}

impl SafetyPolicyEngine {
    /// Create an engine over `sessions` with its own kill switch.
    pub fn new(sessions: Arc<SessionRegistry>, risk: RiskTable) -> Self {
        Self {
            sessions,
            risk,
            kill_switch: KillSwitch::new(),
        }
    }

    /// Use an externally owned kill switch.
    pub fn with_kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = kill_switch;
        self
    }

    /// The kill switch consulted on every decision.
    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Risk class of an action under the configured table.
    pub fn classify(&self, action: &Action) -> RiskClass {
        self.risk.classify(action)
    }

    /// Level decisions for `agent` are taken at right now.
    pub fn effective_level(&self, agent: &AgentId) -> Result<SafetyLevel, GuardError> {
        let level = self
            .sessions
            .level_of(agent)
            .ok_or_else(|| GuardError::UnknownSession(agent.clone()))?;
        if self.kill_switch.is_engaged() {
            Ok(SafetyLevel::AskFirst)
        } else {
            Ok(level)
        }
    }

    /// Decide what to do with a validated action.
    pub fn decide_for(
        &self,
        action: &Action,
        verdict: &ValidationVerdict,
    ) -> Result<PolicyOutcome, GuardError> {
        let level = self.effective_level(action.agent_id())?;
        let risk_class = self.classify(action);
        Ok(PolicyOutcome {
            decision: decide(level, verdict, risk_class),
            level,
            risk_class,
        })
    }

    /// Raise (or lower) a session's level on a human's say-so.
    ///
    /// The grant never exceeds the ceiling stamped when the session was
    /// registered, nor a sub-agent's parent's current level. Nothing rises
    /// while the kill switch is engaged.
    pub fn escalate(
        &self,
        agent: &AgentId,
        target: SafetyLevel,
        confirmation: &HumanConfirmation,
    ) -> Result<SafetyLevel, ExecError> {
        self.refuse_if_engaged("escalation")?;
        let parent_level = self.parent_level(agent);
        let (previous, granted) = self.sessions.with(agent, |s| {
            let previous = s.level();
            let granted = target.min(s.ceiling()).min(parent_level);
            s.set_level(granted);
            (previous, granted)
        })?;
        info!(
            agent_id = %agent,
            operator = confirmation.operator(),
            from = %previous,
            to = %granted,
            requested = %target,
            "Safety level changed by human confirmation"
        );
        Ok(granted)
    }

    /// Move a sub-agent's ceiling on a human's say-so. This is the only way
    /// a ceiling rises after registration; escalating the parent alone does
    /// not lift it. The new ceiling is clamped to the parent's current level.
    pub fn raise_ceiling(
        &self,
        agent: &AgentId,
        target: SafetyLevel,
        confirmation: &HumanConfirmation,
    ) -> Result<SafetyLevel, ExecError> {
        self.refuse_if_engaged("ceiling change")?;
        let ceiling = target.min(self.parent_level(agent));
        let previous = self.sessions.with(agent, |s| {
            let previous = s.ceiling();
            s.set_ceiling(ceiling);
            previous
        })?;
        info!(
            agent_id = %agent,
            operator = confirmation.operator(),
            from = %previous,
            to = %ceiling,
            requested = %target,
            "Safety ceiling changed by human confirmation"
        );
        Ok(ceiling)
    }

    fn refuse_if_engaged(&self, what: &str) -> Result<(), ExecError> {
        if self.kill_switch.is_engaged() {
            return Err(ExecError::PolicyRejection(format!(
                "kill switch engaged; {what} refused"
            )));
        }
        Ok(())
    }

    /// Current level of the agent's parent. Roots are bounded by nothing;
    /// orphans by `AskFirst`.
    fn parent_level(&self, agent: &AgentId) -> SafetyLevel {
        match self.sessions.parent_of(agent) {
            Some(parent) => self.sessions.level_of(&parent).unwrap_or(SafetyLevel::AskFirst),
            None => SafetyLevel::Yolo,
        }
    }

    /// Step a session down one level after a denied action.
    pub fn record_deny(&self, agent: &AgentId) -> Result<SafetyLevel, GuardError> {
        let (from, to) = self.sessions.with(agent, |s| {
            let from = s.level();
            s.set_level(from.step_down());
            (from, s.level())
        })?;
        if from != to {
            warn!(agent_id = %agent, from = %from, to = %to, "Safety level lowered after deny");
        }
        Ok(to)
    }

    /// Drop the given sessions to `AskFirst`. Unknown agents are skipped.
    pub fn force_ask_first(&self, agents: &[AgentId]) {
        for agent in agents {
            let _ = self.sessions.with(agent, |s| s.force_ask_first());
        }
    }

    /// Engage the kill switch and drop every session to `AskFirst`.
    pub fn engage_kill_switch(&self) {
        if self.kill_switch.engage() {
            warn!("Global kill switch engaged");
        }
        self.force_ask_first(&self.sessions.agents());
    }

    /// Release the kill switch. Sessions stay at `AskFirst` until escalated.
    pub fn disengage_kill_switch(&self, confirmation: &HumanConfirmation) {
        self.kill_switch.disengage();
        info!(
            operator = confirmation.operator(),
            "Global kill switch disengaged"
        );
    }

    /// React to the kill switch being engaged through another handle.
    pub fn spawn_kill_switch_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.kill_switch.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let engaged = *rx.borrow_and_update();
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if engaged {
                    warn!("Kill switch engaged externally; forcing all sessions to ask_first");
                    engine.force_ask_first(&engine.sessions.agents());
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::action::ActionKind;

    fn engine() -> SafetyPolicyEngine {
        SafetyPolicyEngine::new(Arc::new(SessionRegistry::new()), RiskTable::new())
    }

    #[test]
    fn test_deny_steps_down() {
        let engine = engine();
        let agent = AgentId::from("a");
        engine.sessions().spawn_root("a", SafetyLevel::Yolo).unwrap();
        assert_eq!(engine.record_deny(&agent).unwrap(), SafetyLevel::Moderate);
        assert_eq!(engine.record_deny(&agent).unwrap(), SafetyLevel::Safe);
        assert_eq!(engine.record_deny(&agent).unwrap(), SafetyLevel::AskFirst);
        assert_eq!(engine.record_deny(&agent).unwrap(), SafetyLevel::AskFirst);
    }

    #[test]
    fn test_escalation_clamped_to_parent() {
        let engine = engine();
        let human = HumanConfirmation::new("ops");
        engine.sessions().spawn_root("root", SafetyLevel::Safe).unwrap();
        engine
            .sessions()
            .spawn_child(&AgentId::from("root"), "child", SafetyLevel::Safe)
            .unwrap();

        let granted = engine
            .escalate(&AgentId::from("child"), SafetyLevel::Yolo, &human)
            .unwrap();
        assert_eq!(granted, SafetyLevel::Safe);

        // raising the parent does not lift the ceiling stamped at spawn
        engine
            .escalate(&AgentId::from("root"), SafetyLevel::Yolo, &human)
            .unwrap();
        let granted = engine
            .escalate(&AgentId::from("child"), SafetyLevel::Moderate, &human)
            .unwrap();
        assert_eq!(granted, SafetyLevel::Safe);
        let ceiling = engine.sessions().snapshot(&AgentId::from("child")).unwrap().ceiling;
        assert_eq!(ceiling, SafetyLevel::Safe);

        let raised = engine
            .raise_ceiling(&AgentId::from("child"), SafetyLevel::Moderate, &human)
            .unwrap();
        assert_eq!(raised, SafetyLevel::Moderate);
        let granted = engine
            .escalate(&AgentId::from("child"), SafetyLevel::Yolo, &human)
            .unwrap();
        assert_eq!(granted, SafetyLevel::Moderate);
    }

    #[test]
    fn test_ceiling_bounded_by_parent_and_lowering_clamps_level() {
        let engine = engine();
        let human = HumanConfirmation::new("ops");
        let child = AgentId::from("child");
        engine.sessions().spawn_root("root", SafetyLevel::Moderate).unwrap();
        engine
            .sessions()
            .spawn_child(&AgentId::from("root"), "child", SafetyLevel::Moderate)
            .unwrap();

        let raised = engine.raise_ceiling(&child, SafetyLevel::Yolo, &human).unwrap();
        assert_eq!(raised, SafetyLevel::Moderate, "never above the parent");

        engine.raise_ceiling(&child, SafetyLevel::Safe, &human).unwrap();
        assert_eq!(engine.sessions().level_of(&child), Some(SafetyLevel::Safe));

        engine.engage_kill_switch();
        let err = engine
            .raise_ceiling(&child, SafetyLevel::Moderate, &human)
            .unwrap_err();
        assert!(matches!(err, ExecError::PolicyRejection(_)));
    }

    #[test]
    fn test_kill_switch_forces_ask_first() {
        let engine = engine();
        engine.sessions().spawn_root("a", SafetyLevel::Yolo).unwrap();
        let action = Action::new("a", ActionKind::Shell, "ls");
        let clean = ValidationVerdict::allow();

        assert_eq!(
            engine.decide_for(&action, &clean).unwrap().decision,
            Decision::AutoRun
        );

        engine.engage_kill_switch();
        let outcome = engine.decide_for(&action, &clean).unwrap();
        assert_eq!(outcome.level, SafetyLevel::AskFirst);
        assert_eq!(outcome.decision, Decision::RequireApproval);
        assert!(
            engine
                .escalate(&AgentId::from("a"), SafetyLevel::Safe, &HumanConfirmation::new("ops"))
                .is_err()
        );

        engine.disengage_kill_switch(&HumanConfirmation::new("ops"));
        assert_eq!(
            engine.sessions().level_of(&AgentId::from("a")),
            Some(SafetyLevel::AskFirst)
        );
    }

    #[test]
    fn test_unknown_session() {
        let engine = engine();
        let action = Action::new("ghost", ActionKind::Shell, "ls");
        assert!(matches!(
            engine.decide_for(&action, &ValidationVerdict::allow()),
            Err(GuardError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_external_kill_switch_is_observed() {
        let switch = KillSwitch::new();
        let engine = Arc::new(engine().with_kill_switch(switch.clone()));
        engine.sessions().spawn_root("a", SafetyLevel::Yolo).unwrap();
        let watcher = engine.spawn_kill_switch_watcher();

        switch.engage();
        for _ in 0..100 {
            if engine.sessions().level_of(&AgentId::from("a")) == Some(SafetyLevel::AskFirst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            engine.sessions().level_of(&AgentId::from("a")),
            Some(SafetyLevel::AskFirst)
        );
        watcher.abort();
    }
}
