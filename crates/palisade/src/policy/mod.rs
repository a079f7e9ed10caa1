//! Safety policy: autonomy levels and the decision table that turns a
//! validator verdict into "run", "ask" or "reject".
//!
//! ## Decision table
//!
//! | verdict | risk class      | AskFirst | Safe    | Moderate | Yolo        |
//! |---------|-----------------|----------|---------|----------|-------------|
//! | Deny    | any             | Reject   | Reject  | Reject   | Reject      |
//! | Warn    | any             | Ask      | Ask     | Ask      | AcceptRisk  |
//! | Allow   | destructive     | Ask      | Ask     | Ask      | AutoRun     |
//! | Allow   | non-destructive | Ask      | AutoRun | AutoRun  | AutoRun     |
//!
//! Levels only go up through [`SafetyPolicyEngine::escalate`], which needs a
//! [`HumanConfirmation`]. They go down on their own whenever a violation is
//! recorded.

mod engine;
mod kill_switch;
mod level;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::RiskClass;
use crate::validator::{Outcome, ValidationVerdict};

pub use engine::{PolicyOutcome, SafetyPolicyEngine};
pub use kill_switch::KillSwitch;
pub use level::SafetyLevel;

/// What the executor should do with an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Run without asking; no risk was found
    AutoRun,
    /// Run without asking although the validator warned (`Yolo` only)
    AcceptRisk,
    /// Wait for a human
    RequireApproval,
    /// Never run
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::AutoRun => "auto_run",
            Decision::AcceptRisk => "accept_risk",
            Decision::RequireApproval => "require_approval",
            Decision::Reject => "reject",
        })
    }
}

/// Apply the decision table.
pub fn decide(level: SafetyLevel, verdict: &ValidationVerdict, class: RiskClass) -> Decision {
    match (verdict.outcome, level, class) {
        (Outcome::Deny, _, _) => Decision::Reject,
        (Outcome::Warn, SafetyLevel::Yolo, _) => Decision::AcceptRisk,
        (Outcome::Warn, _, _) => Decision::RequireApproval,
        (Outcome::Allow, SafetyLevel::Yolo, _) => Decision::AutoRun,
        (Outcome::Allow, _, RiskClass::Destructive) => Decision::RequireApproval,
        (Outcome::Allow, SafetyLevel::AskFirst, RiskClass::NonDestructive) => {
            Decision::RequireApproval
        }
        (Outcome::Allow, _, RiskClass::NonDestructive) => Decision::AutoRun,
    }
}

/// Proof that a human took an explicit, out-of-band action.
///
/// Only the approval side of the system should construct one; the executor
/// never fabricates it on a planner's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanConfirmation {
    operator: String,
    confirmed_at: DateTime<Utc>,
}

impl HumanConfirmation {
    /// Record a confirmation by `operator`, timestamped now.
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            confirmed_at: Utc::now(),
        }
    }

    /// Who confirmed.
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// When they confirmed.
    pub fn confirmed_at(&self) -> DateTime<Utc> {
        self.confirmed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{Finding, Severity};

    fn verdict(outcome: Outcome) -> ValidationVerdict {
        ValidationVerdict::from_findings(match outcome {
            Outcome::Allow => vec![],
            Outcome::Warn => vec![Finding::warn(Severity::Medium, "w")],
            Outcome::Deny => vec![Finding::deny(Severity::High, "d")],
        })
    }

    #[test]
    fn test_deny_always_rejects() {
        for level in SafetyLevel::ALL {
            for class in [RiskClass::NonDestructive, RiskClass::Destructive] {
                assert_eq!(
                    decide(level, &verdict(Outcome::Deny), class),
                    Decision::Reject
                );
            }
        }
    }

    #[test]
    fn test_warn_needs_approval_below_yolo() {
        let warn = verdict(Outcome::Warn);
        for level in [SafetyLevel::AskFirst, SafetyLevel::Safe, SafetyLevel::Moderate] {
            assert_eq!(
                decide(level, &warn, RiskClass::NonDestructive),
                Decision::RequireApproval
            );
        }
        assert_eq!(
            decide(SafetyLevel::Yolo, &warn, RiskClass::Destructive),
            Decision::AcceptRisk
        );
    }

    #[test]
    fn test_allow_by_risk_class() {
        let allow = verdict(Outcome::Allow);
        assert_eq!(
            decide(SafetyLevel::Moderate, &allow, RiskClass::Destructive),
            Decision::RequireApproval
        );
        assert_eq!(
            decide(SafetyLevel::Yolo, &allow, RiskClass::Destructive),
            Decision::AutoRun
        );
        assert_eq!(
            decide(SafetyLevel::AskFirst, &allow, RiskClass::NonDestructive),
            Decision::RequireApproval
        );
        assert_eq!(
            decide(SafetyLevel::Safe, &allow, RiskClass::NonDestructive),
            Decision::AutoRun
        );
    }
}
