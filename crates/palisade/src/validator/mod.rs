//! Static screening of proposed actions.
//!
//! The [`Validator`] runs every action through a fixed list of [`Screen`]s and
//! folds their findings into one [`ValidationVerdict`]. Screens are pure: the
//! same action payload always produces the same verdict, so verdicts can be
//! recomputed freely and are never cached across actions.
//!
//! ## Screens
//!
//! - **shell**: injection metacharacters, command substitution, variable
//!   expansion, reverse-shell idioms, privilege escalation, destructive
//!   root/home deletes, fork bombs and unbounded loops
//! - **paths**: traversal, absolute and home paths, wildcard deletes
//! - **network**: egress allowlist, DNS-exfiltration-shaped hosts, secrets in URLs
//! - **packages**: pinned versions, non-registry sources, registry overrides
//! - **rationale**: cross-agent approval manipulation
//! - **content**: credentials written to disk
//!
//! A `Deny` is terminal: nothing downstream may override it.

mod network;
mod packages;
mod paths;
mod shell;

use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::{Action, ActionKind};
use crate::redact::contains_secret;

pub use network::HostAllowlist;

/// Outcome of validating an action. Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No hazard found
    Allow,
    /// A hazard a human should look at
    Warn,
    /// Must not run
    Deny,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Allow => "allow",
            Outcome::Warn => "warn",
            Outcome::Deny => "deny",
        })
    }
}

/// How serious the worst finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Info,
    /// Low
    Low,
    /// Medium
    Medium,
    /// High
    High,
    /// Critical: destructive or escaping the sandbox
    Critical,
}

/// One hazard reported by a screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// What the finding implies for the action
    pub outcome: Outcome,
    /// How serious it is
    pub severity: Severity,
    /// Human-readable explanation
    pub reason: String,
}

impl Finding {
    /// An informational note that does not restrict the action.
    pub fn note(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Allow,
            severity: Severity::Info,
            reason: reason.into(),
        }
    }

    /// A finding that requires human review.
    pub fn warn(severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Warn,
            severity,
            reason: reason.into(),
        }
    }

    /// A finding that blocks the action.
    pub fn deny(severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Deny,
            severity,
            reason: reason.into(),
        }
    }
}

/// The validator's judgement on one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Most restrictive outcome across all findings
    pub outcome: Outcome,
    /// Every finding's reason, in screen order
    pub reasons: Vec<String>,
    /// Highest severity across all findings
    pub severity: Severity,
}

impl ValidationVerdict {
    /// A clean verdict.
    pub fn allow() -> Self {
        Self {
            outcome: Outcome::Allow,
            reasons: Vec::new(),
            severity: Severity::Info,
        }
    }

    /// Fold a list of findings into a verdict.
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let mut verdict = Self::allow();
        for finding in findings {
            verdict.outcome = verdict.outcome.max(finding.outcome);
            verdict.severity = verdict.severity.max(finding.severity);
            if !verdict.reasons.contains(&finding.reason) {
                verdict.reasons.push(finding.reason);
            }
        }
        verdict
    }

    /// Whether the action may proceed without any review.
    pub fn is_allow(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    /// Whether the action is blocked.
    pub fn is_deny(&self) -> bool {
        self.outcome == Outcome::Deny
    }
}

/// A single screening pass.
pub trait Screen: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Inspect an action and report hazards.
    fn screen(&self, action: &Action) -> Vec<Finding>;
}

/// Network rules shared by the validator and the sandbox runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRules {
    /// Egress allowlist. Entries are host names or glob patterns such as
    /// `*.githubusercontent.com`.
    pub allowlist: Vec<String>,
    /// Hosts that serve package registries.
    pub registry_hosts: Vec<String>,
}

impl Default for NetworkRules {
    fn default() -> Self {
        Self {
            allowlist: [
                "registry.npmjs.org",
                "pypi.org",
                "files.pythonhosted.org",
                "github.com",
                "raw.githubusercontent.com",
                "crates.io",
                "static.crates.io",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            registry_hosts: [
                "registry.npmjs.org",
                "registry.yarnpkg.com",
                "pypi.org",
                "files.pythonhosted.org",
                "crates.io",
                "static.crates.io",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl NetworkRules {
    /// Rules that allow no egress at all.
    pub fn deny_all() -> Self {
        Self {
            allowlist: Vec::new(),
            registry_hosts: Vec::new(),
        }
    }
}

/// Screens planner actions for unsafe patterns.
pub struct Validator {
    screens: Vec<Box<dyn Screen>>,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field(
                "screens",
                &self.screens.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(&NetworkRules::default())
    }
}

impl Validator {
    /// Build a validator with the standard screens.
    pub fn new(rules: &NetworkRules) -> Self {
        let egress = HostAllowlist::new(&rules.allowlist);
        let registries = HostAllowlist::new(&rules.registry_hosts);
        Self {
            screens: vec![
                Box::new(shell::ShellScreen::new(egress.clone())),
                Box::new(paths::PathScreen),
                Box::new(network::NetworkScreen::new(egress)),
                Box::new(packages::PackageScreen::new(registries)),
                Box::new(RationaleScreen),
                Box::new(ContentScreen),
            ],
        }
    }

    /// Add a custom screen after the standard ones.
    pub fn with_screen(mut self, screen: impl Screen + 'static) -> Self {
        self.screens.push(Box::new(screen));
        self
    }

    /// Validate an action.
    pub fn check(&self, action: &Action) -> ValidationVerdict {
        let findings: Vec<Finding> = self
            .screens
            .iter()
            .flat_map(|screen| {
                let found = screen.screen(action);
                if !found.is_empty() {
                    debug!(
                        screen = screen.name(),
                        action_id = %action.id(),
                        findings = found.len(),
                        "screen reported findings"
                    );
                }
                found
            })
            .collect();
        ValidationVerdict::from_findings(findings)
    }
}

/// Phrases one agent uses to talk another agent (or a reviewer) into approving.
static MANIPULATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)pretend\s+you\s+are\s+the",
        r"(?i)\bact\s+as\s+the\b",
        r"(?i)override\b.*\bdecision",
        r"(?i)\[[^\]]*:\s*approved\s*\]",
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions",
        r"(?i)\b(security|reviewer|tester|human)\s+(has\s+)?(already\s+)?(approved|signed\s+off)",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Screens the planner's rationale for approval manipulation.
struct RationaleScreen;

impl Screen for RationaleScreen {
    fn name(&self) -> &'static str {
        "rationale"
    }

    fn screen(&self, action: &Action) -> Vec<Finding> {
        let rationale = action.rationale();
        if rationale.is_empty() {
            return Vec::new();
        }
        if MANIPULATION_PATTERNS.iter().any(|regex| regex.is_match(rationale)) {
            vec![Finding::deny(
                Severity::High,
                "rationale attempts to manipulate approval",
            )]
        } else {
            Vec::new()
        }
    }
}

/// Screens file bodies for credentials.
struct ContentScreen;

impl Screen for ContentScreen {
    fn name(&self) -> &'static str {
        "content"
    }

    fn screen(&self, action: &Action) -> Vec<Finding> {
        match (action.kind(), action.content()) {
            (ActionKind::FileWrite, Some(content)) if contains_secret(content) => {
                vec![Finding::warn(
                    Severity::Medium,
                    "file content contains what looks like a credential",
                )]
            }
            _ => Vec::new(),
        }
    }
}
