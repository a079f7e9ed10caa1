//! Path screening for file actions.
//!
//! File actions address the sandbox volume with relative paths only. Anything
//! that could resolve outside the volume is denied.

use std::path::{Component, Path};

use super::{Finding, Screen, Severity};
use crate::action::{Action, ActionKind};

/// Screens `FileWrite` and `FileDelete` targets.
pub(super) struct PathScreen;

impl Screen for PathScreen {
    fn name(&self) -> &'static str {
        "paths"
    }

    fn screen(&self, action: &Action) -> Vec<Finding> {
        if !action.kind().is_file_op() {
            return Vec::new();
        }
        let mut findings = screen_relative_path(action.payload());
        if action.kind() == ActionKind::FileDelete {
            findings.extend(screen_delete_target(action.payload()));
        }
        if action.kind() == ActionKind::FileWrite && touches_git_hooks(action.payload()) {
            findings.push(Finding::warn(
                Severity::Medium,
                "write into .git/hooks installs code that runs on later git commands",
            ));
        }
        findings
    }
}

/// Check that `raw` is a plain relative path that stays inside its root.
fn screen_relative_path(raw: &str) -> Vec<Finding> {
    if raw.trim().is_empty() {
        return vec![Finding::deny(Severity::Low, "empty path")];
    }
    if raw.chars().any(char::is_control) {
        return vec![Finding::deny(
            Severity::High,
            "control characters in path",
        )];
    }

    let mut findings = Vec::new();
    if raw.starts_with('~') {
        findings.push(Finding::deny(
            Severity::High,
            format!("home-relative path `{raw}`"),
        ));
    }
    if raw.contains('\\') || raw.as_bytes().get(1) == Some(&b':') {
        findings.push(Finding::deny(
            Severity::Medium,
            format!("non-POSIX path `{raw}`"),
        ));
    }

    let path = Path::new(raw);
    if path.is_absolute() {
        findings.push(Finding::deny(
            Severity::High,
            format!("absolute path `{raw}`"),
        ));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        findings.push(Finding::deny(
            Severity::High,
            format!("path traversal in `{raw}`"),
        ));
    }
    findings
}

fn screen_delete_target(raw: &str) -> Vec<Finding> {
    let trimmed = raw.trim().trim_end_matches('/');
    if matches!(trimmed, "" | "." | "*" | "./*" | "./") {
        return vec![Finding::deny(
            Severity::High,
            "delete of the whole workspace",
        )];
    }
    if raw.contains(['*', '?', '[']) {
        return vec![Finding::deny(
            Severity::Medium,
            format!("wildcard delete `{raw}`"),
        )];
    }
    Vec::new()
}

fn touches_git_hooks(raw: &str) -> bool {
    let normalized: Vec<&str> = Path::new(raw)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    normalized
        .windows(2)
        .any(|w| w[0] == ".git" && w[1] == "hooks")
}
