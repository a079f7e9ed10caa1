//! Actions proposed by the planner and the identifiers that tie them to
//! agents and sandboxes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an agent session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a proposed action.
    ActionId
);
uuid_id!(
    /// Identifier of a sandbox instance.
    SandboxId
);

/// The closed set of side effects a planner may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Run a shell command line
    Shell,
    /// Write a file inside the sandbox volume
    FileWrite,
    /// Delete a file inside the sandbox volume
    FileDelete,
    /// Fetch a URL
    NetworkFetch,
    /// Install a package from a registry
    PackageInstall,
}

impl ActionKind {
    /// Every action kind.
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Shell,
        ActionKind::FileWrite,
        ActionKind::FileDelete,
        ActionKind::NetworkFetch,
        ActionKind::PackageInstall,
    ];

    /// The snake_case name used in configuration and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Shell => "shell",
            ActionKind::FileWrite => "file_write",
            ActionKind::FileDelete => "file_delete",
            ActionKind::NetworkFetch => "network_fetch",
            ActionKind::PackageInstall => "package_install",
        }
    }

    /// Whether the action touches the sandbox filesystem directly.
    pub fn is_file_op(&self) -> bool {
        matches!(self, ActionKind::FileWrite | ActionKind::FileDelete)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown action kind: {s}"))
    }
}

/// Planner-supplied hints. Hints can only raise the risk class of an action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskHints {
    /// The action needs elevated privileges or writes outside the workspace
    #[serde(default)]
    pub privileged: bool,
    /// The planner itself considers the action destructive
    #[serde(default)]
    pub destructive: bool,
}

/// A single side-effecting operation proposed by the planner.
///
/// Fields are private: once built an action is never modified, so a verdict
/// computed for it stays valid for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    id: ActionId,
    agent_id: AgentId,
    kind: ActionKind,
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    risk_hints: RiskHints,
}

impl Action {
    /// Start building an action.
    ///
    /// `payload` is the command line for `Shell`, the relative path for file
    /// actions, the URL for `NetworkFetch` and the package spec(s) for
    /// `PackageInstall`.
    pub fn builder(
        agent_id: impl Into<AgentId>,
        kind: ActionKind,
        payload: impl Into<String>,
    ) -> ActionBuilder {
        ActionBuilder {
            agent_id: agent_id.into(),
            kind,
            payload: payload.into(),
            content: None,
            rationale: String::new(),
            risk_hints: RiskHints::default(),
        }
    }

    /// Shorthand for an action without content, rationale or hints.
    pub fn new(agent_id: impl Into<AgentId>, kind: ActionKind, payload: impl Into<String>) -> Self {
        Self::builder(agent_id, kind, payload).build()
    }

    /// Action identifier.
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Proposing agent.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Kind of side effect.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Kind-specific payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// File body for `FileWrite`.
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// The planner's stated reason for the action.
    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    /// Planner-supplied risk hints.
    pub fn risk_hints(&self) -> RiskHints {
        self.risk_hints
    }
}

/// Builder for [`Action`].
#[derive(Debug, Clone)]
pub struct ActionBuilder {
    agent_id: AgentId,
    kind: ActionKind,
    payload: String,
    content: Option<String>,
    rationale: String,
    risk_hints: RiskHints,
}

impl ActionBuilder {
    /// Set the file body (used by `FileWrite`).
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set the rationale.
    pub fn rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// Set risk hints.
    pub fn risk_hints(mut self, hints: RiskHints) -> Self {
        self.risk_hints = hints;
        self
    }

    /// Freeze the action and assign it an identifier.
    pub fn build(self) -> Action {
        Action {
            id: ActionId::new(),
            agent_id: self.agent_id,
            kind: self.kind,
            payload: self.payload,
            content: self.content,
            rationale: self.rationale,
            risk_hints: self.risk_hints,
        }
    }
}

/// Risk classes used by the safety policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Reads, builds, scratch writes
    NonDestructive,
    /// Deletes and privileged writes
    Destructive,
}

/// Per-kind risk classification table.
///
/// Unset entries fall back to the built-in classes: `file_delete` is
/// destructive, everything else is not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskTable {
    shell: Option<RiskClass>,
    file_write: Option<RiskClass>,
    file_delete: Option<RiskClass>,
    network_fetch: Option<RiskClass>,
    package_install: Option<RiskClass>,
}

impl RiskTable {
    /// Table with only the built-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the class of one kind.
    pub fn with(mut self, kind: ActionKind, class: RiskClass) -> Self {
        *self.slot(kind) = Some(class);
        self
    }

    fn slot(&mut self, kind: ActionKind) -> &mut Option<RiskClass> {
        match kind {
            ActionKind::Shell => &mut self.shell,
            ActionKind::FileWrite => &mut self.file_write,
            ActionKind::FileDelete => &mut self.file_delete,
            ActionKind::NetworkFetch => &mut self.network_fetch,
            ActionKind::PackageInstall => &mut self.package_install,
        }
    }

    /// Class of an action kind, before hints.
    pub fn class_of(&self, kind: ActionKind) -> RiskClass {
        let configured = match kind {
            ActionKind::Shell => self.shell,
            ActionKind::FileWrite => self.file_write,
            ActionKind::FileDelete => self.file_delete,
            ActionKind::NetworkFetch => self.network_fetch,
            ActionKind::PackageInstall => self.package_install,
        };
        configured.unwrap_or(match kind {
            ActionKind::FileDelete => RiskClass::Destructive,
            ActionKind::Shell
            | ActionKind::FileWrite
            | ActionKind::NetworkFetch
            | ActionKind::PackageInstall => RiskClass::NonDestructive,
        })
    }

    /// Class of a concrete action. Hints raise, never lower.
    pub fn classify(&self, action: &Action) -> RiskClass {
        let hints = action.risk_hints();
        if hints.privileged || hints.destructive {
            return RiskClass::Destructive;
        }
        self.class_of(action.kind())
    }
}
