//! Append-only audit trail.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::machine::ActionState;
use crate::action::{Action, ActionId, ActionKind, AgentId};
use crate::policy::{Decision, SafetyLevel};
use crate::redact::scrub_secrets;
use crate::sandbox::ExecutionResult;
use crate::validator::ValidationVerdict;

/// Why an action did or did not run, as recorded for auditors.
///
/// `RiskAccepted` and `RiskAbsent` are kept apart: the first ran although the
/// validator warned, the second ran on a clean verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDisposition {
    /// Ran unattended on a clean verdict
    RiskAbsent,
    /// Ran unattended at `yolo` despite a warning
    RiskAccepted,
    /// A human approved this action
    HumanApproved,
    /// Covered by an earlier "approve for this session"
    SessionApproved,
    /// Refused by the validator, the policy or a human
    Rejected,
    /// Cancelled before or during the run
    Cancelled,
    /// The sandbox could not be provided
    Failed,
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the action reached its terminal state
    pub recorded_at: DateTime<Utc>,
    /// Action identifier
    pub action_id: ActionId,
    /// Proposing agent
    pub agent_id: AgentId,
    /// Action kind
    pub kind: ActionKind,
    /// Payload with credentials redacted
    pub payload: String,
    /// Validator verdict
    pub verdict: ValidationVerdict,
    /// Policy decision, if the action got that far
    pub decision: Option<Decision>,
    /// Level the decision was taken at
    pub level: Option<SafetyLevel>,
    /// Why it ran or not
    pub disposition: AuditDisposition,
    /// States the action passed through
    pub path: Vec<ActionState>,
    /// Final result, with captured output redacted
    pub result: ExecutionResult,
}

impl AuditRecord {
    pub(crate) fn new(
        action: &Action,
        verdict: &ValidationVerdict,
        decision: Option<(Decision, SafetyLevel)>,
        disposition: AuditDisposition,
        path: Vec<ActionState>,
        result: &ExecutionResult,
    ) -> Self {
        let mut result = result.clone();
        result.stdout = scrub_secrets(&result.stdout).into_owned();
        result.stderr = scrub_secrets(&result.stderr).into_owned();
        Self {
            recorded_at: Utc::now(),
            action_id: action.id(),
            agent_id: action.agent_id().clone(),
            kind: action.kind(),
            payload: scrub_secrets(action.payload()).into_owned(),
            verdict: verdict.clone(),
            decision: decision.map(|(d, _)| d),
            level: decision.map(|(_, l)| l),
            disposition,
            path,
            result,
        }
    }
}

/// Receives one record per terminal action. Recording never fails the action.
pub trait AuditSink: Send + Sync {
    /// Append a record.
    fn record(&self, record: &AuditRecord);
}

/// Writes records as `tracing` events under the `palisade::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "palisade::audit",
            action_id = %record.action_id,
            agent_id = %record.agent_id,
            kind = %record.kind,
            payload = %record.payload,
            verdict = ?record.verdict.outcome,
            decision = ?record.decision,
            level = ?record.level,
            disposition = ?record.disposition,
            status = ?record.result.status,
            exit_code = ?record.result.exit_code,
            reasons = ?record.result.reasons,
            "action audited"
        );
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record so far, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Appends one JSON object per line to a file.
///
/// Write failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) {
        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(action_id = %record.action_id, error = %e, "Failed to encode audit record");
                return;
            }
        };
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(path = %self.path.display(), error = %e, "Failed to append audit record");
        }
    }
}

impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    fn record(&self, record: &AuditRecord) {
        (**self).record(record);
    }
}
