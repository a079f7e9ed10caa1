//! Arbitration between concurrently running agents.
//!
//! The [`SwarmIsolationGuard`] owns the global sandbox capacity, hands out
//! lease tokens in arrival order, keeps each leased sandbox private to its
//! holder, and trips a lineage-wide kill switch when violations pile up.

mod guard;

use serde::Serialize;

use crate::action::AgentId;

pub use guard::{SandboxLeaseToken, SwarmIsolationGuard};

/// Why a lineage was shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// Validator denies reached the configured threshold
    RepeatedDenies,
    /// A sandbox leased to one agent was touched by another
    IsolationBreach,
}

/// A lineage kill-switch trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageTrip {
    /// Top-most ancestor of the offending agent
    pub root: AgentId,
    /// Every session that was forced to `AskFirst`, root first
    pub family: Vec<AgentId>,
    /// What tripped it
    pub reason: TripReason,
}
