// SPDX-License-Identifier: MIT OR Apache-2.0
//! The diff recorder: an ordered, per-execution log of every mediated
//! operation — executed or blocked.
//!
//! Grounded in the same shape as an audit log: every call the mediating
//! proxy touches produces exactly one [`DiffEntry`], appended strictly in
//! call order. Downstream readers can reconstruct the full policy-decision
//! trail from the sequence alone.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dms_budget::BudgetSnapshot;
use dms_catalog::Classification;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One mediated operation, executed or blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Classification of the invoked method.
    pub action: Classification,
    /// Method name as invoked through the proxy.
    pub method: String,
    /// Arguments, stored by value.
    pub args: serde_json::Value,
    /// Result, when the call executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// `true` when the call was blocked (plan-mode gate or missing approval)
    /// rather than executed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    /// Present only on a blocked command-classified call that is waiting
    /// on an approval token.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_approval: bool,
}

/// Aggregate counts and timing for one execution, derived from the diff and
/// wall-clock duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Read-classified calls counted by the budget tracker (a call that
    /// passed the capability and budget gates; plan mode never blocks
    /// reads, so this is also the number actually executed).
    pub reads: u32,
    /// Write-classified calls counted by the budget tracker, including
    /// ones blocked by the plan-mode gate after the budget check ran.
    pub writes: u32,
    /// Command-classified calls counted by the budget tracker, including
    /// ones blocked by the plan-mode or approval gate after the budget
    /// check ran.
    pub commands: u32,
    /// Wall-clock duration of the execution, in milliseconds.
    pub duration_ms: u64,
}

/// Per-execution, append-only recorder of [`DiffEntry`] values.
///
/// Constructed fresh for every execution and owned by the two-phase
/// controller; discarded at result construction.
#[derive(Debug, Default)]
pub struct DiffRecorder {
    entries: Mutex<Vec<DiffEntry>>,
}

impl DiffRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an executed entry.
    pub fn record(
        &self,
        action: Classification,
        method: impl Into<String>,
        args: serde_json::Value,
        result: Option<serde_json::Value>,
    ) {
        let method = method.into();
        tracing::info!(method = %method, classification = %action, blocked = false, "mediated call executed");
        self.entries.lock().unwrap().push(DiffEntry {
            action,
            method,
            args,
            result,
            blocked: false,
            requires_approval: false,
        });
    }

    /// Append a blocked entry (plan-mode gate, or apply-mode without an
    /// approval token).
    pub fn record_blocked(
        &self,
        action: Classification,
        method: impl Into<String>,
        args: serde_json::Value,
        requires_approval: bool,
    ) {
        let method = method.into();
        tracing::info!(method = %method, classification = %action, blocked = true, requires_approval, "mediated call blocked");
        self.entries.lock().unwrap().push(DiffEntry {
            action,
            method,
            args,
            result: None,
            blocked: true,
            requires_approval,
        });
    }

    /// The recorded sequence, in call order.
    #[must_use]
    pub fn entries(&self) -> Vec<DiffEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of entries recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// `true` if no entries have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Derive [`ExecutionMetrics`] from `snapshot` and the given wall-clock
    /// duration. Counts come from the budget tracker rather than the diff
    /// directly, since it is the authoritative source of attempted-call
    /// counts per classification — including plan-mode entries that were
    /// blocked after already passing the budget check.
    #[must_use]
    pub fn metrics(&self, snapshot: BudgetSnapshot, duration_ms: u64) -> ExecutionMetrics {
        ExecutionMetrics {
            reads: snapshot.reads,
            writes: snapshot.writes,
            commands: snapshot.commands,
            duration_ms,
        }
    }

    /// All entries with `action == Command` that were recorded as blocked.
    #[must_use]
    pub fn blocked_commands(&self) -> Vec<DiffEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.blocked && e.action == Classification::Command)
            .cloned()
            .collect()
    }
}
