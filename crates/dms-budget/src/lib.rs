// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-execution budget tracking for read/write/command operation counts.
//!
//! A [`BudgetTracker`] is constructed fresh for every [`execute`] call
//! (`dms_runtime::execute`) and discarded at result construction — budgets
//! are never shared between invocations.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dms_catalog::Classification;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Per-execution caps for each classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Maximum read-classified calls.
    pub reads: u32,
    /// Maximum write-classified calls.
    pub writes: u32,
    /// Maximum command-classified calls.
    pub commands: u32,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            reads: 500,
            writes: 50,
            commands: 20,
        }
    }
}

impl From<&dms_config::SandboxConfig> for BudgetLimits {
    fn from(config: &dms_config::SandboxConfig) -> Self {
        Self {
            reads: config.read_budget,
            writes: config.write_budget,
            commands: config.command_budget,
        }
    }
}

/// Outcome of [`BudgetTracker::track_call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackResult {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Present when `allowed` is `false`.
    pub reason: Option<String>,
}

/// Point-in-time snapshot of the three counters, used for
/// `ExecutionMetrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// Read-classified calls counted so far.
    pub reads: u32,
    /// Write-classified calls counted so far.
    pub writes: u32,
    /// Command-classified calls counted so far.
    pub commands: u32,
}

/// A per-execution budget tracker: three independent atomic counters with
/// hard caps.
#[derive(Debug)]
pub struct BudgetTracker {
    limits: BudgetLimits,
    reads: AtomicU32,
    writes: AtomicU32,
    commands: AtomicU32,
}

impl BudgetTracker {
    /// Create a tracker with the given caps, all counters at zero.
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            commands: AtomicU32::new(0),
        }
    }

    /// Resolve `name`'s classification via the catalog, increment the
    /// matching counter, and report whether the call may proceed.
    ///
    /// The counter is incremented *before* the cap comparison; if the
    /// post-increment value exceeds the cap, the counter is frozen at the
    /// cap (not rolled back) and `allowed: false` is returned.
    ///
    /// Methods absent from the catalog are not this tracker's concern —
    /// the mediating proxy's visibility check runs first, so `track_call`
    /// is only ever reached for catalogued methods. Given an unclassified
    /// name, it is treated as always-allowed and uncounted.
    pub fn track_call(&self, name: &str) -> TrackResult {
        let Some(classification) = dms_policy::get_classification(name) else {
            return TrackResult {
                allowed: true,
                reason: None,
            };
        };
        self.track_classification(classification)
    }

    /// Like [`Self::track_call`] but takes an already-resolved
    /// classification, avoiding a second catalog lookup when the caller
    /// has already looked the entry up.
    pub fn track_classification(&self, classification: Classification) -> TrackResult {
        let (counter, cap, label) = match classification {
            Classification::Read => (&self.reads, self.limits.reads, "reads"),
            Classification::Write => (&self.writes, self.limits.writes, "writes"),
            Classification::Command => (&self.commands, self.limits.commands, "commands"),
        };

        let mut result = TrackResult {
            allowed: true,
            reason: None,
        };
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current >= cap {
                    result = TrackResult {
                        allowed: false,
                        reason: Some(format!("{label} budget of {cap} exceeded")),
                    };
                    None
                } else {
                    Some(current + 1)
                }
            })
            .ok();

        if !result.allowed {
            tracing::warn!(classification = %classification, cap, "budget exceeded");
        }
        result
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            commands: self.commands.load(Ordering::SeqCst),
        }
    }

    /// The caps this tracker enforces.
    #[must_use]
    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }
}
