// SPDX-License-Identifier: MIT OR Apache-2.0
//! The policy engine: pure functions over the classification catalog.
//!
//! [`check_access`], [`get_classification`], and [`requires_approval`] carry
//! no state of their own beyond [`dms_catalog::CATALOG`], so the mediating
//! proxy that calls them carries no policy knowledge — every access
//! decision is traceable to one of these three functions.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dms_catalog::{lookup, Classification};
use serde::{Deserialize, Serialize};

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the action is allowed.
    pub allowed: bool,
    /// Human-readable reason, always present on denial.
    pub reason: Option<String>,
}

impl Decision {
    /// An allowing decision with no reason attached.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denying decision carrying `reason`.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Checks whether `capabilities` permit invoking `method`.
///
/// Denies if `method` is not in the catalog, or if neither the method's
/// required capability nor its verb wildcard (`<verb>:*`) is present in
/// `capabilities`.
#[must_use]
pub fn check_access(method: &str, capabilities: &[String]) -> Decision {
    let Some(entry) = lookup(method) else {
        tracing::debug!(method, "checkAccess: method not in catalog");
        return Decision::deny(format!("method '{method}' is not in the catalog"));
    };

    if dms_catalog::capability_grants(capabilities, entry.required_capability) {
        tracing::debug!(method, capability = entry.required_capability, "checkAccess: granted");
        Decision::allow()
    } else {
        tracing::info!(
            method,
            required = entry.required_capability,
            "checkAccess: missing capability"
        );
        Decision::deny(format!(
            "capability '{}' required for '{method}'",
            entry.required_capability
        ))
    }
}

/// Returns the classification of `method`, or `None` if it is not catalogued.
#[must_use]
pub fn get_classification(method: &str) -> Option<Classification> {
    lookup(method).map(|e| e.classification)
}

/// Returns `true` if `method` requires a valid approval token to execute in
/// apply mode.
///
/// Per the mediating proxy's approval gate (which applies only to
/// command-classified calls), this is consulted only when the method's
/// classification is [`Classification::Command`]; the catalog also flags
/// destructive writes (`delete*`) as `needs_approval`, but the apply-mode
/// token gate does not block those — they are recorded and executed like
/// any other write, consistent with the plan-mode block already having
/// surfaced them to the caller for review.
#[must_use]
pub fn requires_approval(method: &str) -> bool {
    lookup(method)
        .map(|e| e.needs_approval && e.classification == Classification::Command)
        .unwrap_or(false)
}
