// SPDX-License-Identifier: MIT OR Apache-2.0
//! The mediating proxy: wraps an [`Adapter`] and exposes exactly the
//! methods named in the classification catalog.
//!
//! Every intercepted call runs through an ordered pipeline — visibility,
//! capability, budget, plan-mode gate, approval gate, execute — grounded on
//! the same shape as a tool-invocation preflight: resolve, authorize,
//! gate, then dispatch. A proxy is single-use per execution: it owns
//! shared handles to the per-execution budget tracker and diff recorder
//! (plus the process-wide approval store and adapter), so reusing one
//! across executions would mix their accounting. Ownership is via `Arc`
//! rather than borrows so a proxy can be captured whole by the script
//! evaluator's host-function closures, which must be `'static`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dms_adapter::Adapter;
use dms_approval::ApprovalTokenStore;
use dms_budget::BudgetTracker;
use dms_catalog::{lookup, Classification};
use dms_diff::DiffRecorder;
use dms_error::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Plan vs apply execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Non-read operations are blocked and recorded, not executed.
    Plan,
    /// All operations execute, subject to approval-token presentation for
    /// command-classified calls.
    Apply,
}

/// The mediating proxy for a single execution.
#[derive(Clone)]
pub struct MediatingProxy {
    adapter: Arc<dyn Adapter>,
    budget: Arc<BudgetTracker>,
    diff: Arc<DiffRecorder>,
    approvals: ApprovalTokenStore,
    capabilities: Vec<String>,
    mode: Mode,
    approval_token: Option<Uuid>,
}

impl MediatingProxy {
    /// Construct a proxy for one execution.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn Adapter>,
        budget: Arc<BudgetTracker>,
        diff: Arc<DiffRecorder>,
        approvals: ApprovalTokenStore,
        capabilities: Vec<String>,
        mode: Mode,
        approval_token: Option<Uuid>,
    ) -> Self {
        Self {
            adapter,
            budget,
            diff,
            approvals,
            capabilities,
            mode,
            approval_token,
        }
    }

    /// Invoke `method` with `args` through the full mediation pipeline.
    ///
    /// Returns `Ok` both for a real execution result and for a blocked-call
    /// sentinel object (`{"blocked": true, ...}`) — the script is expected
    /// to branch on the sentinel's shape. Returns `Err` for capability,
    /// budget, and approval failures, and for adapter-level failures, all
    /// of which the script may catch.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value, SandboxError> {
        // 1. Visibility: names outside the catalog do not exist for the
        // script. There is no member-access interception to special-case
        // here (see the dispatch-table design note) — an unknown name is
        // simply denied.
        let Some(entry) = lookup(method) else {
            tracing::info!(method, "proxy: method not in catalog");
            return Err(SandboxError::access_denied(format!(
                "method '{method}' is not in the catalog"
            ))
            .with_context("method", method));
        };
        let classification = entry.classification;

        // 2. Capability check.
        let access = dms_policy::check_access(method, &self.capabilities);
        if !access.allowed {
            return Err(SandboxError::access_denied(
                access.reason.unwrap_or_else(|| "access denied".to_string()),
            )
            .with_context("method", method));
        }

        // 3. Budget check.
        let budget_result = self.budget.track_classification(classification);
        if !budget_result.allowed {
            return Err(SandboxError::budget_exceeded(
                budget_result.reason.unwrap_or_else(|| "budget exceeded".to_string()),
            )
            .with_context("method", method));
        }

        // 4. Plan-mode gating: reads always proceed; everything else is
        // blocked and recorded.
        if classification != Classification::Read && self.mode == Mode::Plan {
            self.diff.record_blocked(classification, method, args.clone(), false);
            tracing::info!(method, %classification, "plan mode: blocked");
            return Ok(json!({
                "blocked": true,
                "method": method,
                "args": args,
                "classification": classification.as_str(),
            }));
        }

        // 5. Apply-mode approval gating (command-classified calls only).
        if self.mode == Mode::Apply
            && classification == Classification::Command
            && dms_policy::requires_approval(method)
        {
            match self.approval_token {
                None => {
                    self.diff
                        .record_blocked(classification, method, args.clone(), true);
                    tracing::info!(method, "apply mode: missing approval token");
                    return Ok(json!({
                        "blocked": true,
                        "requiresApproval": true,
                        "method": method,
                        "args": args,
                    }));
                }
                Some(token) => {
                    if let Err(reason) = self.approvals.validate(&token) {
                        tracing::warn!(method, %token, %reason, "apply mode: invalid approval token");
                        return Err(SandboxError::invalid_approval(reason.to_string())
                            .with_context("method", method));
                    }
                    // Valid: fall through to execute. The controller
                    // consumes the token once, at the end of the run.
                }
            }
        }

        // 6. Execute.
        tracing::debug!(method, %classification, "dispatching to adapter");
        match self.adapter.call(method, args.clone()).await {
            Ok(result) => {
                self.diff
                    .record(classification, method, args, Some(result.clone()));
                Ok(result)
            }
            Err(err) => {
                self.diff.record(classification, method, args, None);
                tracing::error!(method, error = %err, "adapter call failed");
                Err(err)
            }
        }
    }

    /// The approval token, if any, this proxy was constructed with.
    #[must_use]
    pub fn approval_token(&self) -> Option<Uuid> {
        self.approval_token
    }

    /// The approval token store backing this proxy's approval gate.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalTokenStore {
        &self.approvals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dms_adapter::MockAdapter;
    use dms_budget::BudgetLimits;

    fn harness(
        adapter: MockAdapter,
        budget: BudgetTracker,
        diff: Arc<DiffRecorder>,
        approvals: ApprovalTokenStore,
        capabilities: Vec<&str>,
        mode: Mode,
        token: Option<Uuid>,
    ) -> (MediatingProxy, Arc<MockAdapter>) {
        let adapter = Arc::new(adapter);
        let proxy = MediatingProxy::new(
            adapter.clone() as Arc<dyn Adapter>,
            Arc::new(budget),
            diff,
            approvals,
            capabilities.into_iter().map(String::from).collect(),
            mode,
            token,
        );
        (proxy, adapter)
    }

    #[tokio::test]
    async fn unknown_method_is_access_denied() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, _adapter) = harness(
            MockAdapter::new(),
            BudgetTracker::new(BudgetLimits::default()),
            diff.clone(),
            ApprovalTokenStore::new(),
            vec!["read:*"],
            Mode::Apply,
            None,
        );
        let err = proxy.invoke("deleteEverything", json!({})).await.unwrap_err();
        assert!(err.message.contains("not in the catalog"));
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn missing_capability_is_access_denied() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, _adapter) = harness(
            MockAdapter::new(),
            BudgetTracker::new(BudgetLimits::default()),
            diff,
            ApprovalTokenStore::new(),
            vec![],
            Mode::Apply,
            None,
        );
        let err = proxy.invoke("listComputers", json!({})).await.unwrap_err();
        assert_eq!(err.code, dms_error::ErrorCode::AccessDenied);
    }

    #[tokio::test]
    async fn budget_exceeded_is_reported() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, _adapter) = harness(
            MockAdapter::new(),
            BudgetTracker::new(BudgetLimits { reads: 0, writes: 50, commands: 20 }),
            diff.clone(),
            ApprovalTokenStore::new(),
            vec!["read:*"],
            Mode::Apply,
            None,
        );
        let err = proxy.invoke("listComputers", json!({})).await.unwrap_err();
        assert_eq!(err.code, dms_error::ErrorCode::BudgetExceeded);
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn reads_execute_in_plan_mode() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, _adapter) = harness(
            MockAdapter::new().on("listComputers", json!([{"id": 1}])),
            BudgetTracker::new(BudgetLimits::default()),
            diff.clone(),
            ApprovalTokenStore::new(),
            vec!["read:*"],
            Mode::Plan,
            None,
        );
        let result = proxy.invoke("listComputers", json!({})).await.unwrap();
        assert_eq!(result, json!([{"id": 1}]));
        assert_eq!(diff.len(), 1);
        assert!(!diff.entries()[0].blocked);
    }

    #[tokio::test]
    async fn writes_are_blocked_in_plan_mode() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, adapter) = harness(
            MockAdapter::new(),
            BudgetTracker::new(BudgetLimits::default()),
            diff.clone(),
            ApprovalTokenStore::new(),
            vec!["write:*"],
            Mode::Plan,
            None,
        );
        let result = proxy.invoke("updatePolicy", json!({"id": 1})).await.unwrap();
        assert_eq!(result["blocked"], json!(true));
        assert!(adapter.calls().is_empty());
        assert!(diff.entries()[0].blocked);
    }

    #[tokio::test]
    async fn commands_are_blocked_in_plan_mode() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, adapter) = harness(
            MockAdapter::new(),
            BudgetTracker::new(BudgetLimits::default()),
            diff,
            ApprovalTokenStore::new(),
            vec!["command:*"],
            Mode::Plan,
            None,
        );
        let result = proxy.invoke("executePolicy", json!({})).await.unwrap();
        assert_eq!(result["blocked"], json!(true));
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn apply_mode_command_without_token_is_blocked_with_requires_approval() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, adapter) = harness(
            MockAdapter::new(),
            BudgetTracker::new(BudgetLimits::default()),
            diff.clone(),
            ApprovalTokenStore::new(),
            vec!["command:*"],
            Mode::Apply,
            None,
        );
        let result = proxy.invoke("executePolicy", json!({})).await.unwrap();
        assert_eq!(result["requiresApproval"], json!(true));
        assert!(adapter.calls().is_empty());
        assert!(diff.entries()[0].requires_approval);
    }

    #[tokio::test]
    async fn apply_mode_command_with_invalid_token_fails() {
        let diff = Arc::new(DiffRecorder::new());
        let bogus = Uuid::new_v4();
        let (proxy, _adapter) = harness(
            MockAdapter::new(),
            BudgetTracker::new(BudgetLimits::default()),
            diff,
            ApprovalTokenStore::new(),
            vec!["command:*"],
            Mode::Apply,
            Some(bogus),
        );
        let err = proxy.invoke("executePolicy", json!({})).await.unwrap_err();
        assert_eq!(err.code, dms_error::ErrorCode::InvalidApproval);
    }

    #[tokio::test]
    async fn apply_mode_command_with_valid_token_executes() {
        let diff = Arc::new(DiffRecorder::new());
        let approvals = ApprovalTokenStore::new();
        let token = approvals.put(
            vec![dms_approval::PlannedOperation {
                method: "executePolicy".to_string(),
                args: json!({}),
            }],
            std::time::Duration::from_secs(300),
        );
        let (proxy, adapter) = harness(
            MockAdapter::new().on("executePolicy", json!({"status": "ok"})),
            BudgetTracker::new(BudgetLimits::default()),
            diff,
            approvals,
            vec!["command:*"],
            Mode::Apply,
            Some(token),
        );
        let result = proxy.invoke("executePolicy", json!({})).await.unwrap();
        assert_eq!(result, json!({"status": "ok"}));
        assert_eq!(adapter.calls().len(), 1);
    }

    #[tokio::test]
    async fn adapter_error_propagates_and_is_recorded() {
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, _adapter) = harness(
            MockAdapter::new().failing("listComputers", "upstream down"),
            BudgetTracker::new(BudgetLimits::default()),
            diff.clone(),
            ApprovalTokenStore::new(),
            vec!["read:*"],
            Mode::Apply,
            None,
        );
        let err = proxy.invoke("listComputers", json!({})).await.unwrap_err();
        assert_eq!(err.code, dms_error::ErrorCode::ApiError);
        assert_eq!(diff.len(), 1);
        assert!(diff.entries()[0].result.is_none());
    }

    #[tokio::test]
    async fn apply_mode_write_executes_without_approval() {
        // Writes flagged needs_approval (e.g. deletePolicy) are not gated
        // by the approval-token check, which fires only for commands.
        let diff = Arc::new(DiffRecorder::new());
        let (proxy, _adapter) = harness(
            MockAdapter::new().on("deletePolicy", json!({"deleted": true})),
            BudgetTracker::new(BudgetLimits::default()),
            diff,
            ApprovalTokenStore::new(),
            vec!["write:*"],
            Mode::Apply,
            None,
        );
        let result = proxy.invoke("deletePolicy", json!({"id": 1})).await.unwrap();
        assert_eq!(result, json!({"deleted": true}));
    }
}
