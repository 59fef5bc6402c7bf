// SPDX-License-Identifier: MIT OR Apache-2.0
//! The two-phase plan/apply controller.
//!
//! [`Runtime::execute`] is the single public entry point: it builds the
//! per-execution budget tracker, diff recorder, and mediating proxy, runs
//! the script through [`dms_sandbox::run_script`], then inspects the
//! resulting diff to decide whether an approval token needs minting or
//! consuming. The approval store and adapter are process-wide and held by
//! the [`Runtime`] itself; everything else is fresh per call.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dms_adapter::Adapter;
use dms_approval::{ApprovalTokenStore, PlannedOperation};
use dms_budget::{BudgetLimits, BudgetTracker};
use dms_config::SandboxConfig;
use dms_diff::{DiffEntry, DiffRecorder, ExecutionMetrics};
pub use dms_proxy::Mode;
use dms_proxy::MediatingProxy;
use dms_sandbox::{LogEntry, LogLevel, Outcome, RunResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A request to run one script against the sandboxed device-management
/// surface.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// ECMAScript source to evaluate.
    pub code: String,
    /// Plan or apply.
    pub mode: Mode,
    /// Capability strings the caller has been granted (e.g. `"read:*"`,
    /// `"command:policies"`).
    pub capabilities: Vec<String>,
    /// An approval token presented for an apply run, if any.
    pub approval: Option<Uuid>,
}

/// An approval token minted at the end of a run that recorded one or more
/// blocked command-classified operations, together with the operations it
/// authorizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequired {
    /// Token to present on a subsequent apply run.
    pub token: Uuid,
    /// The operations this token will authorize.
    pub operations: Vec<PlannedOperation>,
}

/// The outcome of one [`Runtime::execute`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `false` if the script threw, timed out, or otherwise failed to
    /// return normally.
    pub success: bool,
    /// The mode the run was executed in.
    pub mode: Mode,
    /// The script's return value, present only when `success` is `true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// The ordered trail of mediated operations, executed and blocked.
    pub diff: Vec<DiffEntry>,
    /// Structured log lines emitted by the script via `log`/`warn`/`err`,
    /// plus (on a thrown exception) a synthetic error-level entry carrying
    /// the thrown message.
    pub logs: Vec<LogEntry>,
    /// Aggregate call counts and wall-clock duration.
    pub metrics: ExecutionMetrics,
    /// Present when this run recorded command-class operations still
    /// waiting on approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_required: Option<ApprovalRequired>,
}

/// Owns the process-wide state (the approval token store and the adapter)
/// and exposes [`Runtime::execute`] as the single entry point for running
/// scripts against it.
#[derive(Clone)]
pub struct Runtime {
    adapter: Arc<dyn Adapter>,
    approvals: ApprovalTokenStore,
    config: SandboxConfig,
}

impl Runtime {
    /// Construct a runtime over `adapter`, configured by `config`.
    ///
    /// Spawns the approval store's background reaper task, so this must be
    /// called from within a running Tokio runtime.
    #[must_use]
    pub fn new(adapter: Arc<dyn Adapter>, config: SandboxConfig) -> Self {
        Self {
            adapter,
            approvals: ApprovalTokenStore::new(),
            config,
        }
    }

    /// The approval token store backing this runtime, exposed for hosts
    /// that need to inspect or pre-seed it (e.g. tests).
    #[must_use]
    pub fn approvals(&self) -> &ApprovalTokenStore {
        &self.approvals
    }

    /// Run one script end to end: build fresh per-execution state, invoke
    /// the sandbox, then reconcile the recorded diff against the approval
    /// store.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        let budget = Arc::new(BudgetTracker::new(BudgetLimits::from(&self.config)));
        let diff = Arc::new(DiffRecorder::new());
        let proxy = Arc::new(MediatingProxy::new(
            Arc::clone(&self.adapter),
            Arc::clone(&budget),
            Arc::clone(&diff),
            self.approvals.clone(),
            request.capabilities,
            request.mode,
            request.approval,
        ));

        let timeout = Duration::from_millis(self.config.execution_timeout_ms);
        let start = Instant::now();
        let run = dms_sandbox::run_script(Arc::clone(&proxy), request.code, timeout).await;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let entries = diff.entries();
        let metrics = diff.metrics(budget.snapshot(), duration_ms);

        let (outcome, mut logs) = match run {
            Ok(RunResult { outcome, logs }) => (outcome, logs),
            Err(reason) => {
                tracing::error!(error = %reason, "execution failed before producing a result");
                return ExecutionResult {
                    success: false,
                    mode: request.mode,
                    return_value: None,
                    diff: entries,
                    logs: vec![LogEntry {
                        level: LogLevel::Error,
                        message: reason.to_string(),
                        fields: Vec::new(),
                    }],
                    metrics,
                    approval_required: None,
                };
            }
        };

        let (success, return_value) = match outcome {
            Outcome::Returned(value) => (true, Some(value)),
            Outcome::Thrown(message) => {
                tracing::warn!(message = %message, "script raised an uncaught exception");
                logs.push(LogEntry {
                    level: LogLevel::Error,
                    message,
                    fields: Vec::new(),
                });
                (false, None)
            }
        };

        let approval_required = if success {
            self.reconcile_approvals(request.mode, request.approval, &diff).await
        } else {
            None
        };

        ExecutionResult {
            success,
            mode: request.mode,
            return_value,
            diff: entries,
            logs,
            metrics,
            approval_required,
        }
    }

    /// After a normal (non-exceptional) return, mint a token for any
    /// freshly blocked command-class operations, or consume the presented
    /// token if this apply run executed commands under it.
    async fn reconcile_approvals(
        &self,
        mode: Mode,
        presented_token: Option<Uuid>,
        diff: &DiffRecorder,
    ) -> Option<ApprovalRequired> {
        match mode {
            Mode::Plan => self.mint_if_blocked(diff),
            Mode::Apply => match presented_token {
                Some(token) => {
                    let executed_a_command = diff
                        .entries()
                        .iter()
                        .any(|e| !e.blocked && e.action == dms_catalog::Classification::Command);
                    if executed_a_command {
                        self.approvals.delete(&token);
                    }
                    None
                }
                None => self.mint_if_blocked(diff),
            },
        }
    }

    fn mint_if_blocked(&self, diff: &DiffRecorder) -> Option<ApprovalRequired> {
        let blocked = diff.blocked_commands();
        if blocked.is_empty() {
            return None;
        }
        let operations = blocked
            .into_iter()
            .map(|entry| PlannedOperation {
                method: entry.method,
                args: entry.args,
            })
            .collect::<Vec<_>>();
        let ttl = Duration::from_secs(self.config.approval_ttl_seconds);
        let token = self.approvals.put(operations.clone(), ttl);
        Some(ApprovalRequired { token, operations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dms_adapter::MockAdapter;
    use serde_json::json;

    fn runtime(adapter: MockAdapter) -> Runtime {
        Runtime::new(Arc::new(adapter), SandboxConfig::default())
    }

    fn plan(code: &str, capabilities: Vec<&str>) -> ExecuteRequest {
        ExecuteRequest {
            code: code.to_string(),
            mode: Mode::Plan,
            capabilities: capabilities.into_iter().map(String::from).collect(),
            approval: None,
        }
    }

    fn apply(code: &str, capabilities: Vec<&str>, approval: Option<Uuid>) -> ExecuteRequest {
        ExecuteRequest {
            code: code.to_string(),
            mode: Mode::Apply,
            capabilities: capabilities.into_iter().map(String::from).collect(),
            approval,
        }
    }

    #[tokio::test]
    async fn read_executes_and_is_recorded() {
        let rt = runtime(MockAdapter::new().on("listComputers", json!([{"id": "1"}, {"id": "2"}])));
        let result = rt
            .execute(plan(
                "return client.listComputers({})",
                vec!["read:*"],
            ))
            .await;
        assert!(result.success);
        assert_eq!(result.return_value, Some(json!([{"id": "1"}, {"id": "2"}])));
        assert_eq!(result.metrics.reads, 1);
        assert_eq!(result.diff.len(), 1);
        assert!(!result.diff[0].blocked);
        assert!(result.approval_required.is_none());
    }

    #[tokio::test]
    async fn plan_mode_blocks_write_and_reports_the_sentinel() {
        let rt = runtime(MockAdapter::new());
        let result = rt
            .execute(plan(
                "return client.createPolicy({name: 'X'})",
                vec!["write:*"],
            ))
            .await;
        assert!(result.success);
        let value = result.return_value.expect("plan-blocked write returns a sentinel");
        assert_eq!(value["blocked"], json!(true));
        assert_eq!(value["method"], json!("createPolicy"));
        assert_eq!(value["classification"], json!("write"));
        assert_eq!(result.diff.len(), 1);
        assert!(result.diff[0].blocked);
        assert!(result.approval_required.is_none());
    }

    #[tokio::test]
    async fn missing_capability_is_denied_and_adapter_is_untouched() {
        let adapter = MockAdapter::new().on("listComputers", json!([]));
        let rt = runtime(adapter);
        let result = rt
            .execute(plan("return client.listComputers({})", vec!["read:policies"]))
            .await;
        assert!(!result.success);
        assert!(result
            .logs
            .iter()
            .any(|l| l.message.to_lowercase().contains("access_denied")
                || l.message.to_lowercase().contains("access denied")));
        assert!(result.diff.is_empty());
    }

    #[tokio::test]
    async fn budget_exhaustion_stops_further_reads() {
        let adapter = MockAdapter::new().on("listComputers", json!([]));
        let mut config = SandboxConfig::default();
        config.read_budget = 2;
        let rt = Runtime::new(Arc::new(adapter), config);
        let code = r#"
            client.listComputers({});
            client.listComputers({});
            return client.listComputers({});
        "#;
        let result = rt.execute(plan(code, vec!["read:*"])).await;
        assert!(!result.success);
        assert_eq!(result.diff.len(), 2);
        assert!(result.diff.iter().all(|e| !e.blocked));
        assert!(result
            .logs
            .iter()
            .any(|l| l.message.to_lowercase().contains("budget")));
    }

    #[tokio::test]
    async fn plan_then_apply_with_approval_executes_the_command_once() {
        let adapter = MockAdapter::new().on("executePolicy", json!({"status": "ok"}));
        let rt = runtime(adapter);

        let planned = rt
            .execute(plan(
                "return client.executePolicy({id: 1})",
                vec!["command:*"],
            ))
            .await;
        assert!(planned.success);
        let approval = planned.approval_required.expect("command class must require approval");
        assert_eq!(approval.operations.len(), 1);
        assert_eq!(approval.operations[0].method, "executePolicy");

        let applied = rt
            .execute(apply(
                "return client.executePolicy({id: 1})",
                vec!["command:*"],
                Some(approval.token),
            ))
            .await;
        assert!(applied.success);
        assert_eq!(applied.return_value, Some(json!({"status": "ok"})));
        assert!(applied.diff.iter().any(|e| !e.blocked && e.method == "executePolicy"));

        let reused = rt
            .execute(apply(
                "return client.executePolicy({id: 1})",
                vec!["command:*"],
                Some(approval.token),
            ))
            .await;
        assert!(!reused.success, "a single-use token must not authorize a second run");
    }

    #[tokio::test]
    async fn apply_without_a_token_mints_one_instead_of_executing() {
        let rt = runtime(MockAdapter::new());
        let result = rt
            .execute(apply(
                "return client.executePolicy({id: 1})",
                vec!["command:*"],
                None,
            ))
            .await;
        assert!(result.success);
        assert!(result.approval_required.is_some());
        assert!(result.diff.iter().all(|e| e.blocked));
    }

    #[tokio::test]
    async fn expired_token_is_rejected_on_apply() {
        let rt = runtime(MockAdapter::new());
        let token = rt.approvals().put(
            vec![PlannedOperation {
                method: "executePolicy".to_string(),
                args: json!({"id": 1}),
            }],
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = rt
            .execute(apply(
                "return client.executePolicy({id: 1})",
                vec!["command:*"],
                Some(token),
            ))
            .await;
        assert!(!result.success);
        assert!(result
            .logs
            .iter()
            .any(|l| l.message.to_lowercase().contains("expired")
                || l.message.to_lowercase().contains("invalid_approval")));
    }

    #[tokio::test]
    async fn script_cannot_see_host_primitives() {
        let rt = runtime(MockAdapter::new());
        let code = "return typeof require + \"/\" + typeof fetch + \"/\" + typeof process";
        let result = rt.execute(plan(code, vec!["read:*"])).await;
        assert!(result.success);
        assert_eq!(result.return_value, Some(json!("undefined/undefined/undefined")));
    }
}
