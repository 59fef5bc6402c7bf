// SPDX-License-Identifier: MIT OR Apache-2.0
//! Facade crate wiring the capability-gated script sandbox and its two-phase
//! plan/apply controller into a single entry point for embedders.
//!
//! Most of this crate's surface is a re-export of [`dms_runtime`]. The one
//! thing it adds is [`Runtime::for_config`], a convenience constructor that
//! builds the default production adapter ([`dms_adapter_hybrid::HybridAdapter`])
//! from a [`SandboxConfig`] instead of requiring callers to wire an
//! `Arc<dyn Adapter>` by hand.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dms_adapter::Adapter;
use dms_adapter_hybrid::HybridAdapter;
use dms_error::SandboxError;
use std::sync::Arc;

pub use dms_catalog::Classification;
pub use dms_config::{load_config, ConfigError, ConfigWarning, SandboxConfig};
pub use dms_runtime::{ApprovalRequired, ExecuteRequest, ExecutionResult, Mode};

/// The two-phase plan/apply controller, re-exported from [`dms_runtime`].
pub struct Runtime(dms_runtime::Runtime);

impl Runtime {
    /// Build a controller from an already-constructed adapter.
    ///
    /// Use this in tests or when embedding against something other than the
    /// hybrid REST adapter (a [`dms_adapter::MockAdapter`], for instance).
    pub fn new(adapter: Arc<dyn Adapter>, config: SandboxConfig) -> Self {
        Self(dms_runtime::Runtime::new(adapter, config))
    }

    /// Build a controller backed by the hybrid classic/modern REST adapter,
    /// constructed from `config`.
    ///
    /// Fails if `config` carries neither dialect's base URL; see
    /// [`HybridAdapter::new`].
    pub fn for_config(config: SandboxConfig) -> Result<Self, SandboxError> {
        let adapter = HybridAdapter::new(&config)?;
        Ok(Self::new(Arc::new(adapter), config))
    }

    /// Run a script to completion under the given request.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        self.0.execute(request).await
    }

    /// The process-wide approval token store backing this controller.
    pub fn approvals(&self) -> &dms_approval::ApprovalTokenStore {
        self.0.approvals()
    }
}

/// Install a [`tracing_subscriber`] global subscriber reading its filter
/// from `config.log_level`, falling back to `RUST_LOG` if set.
///
/// Call this once, near process startup. Safe to skip entirely if the
/// embedding application manages its own subscriber.
pub fn init_tracing(config: &SandboxConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub use dms_approval;

#[cfg(test)]
mod tests {
    use super::*;
    use dms_adapter::MockAdapter;
    use serde_json::json;

    #[tokio::test]
    async fn new_wraps_an_arbitrary_adapter() {
        let adapter = MockAdapter::new().on("listComputers", json!([]));
        let rt = Runtime::new(Arc::new(adapter), SandboxConfig::default());

        let result = rt
            .execute(ExecuteRequest {
                code: "return client.listComputers()".into(),
                mode: Mode::Plan,
                capabilities: vec!["read:computers".into()],
                approval: None,
            })
            .await;

        assert!(result.success);
    }

    #[test]
    fn for_config_rejects_a_config_with_no_base_url() {
        let config = SandboxConfig::default();
        let err = Runtime::for_config(config).unwrap_err();
        assert!(err.to_string().to_uppercase().contains("CONFIG_INVALID"));
    }
}
