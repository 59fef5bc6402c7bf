// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the device-management
//! sandbox.
//!
//! Every error raised anywhere in this workspace — by the policy engine, the
//! budget tracker, the mediating proxy, the script evaluator, the two-phase
//! controller, or the hybrid API adapter — is a [`SandboxError`]. It carries
//! an [`ErrorCode`] (a stable, machine-readable tag), a human-readable
//! message, an optional cause chain, and arbitrary key-value context. Use the
//! constructors on [`SandboxError`] (e.g. [`SandboxError::access_denied`]) to
//! build errors fluently at the point of failure.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Capability / access-control failures.
    Access,
    /// Per-execution budget failures.
    Budget,
    /// Approval-token lifecycle failures.
    Approval,
    /// Script-evaluator failures (timeout, thrown exception).
    Sandbox,
    /// Hybrid API adapter failures (both dialects exhausted).
    Adapter,
    /// Authentication / credential failures.
    Auth,
    /// Classification catalog lookup failures.
    Catalog,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Access => "access",
            Self::Budget => "budget",
            Self::Approval => "approval",
            Self::Sandbox => "sandbox",
            Self::Adapter => "adapter",
            Self::Auth => "auth",
            Self::Catalog => "catalog",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Access --
    /// Capability not granted, or method not in the catalog.
    AccessDenied,

    // -- Budget --
    /// A per-classification execution budget was hit.
    BudgetExceeded,

    // -- Approval --
    /// Apply mode presented a missing, expired, or already-consumed token.
    InvalidApproval,

    // -- Sandbox --
    /// The script exceeded its wall-clock execution timeout.
    SandboxTimeout,
    /// An exception was thrown from within the script body.
    ScriptError,

    // -- Adapter --
    /// The hybrid adapter exhausted both REST dialects.
    ApiError,

    // -- Auth --
    /// No credential method worked after refresh.
    AuthFailure,

    // -- Catalog --
    /// The requested method name is not present in the classification catalog.
    CatalogUnknownMethod,

    // -- Config --
    /// A configuration value was invalid.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AccessDenied => ErrorCategory::Access,
            Self::BudgetExceeded => ErrorCategory::Budget,
            Self::InvalidApproval => ErrorCategory::Approval,
            Self::SandboxTimeout | Self::ScriptError => ErrorCategory::Sandbox,
            Self::ApiError => ErrorCategory::Adapter,
            Self::AuthFailure => ErrorCategory::Auth,
            Self::CatalogUnknownMethod => ErrorCategory::Catalog,
            Self::ConfigInvalid => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"ACCESS_DENIED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "ACCESS_DENIED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::InvalidApproval => "INVALID_APPROVAL",
            Self::SandboxTimeout => "SANDBOX_TIMEOUT",
            Self::ScriptError => "SCRIPT_ERROR",
            Self::ApiError => "API_ERROR",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::CatalogUnknownMethod => "CATALOG_UNKNOWN_METHOD",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SandboxError
// ---------------------------------------------------------------------------

/// Unified sandbox/adapter error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use dms_error::SandboxError;
///
/// let err = SandboxError::access_denied("method 'wipeDevice' not in capability set")
///     .with_context("method", "wipeDevice");
/// assert!(err.to_string().starts_with("[ACCESS_DENIED]"));
/// ```
pub struct SandboxError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl SandboxError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Construct an [`ErrorCode::AccessDenied`] error.
    #[must_use]
    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessDenied, reason)
    }

    /// Construct an [`ErrorCode::BudgetExceeded`] error.
    #[must_use]
    pub fn budget_exceeded(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::BudgetExceeded, reason)
    }

    /// Construct an [`ErrorCode::InvalidApproval`] error.
    #[must_use]
    pub fn invalid_approval(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidApproval, reason)
    }

    /// Construct an [`ErrorCode::SandboxTimeout`] error.
    #[must_use]
    pub fn sandbox_timeout(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::SandboxTimeout, reason)
    }

    /// Construct an [`ErrorCode::ScriptError`] error.
    #[must_use]
    pub fn script_error(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ScriptError, reason)
    }

    /// Construct an [`ErrorCode::ApiError`] error.
    #[must_use]
    pub fn api_error(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiError, reason)
    }

    /// Construct an [`ErrorCode::AuthFailure`] error.
    #[must_use]
    pub fn auth_failure(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthFailure, reason)
    }

    /// Construct an [`ErrorCode::CatalogUnknownMethod`] error.
    #[must_use]
    pub fn catalog_unknown_method(method: impl Into<String>) -> Self {
        let method = method.into();
        Self::new(
            ErrorCode::CatalogUnknownMethod,
            format!("method '{method}' is not in the classification catalog"),
        )
        .with_context("method", method)
    }

    /// Construct an [`ErrorCode::ConfigInvalid`] error.
    #[must_use]
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalid, reason)
    }
}

impl fmt::Debug for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SandboxError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SandboxError>;

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`SandboxError`] (without the opaque source).
///
/// This is what ends up in `ExecutionResult.logs` and in any wire
/// representation — the source chain is collapsed to a string because
/// trait objects are not `Serialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&SandboxError> for SandboxErrorDto {
    fn from(err: &SandboxError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<SandboxErrorDto> for SandboxError {
    fn from(dto: SandboxErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::AccessDenied,
        ErrorCode::BudgetExceeded,
        ErrorCode::InvalidApproval,
        ErrorCode::SandboxTimeout,
        ErrorCode::ScriptError,
        ErrorCode::ApiError,
        ErrorCode::AuthFailure,
        ErrorCode::CatalogUnknownMethod,
        ErrorCode::ConfigInvalid,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = SandboxError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = SandboxError::access_denied("no such capability");
        assert_eq!(err.to_string(), "[ACCESS_DENIED] no such capability");
    }

    #[test]
    fn display_with_context() {
        let err = SandboxError::budget_exceeded("reads cap hit").with_context("cap", 500);
        let s = err.to_string();
        assert!(s.starts_with("[BUDGET_EXCEEDED] reads cap hit"));
        assert!(s.contains("cap"));
        assert!(s.contains("500"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "token missing");
        let err = SandboxError::invalid_approval("no such token").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("token missing"));
    }

    #[test]
    fn catalog_unknown_method_sets_context() {
        let err = SandboxError::catalog_unknown_method("deleteEverything");
        assert_eq!(err.code, ErrorCode::CatalogUnknownMethod);
        assert_eq!(
            err.context["method"],
            serde_json::json!("deleteEverything")
        );
        assert!(err.message.contains("deleteEverything"));
    }

    #[test]
    fn category_mapping() {
        assert_eq!(ErrorCode::AccessDenied.category(), ErrorCategory::Access);
        assert_eq!(ErrorCode::BudgetExceeded.category(), ErrorCategory::Budget);
        assert_eq!(
            ErrorCode::InvalidApproval.category(),
            ErrorCategory::Approval
        );
        assert_eq!(ErrorCode::SandboxTimeout.category(), ErrorCategory::Sandbox);
        assert_eq!(ErrorCode::ScriptError.category(), ErrorCategory::Sandbox);
        assert_eq!(ErrorCode::ApiError.category(), ErrorCategory::Adapter);
        assert_eq!(ErrorCode::AuthFailure.category(), ErrorCategory::Auth);
        assert_eq!(
            ErrorCode::CatalogUnknownMethod.category(),
            ErrorCategory::Catalog
        );
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::Internal);
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()));
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = SandboxError::new(ErrorCode::Internal, "wrap").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = SandboxError::access_denied("denied").with_context("method", "wipeDevice");
        let dto: SandboxErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: SandboxErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = SandboxError::api_error("adapter failed").with_source(src);
        let dto: SandboxErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let json = serde_json::to_string(&ErrorCode::InvalidApproval).unwrap();
        assert_eq!(json, r#""INVALID_APPROVAL""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::InvalidApproval);
    }

    #[test]
    fn error_category_display() {
        assert_eq!(ErrorCategory::Access.to_string(), "access");
        assert_eq!(ErrorCategory::Internal.to_string(), "internal");
    }
}
