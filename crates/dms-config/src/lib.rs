// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed configuration for the device-management sandbox.
//!
//! [`SandboxConfig`] is assembled from documented defaults, optionally
//! overlaid with a TOML file, and then overlaid again with environment
//! variables (`DMS_*`). [`validate_config`] turns soft issues into
//! [`ConfigWarning`]s and hard issues into a [`ConfigError`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dms_error::{ErrorCode, SandboxError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors and warnings
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// A numeric environment override could not be parsed.
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvValue {
        /// Environment variable name.
        var: String,
        /// Parse failure detail.
        reason: String,
    },
    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

impl From<ConfigError> for SandboxError {
    fn from(err: ConfigError) -> Self {
        SandboxError::new(ErrorCode::ConfigInvalid, err.to_string())
    }
}

/// Advisory-level configuration issues that do not prevent startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The execution timeout is unusually large.
    LargeExecutionTimeout {
        /// Configured timeout in milliseconds.
        ms: u64,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// Neither basic nor oauth credentials are configured.
    NoAdapterCredentials,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeExecutionTimeout { ms } => {
                write!(f, "execution timeout is unusually large ({ms}ms)")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::NoAdapterCredentials => {
                write!(f, "no adapter credentials configured (basic or oauth)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// Typed runtime configuration for the sandbox and its adapter.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock timeout for a single script run, in milliseconds.
    pub execution_timeout_ms: u64,
    /// Per-execution cap on read-classified operations.
    pub read_budget: u32,
    /// Per-execution cap on write-classified operations.
    pub write_budget: u32,
    /// Per-execution cap on command-classified operations.
    pub command_budget: u32,
    /// Lifetime of minted approval tokens, in seconds.
    pub approval_ttl_seconds: u64,
    /// Maximum number of entries in the adapter's LRU cache.
    pub cache_max_entries: usize,
    /// TTL of adapter cache entries, in milliseconds.
    pub cache_ttl_ms: u64,
    /// Whether the adapter validates upstream TLS certificates.
    pub reject_unauthorized_tls: bool,
    /// Tracing verbosity (`"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`).
    pub log_level: String,
    /// Base URL for the classic (form/XML) REST dialect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classic_base_url: Option<String>,
    /// Base URL for the modern (JSON) REST dialect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modern_base_url: Option<String>,
    /// Basic-auth username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic-auth password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// OAuth client id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// OAuth client secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 30_000,
            read_budget: 500,
            write_budget: 50,
            command_budget: 20,
            approval_ttl_seconds: 300,
            cache_max_entries: 200,
            cache_ttl_ms: 60_000,
            reject_unauthorized_tls: true,
            log_level: "info".into(),
            classic_base_url: None,
            modern_base_url: None,
            username: None,
            password: None,
            client_id: None,
            client_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 300_000;
const MAX_TIMEOUT_MS: u64 = 3_600_000;
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`SandboxConfig`] from an optional TOML file path, then apply
/// environment variable overrides.
pub fn load_config(path: Option<&Path>) -> Result<SandboxConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => SandboxConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Parse a TOML string into a [`SandboxConfig`].
pub fn parse_toml(content: &str) -> Result<SandboxConfig, ConfigError> {
    toml::from_str::<SandboxConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply `DMS_*` environment variable overrides in place.
///
/// Recognised variables: `DMS_EXECUTION_TIMEOUT_MS`, `DMS_READ_BUDGET`,
/// `DMS_WRITE_BUDGET`, `DMS_COMMAND_BUDGET`, `DMS_APPROVAL_TTL_SECONDS`,
/// `DMS_CACHE_MAX_ENTRIES`, `DMS_CACHE_TTL_MS`,
/// `DMS_REJECT_UNAUTHORIZED_TLS`, `DMS_LOG_LEVEL` (or `RUST_LOG`),
/// `DMS_CLASSIC_BASE_URL`, `DMS_MODERN_BASE_URL`, `DMS_USERNAME`,
/// `DMS_PASSWORD`, `DMS_CLIENT_ID`, `DMS_CLIENT_SECRET`.
pub fn apply_env_overrides(config: &mut SandboxConfig) -> Result<(), ConfigError> {
    set_u64(&mut config.execution_timeout_ms, "DMS_EXECUTION_TIMEOUT_MS")?;
    set_u32(&mut config.read_budget, "DMS_READ_BUDGET")?;
    set_u32(&mut config.write_budget, "DMS_WRITE_BUDGET")?;
    set_u32(&mut config.command_budget, "DMS_COMMAND_BUDGET")?;
    set_u64(&mut config.approval_ttl_seconds, "DMS_APPROVAL_TTL_SECONDS")?;
    set_usize(&mut config.cache_max_entries, "DMS_CACHE_MAX_ENTRIES")?;
    set_u64(&mut config.cache_ttl_ms, "DMS_CACHE_TTL_MS")?;
    set_bool(
        &mut config.reject_unauthorized_tls,
        "DMS_REJECT_UNAUTHORIZED_TLS",
    )?;

    if let Ok(val) = std::env::var("DMS_LOG_LEVEL") {
        config.log_level = val;
    } else if let Ok(val) = std::env::var("RUST_LOG") {
        config.log_level = val;
    }

    if let Ok(val) = std::env::var("DMS_CLASSIC_BASE_URL") {
        config.classic_base_url = Some(val);
    }
    if let Ok(val) = std::env::var("DMS_MODERN_BASE_URL") {
        config.modern_base_url = Some(val);
    }
    if let Ok(val) = std::env::var("DMS_USERNAME") {
        config.username = Some(val);
    }
    if let Ok(val) = std::env::var("DMS_PASSWORD") {
        config.password = Some(val);
    }
    if let Ok(val) = std::env::var("DMS_CLIENT_ID") {
        config.client_id = Some(val);
    }
    if let Ok(val) = std::env::var("DMS_CLIENT_SECRET") {
        config.client_secret = Some(val);
    }
    Ok(())
}

fn set_u64(field: &mut u64, var: &str) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(var) {
        *field = val.parse().map_err(|_| ConfigError::InvalidEnvValue {
            var: var.to_string(),
            reason: format!("'{val}' is not a valid u64"),
        })?;
    }
    Ok(())
}

fn set_u32(field: &mut u32, var: &str) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(var) {
        *field = val.parse().map_err(|_| ConfigError::InvalidEnvValue {
            var: var.to_string(),
            reason: format!("'{val}' is not a valid u32"),
        })?;
    }
    Ok(())
}

fn set_usize(field: &mut usize, var: &str) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(var) {
        *field = val.parse().map_err(|_| ConfigError::InvalidEnvValue {
            var: var.to_string(),
            reason: format!("'{val}' is not a valid usize"),
        })?;
    }
    Ok(())
}

fn set_bool(field: &mut bool, var: &str) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(var) {
        *field = val.parse().map_err(|_| ConfigError::InvalidEnvValue {
            var: var.to_string(),
            reason: format!("'{val}' is not a valid bool"),
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a loaded configuration, returning advisory warnings.
///
/// Hard errors (zero TTLs/budgets, unrecognised log level, out-of-range
/// timeout) come back as a [`ConfigError::ValidationError`]; soft issues
/// come back as warnings.
pub fn validate_config(config: &SandboxConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", config.log_level));
    }

    if config.execution_timeout_ms == 0 {
        errors.push("execution_timeout_ms must be greater than zero".into());
    } else if config.execution_timeout_ms > MAX_TIMEOUT_MS {
        errors.push(format!(
            "execution_timeout_ms {} exceeds maximum {MAX_TIMEOUT_MS}",
            config.execution_timeout_ms
        ));
    } else if config.execution_timeout_ms > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeExecutionTimeout {
            ms: config.execution_timeout_ms,
        });
    }

    if config.approval_ttl_seconds == 0 {
        errors.push("approval_ttl_seconds must be greater than zero".into());
    }
    if config.cache_ttl_ms == 0 {
        errors.push("cache_ttl_ms must be greater than zero".into());
    }
    if config.read_budget == 0 {
        errors.push("read_budget must be greater than zero".into());
    }
    if config.write_budget == 0 {
        errors.push("write_budget must be greater than zero".into());
    }
    if config.command_budget == 0 {
        errors.push("command_budget must be greater than zero".into());
    }
    if config.cache_max_entries == 0 {
        errors.push("cache_max_entries must be greater than zero".into());
    }

    if config.username.is_none()
        && config.password.is_none()
        && config.client_id.is_none()
        && config.client_secret.is_none()
    {
        warnings.push(ConfigWarning::NoAdapterCredentials);
    }
    if config.classic_base_url.is_none() && config.modern_base_url.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "classic_base_url / modern_base_url".into(),
            hint: "the hybrid adapter needs at least one dialect base URL".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.execution_timeout_ms, 30_000);
        assert_eq!(cfg.read_budget, 500);
        assert_eq!(cfg.write_budget, 50);
        assert_eq!(cfg.command_budget, 20);
        assert_eq!(cfg.approval_ttl_seconds, 300);
        assert_eq!(cfg.cache_max_entries, 200);
        assert_eq!(cfg.cache_ttl_ms, 60_000);
        assert!(cfg.reject_unauthorized_tls);
    }

    #[test]
    fn default_config_is_valid_with_warnings() {
        let cfg = SandboxConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        assert!(warnings.contains(&ConfigWarning::NoAdapterCredentials));
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml = r#"
            read_budget = 100
            log_level = "debug"
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.read_budget, 100);
        assert_eq!(cfg.log_level, "debug");
        // Unspecified fields keep their serde(default) value.
        assert_eq!(cfg.write_budget, 50);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("not [ valid =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let cfg = SandboxConfig {
            log_level: "verbose".into(),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_budgets() {
        let cfg = SandboxConfig {
            read_budget: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("read_budget")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_zero_approval_ttl() {
        let cfg = SandboxConfig {
            approval_ttl_seconds: 0,
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn validation_catches_timeout_exceeding_max() {
        let cfg = SandboxConfig {
            execution_timeout_ms: MAX_TIMEOUT_MS + 1,
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn large_timeout_produces_warning_not_error() {
        let cfg = SandboxConfig {
            execution_timeout_ms: LARGE_TIMEOUT_THRESHOLD_MS + 1,
            username: Some("u".into()),
            classic_base_url: Some("https://example.com".into()),
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::LargeExecutionTimeout { .. }))
        );
    }

    #[test]
    fn env_overrides_numeric_fields() {
        let mut cfg = SandboxConfig::default();
        std::env::set_var("DMS_READ_BUDGET", "12");
        std::env::set_var("DMS_COMMAND_BUDGET", "3");
        let result = apply_env_overrides(&mut cfg);
        std::env::remove_var("DMS_READ_BUDGET");
        std::env::remove_var("DMS_COMMAND_BUDGET");
        result.unwrap();
        assert_eq!(cfg.read_budget, 12);
        assert_eq!(cfg.command_budget, 3);
    }

    #[test]
    fn env_override_rejects_non_numeric() {
        let mut cfg = SandboxConfig::default();
        std::env::set_var("DMS_READ_BUDGET", "not-a-number");
        let result = apply_env_overrides(&mut cfg);
        std::env::remove_var("DMS_READ_BUDGET");
        assert!(matches!(result, Err(ConfigError::InvalidEnvValue { .. })));
    }

    #[test]
    fn env_override_log_level_prefers_dms_specific() {
        let mut cfg = SandboxConfig::default();
        std::env::set_var("RUST_LOG", "trace");
        std::env::set_var("DMS_LOG_LEVEL", "warn");
        apply_env_overrides(&mut cfg).unwrap();
        std::env::remove_var("RUST_LOG");
        std::env::remove_var("DMS_LOG_LEVEL");
        assert_eq!(cfg.log_level, "warn");
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "read_budget = 7\nlog_level = \"warn\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.read_budget, 7);
        assert_eq!(cfg.log_level, "warn");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/sandbox.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.execution_timeout_ms, 30_000);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = SandboxConfig {
            classic_base_url: Some("https://classic.example.com".into()),
            modern_base_url: Some("https://modern.example.com".into()),
            ..Default::default()
        };
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: SandboxConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::LargeExecutionTimeout { ms: 500_000 };
        assert!(w.to_string().contains("500000"));
        let w = ConfigWarning::NoAdapterCredentials;
        assert!(w.to_string().contains("credentials"));
    }

    #[test]
    fn sandbox_error_conversion_uses_config_invalid_code() {
        let err = ConfigError::ValidationError {
            reasons: vec!["bad".into()],
        };
        let sandbox_err: SandboxError = err.into();
        assert_eq!(sandbox_err.code, ErrorCode::ConfigInvalid);
    }
}
