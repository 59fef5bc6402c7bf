// SPDX-License-Identifier: MIT OR Apache-2.0
//! A hybrid REST adapter speaking two dialects of the same device-management
//! API: a classic form-encoded surface and a modern JSON surface.
//!
//! [`HybridAdapter`] implements [`dms_adapter::Adapter`] by:
//! - preferring the modern dialect when a base URL for it is configured,
//!   falling back to the classic dialect on a dialect-unsupported response;
//! - layering authentication through [`auth::AuthCoordinator`] (basic
//!   preferred, oauth bearer as secondary, single-flight refresh);
//! - caching read-classified calls in a bounded TTL [`cache::AdapterCache`]
//!   and invalidating affected prefixes after a successful write/command;
//! - retrying transient upstream failures with [`retry`]'s backoff loop;
//! - falling back `search*` calls to a cached canonical-name lookup over the
//!   corresponding `list*` when the upstream's search endpoint itself is
//!   unavailable.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod retry;

use async_trait::async_trait;
use auth::{AuthCoordinator, Credentials, TokenEndpoints};
use cache::{cache_key, AdapterCache};
use dms_adapter::Adapter;
use dms_catalog::Classification;
use dms_config::SandboxConfig;
use dms_error::SandboxError;
use retry::RetryConfig;
use serde_json::Value;
use std::time::Duration;

/// Upstream dialect a request was dispatched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Classic,
    Modern,
}

/// The hybrid classic/modern REST adapter.
pub struct HybridAdapter {
    http: reqwest::Client,
    auth: AuthCoordinator,
    cache: AdapterCache,
    classic_base_url: Option<String>,
    modern_base_url: Option<String>,
    retry_config: RetryConfig,
}

impl HybridAdapter {
    /// Build an adapter from sandbox configuration.
    ///
    /// Fails if the configuration carries neither a base URL for either
    /// dialect, or no usable credential pair.
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        if config.classic_base_url.is_none() && config.modern_base_url.is_none() {
            return Err(SandboxError::config_invalid(
                "hybrid adapter requires classic_base_url or modern_base_url",
            ));
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.reject_unauthorized_tls)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SandboxError::api_error("failed to build http client").with_source(e))?;

        let credentials = Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        };
        let endpoints = TokenEndpoints {
            basic_token_url: config
                .classic_base_url
                .as_ref()
                .map(|base| format!("{base}/api/auth/tokens")),
            oauth_token_url: config
                .modern_base_url
                .as_ref()
                .map(|base| format!("{base}/api/oauth/token")),
        };
        let auth = AuthCoordinator::new(http.clone(), credentials, endpoints)?;

        Ok(Self {
            http,
            auth,
            cache: AdapterCache::new(config.cache_max_entries, Duration::from_millis(config.cache_ttl_ms)),
            classic_base_url: config.classic_base_url.clone(),
            modern_base_url: config.modern_base_url.clone(),
            retry_config: RetryConfig::default(),
        })
    }

    fn preferred_dialect(&self) -> Dialect {
        if self.modern_base_url.is_some() {
            Dialect::Modern
        } else {
            Dialect::Classic
        }
    }

    fn fallback_dialect(&self, primary: Dialect) -> Option<Dialect> {
        match primary {
            Dialect::Modern if self.classic_base_url.is_some() => Some(Dialect::Classic),
            Dialect::Classic if self.modern_base_url.is_some() => Some(Dialect::Modern),
            _ => None,
        }
    }

    async fn dispatch(&self, dialect: Dialect, method: &str, args: &Value) -> Result<Value, DispatchError> {
        let base = match dialect {
            Dialect::Classic => self.classic_base_url.as_ref(),
            Dialect::Modern => self.modern_base_url.as_ref(),
        }
        .expect("dispatch only called for a dialect with a configured base url");

        let url = match dialect {
            Dialect::Classic => format!("{base}/JSSResource/{method}"),
            Dialect::Modern => format!("{base}/api/v1/{method}"),
        };

        let auth_header = match dialect {
            Dialect::Classic => self
                .auth
                .basic_auth_header()
                .map(|h| (reqwest::header::AUTHORIZATION, h)),
            Dialect::Modern => {
                let token = self.auth.ensure_fresh().await.map_err(DispatchError::Sandbox)?;
                Some((reqwest::header::AUTHORIZATION, format!("Bearer {token}")))
            }
        };

        let mut builder = match dialect {
            Dialect::Classic => self.http.post(&url).form(args),
            Dialect::Modern => self.http.post(&url).json(args),
        };
        if let Some((header, value)) = auth_header {
            builder = builder.header(header, value);
        }

        let response = builder.send().await.map_err(DispatchError::Transport)?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DispatchError::Unauthorized);
        }
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NOT_IMPLEMENTED {
            return Err(DispatchError::DialectUnsupported);
        }
        if status.is_server_error() {
            return Err(DispatchError::Transient(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Sandbox(
                SandboxError::api_error(format!("upstream returned {status}")).with_context("body", body),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| DispatchError::Sandbox(SandboxError::api_error("malformed upstream response").with_source(e)))
    }

    /// Call a method against the preferred dialect, falling back to the
    /// other configured dialect on an unsupported-dialect response, and
    /// retrying transient (5xx, transport) failures with backoff. A single
    /// unauthorized response triggers a forced token refresh and one retry.
    async fn call_with_fallback(&self, method: &str, args: &Value) -> Result<Value, SandboxError> {
        let primary = self.preferred_dialect();
        match self.try_dialect_with_retry(primary, method, args).await {
            Ok(value) => Ok(value),
            Err(DispatchError::DialectUnsupported) => {
                if let Some(fallback) = self.fallback_dialect(primary) {
                    tracing::debug!(method, ?fallback, "adapter: falling back to other dialect");
                    self.try_dialect_with_retry(fallback, method, args)
                        .await
                        .map_err(|e| e.into_sandbox_error(method))
                } else {
                    Err(SandboxError::api_error(format!(
                        "method '{method}' is not supported by the configured dialect and no fallback is configured"
                    )))
                }
            }
            Err(other) => Err(other.into_sandbox_error(method)),
        }
    }

    async fn try_dialect_with_retry(&self, dialect: Dialect, method: &str, args: &Value) -> Result<Value, DispatchError> {
        let unauthorized_retried = std::sync::atomic::AtomicBool::new(false);
        retry::retry_async(
            &self.retry_config,
            || async {
                match self.dispatch(dialect, method, args).await {
                    Err(DispatchError::Unauthorized)
                        if !unauthorized_retried.swap(true, std::sync::atomic::Ordering::SeqCst) =>
                    {
                        tracing::warn!(method, "adapter: unauthorized, invalidating token and retrying once");
                        self.auth.invalidate().await;
                        Err(DispatchError::Transient(401))
                    }
                    other => other,
                }
            },
            DispatchError::is_retryable,
        )
        .await
    }

    /// Fall back a `search*` method to the cached canonical-name lookup over
    /// its corresponding `list*` entries when the direct search endpoint is
    /// unavailable. `args` is expected to carry a `"name"` field; matches are
    /// exact on the entity's `name` field.
    async fn advanced_search_fallback(&self, method: &str, args: &Value) -> Result<Value, SandboxError> {
        let list_method = method.replacen("search", "list", 1);
        let name = args.get("name").and_then(Value::as_str).unwrap_or_default();

        let all = self.call_cached(&list_method, &Value::Null).await?;
        let Value::Array(items) = all else {
            return Ok(Value::Array(Vec::new()));
        };
        let matches: Vec<Value> = items
            .into_iter()
            .filter(|item| item.get("name").and_then(Value::as_str) == Some(name))
            .collect();
        Ok(Value::Array(matches))
    }

    async fn call_cached(&self, method: &str, args: &Value) -> Result<Value, SandboxError> {
        let key = cache_key(method, args);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(method, "adapter: cache hit");
            return Ok(hit);
        }
        let value = self.call_with_fallback(method, args).await?;
        self.cache.put(key, value.clone());
        Ok(value)
    }
}

/// The script side calls `client.method(a, b, ...)` with positional
/// arguments, carried through the proxy and diff recorder as a JSON array
/// so the full tuple survives for audit. Most catalog methods take a
/// single options object (`createPolicy({name: 'X'})`); this REST layer
/// dispatches on that one value, so the first element of the tuple is what
/// reaches the request body, the cache key, and the search-fallback name
/// lookup. A bare (non-array) value is passed through unchanged for
/// callers that still invoke the adapter directly with one argument.
fn primary_arg(args: &Value) -> Value {
    match args {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
}

#[async_trait]
impl Adapter for HybridAdapter {
    async fn call(&self, method: &str, args: Value) -> Result<Value, SandboxError> {
        let entry = dms_catalog::lookup(method).ok_or_else(|| SandboxError::catalog_unknown_method(method))?;
        let primary = primary_arg(&args);

        let result = match entry.classification {
            Classification::Read => {
                let fallback_eligible = method.starts_with("search");
                match self.call_cached(method, &primary).await {
                    Ok(value) => Ok(value),
                    Err(err) if fallback_eligible => {
                        tracing::warn!(method, error = %err, "adapter: search failed, falling back to cached list + filter");
                        self.advanced_search_fallback(method, &primary).await
                    }
                    Err(err) => Err(err),
                }
            }
            Classification::Write | Classification::Command => self.call_with_fallback(method, &primary).await,
        }?;

        if !entry.invalidates.is_empty() {
            for prefix in entry.invalidates {
                self.cache.invalidate_prefix(prefix);
            }
        }

        Ok(result)
    }
}

/// Internal dispatch failure, distinguishing retryable transport/5xx
/// conditions from conditions that warrant dialect fallback or immediate
/// surfacing to the caller.
#[derive(Debug)]
enum DispatchError {
    Transport(reqwest::Error),
    Transient(u16),
    Unauthorized,
    DialectUnsupported,
    Sandbox(SandboxError),
}

impl DispatchError {
    fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transport(_) | DispatchError::Transient(_))
    }

    fn into_sandbox_error(self, method: &str) -> SandboxError {
        match self {
            DispatchError::Transport(e) => {
                SandboxError::api_error(format!("transport error calling '{method}'")).with_source(e)
            }
            DispatchError::Transient(status) => {
                SandboxError::api_error(format!("upstream returned {status} for '{method}'"))
            }
            DispatchError::Unauthorized => {
                SandboxError::auth_failure(format!("'{method}' was rejected as unauthorized after token refresh"))
            }
            DispatchError::DialectUnsupported => {
                SandboxError::api_error(format!("'{method}' is not supported by the configured dialect"))
            }
            DispatchError::Sandbox(e) => e,
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Transport(e) => write!(f, "transport error: {e}"),
            DispatchError::Transient(status) => write!(f, "transient upstream error: {status}"),
            DispatchError::Unauthorized => write!(f, "unauthorized"),
            DispatchError::DialectUnsupported => write!(f, "dialect unsupported"),
            DispatchError::Sandbox(e) => write!(f, "{e}"),
        }
    }
}

/// Re-exported for callers that want the token source an adapter most
/// recently authenticated with, e.g. for diagnostics endpoints.
pub use auth::TokenSource as AdapterTokenSource;

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SandboxConfig {
        SandboxConfig {
            classic_base_url: Some("https://classic.example.com".into()),
            modern_base_url: Some("https://modern.example.com".into()),
            username: Some("alice".into()),
            password: Some("wonderland".into()),
            ..Default::default()
        }
    }

    #[test]
    fn new_requires_a_base_url() {
        let config = SandboxConfig {
            username: Some("alice".into()),
            password: Some("wonderland".into()),
            ..Default::default()
        };
        let err = HybridAdapter::new(&config).unwrap_err();
        assert_eq!(err.code, dms_error::ErrorCode::ConfigInvalid);
    }

    #[test]
    fn new_requires_credentials() {
        let config = SandboxConfig {
            classic_base_url: Some("https://classic.example.com".into()),
            ..Default::default()
        };
        let err = HybridAdapter::new(&config).unwrap_err();
        assert_eq!(err.code, dms_error::ErrorCode::AuthFailure);
    }

    #[test]
    fn new_succeeds_with_url_and_credentials() {
        let adapter = HybridAdapter::new(&base_config()).unwrap();
        assert_eq!(adapter.preferred_dialect(), Dialect::Modern);
    }

    #[test]
    fn prefers_modern_dialect_when_both_configured() {
        let adapter = HybridAdapter::new(&base_config()).unwrap();
        assert_eq!(adapter.fallback_dialect(Dialect::Modern), Some(Dialect::Classic));
    }

    #[test]
    fn classic_only_config_has_no_fallback() {
        let config = SandboxConfig {
            classic_base_url: Some("https://classic.example.com".into()),
            username: Some("alice".into()),
            password: Some("wonderland".into()),
            ..Default::default()
        };
        let adapter = HybridAdapter::new(&config).unwrap();
        assert_eq!(adapter.preferred_dialect(), Dialect::Classic);
        assert_eq!(adapter.fallback_dialect(Dialect::Classic), None);
    }

    #[tokio::test]
    async fn call_rejects_uncatalogued_method() {
        let adapter = HybridAdapter::new(&base_config()).unwrap();
        let err = adapter.call("deleteEverything", Value::Null).await.unwrap_err();
        assert_eq!(err.code, dms_error::ErrorCode::CatalogUnknownMethod);
    }
}
