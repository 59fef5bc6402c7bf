// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layered authentication for the hybrid adapter.
//!
//! Mirrors the unconfigured → (basic|oauth) → token-valid →
//! (token-refreshing → token-valid) state machine: at most one refresh is
//! ever in flight because [`AuthCoordinator::ensure_fresh`] does its check
//! and its refresh under the same [`tokio::sync::Mutex`] guard, so
//! concurrent callers simply queue on the lock and re-observe fresh state
//! once the first holder publishes it — the same single-flight shape as
//! [`CancellationToken`]'s `Notify`-based waiters elsewhere in this
//! workspace, applied to a value instead of a boolean flag.

use dms_error::SandboxError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// The skew applied before a token's wall-clock expiry at which point it is
/// considered due for refresh.
const REFRESH_SKEW: Duration = Duration::from_secs(60);

const DEFAULT_BASIC_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_OAUTH_TOKEN_TTL: Duration = Duration::from_secs(20 * 60);

/// Which credential method produced the currently held bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Acquired via username/password against the modern token endpoint.
    Basic,
    /// Acquired via client-credentials against the oauth endpoint.
    OAuth,
}

#[derive(Debug, Clone)]
struct Token {
    value: String,
    source: TokenSource,
    expires_at: Instant,
}

impl Token {
    fn is_fresh(&self) -> bool {
        Instant::now() + REFRESH_SKEW < self.expires_at
    }
}

/// Static credential material. `basic_auth_header` is built once at
/// construction and never logged or `Debug`-formatted.
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Credentials {
    /// `Err` if neither basic nor oauth credentials are present — a
    /// construction-time failure per the adapter's auth contract.
    pub fn validate(&self) -> Result<(), SandboxError> {
        let has_basic = self.username.is_some() && self.password.is_some();
        let has_oauth = self.client_id.is_some() && self.client_secret.is_some();
        if has_basic || has_oauth {
            Ok(())
        } else {
            Err(SandboxError::auth_failure(
                "at least one of username/password or clientId/clientSecret must be configured",
            ))
        }
    }

    fn has_basic(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// The HTTP Basic auth header value, built once. Never logged: callers
    /// must not pass this to a tracing field.
    pub fn basic_auth_header(&self) -> Option<String> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let (user, pass) = (self.username.as_ref()?, self.password.as_ref()?);
        Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))))
    }
}

/// Where to send credentials to mint a fresh token.
pub struct TokenEndpoints {
    /// Modern-dialect token endpoint, used by the basic-credential path.
    pub basic_token_url: Option<String>,
    /// OAuth token endpoint, used by the client-credentials path.
    pub oauth_token_url: Option<String>,
}

/// Coordinates token acquisition and refresh across concurrent callers.
///
/// A request failing with an unauthorized status, or a token whose
/// remaining life is under [`REFRESH_SKEW`], triggers exactly one refresh;
/// everyone else awaiting [`Self::ensure_fresh`] observes the same fresh
/// token once it publishes.
pub struct AuthCoordinator {
    http: reqwest::Client,
    credentials: Credentials,
    endpoints: TokenEndpoints,
    current: Mutex<Option<Token>>,
}

impl AuthCoordinator {
    /// Construct a coordinator. Fails if neither credential method is
    /// configured.
    pub fn new(
        http: reqwest::Client,
        credentials: Credentials,
        endpoints: TokenEndpoints,
    ) -> Result<Self, SandboxError> {
        credentials.validate()?;
        Ok(Self {
            http,
            credentials,
            endpoints,
            current: Mutex::new(None),
        })
    }

    /// The basic-auth header, if username+password are configured. Never
    /// logged.
    pub fn basic_auth_header(&self) -> Option<String> {
        self.credentials.basic_auth_header()
    }

    /// The credential method that produced the currently cached token, if
    /// any. Exposed for diagnostics; header selection itself does not
    /// depend on it (classic prefers basic auth outright, modern always
    /// uses bearer).
    pub async fn current_source(&self) -> Option<TokenSource> {
        self.current.lock().await.as_ref().map(|t| t.source)
    }

    /// Force the next call to [`Self::ensure_fresh`] to re-acquire a token,
    /// e.g. after a request failed with an unauthorized status.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }

    /// Returns a bearer token, acquiring or refreshing one if necessary.
    ///
    /// The entire check-then-refresh sequence runs under one lock
    /// acquisition, so only the first caller to observe a stale token
    /// performs the network round-trip; later callers queued on the same
    /// lock see the freshly published token and return immediately.
    pub async fn ensure_fresh(&self) -> Result<String, SandboxError> {
        let mut guard = self.current.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_fresh() {
                return Ok(token.value.clone());
            }
        }
        tracing::debug!("auth: acquiring fresh token");
        let token = self.acquire().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn acquire(&self) -> Result<Token, SandboxError> {
        // Preference: bearer-from-basic is tried first when available.
        if self.credentials.has_basic() {
            if let Some(url) = &self.endpoints.basic_token_url {
                match self.acquire_basic(url).await {
                    Ok(token) => return Ok(token),
                    Err(err) => {
                        tracing::warn!(error = %err, "auth: basic token acquisition failed, trying oauth");
                    }
                }
            }
        }
        if let Some(url) = &self.endpoints.oauth_token_url {
            return self.acquire_oauth(url).await;
        }
        Err(SandboxError::auth_failure(
            "no credential method produced a usable token",
        ))
    }

    async fn acquire_basic(&self, url: &str) -> Result<Token, SandboxError> {
        let header = self
            .credentials
            .basic_auth_header()
            .ok_or_else(|| SandboxError::auth_failure("basic credentials not configured"))?;
        #[derive(serde::Deserialize)]
        struct BasicTokenResponse {
            token: String,
            #[serde(default)]
            expires_in_seconds: Option<u64>,
        }
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, header)
            .send()
            .await
            .map_err(|e| SandboxError::auth_failure(format!("basic token request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(SandboxError::auth_failure(format!(
                "basic token endpoint returned {}",
                resp.status()
            )));
        }
        let body: BasicTokenResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::auth_failure(format!("malformed token response: {e}")))?;
        let ttl = body
            .expires_in_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BASIC_TOKEN_TTL);
        Ok(Token {
            value: body.token,
            source: TokenSource::Basic,
            expires_at: Instant::now() + ttl,
        })
    }

    async fn acquire_oauth(&self, url: &str) -> Result<Token, SandboxError> {
        let client_id = self
            .credentials
            .client_id
            .clone()
            .ok_or_else(|| SandboxError::auth_failure("oauth client_id not configured"))?;
        let client_secret = self
            .credentials
            .client_secret
            .clone()
            .ok_or_else(|| SandboxError::auth_failure("oauth client_secret not configured"))?;
        #[derive(serde::Deserialize)]
        struct OAuthTokenResponse {
            access_token: String,
            #[serde(default)]
            expires_in: Option<u64>,
        }
        let resp = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &client_id),
                ("client_secret", &client_secret),
            ])
            .send()
            .await
            .map_err(|e| SandboxError::auth_failure(format!("oauth token request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(SandboxError::auth_failure(format!(
                "oauth token endpoint returned {}",
                resp.status()
            )));
        }
        let body: OAuthTokenResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::auth_failure(format!("malformed oauth response: {e}")))?;
        let ttl = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_OAUTH_TOKEN_TTL);
        Ok(Token {
            value: body.access_token,
            source: TokenSource::OAuth,
            expires_at: Instant::now() + ttl,
        })
    }
}
