// SPDX-License-Identifier: MIT OR Apache-2.0
//! The adapter trait boundary consumed by the mediating proxy.
//!
//! The catalog fixes which method names exist and what they're called, but
//! the proxy does not assume a source language with member-access
//! interception: it dispatches by name through a single typed call site.
//! Any object that honours catalogued names is an acceptable
//! [`Adapter`] — a real REST client in production, a [`MockAdapter`] in
//! tests.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use dms_error::SandboxError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// The set of named async operations the mediating proxy forwards
/// catalogued calls to.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Invoke `method` with `args`, returning its JSON result.
    ///
    /// `method` is always a name already confirmed present in
    /// `dms_catalog::CATALOG` by the proxy's visibility check; an adapter
    /// implementation may still return [`dms_error::ErrorCode::ApiError`]
    /// for a catalogued-but-unimplemented method.
    async fn call(&self, method: &str, args: Value) -> Result<Value, SandboxError>;
}

/// A canned, in-memory [`Adapter`] for tests and examples.
///
/// Responses are registered with [`MockAdapter::on`] ahead of time; calls to
/// unregistered methods succeed with `Value::Null` so tests that don't care
/// about a particular return value don't need to stub every call.
/// Invocations are recorded for assertions via [`MockAdapter::calls`].
#[derive(Default)]
pub struct MockAdapter {
    responses: Mutex<HashMap<String, Result<Value, String>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockAdapter {
    /// An adapter with no canned responses; every call succeeds with null.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a successful canned response for `method`.
    #[must_use]
    pub fn on(self, method: impl Into<String>, value: Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(method.into(), Ok(value));
        self
    }

    /// Register a failing canned response for `method`.
    #[must_use]
    pub fn failing(self, method: impl Into<String>, reason: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(method.into(), Err(reason.into()));
        self
    }

    /// All `(method, args)` pairs this adapter has been called with, in
    /// call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn call(&self, method: &str, args: Value) -> Result<Value, SandboxError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), args.clone()));
        tracing::debug!(method, "mock adapter invoked");

        match self.responses.lock().unwrap().get(method) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(reason)) => Err(SandboxError::api_error(reason.clone())
                .with_context("method", method)),
            None => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_returns_canned_response() {
        let adapter = MockAdapter::new().on("listComputers", json!([{"id": 1}]));
        let result = adapter.call("listComputers", json!({})).await.unwrap();
        assert_eq!(result, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn mock_returns_null_for_unregistered_method() {
        let adapter = MockAdapter::new();
        let result = adapter.call("getComputerDetails", json!({"id": 1})).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn mock_returns_configured_failure() {
        let adapter = MockAdapter::new().failing("executePolicy", "upstream unavailable");
        let err = adapter.call("executePolicy", json!({})).await.unwrap_err();
        assert!(err.message.contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn mock_records_calls_in_order() {
        let adapter = MockAdapter::new();
        adapter.call("a", json!(1)).await.unwrap();
        adapter.call("b", json!(2)).await.unwrap();
        let calls = adapter.calls();
        assert_eq!(calls[0].0, "a");
        assert_eq!(calls[1].0, "b");
    }
}
