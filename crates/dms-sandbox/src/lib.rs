// SPDX-License-Identifier: MIT OR Apache-2.0
//! The script evaluator: runs a textual program against the mediating
//! proxy inside an embedded ECMAScript engine, in an isolated context.
//!
//! The program sees exactly four things: the proxy, bound to `client`; a
//! helper namespace of pure utilities (`paginate`, `daysSince`, `chunk`);
//! logging sinks (`log`, `warn`, `err`); and the engine's own built-ins
//! (collections, `Math`, `Date`, `JSON`, `encodeURIComponent` and friends).
//! Network primitives, the filesystem, subprocess spawning, dynamic module
//! loading, and timers are never registered, so they read as `undefined`
//! rather than being explicitly denied — there is nothing to deny.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use boa_engine::object::builtins::JsArray;
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsNativeError, JsResult, JsValue, NativeFunction, Source};
use dms_error::SandboxError;
use dms_proxy::MediatingProxy;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Severity of a captured log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// `log(...)`.
    Info,
    /// `warn(...)`.
    Warn,
    /// `err(...)`.
    Error,
}

/// One line captured from the script's logging sinks.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Severity the script logged at.
    pub level: LogLevel,
    /// The logged message (first argument, stringified).
    pub message: String,
    /// Any further arguments, stringified and joined, empty if none.
    pub fields: Vec<String>,
}

/// How a run concluded.
#[derive(Debug)]
pub enum Outcome {
    /// The wrapped program body returned normally.
    Returned(Value),
    /// The program threw an uncaught exception.
    Thrown(String),
}

/// Result of one script run: its outcome plus whatever it logged.
#[derive(Debug)]
pub struct RunResult {
    /// How the run concluded.
    pub outcome: Outcome,
    /// Captured `log`/`warn`/`err` lines, in call order.
    pub logs: Vec<LogEntry>,
}

const HELPER_PREAMBLE: &str = r#"
"use strict";
// globalThis is a normal ECMAScript built-in, not a host addition, so it
// must be removed explicitly to satisfy the no-escape-hatch isolation
// property; every other identifier (Date, JSON, chunk, ...) still
// resolves through the global environment record, which this does not
// touch.
Reflect.deleteProperty(globalThis, "globalThis");

function chunk(array, size) {
    if (!Array.isArray(array) || !Number.isInteger(size) || size <= 0) {
        return [];
    }
    const out = [];
    for (let i = 0; i < array.length; i += size) {
        out.push(array.slice(i, i + size));
    }
    return out;
}

function daysSince(isoDateString) {
    const then = new Date(isoDateString).getTime();
    if (Number.isNaN(then)) {
        return null;
    }
    const now = Date.now();
    return Math.floor((now - then) / 86400000);
}

function paginate(fetchPage, pageSize) {
    const pageLimit = Number.isInteger(pageSize) && pageSize > 0 ? pageSize : 100;
    const all = [];
    let page = 0;
    while (true) {
        const items = fetchPage(page, pageLimit);
        if (!Array.isArray(items) || items.length === 0) {
            break;
        }
        for (const item of items) {
            all.push(item);
        }
        if (items.length < pageLimit) {
            break;
        }
        page += 1;
    }
    return all;
}
"#;

/// Run `code` against `proxy` inside a fresh, isolated evaluation context,
/// enforcing a wall-clock timeout.
///
/// The engine itself is built, populated, and torn down entirely on a
/// dedicated blocking thread, since `boa_engine::Context` holds
/// non-`Send` garbage-collected state; `client.<method>(args)` calls block
/// that thread only, bridging back into async code via
/// [`tokio::runtime::Handle::block_on`] so the mediating proxy's pipeline
/// (capability, budget, plan/approval gating) runs exactly as it would for
/// any other caller. On timeout the evaluation thread is abandoned rather
/// than interrupted — any diff entries and logs already recorded through
/// `proxy` before the deadline are unaffected, since both live in `Arc`s
/// owned independently of the thread.
pub async fn run_script(
    proxy: Arc<MediatingProxy>,
    code: String,
    timeout: Duration,
) -> Result<RunResult, SandboxError> {
    let handle = tokio::runtime::Handle::current();
    let join = tokio::task::spawn_blocking(move || evaluate(proxy, &code, handle));

    match tokio::time::timeout(timeout, join).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SandboxError::script_error(format!(
            "evaluator thread panicked: {join_err}"
        ))),
        Err(_) => Err(SandboxError::sandbox_timeout(format!(
            "script exceeded {}ms wall-clock timeout",
            timeout.as_millis()
        ))),
    }
}

fn evaluate(
    proxy: Arc<MediatingProxy>,
    code: &str,
    handle: tokio::runtime::Handle,
) -> Result<RunResult, SandboxError> {
    let logs = Arc::new(Mutex::new(Vec::new()));
    let mut context = Context::default();

    register_log_sinks(&mut context, &logs)
        .map_err(|e| SandboxError::script_error(format!("failed to initialize logging sinks: {e}")))?;
    register_client(&mut context, proxy, handle)
        .map_err(|e| SandboxError::script_error(format!("failed to initialize client binding: {e}")))?;

    context
        .eval(Source::from_bytes(HELPER_PREAMBLE))
        .map_err(|e| SandboxError::script_error(format!("failed to initialize helpers: {e}")))?;

    let wrapped = format!("\"use strict\";\n(function() {{\n{code}\n}})();");
    let outcome = match context.eval(Source::from_bytes(&wrapped)) {
        Ok(value) => Outcome::Returned(js_to_json(&value, &mut context)),
        Err(err) => Outcome::Thrown(err.to_string()),
    };

    let logs = Arc::try_unwrap(logs)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();
    Ok(RunResult { outcome, logs })
}

fn register_log_sinks(context: &mut Context, logs: &Arc<Mutex<Vec<LogEntry>>>) -> JsResult<()> {
    for (name, level) in [
        ("log", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("err", LogLevel::Error),
    ] {
        let logs = Arc::clone(logs);
        let function = FunctionObjectBuilder::new(
            context.realm(),
            NativeFunction::from_closure(move |_this, args, ctx| {
                let message = args
                    .first()
                    .map(|v| stringify_for_log(v, ctx))
                    .unwrap_or_default();
                let fields = args
                    .iter()
                    .skip(1)
                    .map(|v| stringify_for_log(v, ctx))
                    .collect::<Vec<_>>();
                logs.lock()
                    .unwrap()
                    .push(LogEntry { level, message, fields });
                Ok(JsValue::undefined())
            }),
        )
        .name(name)
        .build();
        context.register_global_property(js_string!(name), function, Attribute::all())?;
    }
    Ok(())
}

fn stringify_for_log(value: &JsValue, context: &mut Context) -> String {
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| "<unstringifiable>".to_string())
}

/// Build a `client` global object with one forwarding method per catalog
/// entry. Each method blocks the evaluation thread on
/// [`MediatingProxy::invoke`], converting the JSON result (or error) back
/// into a JS value.
///
/// Names outside [`dms_catalog::CATALOG`] are never registered, so they
/// are simply `undefined` on `client` — there is no dispatch table to
/// consult, matching the proxy's own visibility rule.
fn register_client(context: &mut Context, proxy: Arc<MediatingProxy>, handle: tokio::runtime::Handle) -> JsResult<()> {
    let mut builder = ObjectInitializer::new(context);
    for entry in dms_catalog::CATALOG {
        let proxy = Arc::clone(&proxy);
        let handle = handle.clone();
        let method = entry.name;
        let function = NativeFunction::from_closure(move |_this, args, ctx| {
            let json_args = args
                .iter()
                .map(|v| json_from_js(v, ctx))
                .collect::<JsResult<Vec<Value>>>()?;
            let result = handle.block_on(proxy.invoke(method, Value::Array(json_args)));
            match result {
                Ok(value) => json_to_js(&value, ctx),
                Err(err) => Err(JsNativeError::error().with_message(err.to_string()).into()),
            }
        });
        builder.function(function, js_string!(method), 1);
    }
    let client = builder.build();
    context.register_global_property(js_string!("client"), client, Attribute::all())?;
    Ok(())
}

fn json_from_js(value: &JsValue, context: &mut Context) -> JsResult<Value> {
    let json_string = context
        .global_object()
        .get(js_string!("JSON"), context)?
        .as_object()
        .expect("JSON global is always an object")
        .get(js_string!("stringify"), context)?
        .as_callable()
        .expect("JSON.stringify is always callable")
        .call(&JsValue::undefined(), &[value.clone()], context)?;
    let Some(s) = json_string.as_string() else {
        return Ok(Value::Null);
    };
    serde_json::from_str(&s.to_std_string_escaped())
        .map_err(|e| JsNativeError::typ().with_message(format!("argument is not valid JSON: {e}")).into())
}

fn json_to_js(value: &Value, context: &mut Context) -> JsResult<JsValue> {
    let text = serde_json::to_string(value)
        .map_err(|e| JsNativeError::typ().with_message(format!("result is not serializable: {e}")))?;
    let parse = context
        .global_object()
        .get(js_string!("JSON"), context)?
        .as_object()
        .expect("JSON global is always an object")
        .get(js_string!("parse"), context)?
        .as_callable()
        .expect("JSON.parse is always callable")
        .call(&JsValue::undefined(), &[js_string!(text).into()], context)?;
    Ok(parse)
}

/// Best-effort conversion of a returned JS value to [`serde_json::Value`],
/// used only for the script's top-level return value. `undefined` and
/// non-serializable values (functions, symbols) become `Value::Null`.
fn js_to_json(value: &JsValue, context: &mut Context) -> Value {
    if value.is_undefined() {
        return Value::Null;
    }
    json_from_js(value, context).unwrap_or(Value::Null)
}
