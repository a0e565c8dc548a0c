//! Dedicated execution context per plugin
//!
//! The engine is single-threaded and non-reentrant, so every touch (load,
//! invoke, promise poll, callback re-entry) is routed through one worker
//! thread per plugin: a named OS thread running a current-thread tokio
//! runtime inside a `LocalSet`. Host callers talk to it over a command
//! channel; the single consumer makes operation ordering strict submission
//! order with no interleaving. This is the actor the design calls for, not a
//! lock around engine calls.

use std::time::Instant;

use deno_core::{v8, JsRuntime};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::adapter;
use super::dom::DomRegistry;
use super::sandbox;
use super::types::{FilterMap, SourceMetadata};
use crate::core::config::RuntimeConfig;
use crate::core::error::RuntimeError;
use crate::plugin::value;

/// The six guest operations the invocation layer can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOp {
    SearchNovels,
    PopularNovels,
    LatestNovels,
    GetNovelDetails,
    GetChapters,
    GetChapterContent,
}

impl SourceOp {
    pub(crate) fn guest_name(self) -> &'static str {
        match self {
            SourceOp::SearchNovels => "searchNovels",
            SourceOp::PopularNovels => "popularNovels",
            SourceOp::LatestNovels => "latestNovels",
            SourceOp::GetNovelDetails => "getNovelDetails",
            SourceOp::GetChapters => "getChapters",
            SourceOp::GetChapterContent => "getChapterContent",
        }
    }
}

impl std::fmt::Display for SourceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.guest_name())
    }
}

/// Commands accepted by the worker thread.
pub(crate) enum SourceCommand {
    Invoke {
        operation: SourceOp,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value, RuntimeError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) type InitResult = Result<(SourceMetadata, FilterMap), RuntimeError>;

/// Host-side entry point the worker uses to start a guest call. The slot it
/// fills is what the settlement poll reads.
pub(crate) const INVOKE_PRELUDE: &str = r#"
"use strict";
(function() {
  function describeError(e) {
    if (e === undefined || e === null) return 'unknown guest error';
    if (e instanceof Error) return e.message || String(e);
    return String(e);
  }

  globalThis.__hostCall = function(name, args) {
    const plugin = globalThis.__wrappedPlugin;
    if (!plugin) throw new Error('no plugin loaded');
    const fn = plugin[name];
    if (typeof fn !== 'function') throw new Error('plugin operation not available: ' + name);

    const slot = { state: 'pending', value: undefined, error: undefined };
    globalThis.__hostPending = slot;

    let out;
    try {
      out = fn.apply(plugin, args);
    } catch (e) {
      slot.state = 'rejected';
      slot.error = describeError(e);
      return;
    }

    if (out && typeof out.then === 'function') {
      out.then(
        (v) => { slot.state = 'resolved'; slot.value = v === undefined ? null : v; },
        (e) => { slot.state = 'rejected'; slot.error = describeError(e); }
      );
    } else {
      slot.state = 'resolved';
      slot.value = out === undefined ? null : out;
    }
  };
})();
"#;

/// Spawn the dedicated worker thread for one plugin.
///
/// The thread builds the engine, runs the load pipeline, reports the result
/// over the init channel, then serves commands until shutdown.
pub(crate) fn spawn(
    plugin_id: String,
    source: String,
    config: RuntimeConfig,
) -> Result<(mpsc::Sender<SourceCommand>, oneshot::Receiver<InitResult>), RuntimeError> {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let (init_tx, init_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name(format!("source-{plugin_id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = init_tx.send(Err(RuntimeError::EngineInit(format!(
                        "failed to build worker runtime: {e}"
                    ))));
                    return;
                }
            };
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, run_worker(plugin_id, source, config, rx, init_tx));
        })
        .map_err(|e| RuntimeError::EngineInit(format!("failed to spawn worker thread: {e}")))?;

    Ok((tx, init_rx))
}

async fn run_worker(
    plugin_id: String,
    source: String,
    config: RuntimeConfig,
    mut rx: mpsc::Receiver<SourceCommand>,
    init_tx: oneshot::Sender<InitResult>,
) {
    let mut runtime = match sandbox::build_runtime(&plugin_id, &config) {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    match adapter::load_plugin(&mut runtime, &plugin_id, &source).await {
        Ok(loaded) => {
            if init_tx.send(Ok(loaded)).is_err() {
                // Caller went away before the load finished.
                return;
            }
        }
        Err(e) => {
            error!(plugin = %plugin_id, "plugin load failed: {e}");
            let _ = init_tx.send(Err(e));
            return;
        }
    }

    debug!(plugin = %plugin_id, "source worker ready");

    while let Some(command) = rx.recv().await {
        match command {
            SourceCommand::Invoke {
                operation,
                args,
                reply,
            } => {
                let result = invoke(&mut runtime, &plugin_id, operation, &args, &config).await;
                let _ = reply.send(result);
            }
            SourceCommand::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }

    debug!(plugin = %plugin_id, "source worker exiting");
}

/// Call one guest operation and await its result.
///
/// If the guest returns a thenable, `then`/`catch` handlers record settlement
/// into a slot, and the worker alternates event-loop pumping with short
/// sleeps until the slot fills or the deadline passes. A deadline miss is
/// `PromiseTimeout`; the abandoned guest computation's eventual result is
/// discarded when the slot is cleared.
pub(crate) async fn invoke(
    runtime: &mut JsRuntime,
    plugin_id: &str,
    operation: SourceOp,
    args: &[Value],
    config: &RuntimeConfig,
) -> Result<Value, RuntimeError> {
    // Selection handles from a previous operation are dead now.
    runtime
        .op_state()
        .borrow_mut()
        .borrow_mut::<DomRegistry>()
        .clear();

    debug!(plugin = %plugin_id, operation = %operation, "invoking guest");

    if let Err(message) = start_call(runtime, operation.guest_name(), args) {
        return Err(invocation_error(plugin_id, operation, message));
    }

    let deadline = Instant::now() + config.promise_timeout();
    loop {
        match settlement(runtime) {
            Ok(Settlement::Resolved(value)) => {
                clear_slot(runtime);
                return Ok(value);
            }
            Ok(Settlement::Rejected(message)) => {
                clear_slot(runtime);
                return Err(invocation_error(plugin_id, operation, message));
            }
            Ok(Settlement::Pending) => {}
            Err(message) => {
                clear_slot(runtime);
                return Err(invocation_error(plugin_id, operation, message));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            clear_slot(runtime);
            return Err(RuntimeError::PromiseTimeout(config.promise_timeout()));
        }

        let remaining = deadline - now;
        match tokio::time::timeout(remaining, runtime.run_event_loop(Default::default())).await {
            Ok(Ok(())) => {
                // Loop drained without settling; wait one poll interval
                // before checking again.
                tokio::time::sleep(config.poll_interval()).await;
            }
            Ok(Err(err)) => {
                // The event loop surfaced an error that never reached the
                // settlement handlers (e.g. an unhandled rejection).
                if matches!(settlement(runtime), Ok(Settlement::Pending) | Err(_)) {
                    clear_slot(runtime);
                    let (message, _) = value::js_error_parts(&err);
                    return Err(invocation_error(plugin_id, operation, message));
                }
            }
            Err(_) => {
                // Deadline hit while pumping; the check at the top of the
                // loop turns this into PromiseTimeout.
            }
        }
    }
}

enum Settlement {
    Pending,
    Resolved(Value),
    Rejected(String),
}

fn start_call(runtime: &mut JsRuntime, name: &str, args: &[Value]) -> Result<(), String> {
    let scope = &mut runtime.handle_scope();
    let invoke_fn = value::get_global(scope, "__hostCall")
        .ok_or_else(|| "invocation helper missing from sandbox".to_string())?;
    let invoke_fn = v8::Local::<v8::Function>::try_from(invoke_fn)
        .map_err(|_| "invocation helper is not callable".to_string())?;

    let name_value =
        value::to_v8(scope, &Value::String(name.to_string())).map_err(|e| e.to_string())?;
    let args_value =
        value::to_v8(scope, &Value::Array(args.to_vec())).map_err(|e| e.to_string())?;

    let tc = &mut v8::TryCatch::new(scope);
    let recv: v8::Local<v8::Value> = v8::undefined(tc).into();
    if invoke_fn.call(tc, recv, &[name_value, args_value]).is_none() {
        let message = tc
            .exception()
            .and_then(|exception| exception.to_string(tc))
            .map(|s| s.to_rust_string_lossy(tc))
            .unwrap_or_else(|| "guest call failed".to_string());
        return Err(message);
    }
    Ok(())
}

fn settlement(runtime: &mut JsRuntime) -> Result<Settlement, String> {
    let scope = &mut runtime.handle_scope();
    let Some(slot) = value::get_global(scope, "__hostPending") else {
        return Ok(Settlement::Pending);
    };
    let Ok(slot) = v8::Local::<v8::Object>::try_from(slot) else {
        return Ok(Settlement::Pending);
    };

    match value::member_string(scope, slot, "state").as_deref() {
        Some("resolved") => {
            let resolved = value::get_member(scope, slot, "value")
                .ok_or_else(|| "settlement slot lost its value".to_string())?;
            let converted = value::from_v8(scope, resolved)
                .map_err(|e| format!("failed to convert guest result: {e}"))?;
            Ok(Settlement::Resolved(converted))
        }
        Some("rejected") => Ok(Settlement::Rejected(
            value::member_string(scope, slot, "error")
                .unwrap_or_else(|| "unknown guest error".to_string()),
        )),
        _ => Ok(Settlement::Pending),
    }
}

/// Free the settlement slot so a large result does not outlive its call.
fn clear_slot(runtime: &mut JsRuntime) {
    let _ = runtime.execute_script(
        "<cleanup>",
        "globalThis.__hostPending = undefined;".to_string().into(),
    );
}

fn invocation_error(plugin_id: &str, operation: SourceOp, message: String) -> RuntimeError {
    RuntimeError::PluginInvocation {
        plugin_id: plugin_id.to_string(),
        operation: operation.to_string(),
        message,
    }
}
