//! Sandboxed engine construction
//!
//! Builds one isolated `JsRuntime` per plugin. Host interop is limited to the
//! op allow-list assembled in [`super::bindings`]; the prelude executed here
//! disables the remaining escape vectors (`eval`, the `Function` constructor)
//! and installs the ambient APIs plugins are written against: a CommonJS
//! shim, `URL`/`URLSearchParams`/`Headers`, `fetch`/`fetchApi`, immediate
//! timers, and a `console` that forwards to host logging.
//!
//! The engine is single-threaded and non-reentrant. Construction happens on
//! the plugin's dedicated worker thread and the runtime never leaves it.

use deno_core::{JsRuntime, RuntimeOptions};

use super::bindings::{self, PluginTag};
use super::dom::{self, DomRegistry};
use super::worker;
use crate::core::config::RuntimeConfig;
use crate::core::error::RuntimeError;
use crate::plugin::value;

/// Ambient environment installed before any plugin code runs.
const SANDBOX_PRELUDE: &str = r#"
"use strict";
(function() {
  const ops = Deno.core.ops;

  function formatArg(arg) {
    if (typeof arg === 'string') return arg;
    if (arg instanceof Error) return arg.message || String(arg);
    try {
      const json = JSON.stringify(arg);
      return json === undefined ? String(arg) : json;
    } catch (_) {
      return String(arg);
    }
  }
  function format(args) {
    return args.map(formatArg).join(' ');
  }
  globalThis.console = {
    log: (...args) => ops.op_console('info', format(args)),
    info: (...args) => ops.op_console('info', format(args)),
    debug: (...args) => ops.op_console('debug', format(args)),
    warn: (...args) => ops.op_console('warn', format(args)),
    error: (...args) => ops.op_console('error', format(args)),
  };

  globalThis.eval = function() {
    throw new Error('eval is disabled in the plugin sandbox');
  };
  globalThis.Function = function() {
    throw new Error('the Function constructor is disabled in the plugin sandbox');
  };

  globalThis.exports = {};
  globalThis.module = { exports: globalThis.exports };
  globalThis.require = function(name) {
    if (name === 'cheerio') return globalThis.cheerio;
    throw new Error("module '" + name + "' is not available in the plugin sandbox");
  };

  // No event loop scheduling in the sandbox: timer callbacks run immediately,
  // intervals are inert.
  globalThis.setTimeout = function(callback) {
    if (typeof callback === 'function') callback();
    return 0;
  };
  globalThis.setInterval = function() { return 0; };
  globalThis.clearTimeout = function() {};
  globalThis.clearInterval = function() {};

  class Headers {
    constructor(init) {
      this._map = new Map();
      if (!init) return;
      if (init instanceof Headers) {
        init.forEach((value, name) => this.set(name, value));
      } else if (Array.isArray(init)) {
        for (const pair of init) {
          if (Array.isArray(pair) && pair.length >= 2) this.set(pair[0], pair[1]);
        }
      } else if (typeof init === 'object') {
        for (const name of Object.keys(init)) this.set(name, init[name]);
      }
    }
    append(name, value) {
      const key = String(name).toLowerCase();
      const existing = this._map.get(key);
      this._map.set(key, existing === undefined ? String(value) : existing + ', ' + String(value));
    }
    set(name, value) { this._map.set(String(name).toLowerCase(), String(value)); }
    get(name) {
      const value = this._map.get(String(name).toLowerCase());
      return value === undefined ? null : value;
    }
    has(name) { return this._map.has(String(name).toLowerCase()); }
    delete(name) { this._map.delete(String(name).toLowerCase()); }
    forEach(callback, thisArg) {
      for (const [name, value] of this._map) callback.call(thisArg, value, name, this);
    }
    keys() { return this._map.keys(); }
    values() { return this._map.values(); }
    entries() { return this._map.entries(); }
  }
  globalThis.Headers = Headers;

  class URLSearchParams {
    constructor(init) {
      this._pairs = [];
      if (typeof init === 'string') {
        const query = init.startsWith('?') ? init.slice(1) : init;
        if (query) {
          for (const piece of query.split('&')) {
            const idx = piece.indexOf('=');
            const name = decodeURIComponent(idx < 0 ? piece : piece.slice(0, idx));
            const value = idx < 0 ? '' : decodeURIComponent(piece.slice(idx + 1).replace(/\+/g, ' '));
            this._pairs.push([name, value]);
          }
        }
      } else if (init && typeof init === 'object') {
        for (const name of Object.keys(init)) this._pairs.push([name, String(init[name])]);
      }
    }
    append(name, value) { this._pairs.push([String(name), String(value)]); }
    delete(name) { this._pairs = this._pairs.filter((p) => p[0] !== String(name)); }
    get(name) {
      const found = this._pairs.find((p) => p[0] === String(name));
      return found ? found[1] : null;
    }
    getAll(name) { return this._pairs.filter((p) => p[0] === String(name)).map((p) => p[1]); }
    has(name) { return this._pairs.some((p) => p[0] === String(name)); }
    set(name, value) {
      this.delete(name);
      this.append(name, value);
    }
    toString() {
      return this._pairs
        .map((p) => encodeURIComponent(p[0]) + '=' + encodeURIComponent(p[1]))
        .join('&');
    }
  }
  globalThis.URLSearchParams = URLSearchParams;

  class URL {
    constructor(url, base) {
      if (url === undefined || url === null) throw new Error('Invalid URL: ' + url);
      url = String(url);
      let full = url;
      if (base && !/^https?:\/\//.test(url)) {
        base = String(base);
        if (url.startsWith('/')) {
          const origin = base.match(/^(https?:\/\/[^\/]+)/);
          full = origin ? origin[1] + url : url;
        } else {
          full = base.replace(/\/[^\/]*$/, '/') + url;
        }
      }
      const match = full.match(/^(https?):\/\/([^\/?#]+)(\/[^?#]*)?(\?[^#]*)?(#.*)?$/);
      if (!match) throw new Error('Invalid URL: ' + full);
      const hostParts = match[2].split(':');
      this.protocol = match[1] + ':';
      this.host = match[2];
      this.hostname = hostParts[0];
      this.port = hostParts[1] || '';
      this.pathname = match[3] || '/';
      this.search = match[4] || '';
      this.hash = match[5] || '';
      this.href = full;
      this.origin = match[1] + '://' + match[2];
      this.searchParams = new URLSearchParams(this.search);
    }
    toString() { return this.href; }
    toJSON() { return this.href; }
  }
  globalThis.URL = URL;

  globalThis.fetch = async function(url, options) {
    const response = await ops.op_fetch(String(url), options === undefined ? null : options);
    return {
      ok: response.ok,
      status: response.status,
      statusText: response.statusText,
      headers: new Headers(response.headers),
      url: String(url),
      text: async () => response.text,
      json: async () => JSON.parse(response.text),
    };
  };
  globalThis.fetchApi = globalThis.fetch;
})();
"#;

/// Create an isolated engine for one plugin with the capability bridge
/// installed and the sandbox prelude applied.
pub(crate) fn build_runtime(
    plugin_id: &str,
    config: &RuntimeConfig,
) -> Result<JsRuntime, RuntimeError> {
    let client =
        bindings::http_client(config).map_err(|e| RuntimeError::EngineInit(e.to_string()))?;

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![bindings::extension()],
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(client);
        state.put(DomRegistry::default());
        state.put(PluginTag {
            id: plugin_id.to_string(),
        });
    }

    for (name, script) in [
        ("<query>", dom::QUERY_PRELUDE),
        ("<sandbox>", SANDBOX_PRELUDE),
        ("<invoke>", worker::INVOKE_PRELUDE),
    ] {
        runtime
            .execute_script(name, script.to_string().into())
            .map_err(|e| RuntimeError::EngineInit(format!("{name} prelude failed: {e}")))?;
    }

    Ok(runtime)
}

/// Evaluate arbitrary source inside the sandbox. Guest-side errors surface as
/// [`RuntimeError::ScriptEvaluation`] with the engine's stack trace attached.
pub(crate) fn evaluate(
    runtime: &mut JsRuntime,
    name: &'static str,
    source: String,
) -> Result<deno_core::v8::Global<deno_core::v8::Value>, RuntimeError> {
    runtime.execute_script(name, source.into()).map_err(|err| {
        let (message, guest_stack) = value::js_error_parts(&err);
        RuntimeError::ScriptEvaluation {
            message,
            guest_stack,
        }
    })
}
