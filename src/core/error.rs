//! Error type system for the source-plugin runtime
//!
//! The taxonomy separates the phases a plugin can fail in:
//! - sandbox construction ([`RuntimeError::EngineInit`])
//! - plugin loading ([`PluginLoadError`], never swallowed)
//! - arbitrary script evaluation ([`RuntimeError::ScriptEvaluation`])
//! - the six content operations ([`RuntimeError::PluginInvocation`])
//! - guest promises that never settle ([`RuntimeError::PromiseTimeout`])
//! - use after `close()` ([`RuntimeError::EngineDisposed`])

use std::time::Duration;

/// Result type alias for the runtime
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Main error type for the source-plugin runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Sandbox construction failed. Fatal for the load attempt, not for the host.
    #[error("engine initialization failed: {0}")]
    EngineInit(String),

    /// Plugin loading failed; the variant carries an actionable message.
    #[error(transparent)]
    PluginLoad(#[from] PluginLoadError),

    /// A guest-side runtime error during script evaluation.
    #[error("script evaluation failed: {message}")]
    ScriptEvaluation {
        message: String,
        /// Guest stack trace, when the engine produced one.
        guest_stack: Option<String>,
    },

    /// A guest exception during one of the content operations.
    #[error("plugin {plugin_id}: {operation} failed: {message}")]
    PluginInvocation {
        plugin_id: String,
        operation: String,
        message: String,
    },

    /// A guest-returned promise never settled within the configured window.
    /// The guest computation may still be running; its result is discarded.
    #[error("guest promise did not settle within {0:?}")]
    PromiseTimeout(Duration),

    /// Operation attempted after `close()` invalidated the engine.
    #[error("engine has been disposed")]
    EngineDisposed,
}

/// Load-phase failures, each specific enough for a user-facing message.
#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    /// The plugin source failed to parse or threw during evaluation.
    #[error("JavaScript syntax error in plugin: {0}")]
    Syntax(String),

    /// The source looks like an HTTP error page rather than code.
    #[error(
        "plugin file contains an HTTP error response instead of JavaScript; \
         the file may be corrupted or incorrectly downloaded, please re-download the plugin"
    )]
    CorruptedDownload,

    /// Neither `exports.default` nor a populated `exports` object was found.
    #[error("plugin does not export a default object")]
    NoDefaultExport,

    /// The fixed adapter script failed to install `wrapPlugin`.
    #[error("plugin adapter failed to load; wrapPlugin is not available")]
    AdapterMissing,
}
