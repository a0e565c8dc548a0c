//! Core infrastructure: error taxonomy and runtime configuration.

pub mod config;
pub mod error;

pub use config::RuntimeConfig;
pub use error::{PluginLoadError, Result, RuntimeError};
