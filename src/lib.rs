//! Source plugin runtime for the reader backend
//!
//! Embeds a sandboxed JavaScript engine so that community-supplied source
//! plugins can scrape novel websites without recompiling the host. One
//! isolated engine per plugin, every engine touch routed through that
//! plugin's dedicated worker thread, with network fetch and HTML querying
//! bridged into the sandbox as the only host capabilities.
//!
//! ```no_run
//! use source_runtime::SourceRuntime;
//!
//! # async fn demo(plugin_source: String) -> source_runtime::Result<()> {
//! let runtime = SourceRuntime::load(plugin_source, "example.novels").await?;
//! let novels = runtime.search_novels("sword", 1).await?;
//! let chapters = runtime.chapters(&novels[0].url).await?;
//! let text = runtime.chapter_content(&chapters[0].url).await?;
//! runtime.close().await;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod plugin;

pub use crate::core::config::RuntimeConfig;
pub use crate::core::error::{PluginLoadError, Result, RuntimeError};
pub use plugin::{
    Chapter, FilterMap, Novel, NovelDetails, NovelSource, SourceMetadata, SourceRuntime,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
