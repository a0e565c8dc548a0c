//! Plugin script runtime
//!
//! Hosts untrusted JavaScript source plugins from the async multi-threaded
//! application:
//! - engine lifecycle and sandboxing (`sandbox`)
//! - the host capability bridge: network fetch and HTML querying
//!   (`bindings`, `dom`)
//! - value marshaling between host and guest (`value`)
//! - the plugin adaptation pipeline (`adapter`)
//! - the dedicated per-plugin execution context and the public async
//!   invocation surface (`worker`, `source`)

pub mod adapter;
pub mod bindings;
pub mod dom;
pub mod sandbox;
pub mod source;
pub mod types;
pub mod value;
pub mod worker;

pub use bindings::FetchResponse;
pub use source::SourceRuntime;
pub use types::{Chapter, FilterMap, Novel, NovelDetails, NovelSource, SourceMetadata};
pub use worker::SourceOp;
