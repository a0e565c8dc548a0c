//! Plugin adaptation layer
//!
//! Plugin authors follow wildly different conventions: `name` vs `title`,
//! `url` vs `path`, `getChapters` vs a `parseNovel` that embeds the chapter
//! list. The fixed adapter script evaluated here normalizes all of that into
//! one canonical guest object, so the rest of the runtime only ever sees the
//! canonical shapes. Fallback-field logic lives here and nowhere else.

use deno_core::{v8, JsRuntime};
use serde_json::Value;
use tracing::{debug, warn};

use super::sandbox;
use super::types::{FilterMap, SourceMetadata};
use crate::core::error::{PluginLoadError, RuntimeError};
use crate::plugin::value;

/// Fixed adapter installed before the plugin source. `wrapPlugin` turns any
/// supported export shape into the canonical plugin object.
const ADAPTER_SCRIPT: &str = r#"
"use strict";
(function() {
  function toNovel(raw) {
    raw = raw || {};
    return {
      name: raw.name || raw.title || '',
      url: raw.url || raw.path || '',
      cover: raw.cover || raw.image || '',
    };
  }

  function toNovelList(result) {
    return Array.isArray(result) ? result.map(toNovel) : [];
  }

  function toChapter(raw) {
    raw = raw || {};
    return {
      name: raw.name || raw.title || '',
      url: raw.url || raw.path || '',
      releaseTime: raw.releaseTime || raw.date || null,
    };
  }

  function listingOptions(latest, filters) {
    return { showLatestNovels: latest, filters: filters || {} };
  }

  globalThis.wrapPlugin = function(plugin) {
    const wrapped = {
      getId: () => plugin.id || 'unknown',
      getName: () => plugin.name || 'Unknown Source',
      getSite: () => plugin.site || '',
      getVersion: () => plugin.version || '1.0.0',
      getLang: () => plugin.lang || plugin.language || 'en',
      getIcon: () => plugin.icon || '',

      searchNovels: async (query, page) => {
        if (typeof plugin.searchNovels !== 'function') return [];
        return toNovelList(await plugin.searchNovels(query, page));
      },

      popularNovels: async (page, filters) => {
        if (typeof plugin.popularNovels !== 'function') return [];
        const result = plugin.popularNovels.length <= 1
          ? await plugin.popularNovels(page)
          : await plugin.popularNovels(page, listingOptions(false, filters || plugin.filters));
        return toNovelList(result);
      },

      latestNovels: async (page) => {
        if (typeof plugin.latestNovels !== 'function') {
          return wrapped.popularNovels(page, {});
        }
        const result = plugin.latestNovels.length <= 1
          ? await plugin.latestNovels(page)
          : await plugin.latestNovels(page, listingOptions(true, plugin.filters));
        return toNovelList(result);
      },

      getNovelDetails: async (url) => {
        const fn = plugin.getNovelDetails || plugin.parseNovel;
        if (typeof fn !== 'function') {
          return { name: '', url: url, cover: '', author: null, description: null, genres: [], status: null };
        }
        const details = (await fn.call(plugin, url)) || {};
        return {
          name: details.name || details.title || '',
          url: details.url || details.path || url,
          cover: details.cover || details.image || '',
          author: details.author || null,
          description: details.description || details.summary || null,
          genres: Array.isArray(details.genres) ? details.genres.map(String) : [],
          status: details.status || null,
        };
      },

      getChapters: async (url) => {
        if (typeof plugin.getChapters === 'function') {
          const result = await plugin.getChapters(url);
          return Array.isArray(result) ? result.map(toChapter) : [];
        }
        if (typeof plugin.parseNovel === 'function') {
          const novel = await plugin.parseNovel(url);
          if (novel && Array.isArray(novel.chapters)) {
            return novel.chapters.map(toChapter);
          }
        }
        return [];
      },

      getChapterContent: async (url) => {
        const fn = plugin.getChapterContent || plugin.parseChapter;
        if (typeof fn !== 'function') return '';
        const content = await fn.call(plugin, url);
        if (typeof content === 'string') return content;
        return (content && content.text) || '';
      },
    };
    return wrapped;
  };
})();
"#;

/// Resolves the plugin's export and wraps it. Returns a marker consumed by
/// the host side of the pipeline.
const WRAP_SCRIPT: &str = r#"
(function() {
  if (typeof wrapPlugin !== 'function') return 'adapter-missing';
  const candidates = [];
  if (typeof exports === 'object' && exports !== null) {
    candidates.push(exports.default, exports);
  }
  if (typeof module === 'object' && module !== null && module.exports) {
    candidates.push(module.exports.default, module.exports);
  }
  let picked = null;
  for (const candidate of candidates) {
    if (candidate === undefined || candidate === null) continue;
    if (typeof candidate === 'function') { picked = candidate; break; }
    if (typeof candidate === 'object' && Object.keys(candidate).length > 0) { picked = candidate; break; }
  }
  if (picked === null) return 'no-default-export';
  globalThis.__wrappedPlugin = wrapPlugin(picked);
  return 'ready';
})()
"#;

const METADATA_SCRIPT: &str = r#"
(function() {
  const plugin = globalThis.__wrappedPlugin;
  return JSON.stringify({
    id: plugin.getId(),
    name: plugin.getName(),
    site: plugin.getSite(),
    version: plugin.getVersion(),
    lang: plugin.getLang(),
    icon: plugin.getIcon(),
  });
})()
"#;

/// Filter definitions are looked up through every convention plugin authors
/// use, then snapshotted. Failure here is non-fatal.
const FILTERS_SCRIPT: &str = r#"
(function() {
  try {
    let filters = null;
    if (typeof exports === 'object' && exports !== null && exports.default && exports.default.filters) {
      filters = exports.default.filters;
    } else if (typeof exports === 'object' && exports !== null && exports.filters) {
      filters = exports.filters;
    } else if (typeof module === 'object' && module !== null && module.exports && module.exports.filters) {
      filters = module.exports.filters;
    } else if (typeof globalThis.filters === 'object' && globalThis.filters !== null) {
      filters = globalThis.filters;
    }
    const json = JSON.stringify(filters);
    return json === undefined ? 'null' : json;
  } catch (e) {
    return 'null';
  }
})()
"#;

/// Run the full load pipeline against a freshly built sandbox: adapter,
/// plugin source, export resolution, metadata and filter extraction.
///
/// Load-time errors abort loading and reach the caller; only filter
/// extraction degrades (to an empty map).
pub(crate) async fn load_plugin(
    runtime: &mut JsRuntime,
    plugin_id: &str,
    source: &str,
) -> Result<(SourceMetadata, FilterMap), RuntimeError> {
    sandbox::evaluate(runtime, "<adapter>", ADAPTER_SCRIPT.to_string())
        .map_err(|_| PluginLoadError::AdapterMissing)?;

    if let Err(err) = sandbox::evaluate(runtime, "<plugin>", source.to_string()) {
        let message = match &err {
            RuntimeError::ScriptEvaluation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if is_corrupted_download(&message, source) {
            return Err(PluginLoadError::CorruptedDownload.into());
        }
        return Err(PluginLoadError::Syntax(message).into());
    }

    // Settle any top-level async work the plugin kicked off.
    runtime
        .run_event_loop(Default::default())
        .await
        .map_err(|err| {
            let (message, guest_stack) = value::js_error_parts(&err);
            RuntimeError::ScriptEvaluation {
                message,
                guest_stack,
            }
        })?;

    let marker_value = sandbox::evaluate(runtime, "<wrap>", WRAP_SCRIPT.to_string())?;
    let marker = script_string(runtime, marker_value);
    match marker.as_str() {
        "ready" => {}
        "no-default-export" => return Err(PluginLoadError::NoDefaultExport.into()),
        "adapter-missing" => return Err(PluginLoadError::AdapterMissing.into()),
        other => {
            return Err(RuntimeError::ScriptEvaluation {
                message: format!("unexpected adapter state: {other}"),
                guest_stack: None,
            })
        }
    }

    let metadata_value = sandbox::evaluate(runtime, "<metadata>", METADATA_SCRIPT.to_string())?;
    let metadata_json = script_string(runtime, metadata_value);
    let mut metadata: SourceMetadata =
        serde_json::from_str(&metadata_json).map_err(|e| RuntimeError::ScriptEvaluation {
            message: format!("adapter produced invalid metadata: {e}"),
            guest_stack: None,
        })?;
    if metadata.id.is_empty() || metadata.id == "unknown" {
        metadata.id = plugin_id.to_string();
    }

    let filters = extract_filters(runtime, plugin_id);
    debug!(
        plugin = %plugin_id,
        name = %metadata.name,
        filters = filters.len(),
        "plugin adapted"
    );

    Ok((metadata, filters))
}

fn extract_filters(runtime: &mut JsRuntime, plugin_id: &str) -> FilterMap {
    let json = match sandbox::evaluate(runtime, "<filters>", FILTERS_SCRIPT.to_string()) {
        Ok(result) => script_string(runtime, result),
        Err(err) => {
            warn!(plugin = %plugin_id, "filter extraction failed: {err}");
            return FilterMap::new();
        }
    };
    match serde_json::from_str::<Value>(&json) {
        Ok(Value::Object(map)) => map,
        Ok(_) => FilterMap::new(),
        Err(err) => {
            warn!(plugin = %plugin_id, "filter definitions were not plain data: {err}");
            FilterMap::new()
        }
    }
}

/// A plugin file that is really an HTTP error page: the engine message quotes
/// the marker for some engines; for the rest, an HTML-looking source carrying
/// the marker is decisive.
fn is_corrupted_download(message: &str, source: &str) -> bool {
    if message.contains("404") || message.contains("Not Found") {
        return true;
    }
    let trimmed = source.trim_start();
    trimmed.starts_with('<') && (source.contains("404") || source.contains("Not Found"))
}

fn script_string(runtime: &mut JsRuntime, result: v8::Global<v8::Value>) -> String {
    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, result);
    local
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuntimeConfig;

    async fn load(source: &str) -> Result<(SourceMetadata, FilterMap), RuntimeError> {
        let mut runtime = sandbox::build_runtime("test.plugin", &RuntimeConfig::default()).unwrap();
        load_plugin(&mut runtime, "test.plugin", source).await
    }

    #[tokio::test]
    async fn loads_metadata_with_defaults() {
        let (metadata, filters) = load(
            r#"
            exports.default = {
                id: 'example.novels',
                name: 'Example Novels',
                site: 'https://example.com',
            };
            "#,
        )
        .await
        .unwrap();
        assert_eq!(metadata.id, "example.novels");
        assert_eq!(metadata.name, "Example Novels");
        assert_eq!(metadata.version, "1.0.0");
        assert_eq!(metadata.lang, "en");
        assert_eq!(metadata.icon, "");
        assert!(filters.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_the_host_supplied_id() {
        let (metadata, _) = load("exports.default = { name: 'Anonymous' };")
            .await
            .unwrap();
        assert_eq!(metadata.id, "test.plugin");
    }

    #[tokio::test]
    async fn language_falls_back_across_conventions() {
        let (metadata, _) = load("exports.default = { name: 'S', language: 'fr' };")
            .await
            .unwrap();
        assert_eq!(metadata.lang, "fr");
    }

    #[tokio::test]
    async fn http_error_page_is_a_corrupted_download() {
        let err = load("<html><head><title>404 Not Found</title></head><body><h1>Not Found</h1></body></html>")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::PluginLoad(PluginLoadError::CorruptedDownload)
        ));
    }

    #[tokio::test]
    async fn broken_source_is_a_syntax_error() {
        let err = load("function broken( {").await.unwrap_err();
        match err {
            RuntimeError::PluginLoad(PluginLoadError::Syntax(message)) => {
                assert!(!message.is_empty());
            }
            other => panic!("expected Syntax, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_export_is_detected() {
        let err = load("const notExported = 1;").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::PluginLoad(PluginLoadError::NoDefaultExport)
        ));
    }

    #[tokio::test]
    async fn bare_exports_object_is_accepted() {
        let (metadata, _) = load("exports.name = 'Bare'; exports.searchNovels = async () => [];")
            .await
            .unwrap();
        assert_eq!(metadata.name, "Bare");
    }

    #[tokio::test]
    async fn module_exports_reassignment_is_accepted() {
        let (metadata, _) = load("module.exports = { default: { name: 'Reassigned' } };")
            .await
            .unwrap();
        assert_eq!(metadata.name, "Reassigned");
    }

    #[tokio::test]
    async fn filters_come_from_the_default_export() {
        let (_, filters) = load(
            r#"
            exports.default = {
                name: 'Filtered',
                filters: {
                    genre: { label: 'Genre', values: ['fantasy', 'sci-fi'] },
                    status: { label: 'Status' },
                },
            };
            "#,
        )
        .await
        .unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters["genre"]["label"], "Genre");
    }

    #[tokio::test]
    async fn bare_global_filters_are_found() {
        let (_, filters) = load(
            r#"
            globalThis.filters = { sort: { label: 'Sort' } };
            exports.default = { name: 'GlobalFilters' };
            "#,
        )
        .await
        .unwrap();
        assert_eq!(filters.len(), 1);
    }

    #[tokio::test]
    async fn unextractable_filters_degrade_to_empty() {
        let (_, filters) = load(
            r#"
            exports.default = { name: 'Cyclic' };
            const cycle = {};
            cycle.self = cycle;
            exports.default.filters = cycle;
            "#,
        )
        .await
        .unwrap();
        assert!(filters.is_empty());
    }

    #[test]
    fn heuristic_requires_html_for_source_markers() {
        // A JS file mentioning 404 in code is not a corrupted download.
        assert!(!is_corrupted_download(
            "Unexpected token ')'",
            "if (res.status === 404) { throw new Error('x') } (",
        ));
        assert!(is_corrupted_download(
            "SyntaxError: Unexpected token '<'",
            "<html><body>404 Not Found</body></html>",
        ));
        assert!(is_corrupted_download("Error: 404 Not Found", "anything"));
    }
}
