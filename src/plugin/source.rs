//! Public runtime handle for one loaded source plugin
//!
//! `SourceRuntime` is what callers hold: load it from plugin source text,
//! call the six async content operations, read the cached metadata and
//! filters, close it when done. Every call is marshaled to the plugin's
//! dedicated worker thread; concurrent callers are serialized in submission
//! order, never interleaved.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::types::{Chapter, FilterMap, Novel, NovelDetails, NovelSource, SourceMetadata};
use super::worker::{self, SourceCommand, SourceOp};
use crate::core::config::RuntimeConfig;
use crate::core::error::{Result, RuntimeError};

/// Handle to one loaded plugin and its dedicated engine.
#[derive(Debug)]
pub struct SourceRuntime {
    plugin_id: String,
    metadata: SourceMetadata,
    filters: FilterMap,
    tx: mpsc::Sender<SourceCommand>,
    closed: AtomicBool,
}

impl SourceRuntime {
    /// Load a plugin from source text with default configuration.
    pub async fn load(source_code: impl Into<String>, plugin_id: impl Into<String>) -> Result<Self> {
        Self::load_with_config(source_code, plugin_id, RuntimeConfig::default()).await
    }

    /// Load a plugin from source text.
    ///
    /// Spawns the dedicated worker thread, builds the sandbox, runs the
    /// adapter pipeline and returns the ready handle. Load failures are
    /// returned in full; nothing is swallowed at load time.
    pub async fn load_with_config(
        source_code: impl Into<String>,
        plugin_id: impl Into<String>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let plugin_id = plugin_id.into();
        info!(plugin = %plugin_id, "loading source plugin");

        let (tx, init_rx) = worker::spawn(plugin_id.clone(), source_code.into(), config)?;
        let (metadata, filters) = match init_rx.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RuntimeError::EngineInit(
                    "worker exited before reporting a load result".to_string(),
                ))
            }
        };

        info!(
            plugin = %plugin_id,
            name = %metadata.name,
            version = %metadata.version,
            lang = %metadata.lang,
            "source plugin loaded"
        );

        Ok(Self {
            plugin_id,
            metadata,
            filters,
            tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn site(&self) -> &str {
        &self.metadata.site
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn lang(&self) -> &str {
        &self.metadata.lang
    }

    pub fn icon(&self) -> &str {
        &self.metadata.icon
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    /// Filter definitions captured at load time. The same snapshot for the
    /// lifetime of the handle.
    pub fn filters(&self) -> &FilterMap {
        &self.filters
    }

    /// Search the source by keyword. `page` is 1-indexed.
    pub async fn search_novels(&self, query: &str, page: u32) -> Result<Vec<Novel>> {
        self.call(SourceOp::SearchNovels, vec![json!(query), json!(page)])
            .await
    }

    /// Browse the popular listing.
    ///
    /// Intentionally best-effort: guest-side failures degrade to an empty
    /// list so discovery flows survive one broken plugin. Only a disposed
    /// engine still errors.
    pub async fn popular_novels(&self, page: u32, filters: &FilterMap) -> Result<Vec<Novel>> {
        let args = vec![json!(page), Value::Object(filters.clone())];
        match self.dispatch(SourceOp::PopularNovels, args).await {
            Ok(value) => match serde_json::from_value(value) {
                Ok(list) => Ok(list),
                Err(e) => {
                    warn!(
                        plugin = %self.plugin_id,
                        operation = %SourceOp::PopularNovels,
                        "malformed listing, returning empty: {e}"
                    );
                    Ok(Vec::new())
                }
            },
            Err(RuntimeError::EngineDisposed) => Err(RuntimeError::EngineDisposed),
            Err(e) => {
                warn!(
                    plugin = %self.plugin_id,
                    operation = %SourceOp::PopularNovels,
                    "operation failed, returning empty: {e}"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Browse the latest listing; plugins without one fall back to popular.
    pub async fn latest_novels(&self, page: u32) -> Result<Vec<Novel>> {
        self.call(SourceOp::LatestNovels, vec![json!(page)]).await
    }

    /// Full details for one novel.
    pub async fn novel_details(&self, url: &str) -> Result<NovelDetails> {
        self.call(SourceOp::GetNovelDetails, vec![json!(url)]).await
    }

    /// Chapter list for one novel, exactly in the source's reading order.
    pub async fn chapters(&self, url: &str) -> Result<Vec<Chapter>> {
        self.call(SourceOp::GetChapters, vec![json!(url)]).await
    }

    /// Text content of one chapter.
    pub async fn chapter_content(&self, url: &str) -> Result<String> {
        self.call(SourceOp::GetChapterContent, vec![json!(url)]).await
    }

    /// Shut the runtime down. Idempotent; queued operations finish first,
    /// anything after fails with `EngineDisposed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(SourceCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        debug!(plugin = %self.plugin_id, "source runtime closed");
    }

    /// Dispatch, decode and log in one place; every propagating operation
    /// goes through here.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        operation: SourceOp,
        args: Vec<Value>,
    ) -> Result<T> {
        let outcome = match self.dispatch(operation, args).await {
            Ok(value) => self.decode(operation, value),
            Err(e) => Err(e),
        };
        outcome.map_err(|e| self.log_failure(operation, e))
    }

    async fn dispatch(&self, operation: SourceOp, args: Vec<Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::EngineDisposed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SourceCommand::Invoke {
                operation,
                args,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::EngineDisposed)?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::EngineDisposed),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, operation: SourceOp, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| RuntimeError::PluginInvocation {
            plugin_id: self.plugin_id.clone(),
            operation: operation.to_string(),
            message: format!("unexpected result shape: {e}"),
        })
    }

    fn log_failure(&self, operation: SourceOp, err: RuntimeError) -> RuntimeError {
        error!(plugin = %self.plugin_id, operation = %operation, "{err}");
        err
    }
}

impl Drop for SourceRuntime {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let (reply_tx, _reply_rx) = oneshot::channel();
            let _ = self.tx.try_send(SourceCommand::Shutdown { reply: reply_tx });
        }
    }
}

#[async_trait]
impl NovelSource for SourceRuntime {
    fn source_metadata(&self) -> &SourceMetadata {
        self.metadata()
    }

    fn filters(&self) -> &FilterMap {
        SourceRuntime::filters(self)
    }

    async fn search_novels(&self, query: &str, page: u32) -> Result<Vec<Novel>> {
        SourceRuntime::search_novels(self, query, page).await
    }

    async fn popular_novels(&self, page: u32, filters: &FilterMap) -> Result<Vec<Novel>> {
        SourceRuntime::popular_novels(self, page, filters).await
    }

    async fn latest_novels(&self, page: u32) -> Result<Vec<Novel>> {
        SourceRuntime::latest_novels(self, page).await
    }

    async fn novel_details(&self, url: &str) -> Result<NovelDetails> {
        SourceRuntime::novel_details(self, url).await
    }

    async fn chapters(&self, url: &str) -> Result<Vec<Chapter>> {
        SourceRuntime::chapters(self, url).await
    }

    async fn chapter_content(&self, url: &str) -> Result<String> {
        SourceRuntime::chapter_content(self, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::PluginLoadError;

    /// Opt-in log output: RUST_LOG=debug cargo test -- --nocapture
    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// A well-behaved plugin using the `title`/`path` naming convention.
    const TITLE_PATH_PLUGIN: &str = r#"
        exports.default = {
            id: 'title.path',
            name: 'Title Path Source',
            searchNovels: async (query, page) => [
                { title: 'X', path: '/y' },
            ],
        };
    "#;

    #[tokio::test]
    async fn adapter_normalizes_field_names() {
        init_logging();
        let runtime = SourceRuntime::load(TITLE_PATH_PLUGIN, "title.path").await.unwrap();
        let novels = runtime.search_novels("x", 1).await.unwrap();
        assert_eq!(
            novels,
            vec![Novel {
                name: "X".to_string(),
                url: "/y".to_string(),
                cover: String::new(),
            }]
        );
        runtime.close().await;
    }

    #[tokio::test]
    async fn search_results_never_have_null_fields() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                searchNovels: async () => [
                    {},
                    { name: null, url: null },
                    { title: 'Named' },
                ],
            };
            "#,
            "sparse",
        )
        .await
        .unwrap();
        let novels = runtime.search_novels("q", 1).await.unwrap();
        assert_eq!(novels.len(), 3);
        // Nulls are coerced to empty strings before crossing the bridge.
        assert_eq!(novels[0].name, "");
        assert_eq!(novels[1].name, "");
        assert_eq!(novels[1].url, "");
        assert_eq!(novels[2].name, "Named");
        runtime.close().await;
    }

    #[tokio::test]
    async fn metadata_getters_are_cached_host_side() {
        let runtime = SourceRuntime::load(TITLE_PATH_PLUGIN, "title.path").await.unwrap();
        assert_eq!(runtime.id(), "title.path");
        assert_eq!(runtime.name(), "Title Path Source");
        assert_eq!(runtime.version(), "1.0.0");
        assert_eq!(runtime.lang(), "en");
        assert_eq!(runtime.site(), "");
        assert_eq!(runtime.icon(), "");
        runtime.close().await;
    }

    #[tokio::test]
    async fn filters_snapshot_is_stable() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                name: 'Filtered',
                filters: { genre: { label: 'Genre' } },
                searchNovels: async () => {
                    // Guest-side mutation after load must not show up.
                    exports.default.filters.genre.label = 'Changed';
                    return [];
                },
            };
            "#,
            "filtered",
        )
        .await
        .unwrap();

        let before = runtime.filters().clone();
        assert_eq!(before["genre"]["label"], "Genre");
        runtime.search_novels("q", 1).await.unwrap();
        assert_eq!(runtime.filters(), &before);
        runtime.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_disposes_the_engine() {
        let runtime = SourceRuntime::load(TITLE_PATH_PLUGIN, "title.path").await.unwrap();
        runtime.close().await;
        runtime.close().await;
        let err = runtime.search_novels("q", 1).await.unwrap_err();
        assert!(matches!(err, RuntimeError::EngineDisposed));
        let err = runtime.popular_novels(1, &FilterMap::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::EngineDisposed));
    }

    #[tokio::test]
    async fn popular_novels_swallows_guest_failures() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                popularNovels: () => { throw new Error('listing exploded'); },
            };
            "#,
            "broken.popular",
        )
        .await
        .unwrap();
        let novels = runtime.popular_novels(1, &FilterMap::new()).await.unwrap();
        assert!(novels.is_empty());
        runtime.close().await;
    }

    #[tokio::test]
    async fn other_operations_propagate_guest_failures() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                getChapters: () => Promise.reject(new Error('chapter list gone')),
                getChapterContent: async () => 'content ok',
            };
            "#,
            "rejecting",
        )
        .await
        .unwrap();

        let err = runtime.chapters("/n/1").await.unwrap_err();
        match err {
            RuntimeError::PluginInvocation {
                plugin_id,
                operation,
                message,
            } => {
                assert_eq!(plugin_id, "rejecting");
                assert_eq!(operation, "getChapters");
                assert!(message.contains("chapter list gone"));
            }
            other => panic!("expected PluginInvocation, got {other:?}"),
        }

        // A failed operation does not invalidate the runtime.
        let content = runtime.chapter_content("/c/1").await.unwrap();
        assert_eq!(content, "content ok");
        runtime.close().await;
    }

    #[tokio::test]
    async fn never_settling_promises_fail_with_timeout() {
        let config = RuntimeConfig {
            promise_timeout_ms: 300,
            poll_interval_ms: 10,
            ..RuntimeConfig::default()
        };
        let runtime = SourceRuntime::load_with_config(
            r#"
            exports.default = {
                searchNovels: () => new Promise(() => {}),
            };
            "#,
            "hanging",
            config,
        )
        .await
        .unwrap();
        let err = runtime.search_novels("q", 1).await.unwrap_err();
        assert!(matches!(err, RuntimeError::PromiseTimeout(_)));
        runtime.close().await;
    }

    #[tokio::test]
    async fn concurrent_operations_are_serialized() {
        let runtime = SourceRuntime::load(
            r#"
            globalThis.state = { calls: 0 };
            exports.default = {
                searchNovels: async (query, page) => {
                    const seen = state.calls;
                    await Promise.resolve();
                    state.calls = seen + 1;
                    return [{ name: 'call-' + state.calls, url: '/' + state.calls }];
                },
            };
            "#,
            "counter",
        )
        .await
        .unwrap();

        let (a, b) = tokio::join!(
            runtime.search_novels("a", 1),
            runtime.search_novels("b", 1)
        );
        let mut names = vec![a.unwrap()[0].name.clone(), b.unwrap()[0].name.clone()];
        names.sort();
        // Interleaved execution would lose an increment and repeat a name.
        assert_eq!(names, vec!["call-1".to_string(), "call-2".to_string()]);
        runtime.close().await;
    }

    #[tokio::test]
    async fn latest_falls_back_to_popular() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                popularNovels: async (page) => [{ name: 'popular-' + page, url: '/p' }],
            };
            "#,
            "no.latest",
        )
        .await
        .unwrap();
        let novels = runtime.latest_novels(3).await.unwrap();
        assert_eq!(novels[0].name, "popular-3");
        runtime.close().await;
    }

    #[tokio::test]
    async fn listing_arity_controls_the_options_object() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                popularNovels: async (page, options) => [{
                    name: typeof options === 'object' && options.filters.genre === 'fantasy'
                        ? 'with-filters'
                        : 'missing-filters',
                    url: '/p',
                }],
            };
            "#,
            "arity.two",
        )
        .await
        .unwrap();
        let mut filters = FilterMap::new();
        filters.insert("genre".to_string(), json!("fantasy"));
        let novels = runtime.popular_novels(1, &filters).await.unwrap();
        assert_eq!(novels[0].name, "with-filters");
        runtime.close().await;
    }

    #[tokio::test]
    async fn single_arity_listings_receive_page_only() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                popularNovels: async function(page) {
                    return [{ name: 'args-' + arguments.length, url: '/p/' + page }];
                },
            };
            "#,
            "arity.one",
        )
        .await
        .unwrap();
        let novels = runtime.popular_novels(7, &FilterMap::new()).await.unwrap();
        assert_eq!(novels[0].name, "args-1");
        assert_eq!(novels[0].url, "/p/7");
        runtime.close().await;
    }

    #[tokio::test]
    async fn details_and_chapters_use_parse_fallbacks() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                parseNovel: async (url) => ({
                    title: 'Parsed Novel',
                    path: url,
                    summary: 'a summary',
                    genres: ['fantasy'],
                    status: 'Ongoing',
                    chapters: [
                        { title: 'One', path: '/c/1', date: '2024-01-01' },
                        { title: 'Two', path: '/c/2' },
                    ],
                }),
                parseChapter: async (url) => 'chapter body of ' + url,
            };
            "#,
            "parse.style",
        )
        .await
        .unwrap();

        let details = runtime.novel_details("/n/9").await.unwrap();
        assert_eq!(details.name, "Parsed Novel");
        assert_eq!(details.url, "/n/9");
        assert_eq!(details.description.as_deref(), Some("a summary"));
        assert_eq!(details.genres, vec!["fantasy".to_string()]);
        assert_eq!(details.status.as_deref(), Some("Ongoing"));

        let chapters = runtime.chapters("/n/9").await.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].name, "One");
        assert_eq!(chapters[0].release_time.as_deref(), Some("2024-01-01"));
        assert_eq!(chapters[1].release_time, None);

        let content = runtime.chapter_content("/c/1").await.unwrap();
        assert_eq!(content, "chapter body of /c/1");
        runtime.close().await;
    }

    #[tokio::test]
    async fn chapter_order_is_preserved() {
        let runtime = SourceRuntime::load(
            r#"
            exports.default = {
                getChapters: async () => [
                    { name: 'Epilogue', url: '/c/99' },
                    { name: 'Prologue', url: '/c/0' },
                    { name: 'Chapter 5', url: '/c/5' },
                ],
            };
            "#,
            "unsorted",
        )
        .await
        .unwrap();
        let chapters = runtime.chapters("/n/1").await.unwrap();
        let names: Vec<_> = chapters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Epilogue", "Prologue", "Chapter 5"]);
        runtime.close().await;
    }

    #[tokio::test]
    async fn load_failures_surface_the_specific_variant() {
        let err = SourceRuntime::load("<html>404 Not Found</html>", "corrupt")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::PluginLoad(PluginLoadError::CorruptedDownload)
        ));

        let err = SourceRuntime::load("const broken = {", "syntax")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::PluginLoad(PluginLoadError::Syntax(_))
        ));
    }

    #[tokio::test]
    async fn runtimes_are_independent() {
        let first = SourceRuntime::load(TITLE_PATH_PLUGIN, "one").await.unwrap();
        let second = SourceRuntime::load(TITLE_PATH_PLUGIN, "two").await.unwrap();
        first.close().await;
        // Closing one plugin's engine leaves the other fully usable.
        let novels = second.search_novels("q", 1).await.unwrap();
        assert_eq!(novels.len(), 1);
        second.close().await;
    }

    #[tokio::test]
    async fn usable_through_the_trait_object() {
        let runtime = SourceRuntime::load(TITLE_PATH_PLUGIN, "title.path").await.unwrap();
        let source: &dyn NovelSource = &runtime;
        assert_eq!(source.source_metadata().name, "Title Path Source");
        let novels = source.search_novels("x", 1).await.unwrap();
        assert_eq!(novels[0].name, "X");
        runtime.close().await;
    }
}
