//! The plugin contract.
//!
//! A plugin turns a user keyword into results from one specific upstream.
//! The mandatory surface is tiny — a name, a priority and a search — and
//! every optional capability is a defaulted method, so a minimal adapter
//! implements exactly two items.

use async_trait::async_trait;

use pansou_core::{Ext, PluginSearchResult, SearchResult};

use crate::error::PluginResult;

/// Contract implemented by every search plugin.
///
/// # Capabilities
///
/// | Method | Default | Meaning when overridden |
/// |--------|---------|-------------------------|
/// | [`skip_service_filter`](Self::skip_service_filter) | `false` | The aggregator must not keyword-filter this plugin's results (it filtered precisely itself, or its titles are file-level and not comparable to the keyword). |
/// | [`initialize`](Self::initialize) | `Ok(())` | One-time setup, invoked lazily before the first search. Must be idempotent and cheap on repeat. |
/// | [`web_routes`](Self::web_routes) | `None` | The plugin mounts its own HTTP endpoints; the returned router is merged into the server. |
///
/// # Failure containment
///
/// A panic inside [`search_with_result`](Self::search_with_result) never
/// takes the aggregator down: every plugin call runs on its own task and a
/// panicked task is logged and treated as an empty result.
#[async_trait]
pub trait SearchPlugin: Send + Sync {
    /// Unique plugin name; also the prefix of every `unique_id` it emits.
    fn name(&self) -> &str;

    /// Display-ordering tie-breaker; lower is higher quality.
    fn priority(&self) -> i32 {
        3
    }

    /// Whether the aggregator should skip its keyword filter for this
    /// plugin's results.
    fn skip_service_filter(&self) -> bool {
        false
    }

    /// One-time lazy setup before the first search.
    async fn initialize(&self) -> PluginResult<()> {
        Ok(())
    }

    /// HTTP endpoints this plugin wants to expose, if any.
    fn web_routes(&self) -> Option<axum::Router> {
        None
    }

    /// Searches the upstream, reporting whether the snapshot is final.
    async fn search_with_result(
        &self,
        keyword: &str,
        ext: &Ext,
    ) -> PluginResult<PluginSearchResult>;

    /// Plain search; delegates to
    /// [`search_with_result`](Self::search_with_result).
    async fn search(&self, keyword: &str, ext: &Ext) -> PluginResult<Vec<SearchResult>> {
        Ok(self.search_with_result(keyword, ext).await?.results)
    }
}
