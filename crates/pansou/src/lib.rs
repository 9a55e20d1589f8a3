//! # PanSou
//!
//! Network-disk resource search aggregator: one keyword fans out to a
//! fleet of upstream adapters (website and API scrapers plus the
//! QQ-channel and Weibo sub-services), results are normalized to one
//! schema, merged, deduplicated and returned both as a ranked list and
//! grouped by share-link provider.
//!
//! This crate is the facade: it re-exports the public API of the layer
//! crates and ships the `pansou` server binary.
//!
//! ```rust,ignore
//! use pansou::prelude::*;
//!
//! let registry = Arc::new(pansou::plugins::builtin_registry()?);
//! let service = SearchService::new(registry, SearchServiceConfig::default());
//! let response = service.search(&SearchRequest::new("三体")).await;
//! ```

pub use pansou_core as core;
pub use pansou_kernel as kernel;
pub use pansou_plugins as plugins;
pub use pansou_runtime as runtime;
pub use pansou_transport as transport;

/// The names most callers need.
pub mod prelude {
    pub use pansou_core::{
        classify_url, extract_cloud_links, extract_password, filter_results_by_keyword, CloudType,
        Ext, Link, PluginSearchResult, SearchResponse, SearchResult,
    };
    pub use pansou_kernel::{
        BaseAsyncPlugin, PluginRegistry, ResultType, SearchPlugin, SearchRequest, SearchService,
        SearchServiceConfig, SourceType,
    };
    pub use pansou_runtime::AppConfig;
}
