//! # PanSou Kernel
//!
//! The execution core of the search aggregator: the plugin contract, the
//! process-wide plugin registry, the two-level cache with per-key
//! single-flight, the [`BaseAsyncPlugin`] every adapter embeds, and the
//! [`SearchService`] that fans a request out to every enabled adapter and
//! merges what comes back.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐    ┌──────────────────────────────────────────┐
//! │ SearchService │───▶│ adapter task (one per plugin, own budget) │──┐
//! │  (aggregator) │───▶│ adapter task                              │──┤
//! └──────┬────────┘    └──────────────────────────────────────────┘  │
//!        │  merge ◀── completion order ◀───────────────────────────────┘
//!        ▼
//!   dedupe → keyword filter → sort → group by provider → response cache
//! ```
//!
//! Each adapter embeds a [`BaseAsyncPlugin`], which owns the plugin's tuned
//! HTTP client, its worker semaphore and its slice of the two-level cache:
//! fresh snapshots are served as final, stale snapshots are served
//! immediately with `is_final = false` while one detached refresh per key
//! re-fetches in the background.

pub mod base;
pub mod cache;
pub mod channel;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod service;

pub use base::BaseAsyncPlugin;
pub use cache::{CacheLookup, TwoLevelCache};
pub use channel::ChannelSearcher;
pub use error::{KernelError, PluginError, PluginResult};
pub use plugin::SearchPlugin;
pub use registry::PluginRegistry;
pub use service::{ResultType, SearchRequest, SearchService, SearchServiceConfig, SourceType};
