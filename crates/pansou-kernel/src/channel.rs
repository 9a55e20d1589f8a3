//! Chat-channel adapter seam.
//!
//! Channel archives (e.g. Telegram mirrors) are external collaborators: the
//! aggregator only needs this interface to fan out to them next to the
//! plugins. Results coming back through it carry the channel name in
//! [`SearchResult::channel`] — the one producer family for which that field
//! is non-empty.

use async_trait::async_trait;

use pansou_core::SearchResult;

use crate::error::PluginResult;

/// One family of chat-channel adapters (`source_type = "tg"`).
#[async_trait]
pub trait ChannelSearcher: Send + Sync {
    /// Family name, e.g. `"tg"`.
    fn name(&self) -> &str;

    /// Searches one channel of the family. Implementations must set
    /// [`SearchResult::channel`] to `channel` on every result.
    async fn search_channel(&self, channel: &str, keyword: &str)
        -> PluginResult<Vec<SearchResult>>;
}
