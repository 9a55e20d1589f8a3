//! # PanSou Plugins
//!
//! The upstream adapters. Every adapter follows one template: it embeds a
//! [`BaseAsyncPlugin`](pansou_kernel::BaseAsyncPlugin) for its HTTP client,
//! worker pool, retries and two-level cache; its search implementation
//! builds the upstream request with spoofed browser headers, parses the
//! answer (JSON or HTML), mines share links through
//! [`pansou_core::extract_cloud_links`] and returns canonical results with
//! `unique_id = "<plugin>-<stable id>"` and an empty `channel`.
//!
//! The two sub-services — [`qqpd`] and [`weibo`] — are larger: multi-tenant
//! proxies with QR login, per-user state on disk and their own web UI,
//! mounted through the plugin contract's `web_routes` capability.
//!
//! Registration is one enumeration phase: [`builtin_registry`] constructs
//! every plugin in a fixed order; a duplicate name panics at startup, not
//! at search time.

use std::sync::Arc;

use pansou_kernel::{KernelError, PluginRegistry};

pub mod cookies;
pub mod discourse;
pub mod huban;
pub mod hunhepan;
pub mod jsnoteclub;
pub mod nyaa;
pub mod qqpd;
pub mod store;
pub mod weibo;

/// Builds the registry with every built-in plugin, in fixed order.
pub fn builtin_registry() -> Result<PluginRegistry, KernelError> {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(hunhepan::HunhepanPlugin::new()?));
    registry.register(Arc::new(jsnoteclub::JsNoteClubPlugin::new()?));
    registry.register(Arc::new(nyaa::NyaaPlugin::new()?));
    registry.register(Arc::new(discourse::DiscoursePlugin::new()?));
    registry.register(Arc::new(huban::HubanPlugin::new()?));
    registry.register(Arc::new(qqpd::QqpdPlugin::new()?));
    registry.register(Arc::new(weibo::WeiboPlugin::new()?));
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_enumerates_all() {
        let registry = builtin_registry().unwrap();
        let names: Vec<_> = registry.plugins().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(
            names,
            vec![
                "hunhepan",
                "jsnoteclub",
                "nyaa",
                "discourse",
                "huban",
                "qqpd",
                "weibo"
            ]
        );
    }
}
