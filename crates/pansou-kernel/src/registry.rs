//! Process-wide plugin registry.
//!
//! Registration happens in one enumeration phase at startup: the plugins
//! crate lists its constructors in a fixed order and registers each exactly
//! once. After that the registry is read-only and shared behind an `Arc`.

use std::sync::Arc;

use crate::plugin::SearchPlugin;

/// Ordered collection of registered plugins.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn SearchPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin.
    ///
    /// # Panics
    ///
    /// Two plugins with the same name are a programming error in the
    /// enumeration phase; a duplicate panics immediately rather than
    /// shadowing one of them at search time.
    pub fn register(&mut self, plugin: Arc<dyn SearchPlugin>) {
        let name = plugin.name().to_string();
        if self.plugins.iter().any(|p| p.name() == name) {
            panic!("duplicate plugin registration: '{name}'");
        }
        self.plugins.push(plugin);
    }

    /// Snapshot of every registered plugin, in registration order.
    pub fn plugins(&self) -> &[Arc<dyn SearchPlugin>] {
        &self.plugins
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SearchPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    /// The plugins whose names appear in `names`; an empty list means
    /// "all".
    pub fn enabled(&self, names: &[String]) -> Vec<Arc<dyn SearchPlugin>> {
        if names.is_empty() {
            return self.plugins.clone();
        }
        self.plugins
            .iter()
            .filter(|p| names.iter().any(|n| n == p.name()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pansou_core::{Ext, PluginSearchResult};

    struct Named(&'static str);

    #[async_trait]
    impl SearchPlugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn search_with_result(
            &self,
            _keyword: &str,
            _ext: &Ext,
        ) -> crate::error::PluginResult<PluginSearchResult> {
            Ok(PluginSearchResult::empty())
        }
    }

    #[test]
    fn enabled_subset_and_all() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("a")));
        registry.register(Arc::new(Named("b")));
        registry.register(Arc::new(Named("c")));

        assert_eq!(registry.enabled(&[]).len(), 3);
        let subset = registry.enabled(&["b".into(), "missing".into()]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].name(), "b");
    }

    #[test]
    #[should_panic(expected = "duplicate plugin registration")]
    fn duplicate_name_panics() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("dup")));
        registry.register(Arc::new(Named("dup")));
    }
}
