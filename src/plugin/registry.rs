//! The registry of plugins and element factories.

use super::descriptor::{ElementFactory, Plugin};
use crate::config::DEFAULT_MAX_RESYNCS;
use crate::element::Element;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Registered plugins and an index of their factories by name.
pub struct Registry {
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
    /// Factory name -> (plugin name, factory).
    features: RwLock<HashMap<String, (String, ElementFactory)>>,
    max_resyncs: AtomicUsize,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            features: RwLock::new(HashMap::new()),
            max_resyncs: AtomicUsize::new(DEFAULT_MAX_RESYNCS),
        }
    }

    /// Iteration restart bound given to created elements.
    pub fn set_max_resyncs(&self, max: usize) {
        self.max_resyncs.store(max, Ordering::Relaxed);
    }

    /// Register a plugin and its factories.
    ///
    /// Fails without registering anything if the plugin name or one of its
    /// factory names is already taken.
    pub fn register_plugin(&self, plugin: Plugin) -> Result<()> {
        let mut plugins = self.plugins.write().unwrap();
        let mut features = self.features.write().unwrap();

        if plugins.contains_key(plugin.name()) {
            return Err(Error::NameConflict {
                name: plugin.name().to_string(),
                container: "registry".to_string(),
            });
        }
        for factory in plugin.factories() {
            if let Some((owner, _)) = features.get(factory.name()) {
                return Err(Error::NameConflict {
                    name: factory.name().to_string(),
                    container: owner.clone(),
                });
            }
        }

        for factory in plugin.factories() {
            trace!(plugin = %plugin.name(), factory = %factory.name(), "registering factory");
            features.insert(
                factory.name().to_string(),
                (plugin.name().to_string(), factory.clone()),
            );
        }
        debug!(
            plugin = %plugin.name(),
            factories = plugin.factories().len(),
            "registered plugin"
        );
        plugins.insert(plugin.name().to_string(), Arc::new(plugin));
        Ok(())
    }

    /// Remove a plugin and its factories.
    pub fn unregister_plugin(&self, name: &str) -> Result<()> {
        let plugin = self
            .plugins
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| Error::not_found("plugin", name))?;

        let mut features = self.features.write().unwrap();
        for factory in plugin.factories() {
            features.remove(factory.name());
        }
        debug!(plugin = %name, "unregistered plugin");
        Ok(())
    }

    /// Look up a plugin.
    pub fn find_plugin(&self, name: &str) -> Result<Arc<Plugin>> {
        self.plugins
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("plugin", name))
    }

    /// Whether a plugin is registered.
    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.read().unwrap().contains_key(name)
    }

    /// Names of all registered plugins, sorted.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up an element factory.
    pub fn lookup_feature(&self, name: &str) -> Result<ElementFactory> {
        self.features
            .read()
            .unwrap()
            .get(name)
            .map(|(_, factory)| factory.clone())
            .ok_or_else(|| Error::not_found("element factory", name))
    }

    /// Name of the plugin providing a factory.
    pub fn feature_plugin(&self, name: &str) -> Option<String> {
        self.features
            .read()
            .unwrap()
            .get(name)
            .map(|(plugin, _)| plugin.clone())
    }

    /// All factories, highest rank first, then by name.
    pub fn element_factories(&self) -> Vec<ElementFactory> {
        let mut factories: Vec<ElementFactory> = self
            .features
            .read()
            .unwrap()
            .values()
            .map(|(_, f)| f.clone())
            .collect();
        factories.sort_by(|a, b| b.rank().cmp(&a.rank()).then_with(|| a.name().cmp(b.name())));
        factories
    }

    /// Create an element from a registered factory.
    pub fn make_element(&self, factory: &str, name: Option<&str>) -> Result<Element> {
        let factory = self.lookup_feature(factory)?;
        let element = factory.create(name);
        element.set_max_resyncs(self.max_resyncs.load(Ordering::Relaxed));
        trace!(factory = %factory.name(), element = %element.name(), "created element");
        Ok(element)
    }

    /// Forget all plugins and factories.
    pub fn clear(&self) {
        self.plugins.write().unwrap().clear();
        self.features.write().unwrap().clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugin_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementImpl;

    #[derive(Default)]
    struct Nop;
    impl ElementImpl for Nop {}

    fn plugin(name: &str, factories: &[&str]) -> Plugin {
        factories.iter().fold(Plugin::new(name), |p, f| {
            p.with_element(ElementFactory::for_impl::<Nop>(*f))
        })
    }

    #[test]
    fn register_and_make() {
        let registry = Registry::new();
        registry.set_max_resyncs(3);
        registry.register_plugin(plugin("basic", &["a", "b"])).unwrap();

        assert!(registry.has_plugin("basic"));
        assert_eq!(registry.feature_plugin("a").as_deref(), Some("basic"));

        let element = registry.make_element("b", Some("mine")).unwrap();
        assert_eq!(element.name(), "mine");
        assert_eq!(element.factory_name(), Some("b"));
        assert_eq!(element.max_resyncs(), 3);

        assert!(matches!(
            registry.make_element("missing", None),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn conflicts_register_nothing() {
        let registry = Registry::new();
        registry.register_plugin(plugin("one", &["a"])).unwrap();

        let err = registry.register_plugin(plugin("two", &["b", "a"])).unwrap_err();
        assert!(matches!(err, Error::NameConflict { .. }));
        assert!(!registry.has_plugin("two"));
        assert!(registry.lookup_feature("b").is_err());

        assert!(registry.register_plugin(plugin("one", &["c"])).is_err());
    }

    #[test]
    fn unregister_and_clear() {
        let registry = Registry::new();
        registry.register_plugin(plugin("one", &["a"])).unwrap();
        registry.register_plugin(plugin("two", &["b"])).unwrap();
        assert_eq!(registry.plugin_names(), vec!["one", "two"]);

        registry.unregister_plugin("one").unwrap();
        assert!(registry.lookup_feature("a").is_err());
        assert!(registry.unregister_plugin("one").is_err());

        registry.clear();
        assert!(registry.find_plugin("two").is_err());
        assert!(registry.element_factories().is_empty());
    }
}
