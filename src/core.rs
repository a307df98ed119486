//! Explicit initialization and shutdown.
//!
//! There is no process-global state: a [`Core`] owns the [`Registry`] and
//! everything created through it is looked up there.

pub use crate::config::CoreConfig;

use crate::element::Element;
use crate::elements;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, build_pipeline, parse_pipeline};
use crate::plugin::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// An initialized framework instance.
///
/// ```rust
/// use padflow::core::{Core, CoreConfig};
///
/// let core = Core::init(CoreConfig::default());
/// assert!(core.registry().lookup_feature("identity").is_ok());
///
/// core.shutdown();
/// assert!(core.make_element("identity", None).is_err());
/// ```
#[derive(Debug)]
pub struct Core {
    registry: Registry,
    config: CoreConfig,
    shut_down: AtomicBool,
}

impl Core {
    /// Install `config` and build the registry, with the built-in elements
    /// unless disabled.
    pub fn init(config: CoreConfig) -> Core {
        config.tracing.install();
        let registry = Registry::new();
        registry.set_max_resyncs(config.max_iterator_resyncs);
        if config.register_core_elements
            && let Err(e) = registry.register_plugin(elements::plugin())
        {
            warn!(error = %e, "cannot register built-in elements");
        }
        info!(
            plugins = registry.plugin_names().len(),
            max_resyncs = config.max_iterator_resyncs,
            "initialized"
        );
        Core {
            registry,
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    /// The plugin registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The configuration this instance was created with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Create an element from a registered factory.
    pub fn make_element(&self, factory: &str, name: Option<&str>) -> Result<Element> {
        self.check_running()?;
        self.registry.make_element(factory, name)
    }

    /// Parse a launch description and build the linked pipeline.
    ///
    /// ```rust
    /// use padflow::core::{Core, CoreConfig};
    ///
    /// let core = Core::init(CoreConfig::default());
    /// let pipeline = core.parse_launch("testsrc num-buffers=1 ! nullsink name=out").unwrap();
    /// assert!(pipeline.by_name("out").is_some());
    /// ```
    pub fn parse_launch(&self, description: &str) -> Result<Pipeline> {
        self.check_running()?;
        debug!(description, "parsing launch description");
        let parsed = parse_pipeline(description)?;
        build_pipeline(&self.registry, &parsed)
    }

    /// Clear the registry. Later lookups through this instance fail with
    /// [`Error::ShutDown`]; existing elements keep working.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            info!("shutting down");
            self.registry.clear();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl Default for Core {
    fn default() -> Self {
        Core::init(CoreConfig::default())
    }
}
