//! Configuration for [`Core`](crate::core::Core).

use crate::observability::TracingConfig;

/// Default number of restarts of a pad or child iteration before it fails.
pub const DEFAULT_MAX_RESYNCS: usize = 16;

/// Core configuration.
///
/// ```rust
/// use padflow::config::CoreConfig;
///
/// let config = CoreConfig::default().with_max_iterator_resyncs(4);
/// assert_eq!(config.max_iterator_resyncs, 4);
/// assert!(config.register_core_elements);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// How often pad/child iteration restarts on concurrent modification
    /// before failing with `TooManyResyncs`. Applied to elements created
    /// through the registry.
    pub max_iterator_resyncs: usize,
    /// Register the built-in `coreelements` plugin.
    pub register_core_elements: bool,
    /// Span configuration, installed by `Core::init`.
    pub tracing: TracingConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_iterator_resyncs: DEFAULT_MAX_RESYNCS,
            register_core_elements: true,
            tracing: TracingConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Set the iteration restart bound.
    pub fn with_max_iterator_resyncs(mut self, max: usize) -> Self {
        self.max_iterator_resyncs = max;
        self
    }

    /// Enable or disable the built-in elements.
    pub fn with_core_elements(mut self, enabled: bool) -> Self {
        self.register_core_elements = enabled;
        self
    }

    /// Set the span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}
