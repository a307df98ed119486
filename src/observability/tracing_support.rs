//! Tracing spans for elements, pads and state changes.

use crate::element::{Element, State};
use crate::pad::Pad;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, Span, span};

static ELEMENT_SPANS: AtomicBool = AtomicBool::new(true);
static PAD_SPANS: AtomicBool = AtomicBool::new(false);
static STATE_SPANS: AtomicBool = AtomicBool::new(true);

/// Which spans the framework creates.
///
/// Spans only cost something when a subscriber is installed; the per-pad
/// span is entered for every iteration of a streaming task and is off by
/// default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Whether to create spans for element streaming threads.
    pub element_spans: bool,
    /// Whether to create spans for every streaming task iteration.
    pub pad_spans: bool,
    /// Whether to create spans around state changes.
    pub state_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            element_spans: true,
            pad_spans: false,
            state_spans: true,
        }
    }
}

impl TracingConfig {
    /// Create a new tracing config with all spans enabled.
    pub fn all() -> Self {
        Self {
            element_spans: true,
            pad_spans: true,
            state_spans: true,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            element_spans: false,
            pad_spans: false,
            state_spans: false,
        }
    }

    /// Enable or disable pad spans.
    pub fn with_pad_spans(mut self, enabled: bool) -> Self {
        self.pad_spans = enabled;
        self
    }

    /// Make this configuration the active one for the process.
    pub fn install(&self) {
        ELEMENT_SPANS.store(self.element_spans, Ordering::Relaxed);
        PAD_SPANS.store(self.pad_spans, Ordering::Relaxed);
        STATE_SPANS.store(self.state_spans, Ordering::Relaxed);
    }
}

/// Create a span for work done on behalf of an element.
///
/// # Example
///
/// ```rust
/// use padflow::element::{Element, ElementImpl};
/// use padflow::observability::span_element;
///
/// struct Empty;
/// impl ElementImpl for Empty {}
///
/// let element = Element::new("e", Empty);
/// let _guard = span_element(&element).entered();
/// ```
#[inline]
pub fn span_element(element: &Element) -> Span {
    if !ELEMENT_SPANS.load(Ordering::Relaxed) {
        return Span::none();
    }
    span!(
        Level::DEBUG,
        "element",
        element = %element.name(),
        factory = element.factory_name().unwrap_or("")
    )
}

/// Create a span for a streaming task iteration on a pad.
#[inline]
pub fn span_pad(pad: &Pad) -> Span {
    if !PAD_SPANS.load(Ordering::Relaxed) {
        return Span::none();
    }
    span!(Level::TRACE, "pad", pad = %pad.path())
}

/// Create a span around a state change towards `target`.
#[inline]
pub fn span_state_change(element: &Element, target: State) -> Span {
    if !STATE_SPANS.load(Ordering::Relaxed) {
        return Span::none();
    }
    span!(
        Level::DEBUG,
        "state_change",
        element = %element.name(),
        target = %target
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.element_spans);
        assert!(!config.pad_spans);
        assert!(config.state_spans);
    }

    #[test]
    fn test_tracing_config_builders() {
        assert!(TracingConfig::all().pad_spans);
        assert!(!TracingConfig::none().state_spans);
        assert!(TracingConfig::none().with_pad_spans(true).pad_spans);
    }

    #[test]
    fn test_span_creation() {
        // No subscriber: spans are disabled but must not panic.
        let pad = Pad::new("p", crate::pad::PadDirection::Src);
        let _span = span_pad(&pad);
    }
}
