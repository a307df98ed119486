//! Element behaviour trait.

use super::{Element, PropertyValue, StateChange, StateChangeResult};
use crate::bus::Message;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::pad::{Pad, PadTemplate};
use crate::query::Query;
use bitflags::bitflags;
use std::any::Any;

bitflags! {
    /// Element classification flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ElementFlags: u32 {
        /// The element consumes data (EOS is aggregated over sinks).
        const SINK = 1 << 0;
        /// The element produces data.
        const SOURCE = 1 << 1;
        /// The element contains other elements.
        const BIN = 1 << 2;
    }
}

impl Default for ElementFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Behaviour of an [`Element`].
///
/// Every method has a default, so a minimal implementation only adds pads
/// in [`constructed`](Self::constructed). Handlers attached to those pads
/// reach the implementation again through
/// [`Element::imp`](Element::imp):
///
/// ```rust
/// use padflow::element::{Element, ElementImpl};
/// use padflow::pad::{Pad, PadDirection};
///
/// #[derive(Default)]
/// struct Counter {
///     seen: std::sync::atomic::AtomicUsize,
/// }
///
/// impl ElementImpl for Counter {
///     fn constructed(&self, element: &Element) {
///         let sink = Pad::builder("sink", PadDirection::Sink)
///             .chain_function(|_pad, parent, _buffer| {
///                 if let Some(this) = parent.and_then(|e| e.imp::<Counter>()) {
///                     this.seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///                 }
///                 Ok(())
///             })
///             .build();
///         element.add_pad(sink).unwrap();
///     }
/// }
///
/// let element = Element::new("counter", Counter::default());
/// assert!(element.static_pad("sink").is_some());
/// ```
pub trait ElementImpl: Any + Send + Sync {
    /// Called once after the element handle exists; add always pads here.
    fn constructed(&self, _element: &Element) {}

    /// Perform one state transition.
    ///
    /// Implementations normally call
    /// [`Element::default_change_state`] for the pad activation part.
    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        element.default_change_state(transition)
    }

    /// Whether an async state change may complete now.
    fn can_commit(&self, _element: &Element) -> bool {
        true
    }

    /// Set a property.
    fn set_property(&self, element: &Element, name: &str, _value: &PropertyValue) -> Result<()> {
        Err(Error::UnknownProperty {
            element: element.name().to_string(),
            property: name.to_string(),
        })
    }

    /// Read a property.
    fn property(&self, _element: &Element, _name: &str) -> Option<PropertyValue> {
        None
    }

    /// Handle an event sent to the element.
    fn send_event(&self, element: &Element, event: Event) -> bool {
        element.default_send_event(event)
    }

    /// Answer a query sent to the element.
    fn query(&self, element: &Element, query: &mut Query) -> bool {
        element.default_query(query)
    }

    /// Templates of the pads this element can have.
    fn pad_templates(&self) -> Vec<PadTemplate> {
        Vec::new()
    }

    /// Create a pad from a request template.
    ///
    /// The returned pad is added to the element unless the implementation
    /// already did so.
    fn request_new_pad(
        &self,
        _element: &Element,
        _template: &PadTemplate,
        _name: Option<&str>,
    ) -> Option<Pad> {
        None
    }

    /// Called before a request pad is removed.
    fn release_pad(&self, _element: &Element, _pad: &Pad) {}

    /// Handle a message posted by a child. Only containers receive these.
    fn handle_message(&self, element: &Element, message: Message) {
        element.post_message(message);
    }
}
