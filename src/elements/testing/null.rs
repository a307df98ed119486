//! NullSink: discards everything it receives.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{
    Element, ElementFlags, ElementImpl, PropertyValue, StateChange, StateChangeResult,
};
use crate::elements::base_sink::SinkCore;
use crate::error::{Error, Result};
use crate::pad::{FlowError, Pad, PadDirection, PadTemplate};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Called for every buffer before it is discarded.
pub type HandoffCallback = Arc<dyn Fn(&Element, &Buffer) + Send + Sync>;

/// A sink that discards all buffers.
///
/// Useful for benchmarking and for testing sources. Prerolls like any sink:
/// going to `Paused` completes when the first buffer or EOS arrives unless
/// the `async` property is `false`.
///
/// | property   | type | default |
/// |------------|------|---------|
/// | `async`    | bool | `true`  |
/// | `rendered` | int  | read only, buffers received |
/// | `bytes`    | int  | read only, bytes received |
pub struct NullSink {
    core: SinkCore,
    is_async: AtomicBool,
    rendered: AtomicU64,
    bytes: AtomicU64,
    handoff: RwLock<Vec<HandoffCallback>>,
}

impl Default for NullSink {
    fn default() -> Self {
        Self {
            core: SinkCore::default(),
            is_async: AtomicBool::new(true),
            rendered: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            handoff: RwLock::new(Vec::new()),
        }
    }
}

impl NullSink {
    /// Buffers received since the last `ReadyToPaused`.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    /// Bytes received since the last `ReadyToPaused`.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Whether EOS has been received.
    pub fn is_eos(&self) -> bool {
        self.core.is_eos()
    }

    /// Call `f` for every buffer, on the streaming thread.
    pub fn connect_handoff<F>(&self, f: F)
    where
        F: Fn(&Element, &Buffer) + Send + Sync + 'static,
    {
        self.handoff.write().unwrap().push(Arc::new(f));
    }

    fn render(&self, element: &Element, buffer: Buffer) -> std::result::Result<(), FlowError> {
        self.core.preroll(element)?;
        let n = self.rendered.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes.fetch_add(buffer.len() as u64, Ordering::Relaxed);
        trace!(element = %element.name(), n, size = buffer.len(), "rendered buffer");

        let callbacks = self.handoff.read().unwrap().clone();
        for f in &callbacks {
            f(element, &buffer);
        }
        Ok(())
    }
}

impl ElementImpl for NullSink {
    fn constructed(&self, element: &Element) {
        element.set_element_flags(ElementFlags::SINK);
        let sink = Pad::builder_from_template(&PadTemplate::sink(Caps::new_any()), None)
            .chain_function(|_pad, parent, buffer| {
                let element = parent.ok_or(FlowError::Error)?;
                let this = element.imp::<NullSink>().ok_or(FlowError::Error)?;
                this.render(element, buffer)
            })
            .event_function(|_pad, parent, event| {
                match parent.and_then(|e| e.imp::<NullSink>().map(|this| (e, this))) {
                    Some((element, this)) => this.core.handle_event(element, &event),
                    None => true,
                }
            })
            .build();
        if let Err(e) = element.add_pad(sink) {
            tracing::error!(element = %element.name(), error = %e, "cannot add sink pad");
        }
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        if transition == StateChange::ReadyToPaused {
            self.rendered.store(0, Ordering::Relaxed);
            self.bytes.store(0, Ordering::Relaxed);
        }
        self.core
            .change_state(element, transition, self.is_async.load(Ordering::Relaxed))
    }

    fn set_property(&self, element: &Element, name: &str, value: &PropertyValue) -> Result<()> {
        match name {
            "async" => {
                let v = value.as_bool().ok_or_else(|| Error::InvalidProperty {
                    property: name.to_string(),
                    reason: format!("expected a boolean, got {value}"),
                })?;
                self.is_async.store(v, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Error::UnknownProperty {
                element: element.name().to_string(),
                property: name.to_string(),
            }),
        }
    }

    fn property(&self, _element: &Element, name: &str) -> Option<PropertyValue> {
        match name {
            "async" => Some(self.is_async.load(Ordering::Relaxed).into()),
            "rendered" => Some(PropertyValue::Integer(self.rendered() as i64)),
            "bytes" => Some(PropertyValue::Integer(self.bytes() as i64)),
            _ => None,
        }
    }

    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::sink(Caps::new_any())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{State, StateChangeSuccess};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn prerolls_on_first_buffer() {
        let sink = Element::new("sink", NullSink::default());
        let pad = sink.static_pad("sink").unwrap();

        assert_eq!(sink.set_state(State::Paused), Ok(StateChangeSuccess::Async));
        assert_eq!(sink.current_state(), State::Ready);

        sink.set_state(State::Playing).unwrap();
        pad.chain(Buffer::from_slice(b"abcd")).unwrap();

        let (res, current, _) = sink.state(None);
        assert_eq!(res, Ok(StateChangeSuccess::Success));
        assert_eq!(current, State::Playing);

        let imp = sink.imp::<NullSink>().unwrap();
        assert_eq!(imp.rendered(), 1);
        assert_eq!(imp.bytes(), 4);

        sink.set_state(State::Null).unwrap();
        assert_eq!(pad.chain(Buffer::from_slice(b"x")), Err(FlowError::Flushing));
    }

    #[test]
    fn sync_when_not_async() {
        let sink = Element::new("sink", NullSink::default());
        sink.set_property("async", false).unwrap();
        assert_eq!(sink.set_state(State::Playing), Ok(StateChangeSuccess::Success));
        assert_eq!(sink.property("async"), Some(PropertyValue::Bool(false)));
        sink.set_state(State::Null).unwrap();
    }

    #[test]
    fn handoff_callback() {
        let sink = Element::new("sink", NullSink::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        sink.imp::<NullSink>().unwrap().connect_handoff(move |_, buffer| {
            s.fetch_add(buffer.len(), Ordering::SeqCst);
        });
        sink.set_property("async", false).unwrap();
        sink.set_state(State::Playing).unwrap();

        let pad = sink.static_pad("sink").unwrap();
        pad.chain(Buffer::from_slice(&[0; 10])).unwrap();
        pad.chain(Buffer::from_slice(&[0; 5])).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 15);
        assert_eq!(sink.property("rendered"), Some(PropertyValue::Integer(2)));
        sink.set_state(State::Null).unwrap();
    }

    #[test]
    fn unknown_property() {
        let sink = Element::new("sink", NullSink::default());
        assert!(matches!(
            sink.set_property("nope", 1),
            Err(Error::UnknownProperty { .. })
        ));
        assert!(matches!(
            sink.set_property("async", "maybe"),
            Err(Error::InvalidProperty { .. })
        ));
    }
}
