//! AppSrc: the pipeline start fed by the application.
//!
//! Buffers queued through a handle are pushed by the source pad task.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{
    Element, ElementFlags, ElementImpl, PropertyValue, StateChange, StateChangeResult,
    StateChangeSuccess,
};
use crate::elements::base_src::{StreamHeader, start_push_loop};
use crate::elements::{invalid_value, unknown_property};
use crate::error::Result;
use crate::format::Format;
use crate::pad::{FlowError, FlowResult, Pad, PadMode, PadTemplate};
use crate::query::Query;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A source element that allows applications to inject buffers into a
/// pipeline.
///
/// Buffers are queued by [`AppSrcHandle::push_buffer`] and pushed downstream
/// by the source pad's streaming task. Once the queue holds `max-buffers`
/// buffers, pushing blocks until the task catches up.
///
/// | property      | type | default |
/// |---------------|------|---------|
/// | `caps`        | caps | none (sent as a `Caps` event when set) |
/// | `max-buffers` | int  | 64, 0 for unlimited |
/// | `is-live`     | bool | `false` |
///
/// # Example
///
/// ```rust
/// use padflow::buffer::Buffer;
/// use padflow::element::Element;
/// use padflow::elements::AppSrc;
///
/// let src = Element::new("src", AppSrc::default());
/// let handle = src.imp::<AppSrc>().unwrap().handle();
///
/// // From any thread:
/// handle.push_buffer(Buffer::from_slice(b"data")).unwrap();
/// handle.end_of_stream().unwrap();
/// ```
pub struct AppSrc {
    inner: Arc<AppSrcInner>,
    caps: RwLock<Option<Caps>>,
    is_live: AtomicBool,
}

struct AppSrcInner {
    state: Mutex<AppSrcState>,
    changed: Condvar,
}

struct AppSrcState {
    queue: VecDeque<Buffer>,
    max_buffers: usize,
    eos: bool,
    flushing: bool,
    total_pushed: u64,
    total_produced: u64,
}

/// Application side of an [`AppSrc`].
///
/// Clone it freely; every clone feeds the same queue.
#[derive(Clone)]
pub struct AppSrcHandle {
    inner: Arc<AppSrcInner>,
}

impl AppSrc {
    /// Create an AppSrc holding at most `max_buffers` queued buffers.
    pub fn with_max_buffers(max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(AppSrcInner {
                state: Mutex::new(AppSrcState {
                    queue: VecDeque::with_capacity(max_buffers.min(256)),
                    max_buffers,
                    eos: false,
                    flushing: false,
                    total_pushed: 0,
                    total_produced: 0,
                }),
                changed: Condvar::new(),
            }),
            caps: RwLock::new(None),
            is_live: AtomicBool::new(false),
        }
    }

    /// A handle that feeds this source.
    pub fn handle(&self) -> AppSrcHandle {
        AppSrcHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Caps announced downstream, if any.
    pub fn caps(&self) -> Option<Caps> {
        self.caps.read().unwrap().clone()
    }

    /// Buffers waiting to be pushed downstream.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Whether the application ended the stream.
    pub fn is_eos(&self) -> bool {
        self.inner.state.lock().unwrap().eos
    }

    /// Get statistics.
    pub fn stats(&self) -> AppSrcStats {
        let state = self.inner.state.lock().unwrap();
        AppSrcStats {
            queued_buffers: state.queue.len(),
            total_pushed: state.total_pushed,
            total_produced: state.total_produced,
            eos: state.eos,
        }
    }

    fn header(&self) -> StreamHeader {
        StreamHeader {
            caps: self.caps(),
            format: Format::Bytes,
        }
    }

    fn activate_push(pad: &Pad, parent: Option<&Element>, active: bool) -> bool {
        let Some(this) = parent.and_then(|e| e.imp::<AppSrc>()) else {
            return false;
        };
        if !active {
            this.inner.set_flushing(true);
            pad.stop_task();
            return true;
        }
        this.inner.set_flushing(false);
        let started = start_push_loop(pad, this.header(), |element, _pad| {
            element
                .imp::<AppSrc>()
                .ok_or(FlowError::Error)?
                .inner
                .pop()
        });
        if let Err(e) = &started {
            warn!(pad = %pad.path(), error = %e, "cannot start streaming");
        }
        started.is_ok()
    }
}

impl Default for AppSrc {
    fn default() -> Self {
        Self::with_max_buffers(64)
    }
}

impl AppSrcInner {
    /// Next buffer for the streaming task; blocks until there is one.
    fn pop(&self) -> std::result::Result<Buffer, FlowError> {
        let mut state = self.state.lock().unwrap();
        while state.queue.is_empty() && !state.eos && !state.flushing {
            state = self.changed.wait(state).unwrap();
        }
        if state.flushing {
            return Err(FlowError::Flushing);
        }
        match state.queue.pop_front() {
            Some(buffer) => {
                state.total_produced += 1;
                self.changed.notify_all();
                trace!(queued = state.queue.len(), "dequeued buffer");
                Ok(buffer)
            }
            None => Err(FlowError::Eos),
        }
    }

    /// Entering flushing drops queued data; leaving it also clears EOS.
    fn set_flushing(&self, flushing: bool) {
        let mut state = self.state.lock().unwrap();
        state.flushing = flushing;
        if flushing {
            state.queue.clear();
        } else {
            state.eos = false;
        }
        self.changed.notify_all();
    }
}

impl AppSrcHandle {
    /// Queue a buffer, blocking while the queue is full.
    ///
    /// This may block if the internal queue is full. Fails with
    /// [`FlowError::Eos`] after [`end_of_stream`](Self::end_of_stream) and
    /// with [`FlowError::Flushing`] while the source is shutting down.
    pub fn push_buffer(&self, buffer: Buffer) -> FlowResult {
        self.push_buffer_timeout(buffer, None)
    }

    /// Push a buffer, giving up with [`FlowError::Error`] if the queue
    /// stays full for `timeout`.
    pub fn push_buffer_timeout(&self, buffer: Buffer, timeout: Option<Duration>) -> FlowResult {
        let mut state = self.inner.state.lock().unwrap();
        if state.eos {
            return Err(FlowError::Eos);
        }

        while state.max_buffers > 0 && state.queue.len() >= state.max_buffers && !state.flushing {
            state = match timeout {
                Some(t) => {
                    let (s, result) = self.inner.changed.wait_timeout(state, t).unwrap();
                    if result.timed_out() {
                        debug!("appsrc push timed out");
                        return Err(FlowError::Error);
                    }
                    s
                }
                None => self.inner.changed.wait(state).unwrap(),
            };
        }
        if state.flushing {
            return Err(FlowError::Flushing);
        }

        state.queue.push_back(buffer);
        state.total_pushed += 1;
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Signal end of stream.
    ///
    /// Queued buffers are still delivered; then the task sends EOS.
    pub fn end_of_stream(&self) -> FlowResult {
        let mut state = self.inner.state.lock().unwrap();
        if state.flushing {
            return Err(FlowError::Flushing);
        }
        state.eos = true;
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Buffers waiting to be pushed downstream.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Whether `push_buffer` would block.
    pub fn is_full(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.max_buffers > 0 && state.queue.len() >= state.max_buffers
    }
}

impl ElementImpl for AppSrc {
    fn constructed(&self, element: &Element) {
        element.set_element_flags(ElementFlags::SOURCE);
        let src = Pad::builder_from_template(&PadTemplate::src(Caps::new_any()), None)
            .activatemode_function(|pad, parent, mode, active| match mode {
                PadMode::Push => AppSrc::activate_push(pad, parent, active),
                _ => !active,
            })
            .query_function(|pad, parent, query| {
                if let Query::Caps { .. } = query
                    && let Some(caps) = parent.and_then(|e| e.imp::<AppSrc>()).and_then(AppSrc::caps)
                {
                    query.set_caps_result(caps);
                    return true;
                }
                Pad::query_default(pad, parent, query)
            })
            .build();
        if let Err(e) = element.add_pad(src) {
            tracing::error!(element = %element.name(), error = %e, "cannot add src pad");
        }
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        let ret = element.default_change_state(transition)?;
        match transition {
            StateChange::ReadyToPaused | StateChange::PlayingToPaused
                if self.is_live.load(Ordering::Relaxed) =>
            {
                Ok(StateChangeSuccess::NoPreroll)
            }
            StateChange::ReadyToNull => {
                if let Some(pad) = element.static_pad("src") {
                    pad.join_task();
                }
                Ok(ret)
            }
            _ => Ok(ret),
        }
    }

    fn set_property(&self, element: &Element, name: &str, value: &PropertyValue) -> Result<()> {
        match name {
            "caps" => {
                let caps = value
                    .as_caps()
                    .ok_or_else(|| invalid_value(name, value, "caps"))?;
                *self.caps.write().unwrap() = Some(caps);
            }
            "max-buffers" => {
                let max = value
                    .as_u64()
                    .ok_or_else(|| invalid_value(name, value, "a non-negative integer"))?;
                self.inner.state.lock().unwrap().max_buffers = max as usize;
                self.inner.changed.notify_all();
            }
            "is-live" => self.is_live.store(
                value
                    .as_bool()
                    .ok_or_else(|| invalid_value(name, value, "a boolean"))?,
                Ordering::Relaxed,
            ),
            _ => return Err(unknown_property(element, name)),
        }
        Ok(())
    }

    fn property(&self, _element: &Element, name: &str) -> Option<PropertyValue> {
        match name {
            "caps" => self.caps().map(Into::into),
            "max-buffers" => Some(PropertyValue::Integer(
                self.inner.state.lock().unwrap().max_buffers as i64,
            )),
            "is-live" => Some(self.is_live.load(Ordering::Relaxed).into()),
            _ => None,
        }
    }

    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::src(Caps::new_any())]
    }
}

/// Counters reported by [`AppSrc::stats`].
#[derive(Debug, Clone, Copy)]
pub struct AppSrcStats {
    /// Buffers waiting when the counters were read.
    pub queued_buffers: usize,
    /// Buffers queued by the application.
    pub total_pushed: u64,
    /// Total buffers handed to the streaming task.
    pub total_produced: u64,
    /// Whether the stream was ended.
    pub eos: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn buffer(seq: u64) -> Buffer {
        Buffer::from_slice(&[0; 100]).with_offset(seq)
    }

    #[test]
    fn test_appsrc_push_pop() {
        let src = AppSrc::default();
        let handle = src.handle();

        handle.push_buffer(buffer(0)).unwrap();
        handle.push_buffer(buffer(1)).unwrap();
        assert_eq!(src.queue_len(), 2);

        assert_eq!(src.inner.pop().unwrap().offset(), Some(0));
        assert_eq!(src.inner.pop().unwrap().offset(), Some(1));
    }

    #[test]
    fn test_appsrc_eos() {
        let src = AppSrc::default();
        let handle = src.handle();

        handle.push_buffer(buffer(0)).unwrap();
        handle.end_of_stream().unwrap();
        assert!(src.is_eos());

        // Queued data is still delivered before EOS.
        assert!(src.inner.pop().is_ok());
        assert_eq!(src.inner.pop().unwrap_err(), FlowError::Eos);
        assert_eq!(handle.push_buffer(buffer(1)), Err(FlowError::Eos));
    }

    #[test]
    fn test_appsrc_flushing() {
        let src = AppSrc::default();
        let handle = src.handle();
        handle.push_buffer(buffer(0)).unwrap();

        src.inner.set_flushing(true);
        assert_eq!(src.queue_len(), 0);
        assert_eq!(handle.push_buffer(buffer(1)), Err(FlowError::Flushing));
        assert_eq!(src.inner.pop().unwrap_err(), FlowError::Flushing);

        src.inner.set_flushing(false);
        handle.push_buffer(buffer(2)).unwrap();
        assert_eq!(src.queue_len(), 1);
    }

    #[test]
    fn test_appsrc_full_queue_times_out() {
        let src = AppSrc::with_max_buffers(1);
        let handle = src.handle();
        handle.push_buffer(buffer(0)).unwrap();
        assert!(handle.is_full());
        assert_eq!(
            handle.push_buffer_timeout(buffer(1), Some(Duration::from_millis(10))),
            Err(FlowError::Error)
        );
    }

    #[test]
    fn test_appsrc_multithreaded() {
        let src = AppSrc::with_max_buffers(2);
        let handle = src.handle();

        let producer = thread::spawn(move || {
            for i in 0..10 {
                handle.push_buffer(buffer(i)).unwrap();
            }
            handle.end_of_stream().unwrap();
        });

        let mut received = Vec::new();
        while let Ok(buf) = src.inner.pop() {
            received.push(buf.offset());
        }
        producer.join().unwrap();
        assert_eq!(received.len(), 10);
        assert_eq!(received[9], Some(9));

        let stats = src.stats();
        assert_eq!(stats.total_pushed, 10);
        assert_eq!(stats.total_produced, 10);
        assert!(stats.eos);
    }

    #[test]
    fn test_appsrc_properties() {
        let src = Element::new("src", AppSrc::default());
        src.set_property("caps", "audio/x-raw, rate=44100").unwrap();
        src.set_property("max-buffers", 3).unwrap();
        src.set_property("is-live", true).unwrap();
        assert_eq!(src.property("max-buffers"), Some(PropertyValue::Integer(3)));
        assert_eq!(src.property("is-live"), Some(PropertyValue::Bool(true)));

        let caps = src.static_pad("src").unwrap().query_caps(None);
        assert_eq!(caps.structure(0).unwrap().get_int("rate"), Some(44100));
        assert!(src.set_property("max-buffers", "many").is_err());
    }
}
