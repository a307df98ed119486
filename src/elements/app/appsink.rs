//! AppSink: the pipeline end that hands buffers to the application.
//!
//! Rendered buffers wait in a queue until a handle pulls them.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{
    Element, ElementFlags, ElementImpl, PropertyValue, StateChange, StateChangeResult,
};
use crate::elements::base_sink::SinkCore;
use crate::elements::{invalid_value, unknown_property};
use crate::error::Result;
use crate::event::Event;
use crate::pad::{FlowError, FlowResult, Pad, PadTemplate};
use crate::query::Query;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Called on the streaming thread after a buffer was queued.
pub type NewSampleCallback = Arc<dyn Fn(&Element) + Send + Sync>;
/// Called on the streaming thread once EOS reached the sink.
pub type EosCallback = Arc<dyn Fn(&Element) + Send + Sync>;

/// A sink element that allows applications to extract buffers from a
/// pipeline.
///
/// Rendered buffers are queued internally and retrieved through an
/// [`AppSinkHandle`]. Like every sink it prerolls on the first buffer.
///
/// | property      | type | default |
/// |---------------|------|---------|
/// | `caps`        | caps | none (accept anything) |
/// | `max-buffers` | int  | 0, unlimited |
/// | `drop`        | bool | `false`; drop the oldest buffer instead of blocking when full |
/// | `eos`         | bool | read only |
///
/// # Example
///
/// ```rust,no_run
/// use padflow::element::Element;
/// use padflow::elements::AppSink;
///
/// let sink = Element::new("sink", AppSink::default());
/// let handle = sink.imp::<AppSink>().unwrap().handle();
///
/// // ...the pipeline runs and renders into the sink...
///
/// // on the application thread:
/// while let Some(buffer) = handle.pull_buffer() {
///     println!("{} bytes", buffer.len());
/// }
/// ```
pub struct AppSink {
    core: SinkCore,
    inner: Arc<AppSinkInner>,
    caps: RwLock<Option<Caps>>,
    drop_on_full: AtomicBool,
    new_sample: RwLock<Vec<NewSampleCallback>>,
    on_eos: RwLock<Vec<EosCallback>>,
}

struct AppSinkInner {
    state: Mutex<AppSinkState>,
    changed: Condvar,
}

struct AppSinkState {
    queue: VecDeque<Buffer>,
    max_buffers: usize,
    eos: bool,
    flushing: bool,
    total_received: u64,
    total_pulled: u64,
    total_dropped: u64,
}

/// Application side of an [`AppSink`].
///
/// Clone it freely; every clone pulls from the same queue.
#[derive(Clone)]
pub struct AppSinkHandle {
    inner: Arc<AppSinkInner>,
}

impl AppSink {
    /// Create an AppSink queueing at most `max_buffers` buffers (0 for
    /// unlimited).
    pub fn with_max_buffers(max_buffers: usize) -> Self {
        Self {
            core: SinkCore::default(),
            inner: Arc::new(AppSinkInner {
                state: Mutex::new(AppSinkState {
                    queue: VecDeque::new(),
                    max_buffers,
                    eos: false,
                    flushing: true,
                    total_received: 0,
                    total_pulled: 0,
                    total_dropped: 0,
                }),
                changed: Condvar::new(),
            }),
            caps: RwLock::new(None),
            drop_on_full: AtomicBool::new(false),
            new_sample: RwLock::new(Vec::new()),
            on_eos: RwLock::new(Vec::new()),
        }
    }

    /// A handle that pulls from this sink.
    pub fn handle(&self) -> AppSinkHandle {
        AppSinkHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Call `f` whenever a buffer was queued.
    pub fn connect_new_sample<F>(&self, f: F)
    where
        F: Fn(&Element) + Send + Sync + 'static,
    {
        self.new_sample.write().unwrap().push(Arc::new(f));
    }

    /// Call `f` when the stream ends.
    pub fn connect_eos<F>(&self, f: F)
    where
        F: Fn(&Element) + Send + Sync + 'static,
    {
        self.on_eos.write().unwrap().push(Arc::new(f));
    }

    /// Buffers waiting to be pulled.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Whether EOS arrived at the sink.
    pub fn is_eos(&self) -> bool {
        self.inner.state.lock().unwrap().eos
    }

    /// Counters for this sink.
    pub fn stats(&self) -> AppSinkStats {
        let state = self.inner.state.lock().unwrap();
        AppSinkStats {
            queued_buffers: state.queue.len(),
            total_received: state.total_received,
            total_pulled: state.total_pulled,
            total_dropped: state.total_dropped,
            eos: state.eos,
        }
    }

    fn caps(&self) -> Option<Caps> {
        self.caps.read().unwrap().clone()
    }

    fn render(&self, element: &Element, buffer: Buffer) -> FlowResult {
        self.core.preroll(element)?;
        {
            let mut state = self.inner.state.lock().unwrap();
            let drop_on_full = self.drop_on_full.load(Ordering::Relaxed);
            while state.max_buffers > 0
                && state.queue.len() >= state.max_buffers
                && !state.flushing
            {
                if drop_on_full {
                    state.queue.pop_front();
                    state.total_dropped += 1;
                    trace!(element = %element.name(), "queue full, dropped oldest buffer");
                } else {
                    state = self.inner.changed.wait(state).unwrap();
                }
            }
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            state.queue.push_back(buffer);
            state.total_received += 1;
            self.inner.changed.notify_all();
        }

        let callbacks = self.new_sample.read().unwrap().clone();
        for f in &callbacks {
            f(element);
        }
        Ok(())
    }

    fn sink_event(&self, element: &Element, event: Event) -> bool {
        match &event {
            Event::FlushStart => self.inner.set_flushing(true),
            Event::FlushStop { .. } => self.inner.set_flushing(false),
            _ => {}
        }
        if !self.core.handle_event(element, &event) {
            return false;
        }
        if let Event::Eos = event {
            {
                let mut state = self.inner.state.lock().unwrap();
                state.eos = true;
                self.inner.changed.notify_all();
            }
            let callbacks = self.on_eos.read().unwrap().clone();
            for f in &callbacks {
                f(element);
            }
        }
        true
    }

    fn sink_query(&self, pad: &Pad, parent: Option<&Element>, query: &mut Query) -> bool {
        let Some(caps) = self.caps() else {
            return Pad::query_default(pad, parent, query);
        };
        match query {
            Query::Caps { .. } => {
                query.set_caps_result(caps);
                true
            }
            Query::AcceptCaps {
                caps: candidate,
                result,
            } => {
                *result = candidate.is_subset(&caps);
                true
            }
            _ => Pad::query_default(pad, parent, query),
        }
    }
}

impl Default for AppSink {
    fn default() -> Self {
        Self::with_max_buffers(0)
    }
}

impl AppSinkInner {
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

impl AppSinkHandle {
    /// Pull a buffer from the sink, blocking until one is available.
    ///
    /// Returns `None` at end of stream once the queue is drained, or when
    /// the sink is shut down.
    pub fn pull_buffer(&self) -> Option<Buffer> {
        self.pull_buffer_timeout(None)
    }

    /// Pull a buffer with a timeout.
    ///
    /// Returns `None` on timeout, EOS or shutdown.
    pub fn pull_buffer_timeout(&self, timeout: Option<Duration>) -> Option<Buffer> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(buffer) = state.queue.pop_front() {
                state.total_pulled += 1;
                self.inner.changed.notify_all();
                return Some(buffer);
            }
            if state.eos || state.flushing {
                return None;
            }
            state = match deadline {
                Some(deadline) => {
                    let remaining = deadline.checked_duration_since(Instant::now())?;
                    self.inner.changed.wait_timeout(state, remaining).unwrap().0
                }
                None => self.inner.changed.wait(state).unwrap(),
            };
        }
    }

    /// Pull a queued buffer, or `None` right away.
    pub fn try_pull_buffer(&self) -> Option<Buffer> {
        let mut state = self.inner.state.lock().unwrap();
        let buffer = state.queue.pop_front()?;
        state.total_pulled += 1;
        self.inner.changed.notify_all();
        Some(buffer)
    }

    /// Buffers waiting to be pulled.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Whether the sink rendered EOS.
    pub fn is_eos(&self) -> bool {
        self.inner.state.lock().unwrap().eos
    }

    /// Whether a buffer can be pulled without waiting.
    pub fn has_buffer(&self) -> bool {
        !self.inner.state.lock().unwrap().queue.is_empty()
    }
}

impl ElementImpl for AppSink {
    fn constructed(&self, element: &Element) {
        element.set_element_flags(ElementFlags::SINK);
        let sink = Pad::builder_from_template(&PadTemplate::sink(Caps::new_any()), None)
            .chain_function(|_pad, parent, buffer| {
                let element = parent.ok_or(FlowError::Error)?;
                element
                    .imp::<AppSink>()
                    .ok_or(FlowError::Error)?
                    .render(element, buffer)
            })
            .event_function(|_pad, parent, event| {
                match parent.and_then(|e| e.imp::<AppSink>().map(|this| (e, this))) {
                    Some((element, this)) => this.sink_event(element, event),
                    None => true,
                }
            })
            .query_function(|pad, parent, query| {
                match parent.and_then(|e| e.imp::<AppSink>()) {
                    Some(this) => this.sink_query(pad, parent, query),
                    None => Pad::query_default(pad, parent, query),
                }
            })
            .build();
        if let Err(e) = element.add_pad(sink) {
            tracing::error!(element = %element.name(), error = %e, "cannot add sink pad");
        }
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        match transition {
            StateChange::ReadyToPaused => self.inner.set_flushing(false),
            StateChange::PausedToReady => {
                debug!(element = %element.name(), "flushing queue");
                self.inner.set_flushing(true);
            }
            _ => {}
        }
        self.core.change_state(element, transition, true)
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
            "drop" => self.drop_on_full.store(
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
            "drop" => Some(self.drop_on_full.load(Ordering::Relaxed).into()),
            "eos" => Some(self.is_eos().into()),
            _ => None,
        }
    }

    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::sink(Caps::new_any())]
    }
}

/// Counters reported by [`AppSink::stats`].
#[derive(Debug, Clone, Copy)]
pub struct AppSinkStats {
    /// Buffers waiting when the counters were read.
    pub queued_buffers: usize,
    /// Buffers rendered by the sink.
    pub total_received: u64,
    /// Buffers taken by the application.
    pub total_pulled: u64,
    /// Total buffers dropped (when `drop` is enabled).
    pub total_dropped: u64,
    /// Whether EOS was rendered.
    pub eos: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Structure;
    use crate::element::State;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn playing_sink(sink: AppSink) -> (Element, Pad) {
        let element = Element::new("sink", sink);
        // Playing before data arrives, so the first buffer does not block.
        element.set_state(State::Playing).unwrap();
        let pad = element.static_pad("sink").unwrap();
        (element, pad)
    }

    #[test]
    fn test_appsink_pull() {
        let (element, pad) = playing_sink(AppSink::default());
        let handle = element.imp::<AppSink>().unwrap().handle();

        pad.chain(Buffer::from_slice(b"one")).unwrap();
        pad.chain(Buffer::from_slice(b"two")).unwrap();
        assert_eq!(handle.queue_len(), 2);
        assert_eq!(handle.pull_buffer().unwrap().as_slice(), b"one");
        assert_eq!(handle.try_pull_buffer().unwrap().as_slice(), b"two");
        assert!(handle.try_pull_buffer().is_none());
        assert!(
            handle
                .pull_buffer_timeout(Some(Duration::from_millis(10)))
                .is_none()
        );
        element.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_appsink_eos_drains_queue() {
        let (element, pad) = playing_sink(AppSink::default());
        let imp = element.imp::<AppSink>().unwrap();
        let handle = imp.handle();
        let eos_calls = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&eos_calls);
        imp.connect_eos(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        pad.chain(Buffer::from_slice(b"last")).unwrap();
        assert!(pad.send_event(Event::Eos));
        assert!(handle.is_eos());
        assert_eq!(eos_calls.load(Ordering::SeqCst), 1);

        assert!(handle.pull_buffer().is_some());
        assert!(handle.pull_buffer().is_none());
        element.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_appsink_drop_oldest() {
        let sink = AppSink::with_max_buffers(2);
        sink.drop_on_full.store(true, Ordering::Relaxed);
        let (element, pad) = playing_sink(sink);
        for i in 0..5u8 {
            pad.chain(Buffer::from_slice(&[i])).unwrap();
        }
        let imp = element.imp::<AppSink>().unwrap();
        let stats = imp.stats();
        assert_eq!(stats.queued_buffers, 2);
        assert_eq!(stats.total_dropped, 3);
        assert_eq!(imp.handle().pull_buffer().unwrap().as_slice(), &[3]);
        element.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_appsink_blocks_when_full() {
        let (element, pad) = playing_sink(AppSink::with_max_buffers(1));
        let handle = element.imp::<AppSink>().unwrap().handle();
        let new_samples = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&new_samples);
        element
            .imp::<AppSink>()
            .unwrap()
            .connect_new_sample(move |_| {
                n.fetch_add(1, Ordering::SeqCst);
            });

        let streaming = thread::spawn(move || {
            for i in 0..4u8 {
                pad.chain(Buffer::from_slice(&[i])).unwrap();
            }
        });
        let mut got = Vec::new();
        while got.len() < 4 {
            if let Some(buffer) = handle.pull_buffer_timeout(Some(Duration::from_secs(5))) {
                got.push(buffer.as_slice()[0]);
            }
        }
        streaming.join().unwrap();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(new_samples.load(Ordering::SeqCst), 4);
        element.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_appsink_caps_property() {
        let element = Element::new("sink", AppSink::default());
        element.set_property("caps", "video/x-raw").unwrap();
        let pad = element.static_pad("sink").unwrap();
        assert!(pad.accept_caps(&Caps::from_structure(Structure::new("video/x-raw"))));
        assert!(!pad.accept_caps(&Caps::from_structure(Structure::new("audio/x-raw"))));
        assert_eq!(element.property("eos"), Some(PropertyValue::Bool(false)));
    }
}
