//! Pads: directional connection points of elements.
//!
//! A [`Pad`] is a cheap, cloneable handle. Source pads push buffers and
//! downstream events to their peer sink pad; sink pads can pull from their
//! peer in pull mode and send upstream events. Every pad owns:
//!
//! - its link (a weak reference to the peer),
//! - the caps agreed through a `Caps` event,
//! - the sticky events it has seen, replayed to new peers,
//! - installed probes,
//! - flags, the last flow result and a running-time offset,
//! - an optional streaming [`Task`].
//!
//! Behaviour is attached with typed handler closures (`set_chain_function`,
//! `set_event_function`, ...). Pads without handlers fall back to default
//! handling that forwards events and queries to internally linked pads.
//!
//! # Example
//!
//! ```rust
//! use padflow::buffer::Buffer;
//! use padflow::caps::Caps;
//! use padflow::pad::{Pad, PadDirection};
//!
//! let caps: Caps = "audio/x-raw, rate=48000".parse().unwrap();
//! let src = Pad::builder("src", PadDirection::Src).caps(caps.clone()).build();
//! let sink = Pad::builder("sink", PadDirection::Sink)
//!     .caps(caps.clone())
//!     .chain_function(|_pad, _parent, _buffer| Ok(()))
//!     .build();
//!
//! assert!(Pad::can_link(&src, &sink));
//! src.link(&sink).unwrap();
//! src.set_active(true).unwrap();
//! sink.set_active(true).unwrap();
//!
//! assert_eq!(src.push(Buffer::with_size(16)), Ok(()));
//! assert_eq!(sink.current_caps(), Some(caps));
//! ```

mod dataflow;
mod flow;
mod ghost;
mod link;
pub mod probe;
mod stream_id;
mod task;
mod template;

pub use flow::{FlowError, FlowResult, FlowReturn};
pub use ghost::GhostPad;
pub use link::{PadLinkCheck, PadLinkError};
pub use probe::{PadProbeData, PadProbeInfo, PadProbeReturn, PadProbeType, ProbeId};
pub use task::{Task, TaskState};
pub use template::{PadPresence, PadTemplate};

use crate::buffer::{Buffer, BufferList};
use crate::caps::Caps;
use crate::element::{Element, WeakElement};
use crate::error::{Error, Result};
use crate::event::{Event, EventType, StreamStart};
use crate::iterator::Iter;
use crate::query::Query;
use bitflags::bitflags;
use probe::{Probe, ProbeCallback};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, warn};

// ============================================================================
// Enums and flags
// ============================================================================

/// Direction of data flow through a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    /// Data leaves the element through this pad.
    Src,
    /// Data enters the element through this pad.
    Sink,
}

impl PadDirection {
    /// The other direction.
    pub fn opposite(self) -> Self {
        match self {
            Self::Src => Self::Sink,
            Self::Sink => Self::Src,
        }
    }
}

/// Scheduling mode of an active pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PadMode {
    /// Inactive.
    #[default]
    None,
    /// Upstream pushes data.
    Push,
    /// Downstream pulls data.
    Pull,
}

bitflags! {
    /// Pad state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PadFlags: u32 {
        /// Inactive or flushing; dataflow returns `Flushing`.
        const FLUSHING = 1 << 0;
        /// EOS went through this pad.
        const EOS = 1 << 1;
        /// A probe blocks the pad.
        const BLOCKED = 1 << 2;
        /// A thread is waiting in a blocking probe.
        const BLOCKING = 1 << 3;
        /// Caps cannot change once set.
        const FIXED_CAPS = 1 << 4;
        /// Caps queries are answered from internally linked pads' peers.
        const PROXY_CAPS = 1 << 5;
        /// The pad must renegotiate before the next buffer.
        const NEED_RECONFIGURE = 1 << 6;
        /// Accept-caps checks the template caps instead of a caps query.
        const ACCEPT_TEMPLATE = 1 << 7;
    }
}

// ============================================================================
// Handler types
// ============================================================================

/// Handles a buffer arriving at a sink pad.
pub type ChainFunction =
    Arc<dyn Fn(&Pad, Option<&Element>, Buffer) -> FlowResult + Send + Sync + 'static>;
/// Handles a buffer list arriving at a sink pad.
pub type ChainListFunction =
    Arc<dyn Fn(&Pad, Option<&Element>, BufferList) -> FlowResult + Send + Sync + 'static>;
/// Handles an event arriving at a pad. Returns whether it was handled.
pub type EventFunction = Arc<dyn Fn(&Pad, Option<&Element>, Event) -> bool + Send + Sync + 'static>;
/// Answers a query arriving at a pad. Returns whether it was answered.
pub type QueryFunction =
    Arc<dyn Fn(&Pad, Option<&Element>, &mut Query) -> bool + Send + Sync + 'static>;
/// Produces data for a pull request on a source pad.
pub type GetRangeFunction = Arc<
    dyn Fn(&Pad, Option<&Element>, u64, u32) -> std::result::Result<Buffer, FlowError>
        + Send
        + Sync
        + 'static,
>;
/// Chooses and activates a scheduling mode.
pub type ActivateFunction = Arc<dyn Fn(&Pad, Option<&Element>) -> Result<()> + Send + Sync + 'static>;
/// Called when a scheduling mode is (de)activated. Returns success.
pub type ActivateModeFunction =
    Arc<dyn Fn(&Pad, Option<&Element>, PadMode, bool) -> bool + Send + Sync + 'static>;
/// Called when the pad gets linked; may refuse the link.
pub type LinkFunction = Arc<
    dyn Fn(&Pad, Option<&Element>, &Pad) -> std::result::Result<(), PadLinkError>
        + Send
        + Sync
        + 'static,
>;
/// Called when the pad gets unlinked.
pub type UnlinkFunction = Arc<dyn Fn(&Pad, Option<&Element>) + Send + Sync + 'static>;
/// Lists the pads data on this pad flows to or from inside the element.
pub type InternalLinksFunction =
    Arc<dyn Fn(&Pad, Option<&Element>) -> Vec<Pad> + Send + Sync + 'static>;

#[derive(Default, Clone)]
struct Handlers {
    chain: Option<ChainFunction>,
    chain_list: Option<ChainListFunction>,
    event: Option<EventFunction>,
    query: Option<QueryFunction>,
    getrange: Option<GetRangeFunction>,
    activate: Option<ActivateFunction>,
    activatemode: Option<ActivateModeFunction>,
    link: Option<LinkFunction>,
    unlink: Option<UnlinkFunction>,
    internal_links: Option<InternalLinksFunction>,
}

// ============================================================================
// Pad state
// ============================================================================

pub(crate) struct StickyEntry {
    event: Event,
    /// The current peer has seen this event.
    received: bool,
}

pub(crate) enum GhostRole {
    None,
    /// This is a ghost pad owning its internal proxy pad.
    Ghost(Pad),
    /// This is the internal proxy pad of a ghost pad.
    Proxy(WeakPad),
}

pub(crate) struct PadState {
    peer: Option<WeakPad>,
    parent: Option<WeakElement>,
    mode: PadMode,
    flags: PadFlags,
    caps: Option<Caps>,
    sticky: Vec<StickyEntry>,
    probes: Vec<Probe>,
    next_probe_id: u64,
    /// Traversals in progress.
    busy: u32,
    /// Threads waiting in blocking probes.
    waiting: u32,
    last_flow: FlowReturn,
    offset: i64,
    task: Option<Arc<Task>>,
    private: Option<Arc<dyn Any + Send + Sync>>,
    ghost: GhostRole,
}

impl PadState {
    fn has_fired_idle(&self) -> bool {
        self.probes.iter().any(|p| p.idle_fired)
    }

    fn update_blocked_flags(&mut self) {
        self.flags.set(PadFlags::BLOCKING, self.waiting > 0);
        self.flags
            .set(PadFlags::BLOCKED, self.waiting > 0 || self.has_fired_idle());
    }

    fn sticky_index(&self, event: &Event) -> std::result::Result<usize, usize> {
        let key = event.sticky_key();
        self.sticky
            .binary_search_by(|e| e.event.sticky_key().cmp(&key))
    }

    /// Store a sticky event, replacing the previous event of the same kind.
    ///
    /// Returns whether the stored value changed.
    fn store_sticky(&mut self, event: Event, received: bool) -> bool {
        match &event {
            Event::Caps(caps) => self.caps = Some(caps.clone()),
            Event::Eos => self.flags.insert(PadFlags::EOS),
            _ => {}
        }
        if let Ok(idx) = self.sticky_index(&event)
            && self.sticky[idx].event == event
        {
            self.sticky[idx].received &= received;
            return false;
        }
        if event.event_type() == EventType::StreamStart {
            // A new stream drops EOS and the old segment
            self.flags.remove(PadFlags::EOS);
            self.sticky.retain(|e| {
                !matches!(e.event.event_type(), EventType::Eos | EventType::Segment)
            });
        }
        let entry = StickyEntry { event, received };
        match self.sticky_index(&entry.event) {
            Ok(idx) => self.sticky[idx] = entry,
            Err(idx) => self.sticky.insert(idx, entry),
        }
        true
    }

    fn clear_sticky(&mut self) {
        self.sticky.clear();
        self.caps = None;
    }

    fn remove_flush_cleared_sticky(&mut self) {
        self.sticky
            .retain(|e| !e.event.event_type().is_cleared_by_flush());
    }

    fn mark_sticky_unreceived(&mut self) {
        for e in &mut self.sticky {
            e.received = false;
        }
    }
}

pub(crate) struct PadInner {
    name: String,
    direction: PadDirection,
    template: Option<PadTemplate>,
    state: Mutex<PadState>,
    cond: Condvar,
    stream_lock: Mutex<()>,
    handlers: RwLock<Arc<Handlers>>,
}

// ============================================================================
// Pad handle
// ============================================================================

/// A directional connection point.
#[derive(Clone)]
pub struct Pad(Arc<PadInner>);

/// Weak reference to a [`Pad`].
#[derive(Clone)]
pub struct WeakPad(Weak<PadInner>);

impl WeakPad {
    /// Upgrade to a strong handle if the pad still exists.
    pub fn upgrade(&self) -> Option<Pad> {
        self.0.upgrade().map(Pad)
    }
}

impl fmt::Debug for WeakPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(p) => write!(f, "WeakPad({})", p.name()),
            None => write!(f, "WeakPad(<dropped>)"),
        }
    }
}

static PAD_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Pad {
    /// Create a pad. An empty name is replaced with a unique `pad<N>` name.
    pub fn new(name: &str, direction: PadDirection) -> Pad {
        Self::builder(name, direction).build()
    }

    /// Create a pad from a template, which supplies direction and caps.
    ///
    /// `None` uses the template name.
    pub fn from_template(template: &PadTemplate, name: Option<&str>) -> Pad {
        Self::builder_from_template(template, name).build()
    }

    /// Start building a pad.
    pub fn builder(name: &str, direction: PadDirection) -> PadBuilder {
        PadBuilder {
            name: name.to_string(),
            direction,
            template: None,
            flags: PadFlags::empty(),
            handlers: Handlers::default(),
        }
    }

    /// Start building a pad from a template.
    pub fn builder_from_template(template: &PadTemplate, name: Option<&str>) -> PadBuilder {
        PadBuilder {
            name: name.unwrap_or(template.name()).to_string(),
            direction: template.direction(),
            template: Some(template.clone()),
            flags: PadFlags::empty(),
            handlers: Handlers::default(),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PadState> {
        self.0.state.lock().unwrap()
    }

    fn handlers(&self) -> Arc<Handlers> {
        Arc::clone(&self.0.handlers.read().unwrap())
    }

    fn update_handlers(&self, f: impl FnOnce(&mut Handlers)) {
        let mut handlers = self.0.handlers.write().unwrap();
        f(Arc::make_mut(&mut handlers));
    }

    /// Weak reference to this pad.
    pub fn downgrade(&self) -> WeakPad {
        WeakPad(Arc::downgrade(&self.0))
    }

    /// Whether two handles refer to the same pad.
    pub fn ptr_eq(&self, other: &Pad) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Pad name, unique within its element.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// `element:pad`, or just the pad name for unparented pads.
    pub fn path(&self) -> String {
        match self.parent_element() {
            Some(e) => format!("{}:{}", e.name(), self.name()),
            None => self.name().to_string(),
        }
    }

    /// Direction; never changes.
    pub fn direction(&self) -> PadDirection {
        self.0.direction
    }

    /// Template the pad was created from.
    pub fn template(&self) -> Option<&PadTemplate> {
        self.0.template.as_ref()
    }

    /// Caps of the template, or `ANY` without template.
    pub fn template_caps(&self) -> Caps {
        self.0
            .template
            .as_ref()
            .map_or_else(Caps::new_any, |t| t.caps().clone())
    }

    /// The linked pad.
    pub fn peer(&self) -> Option<Pad> {
        self.lock_state().peer.as_ref().and_then(WeakPad::upgrade)
    }

    /// Whether the pad has a peer.
    pub fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    /// The element owning this pad.
    pub fn parent_element(&self) -> Option<Element> {
        self.lock_state().parent.as_ref().and_then(WeakElement::upgrade)
    }

    pub(crate) fn set_parent(&self, parent: Option<&Element>) {
        self.lock_state().parent = parent.map(Element::downgrade);
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.lock_state().parent.is_some()
    }

    /// Scheduling mode.
    pub fn mode(&self) -> PadMode {
        self.lock_state().mode
    }

    /// Whether the pad is active in some mode.
    pub fn is_active(&self) -> bool {
        self.mode() != PadMode::None
    }

    /// Current flags.
    pub fn flags(&self) -> PadFlags {
        self.lock_state().flags
    }

    /// Whether all of `flags` are set.
    pub fn has_flags(&self, flags: PadFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Set flags.
    pub fn set_flags(&self, flags: PadFlags) {
        self.lock_state().flags.insert(flags);
    }

    /// Clear flags.
    pub fn unset_flags(&self, flags: PadFlags) {
        self.lock_state().flags.remove(flags);
    }

    /// Whether the pad is inactive or flushing.
    pub fn is_flushing(&self) -> bool {
        self.has_flags(PadFlags::FLUSHING)
    }

    /// Whether the pad is blocked by a probe.
    pub fn is_blocked(&self) -> bool {
        self.has_flags(PadFlags::BLOCKED)
    }

    /// Whether a thread is currently waiting in a blocking probe.
    pub fn is_blocking(&self) -> bool {
        self.has_flags(PadFlags::BLOCKING)
    }

    /// Make caps immutable once negotiated.
    pub fn use_fixed_caps(&self) {
        self.set_flags(PadFlags::FIXED_CAPS);
    }

    /// Result of the last push, chain or pull on this pad.
    pub fn last_flow_result(&self) -> FlowReturn {
        self.lock_state().last_flow
    }

    pub(crate) fn store_flow<T>(&self, result: &std::result::Result<T, FlowError>) {
        self.lock_state().last_flow = FlowReturn::from(result);
    }

    /// Running-time offset applied to segments leaving or entering the pad.
    pub fn offset(&self) -> i64 {
        self.lock_state().offset
    }

    /// Set the running-time offset. Sticky segments are resent.
    pub fn set_offset(&self, offset: i64) {
        let mut st = self.lock_state();
        if st.offset == offset {
            return;
        }
        st.offset = offset;
        for e in &mut st.sticky {
            if e.event.event_type() == EventType::Segment {
                e.received = false;
            }
        }
    }

    /// Attach element-private data.
    pub fn set_element_private<T: Any + Send + Sync>(&self, data: Option<Arc<T>>) {
        self.lock_state().private = data.map(|d| d as Arc<dyn Any + Send + Sync>);
    }

    /// Element-private data, if set and of type `T`.
    pub fn element_private<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.lock_state().private.clone()?;
        data.downcast::<T>().ok()
    }

    // ========================================================================
    // Sticky events
    // ========================================================================

    /// The sticky event of `event_type`, if stored.
    ///
    /// For custom sticky events this returns the first one stored.
    pub fn sticky_event(&self, event_type: EventType) -> Option<Event> {
        self.lock_state()
            .sticky
            .iter()
            .find(|e| e.event.event_type() == event_type)
            .map(|e| e.event.clone())
    }

    /// Call `f` for every sticky event in storage order until it returns
    /// `false`.
    pub fn sticky_events_foreach(&self, mut f: impl FnMut(&Event) -> bool) {
        let events: Vec<Event> = self
            .lock_state()
            .sticky
            .iter()
            .map(|e| e.event.clone())
            .collect();
        for event in &events {
            if !f(event) {
                break;
            }
        }
    }

    /// Copy all sticky events of this pad onto `dest` so they are sent
    /// before its next data.
    pub fn sticky_events_to(&self, dest: &Pad) {
        let events: Vec<Event> = self
            .lock_state()
            .sticky
            .iter()
            .map(|e| e.event.clone())
            .collect();
        let mut st = dest.lock_state();
        for event in events {
            st.store_sticky(event, false);
        }
    }

    /// Stream id from the sticky stream-start event.
    pub fn stream_id(&self) -> Option<String> {
        match self.sticky_event(EventType::StreamStart)? {
            Event::StreamStart(s) => Some(s.stream_id),
            _ => None,
        }
    }

    /// The stream announced by the sticky stream-start event.
    pub fn stream(&self) -> Option<StreamStart> {
        match self.sticky_event(EventType::StreamStart)? {
            Event::StreamStart(s) => Some(s),
            _ => None,
        }
    }

    /// Store a sticky event without sending it.
    ///
    /// The event replaces the stored one of the same kind and is sent to the
    /// peer before the next data. An inactive pad returns `Flushing`, and so
    /// does a flushing pad for `Segment` and `Eos`. An EOS pad returns `Eos`
    /// unless the event starts a new stream.
    pub fn store_sticky_event(&self, event: Event) -> FlowResult {
        if !event.is_sticky() {
            warn!(pad = %self.path(), event = event.name(), "not a sticky event");
            return Err(FlowError::Error);
        }
        let event_type = event.event_type();
        let mut st = self.lock_state();
        if st.mode == PadMode::None
            || (st.flags.contains(PadFlags::FLUSHING)
                && matches!(event_type, EventType::Segment | EventType::Eos))
        {
            return Err(FlowError::Flushing);
        }
        if st.flags.contains(PadFlags::EOS) && event_type != EventType::StreamStart {
            return Err(FlowError::Eos);
        }
        st.store_sticky(event, false);
        Ok(())
    }

    // ========================================================================
    // Caps
    // ========================================================================

    /// Caps agreed through a `Caps` event.
    pub fn current_caps(&self) -> Option<Caps> {
        self.lock_state().caps.clone()
    }

    /// Whether caps were agreed.
    pub fn has_current_caps(&self) -> bool {
        self.lock_state().caps.is_some()
    }

    // ========================================================================
    // Reconfiguration
    // ========================================================================

    /// Flag the pad for renegotiation.
    pub fn mark_reconfigure(&self) {
        self.set_flags(PadFlags::NEED_RECONFIGURE);
    }

    /// Whether the pad is flagged for renegotiation.
    pub fn needs_reconfigure(&self) -> bool {
        self.has_flags(PadFlags::NEED_RECONFIGURE)
    }

    /// Clear the renegotiation flag, returning whether it was set.
    pub fn check_reconfigure(&self) -> bool {
        let mut st = self.lock_state();
        let was = st.flags.contains(PadFlags::NEED_RECONFIGURE);
        st.flags.remove(PadFlags::NEED_RECONFIGURE);
        was
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Set the chain handler.
    pub fn set_chain_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>, Buffer) -> FlowResult + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.chain = Some(Arc::new(f)));
    }

    /// Set the chain-list handler.
    pub fn set_chain_list_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>, BufferList) -> FlowResult + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.chain_list = Some(Arc::new(f)));
    }

    /// Set the event handler.
    pub fn set_event_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>, Event) -> bool + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.event = Some(Arc::new(f)));
    }

    /// Set the query handler.
    pub fn set_query_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>, &mut Query) -> bool + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.query = Some(Arc::new(f)));
    }

    /// Set the pull handler.
    pub fn set_getrange_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>, u64, u32) -> std::result::Result<Buffer, FlowError>
            + Send
            + Sync
            + 'static,
    {
        self.update_handlers(|h| h.getrange = Some(Arc::new(f)));
    }

    /// Set the activation handler choosing a scheduling mode.
    pub fn set_activate_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>) -> Result<()> + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.activate = Some(Arc::new(f)));
    }

    /// Set the mode (de)activation handler.
    pub fn set_activatemode_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>, PadMode, bool) -> bool + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.activatemode = Some(Arc::new(f)));
    }

    /// Set the link handler.
    pub fn set_link_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>, &Pad) -> std::result::Result<(), PadLinkError>
            + Send
            + Sync
            + 'static,
    {
        self.update_handlers(|h| h.link = Some(Arc::new(f)));
    }

    /// Set the unlink handler.
    pub fn set_unlink_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>) + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.unlink = Some(Arc::new(f)));
    }

    /// Set the internal-links handler.
    pub fn set_iterate_internal_links_function<F>(&self, f: F)
    where
        F: Fn(&Pad, Option<&Element>) -> Vec<Pad> + Send + Sync + 'static,
    {
        self.update_handlers(|h| h.internal_links = Some(Arc::new(f)));
    }

    // ========================================================================
    // Linking
    // ========================================================================

    /// Link `self` (a source pad) to `sink` with the default checks.
    pub fn link(&self, sink: &Pad) -> std::result::Result<(), PadLinkError> {
        self.link_full(sink, PadLinkCheck::DEFAULT)
    }

    /// Link `self` (a source pad) to `sink` with the given checks.
    pub fn link_full(&self, sink: &Pad, checks: PadLinkCheck) -> std::result::Result<(), PadLinkError> {
        link_checks(self, sink, checks)?;

        {
            let (mut src_st, mut sink_st) = (self.lock_state(), sink.lock_state());
            if src_st.peer.as_ref().and_then(WeakPad::upgrade).is_some()
                || sink_st.peer.as_ref().and_then(WeakPad::upgrade).is_some()
            {
                return Err(PadLinkError::WasLinked);
            }
            src_st.peer = Some(sink.downgrade());
            sink_st.peer = Some(self.downgrade());
        }

        let mut refused = None;
        if let Some(f) = self.handlers().link.clone() {
            refused = f(self, self.parent_element().as_ref(), sink).err();
        }
        if refused.is_none()
            && let Some(f) = sink.handlers().link.clone()
        {
            refused = f(sink, sink.parent_element().as_ref(), self).err();
        }
        if let Some(err) = refused {
            let mut src_st = self.lock_state();
            let mut sink_st = sink.lock_state();
            src_st.peer = None;
            sink_st.peer = None;
            debug!(src = %self.path(), sink = %sink.path(), %err, "link refused by handler");
            return Err(err);
        }

        self.lock_state().mark_sticky_unreceived();
        if !checks.contains(PadLinkCheck::NO_RECONFIGURE) {
            self.mark_reconfigure();
        }
        debug!(src = %self.path(), sink = %sink.path(), "linked");
        Ok(())
    }

    /// Dry run of [`link`](Self::link): whether the pads could be linked.
    pub fn can_link(src: &Pad, sink: &Pad) -> bool {
        link_checks(src, sink, PadLinkCheck::DEFAULT).is_ok()
    }

    /// Unlink `self` (a source pad) from `sink`.
    ///
    /// Returns `false` if the pads were not linked to each other, or if
    /// `self` is not a source pad.
    pub fn unlink(&self, sink: &Pad) -> bool {
        // Locks are always taken source first, as in `link_full`.
        if self.direction() != PadDirection::Src || sink.direction() != PadDirection::Sink {
            warn!(pad = %self.path(), peer = %sink.path(), "unlink must be called on the source pad");
            return false;
        }
        {
            let mut src_st = self.lock_state();
            let mut sink_st = sink.lock_state();
            let linked = src_st
                .peer
                .as_ref()
                .and_then(WeakPad::upgrade)
                .is_some_and(|p| p.ptr_eq(sink))
                && sink_st
                    .peer
                    .as_ref()
                    .and_then(WeakPad::upgrade)
                    .is_some_and(|p| p.ptr_eq(self));
            if !linked {
                return false;
            }
            src_st.peer = None;
            sink_st.peer = None;
            src_st.mark_sticky_unreceived();
        }

        if let Some(f) = self.handlers().unlink.clone() {
            f(self, self.parent_element().as_ref());
        }
        if let Some(f) = sink.handlers().unlink.clone() {
            f(sink, sink.parent_element().as_ref());
        }
        debug!(src = %self.path(), sink = %sink.path(), "unlinked");
        true
    }

    /// Link through ghost pads when the pads live in different bins.
    ///
    /// Ghost pads are created on every bin between each pad and the closest
    /// common ancestor of both elements.
    pub fn link_maybe_ghosting(&self, sink: &Pad) -> std::result::Result<(), PadLinkError> {
        self.link_maybe_ghosting_full(sink, PadLinkCheck::DEFAULT)
    }

    /// [`link_maybe_ghosting`](Self::link_maybe_ghosting) with explicit checks.
    pub fn link_maybe_ghosting_full(
        &self,
        sink: &Pad,
        checks: PadLinkCheck,
    ) -> std::result::Result<(), PadLinkError> {
        if self.direction() != PadDirection::Src || sink.direction() != PadDirection::Sink {
            return Err(PadLinkError::WrongDirection);
        }
        let (Some(src_elem), Some(sink_elem)) = (self.parent_element(), sink.parent_element())
        else {
            return self.link_full(sink, checks);
        };
        let same_parent = match (src_elem.parent(), sink_elem.parent()) {
            (Some(a), Some(b)) => a.ptr_eq(&b),
            (None, None) => true,
            _ => false,
        };
        if same_parent {
            return self.link_full(sink, checks);
        }

        let src_chain = ancestors(&src_elem);
        let sink_chain = ancestors(&sink_elem);
        let common = src_chain
            .iter()
            .find(|a| sink_chain.iter().any(|b| b.ptr_eq(a)))
            .cloned()
            .ok_or(PadLinkError::WrongHierarchy)?;

        let src_side = ghost_up(self, &src_chain, &common)?;
        let sink_side = ghost_up(sink, &sink_chain, &common)?;
        src_side.link_full(&sink_side, checks)
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// Activate or deactivate the pad.
    ///
    /// Activation uses the activate handler, or push mode by default.
    /// Deactivation makes in-flight and future dataflow return `Flushing`,
    /// wakes threads blocked in probes and clears sticky events and caps. It
    /// never waits for in-flight operations.
    pub fn set_active(&self, active: bool) -> Result<()> {
        if active {
            match self.handlers().activate.clone() {
                Some(f) => f(self, self.parent_element().as_ref()),
                None => self.activate_mode(PadMode::Push, true),
            }
        } else {
            match self.mode() {
                PadMode::None => Ok(()),
                mode => self.activate_mode(mode, false),
            }
        }
    }

    /// Activate or deactivate a specific scheduling mode.
    ///
    /// Activating a sink pad in pull mode activates its peer in pull mode.
    pub fn activate_mode(&self, mode: PadMode, active: bool) -> Result<()> {
        let old = self.mode();
        if active && old == mode {
            return Ok(());
        }
        if !active && old == PadMode::None {
            return Ok(());
        }
        if !active && old != mode {
            return Err(Error::Activation(format!(
                "{}: cannot deactivate {mode:?}, pad is in {old:?}",
                self.path()
            )));
        }
        if active && old != PadMode::None {
            self.activate_mode(old, false)?;
        }
        if mode == PadMode::None {
            return Ok(());
        }

        if self.direction() == PadDirection::Sink && mode == PadMode::Pull {
            match self.peer() {
                Some(peer) => peer.activate_mode(PadMode::Pull, active)?,
                None if active => {
                    return Err(Error::Activation(format!(
                        "{}: pull mode needs a peer",
                        self.path()
                    )));
                }
                None => {}
            }
        }

        self.pre_activate(if active { mode } else { PadMode::None });

        if let Some(f) = self.handlers().activatemode.clone()
            && !f(self, self.parent_element().as_ref(), mode, active)
        {
            if active {
                self.pre_activate(PadMode::None);
            }
            warn!(pad = %self.path(), ?mode, active, "activation handler failed");
            return Err(Error::Activation(format!(
                "{}: failed to {} {mode:?} mode",
                self.path(),
                if active { "activate" } else { "deactivate" }
            )));
        }

        debug!(pad = %self.path(), ?mode, active, "pad mode changed");
        Ok(())
    }

    fn pre_activate(&self, new_mode: PadMode) {
        let mut st = self.lock_state();
        st.mode = new_mode;
        if new_mode == PadMode::None {
            st.flags.insert(PadFlags::FLUSHING);
            st.clear_sticky();
            self.0.cond.notify_all();
        } else {
            st.flags.remove(PadFlags::FLUSHING | PadFlags::EOS);
        }
    }

    // ========================================================================
    // Probes
    // ========================================================================

    /// Install a probe.
    ///
    /// Idle probes installed on an idle pad run before this returns; if such
    /// a probe asks to be removed the result is `None`.
    pub fn add_probe<F>(&self, mask: PadProbeType, callback: F) -> Option<ProbeId>
    where
        F: Fn(&Pad, &mut PadProbeInfo<'_>) -> PadProbeReturn + Send + Sync + 'static,
    {
        let callback: ProbeCallback = Arc::new(callback);
        let (id, fire_now) = {
            let mut st = self.lock_state();
            st.next_probe_id += 1;
            let id = ProbeId::new(st.next_probe_id)?;
            let fire_now = mask.contains(PadProbeType::IDLE) && st.busy == 0;
            st.probes.push(Probe {
                id,
                mask,
                callback: Arc::clone(&callback),
                idle_fired: fire_now,
            });
            st.update_blocked_flags();
            (id, fire_now)
        };
        debug!(pad = %self.path(), probe = id.get(), ?mask, "probe added");

        if fire_now && !self.fire_idle_probe(id, &callback) {
            return None;
        }
        Some(id)
    }

    /// Remove a probe. Unknown ids are ignored.
    pub fn remove_probe(&self, id: ProbeId) {
        let mut st = self.lock_state();
        let before = st.probes.len();
        st.probes.retain(|p| p.id != id);
        if st.probes.len() != before {
            st.update_blocked_flags();
            self.0.cond.notify_all();
            debug!(pad = %self.name(), probe = id.get(), "probe removed");
        }
    }

    pub(crate) fn has_probe(&self, id: ProbeId) -> bool {
        self.lock_state().probes.iter().any(|p| p.id == id)
    }

    // ========================================================================
    // Internal links
    // ========================================================================

    /// Pads that data on this pad flows to or from inside the element.
    ///
    /// Defaults to all pads of the parent element with the opposite
    /// direction.
    pub fn iterate_internal_links(&self) -> Iter<Pad> {
        let parent = self.parent_element();
        if let Some(f) = self.handlers().internal_links.clone() {
            return Iter::from_vec(f(self, parent.as_ref()));
        }
        match parent {
            Some(element) => {
                let direction = self.direction().opposite();
                let weak = element.downgrade();
                let cookie_src = element.downgrade();
                Iter::new(
                    move || match weak.upgrade() {
                        Some(e) => {
                            let (cookie, pads) = e.pads_with_cookie();
                            (
                                cookie,
                                pads.into_iter()
                                    .filter(|p| p.direction() == direction)
                                    .collect(),
                            )
                        }
                        None => (0, Vec::new()),
                    },
                    move || cookie_src.upgrade().map_or(0, |e| e.pads_cookie()),
                )
            }
            None => Iter::from_vec(Vec::new()),
        }
    }

    /// Internal links as a list, retrying if pads change concurrently.
    pub fn internal_links(&self) -> Vec<Pad> {
        let max = self
            .parent_element()
            .map_or(crate::config::DEFAULT_MAX_RESYNCS, |e| e.max_resyncs());
        self.iterate_internal_links()
            .collect_with_retry(max)
            .unwrap_or_default()
    }

    /// Call `f` for each internally linked pad until it returns `true`.
    ///
    /// Returns whether any call returned `true`.
    pub fn forward(&self, mut f: impl FnMut(&Pad) -> bool) -> bool {
        self.internal_links().iter().any(|p| f(p))
    }

    // ========================================================================
    // Ghost helpers
    // ========================================================================

    /// For a ghost pad its proxy pad; for a proxy pad its ghost pad.
    pub(crate) fn ghost_internal(&self) -> Option<Pad> {
        match &self.lock_state().ghost {
            GhostRole::None => None,
            GhostRole::Ghost(p) => Some(p.clone()),
            GhostRole::Proxy(w) => w.upgrade(),
        }
    }

    pub(crate) fn is_ghost(&self) -> bool {
        matches!(self.lock_state().ghost, GhostRole::Ghost(_))
    }

    pub(crate) fn set_ghost_role(&self, role: GhostRole) {
        self.lock_state().ghost = role;
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Start a streaming task calling `func` in a loop with the stream lock
    /// held. A paused task is restarted instead; a stopped one is replaced.
    ///
    /// A panic inside `func` posts an error on the bus and stops the task.
    pub fn start_task<F>(&self, func: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let task = {
            let mut st = self.lock_state();
            match &st.task {
                // A stopped task is replaced so the new function runs.
                Some(t) if t.state() != TaskState::Stopped => Arc::clone(t),
                _ => {
                    let task = Arc::new(Task::new(
                        format!("{}-task", self.path()),
                        self.task_wrapper(func),
                    ));
                    st.task = Some(Arc::clone(&task));
                    task
                }
            }
        };
        task.start()
            .map_err(|e| Error::Activation(format!("{}: cannot spawn task: {e}", self.path())))
    }

    fn task_wrapper<F>(&self, mut func: F) -> impl FnMut() + Send + 'static
    where
        F: FnMut() + Send + 'static,
    {
        let weak = self.downgrade();
        move || {
            let Some(pad) = weak.upgrade() else {
                return;
            };
            let result = {
                let _span = crate::observability::span_pad(&pad).entered();
                let _stream = pad.stream_lock();
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut func))
            };
            if let Err(payload) = result {
                if let Some(element) = pad.parent_element() {
                    element.post_error(
                        "streaming task panicked",
                        Some(format!("{}: {}", pad.path(), panic_message(&*payload))),
                    );
                }
                std::panic::resume_unwind(payload);
            }
        }
    }

    /// Park the streaming task after its current iteration.
    pub fn pause_task(&self) -> Result<()> {
        let task = self.lock_state().task.clone();
        match task {
            Some(t) => t
                .pause()
                .map_err(|e| Error::Activation(format!("{}: cannot pause task: {e}", self.path()))),
            None => Ok(()),
        }
    }

    /// Ask the streaming task to exit. Does not wait.
    pub fn stop_task(&self) {
        if let Some(t) = self.lock_state().task.clone() {
            t.stop();
        }
    }

    /// Stop the streaming task and wait for its thread to exit.
    ///
    /// From inside the task this only stops it.
    pub fn join_task(&self) {
        let task = self.lock_state().task.clone();
        if let Some(t) = task {
            t.join();
            if !t.is_current_thread() {
                let mut st = self.lock_state();
                if st.task.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &t)) {
                    st.task = None;
                }
            }
        }
    }

    /// State of the streaming task.
    pub fn task_state(&self) -> TaskState {
        self.lock_state()
            .task
            .as_ref()
            .map_or(TaskState::Stopped, |t| t.state())
    }

    /// Take the stream lock, serializing against data and serialized events.
    ///
    /// Not reentrant: do not call from a chain or event handler of the same
    /// pad.
    pub fn stream_lock(&self) -> MutexGuard<'_, ()> {
        self.0
            .stream_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The element and all its ancestors, innermost first.
fn ancestors(element: &Element) -> Vec<Element> {
    let mut out = vec![element.clone()];
    let mut cur = element.parent();
    while let Some(p) = cur {
        cur = p.parent();
        out.push(p);
    }
    out
}

/// Expose `pad` on every bin between its element and `common`.
fn ghost_up(
    pad: &Pad,
    chain: &[Element],
    common: &Element,
) -> std::result::Result<Pad, PadLinkError> {
    let mut current = pad.clone();
    // chain[0] is the pad's own element; bins start at index 1.
    for bin in chain.iter().skip(1).take_while(|b| !b.ptr_eq(common)) {
        let ghost = GhostPad::with_target("", &current)?;
        bin.add_pad(ghost.as_pad().clone())
            .map_err(|_| PadLinkError::WrongHierarchy)?;
        current = ghost.as_pad().clone();
    }
    Ok(current)
}

fn link_checks(src: &Pad, sink: &Pad, checks: PadLinkCheck) -> std::result::Result<(), PadLinkError> {
    if src.direction() != PadDirection::Src || sink.direction() != PadDirection::Sink {
        return Err(PadLinkError::WrongDirection);
    }
    if src.is_linked() || sink.is_linked() {
        return Err(PadLinkError::WasLinked);
    }

    if checks.contains(PadLinkCheck::HIERARCHY)
        && let (Some(a), Some(b)) = (src.parent_element(), sink.parent_element())
    {
        let same_container = match (a.parent(), b.parent()) {
            (None, None) => true,
            (Some(pa), Some(pb)) => pa.ptr_eq(&pb),
            _ => false,
        };
        if !same_container {
            return Err(PadLinkError::WrongHierarchy);
        }
    }

    let caps = if checks.contains(PadLinkCheck::CAPS) {
        Some((src.query_caps(None), sink.query_caps(None)))
    } else if checks.contains(PadLinkCheck::TEMPLATE_CAPS) {
        Some((src.template_caps(), sink.template_caps()))
    } else {
        None
    };
    if let Some((src_caps, sink_caps)) = caps
        && !src_caps.can_intersect(&sink_caps)
    {
        debug!(src = %src.path(), sink = %sink.path(), %src_caps, %sink_caps, "no common format");
        return Err(PadLinkError::NoFormat);
    }
    Ok(())
}

impl PartialEq for Pad {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Pad {}

impl Hash for Pad {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Debug for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pad")
            .field("name", &self.name())
            .field("direction", &self.direction())
            .finish()
    }
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Pad`].
pub struct PadBuilder {
    name: String,
    direction: PadDirection,
    template: Option<PadTemplate>,
    flags: PadFlags,
    handlers: Handlers,
}

impl PadBuilder {
    /// Use an ad-hoc template with these caps.
    pub fn caps(mut self, caps: Caps) -> Self {
        self.template = Some(PadTemplate::new(
            self.name.clone(),
            self.direction,
            PadPresence::Always,
            caps,
        ));
        self
    }

    /// Initial flags.
    pub fn flags(mut self, flags: PadFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Chain handler.
    pub fn chain_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>, Buffer) -> FlowResult + Send + Sync + 'static,
    {
        self.handlers.chain = Some(Arc::new(f));
        self
    }

    /// Chain-list handler.
    pub fn chain_list_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>, BufferList) -> FlowResult + Send + Sync + 'static,
    {
        self.handlers.chain_list = Some(Arc::new(f));
        self
    }

    /// Event handler.
    pub fn event_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>, Event) -> bool + Send + Sync + 'static,
    {
        self.handlers.event = Some(Arc::new(f));
        self
    }

    /// Query handler.
    pub fn query_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>, &mut Query) -> bool + Send + Sync + 'static,
    {
        self.handlers.query = Some(Arc::new(f));
        self
    }

    /// Pull handler.
    pub fn getrange_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>, u64, u32) -> std::result::Result<Buffer, FlowError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.getrange = Some(Arc::new(f));
        self
    }

    /// Activation handler.
    pub fn activate_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.activate = Some(Arc::new(f));
        self
    }

    /// Mode (de)activation handler.
    pub fn activatemode_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>, PadMode, bool) -> bool + Send + Sync + 'static,
    {
        self.handlers.activatemode = Some(Arc::new(f));
        self
    }

    /// Link handler.
    pub fn link_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>, &Pad) -> std::result::Result<(), PadLinkError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.link = Some(Arc::new(f));
        self
    }

    /// Unlink handler.
    pub fn unlink_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>) + Send + Sync + 'static,
    {
        self.handlers.unlink = Some(Arc::new(f));
        self
    }

    /// Internal-links handler.
    pub fn iterate_internal_links_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Pad, Option<&Element>) -> Vec<Pad> + Send + Sync + 'static,
    {
        self.handlers.internal_links = Some(Arc::new(f));
        self
    }

    /// Create the pad. It starts inactive (flushing).
    pub fn build(self) -> Pad {
        let name = if self.name.is_empty() {
            format!("pad{}", PAD_COUNTER.fetch_add(1, Ordering::Relaxed))
        } else {
            self.name
        };
        Pad(Arc::new(PadInner {
            name,
            direction: self.direction,
            template: self.template,
            state: Mutex::new(PadState {
                peer: None,
                parent: None,
                mode: PadMode::None,
                flags: self.flags | PadFlags::FLUSHING,
                caps: None,
                sticky: Vec::new(),
                probes: Vec::new(),
                next_probe_id: 0,
                busy: 0,
                waiting: 0,
                last_flow: FlowReturn::Ok,
                offset: 0,
                task: None,
                private: None,
                ghost: GhostRole::None,
            }),
            cond: Condvar::new(),
            stream_lock: Mutex::new(()),
            handlers: RwLock::new(Arc::new(self.handlers)),
        }))
    }
}
