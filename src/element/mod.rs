//! Elements: pads plus a state machine plus behaviour.
//!
//! An [`Element`] is a cheap, cloneable handle. Its behaviour comes from an
//! [`ElementImpl`] supplied at construction; the handle owns everything the
//! framework manages itself:
//!
//! - the pad list, with a cookie that changes on every add/remove,
//! - the current/next/pending/target states (see [`State`]),
//! - a weak reference to the containing bin,
//! - the bus, for top-level pipelines.
//!
//! Messages posted by an element travel to its parent's
//! [`ElementImpl::handle_message`] and from the top-level element to its bus.
//!
//! # Example
//!
//! ```rust
//! use padflow::element::{Element, ElementImpl, State};
//!
//! struct Empty;
//! impl ElementImpl for Empty {}
//!
//! let element = Element::new("", Empty);
//! assert!(element.name().starts_with("element"));
//! element.set_state(State::Paused).unwrap();
//! assert_eq!(element.current_state(), State::Paused);
//! ```

mod property;
mod state;
mod traits;

pub use property::PropertyValue;
pub use state::{State, StateChange, StateChangeError, StateChangeResult, StateChangeSuccess};
pub use traits::{ElementFlags, ElementImpl};

use crate::bus::{Bus, Message, MessageView};
use crate::error::{Error, Result};
use crate::event::{Event, TagList};
use crate::format::Format;
use crate::iterator::Iter;
use crate::pad::{Pad, PadDirection, PadLinkError, PadPresence, PadTemplate};
use crate::query::Query;
use state::StateData;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tracing::{debug, error, info, warn};

/// Callback run when a pad is added to or removed from an element.
pub type PadCallback = Arc<dyn Fn(&Element, &Pad) + Send + Sync + 'static>;

#[derive(Default)]
struct PadList {
    pads: Vec<Pad>,
    cookie: u32,
}

pub(crate) struct ElementInner {
    name: String,
    factory_name: OnceLock<String>,
    imp: Box<dyn ElementImpl>,
    flags: Mutex<ElementFlags>,
    pads: Mutex<PadList>,
    parent: Mutex<Option<WeakElement>>,
    bus: Mutex<Option<Bus>>,
    state: Mutex<StateData>,
    state_cond: Condvar,
    /// Serializes state changes.
    state_lock: Mutex<()>,
    commit_pending: AtomicBool,
    pad_added: Mutex<Vec<PadCallback>>,
    pad_removed: Mutex<Vec<PadCallback>>,
    max_resyncs: AtomicUsize,
}

/// A pipeline element.
#[derive(Clone)]
pub struct Element(Arc<ElementInner>);

/// Weak reference to an [`Element`].
#[derive(Clone)]
pub struct WeakElement(Weak<ElementInner>);

impl WeakElement {
    /// Upgrade to a strong handle if the element still exists.
    pub fn upgrade(&self) -> Option<Element> {
        self.0.upgrade().map(Element)
    }
}

impl fmt::Debug for WeakElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(e) => write!(f, "WeakElement({})", e.name()),
            None => write!(f, "WeakElement(<dropped>)"),
        }
    }
}

static ELEMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Element {
    /// Create an element. An empty name is replaced with `element<N>`.
    pub fn new(name: &str, imp: impl ElementImpl) -> Element {
        Self::with_boxed_impl(name, Box::new(imp))
    }

    pub(crate) fn with_boxed_impl(name: &str, imp: Box<dyn ElementImpl>) -> Element {
        let name = if name.is_empty() {
            format!("element{}", ELEMENT_COUNTER.fetch_add(1, Ordering::Relaxed))
        } else {
            name.to_string()
        };
        let element = Element(Arc::new(ElementInner {
            name,
            factory_name: OnceLock::new(),
            imp,
            flags: Mutex::new(ElementFlags::empty()),
            pads: Mutex::new(PadList::default()),
            parent: Mutex::new(None),
            bus: Mutex::new(None),
            state: Mutex::new(StateData::default()),
            state_cond: Condvar::new(),
            state_lock: Mutex::new(()),
            commit_pending: AtomicBool::new(false),
            pad_added: Mutex::new(Vec::new()),
            pad_removed: Mutex::new(Vec::new()),
            max_resyncs: AtomicUsize::new(crate::config::DEFAULT_MAX_RESYNCS),
        }));
        element.0.imp.constructed(&element);
        element
    }

    pub(crate) fn inner(&self) -> &ElementInner {
        &self.0
    }

    pub(crate) fn lock_state_data(&self) -> MutexGuard<'_, StateData> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Weak reference to this element.
    pub fn downgrade(&self) -> WeakElement {
        WeakElement(Arc::downgrade(&self.0))
    }

    /// Whether two handles refer to the same element.
    pub fn ptr_eq(&self, other: &Element) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The behaviour object, if it is a `T`.
    pub fn imp<T: ElementImpl>(&self) -> Option<&T> {
        let imp: &dyn Any = &*self.0.imp;
        imp.downcast_ref::<T>()
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Element name, unique within its parent.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Slash-separated names from the top-level element, e.g. `/pipeline0/src`.
    pub fn path_string(&self) -> String {
        let mut names = vec![self.name().to_string()];
        let mut cur = self.parent();
        while let Some(p) = cur {
            names.push(p.name().to_string());
            cur = p.parent();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Name of the factory that created the element.
    pub fn factory_name(&self) -> Option<&str> {
        self.0.factory_name.get().map(String::as_str)
    }

    pub(crate) fn set_factory_name(&self, name: &str) {
        let _ = self.0.factory_name.set(name.to_string());
    }

    /// Classification flags.
    pub fn element_flags(&self) -> ElementFlags {
        *self.0.flags.lock().unwrap()
    }

    /// Add classification flags.
    pub fn set_element_flags(&self, flags: ElementFlags) {
        self.0.flags.lock().unwrap().insert(flags);
    }

    /// Whether all of `flags` are set.
    pub fn has_element_flags(&self, flags: ElementFlags) -> bool {
        self.element_flags().contains(flags)
    }

    /// How often pad iteration restarts before giving up.
    pub fn max_resyncs(&self) -> usize {
        self.0.max_resyncs.load(Ordering::Relaxed)
    }

    /// Change the pad iteration restart bound.
    pub fn set_max_resyncs(&self, max: usize) {
        self.0.max_resyncs.store(max, Ordering::Relaxed);
    }

    // ========================================================================
    // Hierarchy
    // ========================================================================

    /// The containing bin.
    pub fn parent(&self) -> Option<Element> {
        self.0
            .parent
            .lock()
            .unwrap()
            .as_ref()
            .and_then(WeakElement::upgrade)
    }

    pub(crate) fn set_parent(&self, parent: &Element) -> Result<()> {
        let mut slot = self.0.parent.lock().unwrap();
        if slot.as_ref().and_then(WeakElement::upgrade).is_some() {
            return Err(Error::AlreadyParented(self.name().to_string()));
        }
        *slot = Some(parent.downgrade());
        Ok(())
    }

    pub(crate) fn unset_parent(&self) {
        *self.0.parent.lock().unwrap() = None;
    }

    // ========================================================================
    // Bus and messages
    // ========================================================================

    /// The bus messages of this element end up on: its own, or its
    /// top-level ancestor's.
    pub fn bus(&self) -> Option<Bus> {
        if let Some(bus) = self.0.bus.lock().unwrap().clone() {
            return Some(bus);
        }
        self.parent().and_then(|p| p.bus())
    }

    pub(crate) fn own_bus(&self) -> Option<Bus> {
        self.0.bus.lock().unwrap().clone()
    }

    pub(crate) fn set_bus(&self, bus: Option<Bus>) {
        *self.0.bus.lock().unwrap() = bus;
    }

    /// Post a message towards the application.
    ///
    /// A parented element hands the message to its parent; a top-level
    /// element posts it on its bus. Returns `false` when the message was
    /// dropped because there is nowhere to send it.
    pub fn post_message(&self, message: Message) -> bool {
        if let Some(parent) = self.parent() {
            parent.0.imp.handle_message(&parent, message);
            return true;
        }
        match self.own_bus() {
            Some(bus) => bus.post(message),
            None => {
                debug!(element = %self.name(), message = ?message.view(), "no bus, dropping message");
                false
            }
        }
    }

    pub(crate) fn post_view(&self, view: MessageView) -> bool {
        self.post_message(Message::new(Some(self), view))
    }

    /// Post an `Error` message.
    pub fn post_error(&self, description: &str, debug_info: Option<String>) -> bool {
        error!(element = %self.name(), description, debug_info = ?debug_info, "error");
        self.post_view(MessageView::Error {
            description: description.to_string(),
            debug: debug_info,
        })
    }

    /// Post a `Warning` message.
    pub fn post_warning(&self, description: &str, debug_info: Option<String>) -> bool {
        warn!(element = %self.name(), description, debug_info = ?debug_info, "warning");
        self.post_view(MessageView::Warning {
            description: description.to_string(),
            debug: debug_info,
        })
    }

    /// Post an `Info` message.
    pub fn post_info(&self, description: &str, debug: Option<String>) -> bool {
        info!(element = %self.name(), description, "info");
        self.post_view(MessageView::Info {
            description: description.to_string(),
            debug,
        })
    }

    /// Post an application-defined message.
    pub fn post_application(&self, name: &str, payload: TagList) -> bool {
        self.post_view(MessageView::Application {
            name: name.to_string(),
            payload,
        })
    }

    // ========================================================================
    // Pads
    // ========================================================================

    /// Add a pad.
    ///
    /// Fails when the element already has a pad with the same name or the pad
    /// has a parent. Pads added to a `Paused` or `Playing` element are
    /// activated.
    pub fn add_pad(&self, pad: Pad) -> Result<()> {
        {
            let mut list = self.0.pads.lock().unwrap();
            if list.pads.iter().any(|p| p.name() == pad.name()) {
                return Err(Error::NameConflict {
                    name: pad.name().to_string(),
                    container: self.name().to_string(),
                });
            }
            if pad.has_parent() {
                return Err(Error::AlreadyParented(pad.path()));
            }
            pad.set_parent(Some(self));
            list.pads.push(pad.clone());
            list.cookie = list.cookie.wrapping_add(1);
        }
        debug!(element = %self.name(), pad = %pad.name(), "added pad");

        let running = {
            let st = self.lock_state_data();
            st.current >= State::Paused || st.next >= State::Paused
        };
        if running && let Err(e) = pad.set_active(true) {
            warn!(pad = %pad.path(), error = %e, "failed to activate pad added to running element");
        }

        let callbacks = self.0.pad_added.lock().unwrap().clone();
        for cb in callbacks {
            cb(self, &pad);
        }
        Ok(())
    }

    /// Remove a pad, unlinking and deactivating it.
    pub fn remove_pad(&self, pad: &Pad) -> Result<()> {
        if !pad.parent_element().is_some_and(|p| p.ptr_eq(self)) {
            return Err(Error::NotParented(pad.path()));
        }
        if let Some(peer) = pad.peer() {
            match pad.direction() {
                PadDirection::Src => pad.unlink(&peer),
                PadDirection::Sink => peer.unlink(pad),
            };
        }
        if let Err(e) = pad.set_active(false) {
            warn!(pad = %pad.path(), error = %e, "failed to deactivate removed pad");
        }
        {
            let mut list = self.0.pads.lock().unwrap();
            list.pads.retain(|p| !p.ptr_eq(pad));
            list.cookie = list.cookie.wrapping_add(1);
        }
        pad.set_parent(None);
        debug!(element = %self.name(), pad = %pad.name(), "removed pad");

        let callbacks = self.0.pad_removed.lock().unwrap().clone();
        for cb in callbacks {
            cb(self, pad);
        }
        Ok(())
    }

    /// Pad by name.
    pub fn static_pad(&self, name: &str) -> Option<Pad> {
        self.0
            .pads
            .lock()
            .unwrap()
            .pads
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Snapshot of all pads, in the order they were added.
    pub fn pads(&self) -> Vec<Pad> {
        self.0.pads.lock().unwrap().pads.clone()
    }

    /// Snapshot of the source pads.
    pub fn src_pads(&self) -> Vec<Pad> {
        self.pads_in_direction(PadDirection::Src)
    }

    /// Snapshot of the sink pads.
    pub fn sink_pads(&self) -> Vec<Pad> {
        self.pads_in_direction(PadDirection::Sink)
    }

    fn pads_in_direction(&self, direction: PadDirection) -> Vec<Pad> {
        self.0
            .pads
            .lock()
            .unwrap()
            .pads
            .iter()
            .filter(|p| p.direction() == direction)
            .cloned()
            .collect()
    }

    /// Snapshot of the pads together with the current cookie.
    pub fn pads_with_cookie(&self) -> (u32, Vec<Pad>) {
        let list = self.0.pads.lock().unwrap();
        (list.cookie, list.pads.clone())
    }

    /// Cookie changing on every pad addition or removal.
    pub fn pads_cookie(&self) -> u32 {
        self.0.pads.lock().unwrap().cookie
    }

    /// Iterate the pads, signalling a resync when the pad list changes.
    pub fn iterate_pads(&self) -> Iter<Pad> {
        self.iterate_filtered(None)
    }

    /// Iterate the source pads.
    pub fn iterate_src_pads(&self) -> Iter<Pad> {
        self.iterate_filtered(Some(PadDirection::Src))
    }

    /// Iterate the sink pads.
    pub fn iterate_sink_pads(&self) -> Iter<Pad> {
        self.iterate_filtered(Some(PadDirection::Sink))
    }

    fn iterate_filtered(&self, direction: Option<PadDirection>) -> Iter<Pad> {
        let snapshot = self.downgrade();
        let cookie = self.downgrade();
        Iter::new(
            move || match snapshot.upgrade() {
                Some(e) => {
                    let (cookie, pads) = e.pads_with_cookie();
                    let pads = pads
                        .into_iter()
                        .filter(|p| direction.is_none_or(|d| p.direction() == d))
                        .collect();
                    (cookie, pads)
                }
                None => (0, Vec::new()),
            },
            move || cookie.upgrade().map_or(0, |e| e.pads_cookie()),
        )
    }

    /// Register a callback run after a pad was added.
    pub fn connect_pad_added<F>(&self, f: F)
    where
        F: Fn(&Element, &Pad) + Send + Sync + 'static,
    {
        self.0.pad_added.lock().unwrap().push(Arc::new(f));
    }

    /// Register a callback run after a pad was removed.
    pub fn connect_pad_removed<F>(&self, f: F)
    where
        F: Fn(&Element, &Pad) + Send + Sync + 'static,
    {
        self.0.pad_removed.lock().unwrap().push(Arc::new(f));
    }

    /// Templates of the pads this element can have.
    pub fn pad_templates(&self) -> Vec<PadTemplate> {
        self.0.imp.pad_templates()
    }

    /// Template by name.
    pub fn pad_template(&self, name: &str) -> Option<PadTemplate> {
        self.pad_templates().into_iter().find(|t| t.name() == name)
    }

    /// Request a pad from a `Request` template such as `src_%u`.
    pub fn request_pad(&self, template_name: &str, name: Option<&str>) -> Option<Pad> {
        let template = self
            .pad_template(template_name)
            .filter(|t| t.presence() == PadPresence::Request)?;
        let pad = self.0.imp.request_new_pad(self, &template, name)?;
        if !pad.has_parent() && self.add_pad(pad.clone()).is_err() {
            return None;
        }
        debug!(element = %self.name(), pad = %pad.name(), "request pad created");
        Some(pad)
    }

    /// Release a pad obtained with [`request_pad`](Self::request_pad).
    pub fn release_request_pad(&self, pad: &Pad) -> Result<()> {
        self.0.imp.release_pad(self, pad);
        self.remove_pad(pad)
    }

    fn request_pad_for_link(&self, direction: PadDirection, other: &Pad) -> Option<Pad> {
        let other_caps = other.query_caps(None);
        self.pad_templates()
            .into_iter()
            .filter(|t| t.direction() == direction && t.presence() == PadPresence::Request)
            .filter(|t| t.caps().can_intersect(&other_caps))
            .find_map(|t| self.request_pad(t.name(), None))
    }

    // ========================================================================
    // Element linking
    // ========================================================================

    /// Link the first compatible unlinked source pad to a sink pad of `dest`.
    pub fn link(&self, dest: &Element) -> Result<()> {
        self.link_pads(None, dest, None)
    }

    /// Link pads by name; `None` picks any compatible pad, requesting one
    /// from a request template if needed.
    ///
    /// Elements in different bins are linked through ghost pads.
    pub fn link_pads(
        &self,
        src_pad: Option<&str>,
        dest: &Element,
        sink_pad: Option<&str>,
    ) -> Result<()> {
        let srcs = match src_pad {
            Some(name) => vec![
                self.static_pad(name)
                    .or_else(|| self.request_pad(name, None))
                    .ok_or_else(|| Error::not_found("pad", format!("{}:{name}", self.name())))?,
            ],
            None => self
                .src_pads()
                .into_iter()
                .filter(|p| !p.is_linked())
                .collect(),
        };
        let sinks = match sink_pad {
            Some(name) => vec![
                dest.static_pad(name)
                    .or_else(|| dest.request_pad(name, None))
                    .ok_or_else(|| Error::not_found("pad", format!("{}:{name}", dest.name())))?,
            ],
            None => dest
                .sink_pads()
                .into_iter()
                .filter(|p| !p.is_linked())
                .collect(),
        };

        let mut last_err = PadLinkError::NoFormat;
        for src in &srcs {
            for sink in &sinks {
                match src.link_maybe_ghosting(sink) {
                    Ok(()) => return Ok(()),
                    Err(e) => last_err = e,
                }
            }
            if sink_pad.is_none()
                && let Some(sink) = dest.request_pad_for_link(PadDirection::Sink, src)
            {
                match src.link_maybe_ghosting(&sink) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        last_err = e;
                        let _ = dest.release_request_pad(&sink);
                    }
                }
            }
        }

        if src_pad.is_none()
            && let Some(sink) = sinks.first()
            && let Some(src) = self.request_pad_for_link(PadDirection::Src, sink)
        {
            match src.link_maybe_ghosting(sink) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = e;
                    let _ = self.release_request_pad(&src);
                }
            }
        }

        debug!(src = %self.name(), sink = %dest.name(), error = %last_err, "element link failed");
        Err(Error::PadLink(last_err))
    }

    /// Unlink all source pads of `self` linked to `dest`.
    pub fn unlink(&self, dest: &Element) {
        for src in self.src_pads() {
            if let Some(peer) = src.peer()
                && peer.parent_element().is_some_and(|p| p.ptr_eq(dest))
            {
                src.unlink(&peer);
            }
        }
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Set a property.
    pub fn set_property(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        debug!(element = %self.name(), property = name, %value, "set property");
        self.0.imp.set_property(self, name, &value)
    }

    /// Read a property.
    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.0.imp.property(self, name)
    }

    // ========================================================================
    // Events and queries
    // ========================================================================

    /// Send an event to the element.
    pub fn send_event(&self, event: Event) -> bool {
        self.0.imp.send_event(self, event)
    }

    /// Default event handling: downstream events leave through a source pad,
    /// upstream events through a sink pad.
    pub fn default_send_event(&self, event: Event) -> bool {
        let pad = if event.is_downstream() {
            self.src_pads().into_iter().next()
        } else {
            self.sink_pads().into_iter().next()
        };
        match pad {
            Some(pad) => pad.push_event(event),
            None => {
                debug!(element = %self.name(), event = event.name(), "no pad to send event on");
                false
            }
        }
    }

    /// Send a query to the element.
    pub fn query(&self, query: &mut Query) -> bool {
        self.0.imp.query(self, query)
    }

    /// Default query handling: ask a source pad, or else the peer of a sink
    /// pad.
    pub fn default_query(&self, query: &mut Query) -> bool {
        if let Some(src) = self.src_pads().into_iter().next() {
            return src.query(query);
        }
        match self.sink_pads().into_iter().next().and_then(|p| p.peer()) {
            Some(peer) => peer.query(query),
            None => false,
        }
    }

    /// Current position in `format`.
    pub fn query_position(&self, format: Format) -> Option<u64> {
        let mut query = Query::position(format);
        if !self.query(&mut query) {
            return None;
        }
        match query {
            Query::Position { result, .. } => result,
            _ => None,
        }
    }

    /// Total duration in `format`.
    pub fn query_duration(&self, format: Format) -> Option<u64> {
        let mut query = Query::duration(format);
        if !self.query(&mut query) {
            return None;
        }
        match query {
            Query::Duration { result, .. } => result,
            _ => None,
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Element {}

impl Hash for Element {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock_state_data();
        f.debug_struct("Element")
            .field("name", &self.name())
            .field("current", &st.current)
            .field("pending", &st.pending)
            .finish()
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
