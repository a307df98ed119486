//! Bins: elements containing other elements.
//!
//! A bin applies each state step to its children in topological order of
//! their links, sinks first going up and sources first going down, before
//! its own pads. Children that go async are tracked until they post
//! `AsyncDone`; the bin then commits its own async step. `Eos` and
//! `StreamStart` from sink children are aggregated into a single message.

use crate::bus::{Message, MessageView};
use crate::element::{
    Element, ElementFlags, ElementImpl, StateChange, StateChangeError, StateChangeResult,
    StateChangeSuccess,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::iterator::Iter;
use crate::pad::PadDirection;
use crate::query::Query;
use daggy::Dag;
use daggy::petgraph::algo::toposort;
use std::ops::Deref;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

#[derive(Default)]
struct Children {
    list: Vec<Element>,
    cookie: u32,
}

/// Container behaviour shared by [`Bin`] and [`Pipeline`](super::Pipeline).
#[derive(Default)]
pub struct BinImpl {
    children: Mutex<Children>,
    /// Children with an outstanding async state change.
    async_pending: Mutex<Vec<Element>>,
    /// Sink children that posted `Eos`.
    eos: Mutex<Vec<Element>>,
    /// Sink children that posted `StreamStart`.
    stream_start: Mutex<Vec<Element>>,
}

impl BinImpl {
    fn children(&self) -> Vec<Element> {
        self.children.lock().unwrap().list.clone()
    }

    fn is_child(&self, element: &Element) -> bool {
        self.children
            .lock()
            .unwrap()
            .list
            .iter()
            .any(|c| c.ptr_eq(element))
    }

    fn sinks(&self) -> Vec<Element> {
        self.children()
            .into_iter()
            .filter(|c| c.has_element_flags(ElementFlags::SINK))
            .collect()
    }

    fn sources(&self) -> Vec<Element> {
        self.children()
            .into_iter()
            .filter(|c| c.has_element_flags(ElementFlags::SOURCE))
            .collect()
    }

    /// Children ordered upstream first.
    fn upstream_order(&self) -> Vec<Element> {
        let children = self.children();
        let mut dag: Dag<usize, ()> = Dag::new();
        let nodes: Vec<_> = (0..children.len()).map(|i| dag.add_node(i)).collect();

        for (i, child) in children.iter().enumerate() {
            for src in child.src_pads() {
                let Some(peer_element) = src.peer().and_then(|p| p.parent_element()) else {
                    continue;
                };
                if let Some(j) = children.iter().position(|c| c.ptr_eq(&peer_element))
                    && i != j
                    && dag.add_edge(nodes[i], nodes[j], ()).is_err()
                {
                    trace!(from = %child.name(), to = %peer_element.name(), "ignoring link closing a cycle");
                }
            }
        }

        match toposort(dag.graph(), None) {
            Ok(order) => order.into_iter().map(|n| children[dag[n]].clone()).collect(),
            Err(_) => children,
        }
    }

    fn sorted(&self, upward: bool) -> Vec<Element> {
        let mut order = self.upstream_order();
        if upward {
            order.reverse();
        }
        order
    }

    fn reset_aggregation(&self) {
        self.eos.lock().unwrap().clear();
        self.stream_start.lock().unwrap().clear();
    }

    /// Record `child` in `set`; true when every sink child is in it.
    fn aggregate(&self, set: &Mutex<Vec<Element>>, child: &Element) -> bool {
        let sinks = self.sinks();
        let mut done = set.lock().unwrap();
        if !done.iter().any(|c| c.ptr_eq(child)) {
            done.push(child.clone());
        }
        sinks.iter().all(|s| done.iter().any(|d| d.ptr_eq(s)))
    }

    fn handle_async_done(&self, element: &Element, child: &Element) {
        let now_empty = {
            let mut pending = self.async_pending.lock().unwrap();
            let before = pending.len();
            pending.retain(|c| !c.ptr_eq(child));
            before > 0 && pending.is_empty()
        };
        if now_empty {
            debug!(bin = %element.name(), "all children prerolled");
            element.commit_state();
        }
    }
}

impl ElementImpl for BinImpl {
    fn constructed(&self, element: &Element) {
        element.set_element_flags(ElementFlags::BIN);
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        let bus = element.own_bus();
        match transition {
            StateChange::NullToReady => {
                if let Some(bus) = &bus {
                    bus.set_flushing(false);
                }
            }
            StateChange::ReadyToPaused => self.reset_aggregation(),
            StateChange::PausedToReady => {
                self.reset_aggregation();
                self.async_pending.lock().unwrap().clear();
            }
            _ => {}
        }

        let next = transition.next();
        let mut no_preroll = false;
        for child in self.sorted(transition.is_upward()) {
            match child.set_state(next) {
                Ok(StateChangeSuccess::Success) => {}
                Ok(StateChangeSuccess::Async) => {
                    trace!(bin = %element.name(), child = %child.name(), "child is async");
                }
                Ok(StateChangeSuccess::NoPreroll) => no_preroll = true,
                Err(e) => {
                    warn!(bin = %element.name(), child = %child.name(), %transition, "child failed to change state");
                    if transition.is_upward() {
                        return Err(e);
                    }
                }
            }
        }

        element.default_change_state(transition)?;

        if transition == StateChange::ReadyToNull
            && let Some(bus) = &bus
        {
            bus.set_flushing(true);
        }

        if no_preroll {
            Ok(StateChangeSuccess::NoPreroll)
        } else if transition.is_upward() && !self.async_pending.lock().unwrap().is_empty() {
            Ok(StateChangeSuccess::Async)
        } else {
            Ok(StateChangeSuccess::Success)
        }
    }

    fn can_commit(&self, _element: &Element) -> bool {
        self.async_pending.lock().unwrap().is_empty()
    }

    fn handle_message(&self, element: &Element, message: Message) {
        let child = message.src().filter(|c| self.is_child(c));
        match (message.view(), child) {
            (MessageView::AsyncStart, Some(child)) => {
                let mut pending = self.async_pending.lock().unwrap();
                if !pending.iter().any(|c| c.ptr_eq(&child)) {
                    pending.push(child);
                }
            }
            (MessageView::AsyncDone, Some(child)) => self.handle_async_done(element, &child),
            (MessageView::Eos, Some(child)) => {
                if !child.has_element_flags(ElementFlags::SINK) {
                    debug!(bin = %element.name(), child = %child.name(), "ignoring EOS from non-sink");
                } else if self.aggregate(&self.eos, &child) {
                    debug!(bin = %element.name(), "all sinks are EOS");
                    element.post_message(Message::new(Some(element), MessageView::Eos));
                }
            }
            (MessageView::StreamStart, Some(child)) => {
                if child.has_element_flags(ElementFlags::SINK)
                    && self.aggregate(&self.stream_start, &child)
                {
                    element.post_message(Message::new(Some(element), MessageView::StreamStart));
                }
            }
            _ => {
                element.post_message(message);
            }
        }
    }

    fn send_event(&self, element: &Element, event: Event) -> bool {
        let targets = if event.is_downstream() {
            self.sources()
        } else {
            self.sinks()
        };
        if targets.is_empty() {
            return element.default_send_event(event);
        }
        let mut res = true;
        for target in targets {
            res &= target.send_event(event.clone());
        }
        res
    }

    fn query(&self, element: &Element, query: &mut Query) -> bool {
        let (position, format) = match query {
            Query::Position { format, .. } => (true, *format),
            Query::Duration { format, .. } => (false, *format),
            _ => return element.default_query(query),
        };
        let best = self
            .sinks()
            .iter()
            .filter_map(|sink| {
                if position {
                    sink.query_position(format)
                } else {
                    sink.query_duration(format)
                }
            })
            .max();
        match (best, query) {
            (Some(v), Query::Position { result, .. } | Query::Duration { result, .. }) => {
                *result = Some(v);
                true
            }
            (_, query) => element.default_query(query),
        }
    }
}

static BIN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A container element.
///
/// ```rust
/// use padflow::element::{Element, ElementImpl};
/// use padflow::pipeline::Bin;
///
/// struct Empty;
/// impl ElementImpl for Empty {}
///
/// let bin = Bin::new("bin");
/// bin.add(&Element::new("child", Empty)).unwrap();
/// assert!(bin.by_name("child").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bin(Element);

impl Bin {
    /// Create an empty bin. An empty name is replaced with `bin<N>`.
    pub fn new(name: &str) -> Bin {
        let name = if name.is_empty() {
            format!("bin{}", BIN_COUNTER.fetch_add(1, Ordering::Relaxed))
        } else {
            name.to_string()
        };
        Bin(Element::new(&name, BinImpl::default()))
    }

    /// The bin behind `element`, if it is one.
    pub fn from_element(element: &Element) -> Option<Bin> {
        element
            .imp::<BinImpl>()
            .is_some()
            .then(|| Bin(element.clone()))
    }

    /// The bin as a plain element.
    pub fn as_element(&self) -> &Element {
        &self.0
    }

    fn imp(&self) -> &BinImpl {
        match self.0.imp::<BinImpl>() {
            Some(imp) => imp,
            None => unreachable!("bin without bin behaviour"),
        }
    }

    /// Add a child. Names must be unique within the bin.
    ///
    /// The bin becomes a sink (source) when the child is one.
    pub fn add(&self, child: &Element) -> Result<()> {
        if child.ptr_eq(&self.0) {
            return Err(Error::AlreadyParented(child.name().to_string()));
        }
        {
            let mut children = self.imp().children.lock().unwrap();
            if children.list.iter().any(|c| c.name() == child.name()) {
                return Err(Error::NameConflict {
                    name: child.name().to_string(),
                    container: self.name().to_string(),
                });
            }
            child.set_parent(&self.0)?;
            children.list.push(child.clone());
            children.cookie = children.cookie.wrapping_add(1);
        }
        let flags = child.element_flags() & (ElementFlags::SINK | ElementFlags::SOURCE);
        self.0.set_element_flags(flags);
        debug!(bin = %self.name(), child = %child.name(), "added child");
        Ok(())
    }

    /// Add several children, stopping at the first failure.
    pub fn add_many(&self, children: &[&Element]) -> Result<()> {
        children.iter().try_for_each(|c| self.add(c))
    }

    /// Remove a child, unlinking all its pads.
    pub fn remove(&self, child: &Element) -> Result<()> {
        let imp = self.imp();
        {
            let mut children = imp.children.lock().unwrap();
            let before = children.list.len();
            children.list.retain(|c| !c.ptr_eq(child));
            if children.list.len() == before {
                return Err(Error::NotParented(child.name().to_string()));
            }
            children.cookie = children.cookie.wrapping_add(1);
        }
        for pad in child.pads() {
            if let Some(peer) = pad.peer() {
                match pad.direction() {
                    PadDirection::Src => pad.unlink(&peer),
                    PadDirection::Sink => peer.unlink(&pad),
                };
            }
        }
        child.unset_parent();
        imp.eos.lock().unwrap().retain(|c| !c.ptr_eq(child));
        imp.stream_start.lock().unwrap().retain(|c| !c.ptr_eq(child));
        imp.handle_async_done(&self.0, child);
        debug!(bin = %self.name(), child = %child.name(), "removed child");
        Ok(())
    }

    /// Direct child by name.
    pub fn by_name(&self, name: &str) -> Option<Element> {
        self.children().into_iter().find(|c| c.name() == name)
    }

    /// Child by name, searching nested bins.
    pub fn by_name_recurse(&self, name: &str) -> Option<Element> {
        self.children().into_iter().find_map(|c| {
            if c.name() == name {
                Some(c)
            } else {
                Bin::from_element(&c).and_then(|b| b.by_name_recurse(name))
            }
        })
    }

    /// Snapshot of the children, in the order they were added.
    pub fn children(&self) -> Vec<Element> {
        self.imp().children()
    }

    /// Cookie changing on every child addition or removal.
    pub fn children_cookie(&self) -> u32 {
        self.imp().children.lock().unwrap().cookie
    }

    /// Iterate the children, signalling a resync when they change.
    pub fn iterate_elements(&self) -> Iter<Element> {
        let snapshot = self.0.downgrade();
        let cookie = self.0.downgrade();
        Iter::new(
            move || match snapshot.upgrade().as_ref().and_then(Bin::from_element) {
                Some(bin) => {
                    let children = bin.imp().children.lock().unwrap();
                    (children.cookie, children.list.clone())
                }
                None => (0, Vec::new()),
            },
            move || {
                cookie
                    .upgrade()
                    .as_ref()
                    .and_then(Bin::from_element)
                    .map_or(0, |b| b.children_cookie())
            },
        )
    }

    /// Children in state-change order: sinks first when `upward`, sources
    /// first otherwise.
    pub fn sorted_children(&self, upward: bool) -> Vec<Element> {
        self.imp().sorted(upward)
    }

    /// Children flagged as sinks.
    pub fn sinks(&self) -> Vec<Element> {
        self.imp().sinks()
    }

    /// Children flagged as sources.
    pub fn sources(&self) -> Vec<Element> {
        self.imp().sources()
    }

    /// Bring every child to the bin's state.
    pub fn sync_children_states(&self) -> std::result::Result<(), StateChangeError> {
        for child in self.children() {
            child.sync_state_with_parent()?;
        }
        Ok(())
    }
}

impl Deref for Bin {
    type Target = Element;

    fn deref(&self) -> &Element {
        &self.0
    }
}

impl From<Bin> for Element {
    fn from(bin: Bin) -> Element {
        bin.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::State;
    use crate::pad::{Pad, PadDirection};
    use std::sync::{Arc, Mutex as StdMutex};

    struct Recorder {
        log: Arc<StdMutex<Vec<String>>>,
        src: bool,
        sink: bool,
    }

    impl ElementImpl for Recorder {
        fn constructed(&self, element: &Element) {
            if self.sink {
                element
                    .add_pad(
                        Pad::builder("sink", PadDirection::Sink)
                            .chain_function(|_, _, _| Ok(()))
                            .build(),
                    )
                    .unwrap();
                element.set_element_flags(ElementFlags::SINK);
            }
            if self.src {
                element.add_pad(Pad::new("src", PadDirection::Src)).unwrap();
                if !self.sink {
                    element.set_element_flags(ElementFlags::SOURCE);
                }
            }
        }

        fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", element.name(), transition));
            element.default_change_state(transition)
        }
    }

    fn recorder(name: &str, log: &Arc<StdMutex<Vec<String>>>, src: bool, sink: bool) -> Element {
        Element::new(
            name,
            Recorder {
                log: Arc::clone(log),
                src,
                sink,
            },
        )
    }

    #[test]
    fn test_add_remove() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let bin = Bin::new("");
        assert!(bin.name().starts_with("bin"));
        let a = recorder("a", &log, true, false);
        bin.add(&a).unwrap();
        assert!(matches!(
            bin.add(&recorder("a", &log, true, false)),
            Err(Error::NameConflict { .. })
        ));
        assert!(bin.has_element_flags(ElementFlags::SOURCE));
        assert_eq!(a.parent().unwrap(), *bin.as_element());

        let other = Bin::new("other");
        assert!(matches!(other.add(&a), Err(Error::AlreadyParented(_))));

        bin.remove(&a).unwrap();
        assert!(a.parent().is_none());
        assert!(matches!(bin.remove(&a), Err(Error::NotParented(_))));
    }

    #[test]
    fn test_state_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let bin = Bin::new("bin");
        let src = recorder("src", &log, true, false);
        let mid = recorder("mid", &log, true, true);
        let sink = recorder("sink", &log, false, true);
        // Added out of order on purpose.
        bin.add_many(&[&mid, &sink, &src]).unwrap();
        src.link(&mid).unwrap();
        mid.link(&sink).unwrap();

        bin.set_state(State::Ready).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            ["sink:null->ready", "mid:null->ready", "src:null->ready"]
        );

        log.lock().unwrap().clear();
        bin.set_state(State::Null).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            ["src:ready->null", "mid:ready->null", "sink:ready->null"]
        );
    }

    #[test]
    fn test_by_name_recurse() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let outer = Bin::new("outer");
        let inner = Bin::new("inner");
        inner.add(&recorder("deep", &log, false, true)).unwrap();
        outer.add(&inner).unwrap();
        assert!(outer.by_name("deep").is_none());
        assert_eq!(outer.by_name_recurse("deep").unwrap().name(), "deep");
        assert!(outer.has_element_flags(ElementFlags::SINK));
        assert_eq!(
            outer.by_name_recurse("deep").unwrap().path_string(),
            "/outer/inner/deep"
        );
    }

    #[test]
    fn test_iterate_elements() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let bin = Bin::new("bin");
        bin.add(&recorder("a", &log, true, false)).unwrap();
        bin.add(&recorder("b", &log, false, true)).unwrap();
        let names: Vec<String> = bin
            .iterate_elements()
            .collect_with_retry(4)
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, ["a", "b"]);
    }
}
