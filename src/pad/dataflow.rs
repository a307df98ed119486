//! Dataflow through pads: push, chain, pull, events, queries and probe
//! dispatch.
//!
//! Lock discipline: the pad state lock is never held while a handler or
//! probe callback runs, and the stream lock is never taken while the state
//! lock is held.

use super::probe::ProbeCallback;
use super::{
    FlowError, FlowResult, Pad, PadDirection, PadFlags, PadMode, PadProbeData, PadProbeInfo,
    PadProbeReturn, PadProbeType, ProbeId, WeakPad, panic_message,
};
use crate::buffer::{Buffer, BufferList};
use crate::caps::Caps;
use crate::element::Element;
use crate::event::{Event, EventType};
use crate::format::{Format, FormattedValue};
use crate::query::{Query, SchedulingFlags};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, trace, warn};

// ============================================================================
// Helpers
// ============================================================================

enum Item {
    Buffer(Buffer),
    List(BufferList),
}

impl Item {
    fn probe_type(&self) -> PadProbeType {
        match self {
            Self::Buffer(_) => PadProbeType::BUFFER,
            Self::List(_) => PadProbeType::BUFFER_LIST,
        }
    }

    fn into_probe_data(self) -> PadProbeData<'static> {
        match self {
            Self::Buffer(b) => PadProbeData::Buffer(b),
            Self::List(l) => PadProbeData::BufferList(l),
        }
    }

    fn from_probe_data(data: PadProbeData<'_>) -> Option<Self> {
        match data {
            PadProbeData::Buffer(b) => Some(Self::Buffer(b)),
            PadProbeData::BufferList(l) => Some(Self::List(l)),
            _ => None,
        }
    }
}

/// Outcome of running the probes of a traversal.
enum Probed<'a> {
    /// Continue with the (possibly modified) item.
    Pass(PadProbeData<'a>),
    /// A probe discarded the item.
    Dropped,
    /// A probe consumed the item.
    Handled(FlowResult, PadProbeData<'a>),
}

fn event_probe_kind(event_type: EventType, downstream: bool) -> PadProbeType {
    let dir = if downstream {
        PadProbeType::EVENT_DOWNSTREAM
    } else {
        PadProbeType::EVENT_UPSTREAM
    };
    if event_type.is_flush() {
        dir | PadProbeType::EVENT_FLUSH | PadProbeType::PUSH
    } else {
        dir | PadProbeType::PUSH
    }
}

/// Counts a traversal in progress; idle probes fire when the last one ends.
struct BusyGuard<'a> {
    pad: &'a Pad,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.pad.end_traversal();
    }
}

impl Pad {
    // ========================================================================
    // Traversal bookkeeping and probes
    // ========================================================================

    fn begin_traversal(&self) -> Result<BusyGuard<'_>, FlowError> {
        let mut st = self.lock_state();
        loop {
            if st.flags.contains(PadFlags::FLUSHING) {
                return Err(FlowError::Flushing);
            }
            if !st.has_fired_idle() {
                break;
            }
            st.waiting += 1;
            st.update_blocked_flags();
            st = self.0.cond.wait(st).unwrap();
            st.waiting -= 1;
            st.update_blocked_flags();
        }
        st.busy += 1;
        Ok(BusyGuard { pad: self })
    }

    fn end_traversal(&self) {
        let pending: Vec<(ProbeId, ProbeCallback)> = {
            let mut st = self.lock_state();
            st.busy = st.busy.saturating_sub(1);
            if st.busy > 0 {
                return;
            }
            let pending = st
                .probes
                .iter_mut()
                .filter(|p| p.mask.contains(PadProbeType::IDLE) && !p.idle_fired)
                .map(|p| {
                    p.idle_fired = true;
                    (p.id, p.callback.clone())
                })
                .collect::<Vec<_>>();
            if !pending.is_empty() {
                st.update_blocked_flags();
            }
            pending
        };
        for (id, callback) in pending {
            self.fire_idle_probe(id, &callback);
        }
    }

    /// Run an idle probe already marked as fired.
    ///
    /// Returns whether the probe stays installed (and keeps the pad blocked).
    pub(super) fn fire_idle_probe(&self, id: ProbeId, callback: &ProbeCallback) -> bool {
        let mut info = PadProbeInfo {
            id,
            mask: PadProbeType::IDLE,
            data: PadProbeData::None,
            offset: 0,
            size: 0,
            flow_result: Ok(()),
        };
        let ret = self
            .call_probe(callback, &mut info)
            .unwrap_or(PadProbeReturn::Remove);
        let keep = ret == PadProbeReturn::Ok;

        let mut st = self.lock_state();
        if !keep {
            st.probes.retain(|p| p.id != id);
        }
        st.update_blocked_flags();
        self.0.cond.notify_all();
        trace!(pad = %self.name(), probe = id.get(), keep, "idle probe fired");
        keep
    }

    fn call_probe(
        &self,
        callback: &ProbeCallback,
        info: &mut PadProbeInfo<'_>,
    ) -> Result<PadProbeReturn, FlowError> {
        catch_unwind(AssertUnwindSafe(|| callback(self, info))).map_err(|payload| {
            let msg = panic_message(&*payload);
            warn!(pad = %self.path(), probe = info.id.get(), %msg, "probe callback panicked");
            if let Some(element) = self.parent_element() {
                element.post_error(
                    "probe callback failed",
                    Some(format!("{}: {msg}", self.path())),
                );
            }
            FlowError::Error
        })
    }

    /// Wait until probe `id` is removed or the pad starts flushing.
    fn wait_blocked(&self, id: ProbeId) -> FlowResult {
        let mut st = self.lock_state();
        st.waiting += 1;
        st.update_blocked_flags();
        while st.probes.iter().any(|p| p.id == id) && !st.flags.contains(PadFlags::FLUSHING) {
            st = self.0.cond.wait(st).unwrap();
        }
        st.waiting -= 1;
        st.update_blocked_flags();
        if st.flags.contains(PadFlags::FLUSHING) {
            Err(FlowError::Flushing)
        } else {
            Ok(())
        }
    }

    /// Run matching probes: blocking ones first, then the others, each group
    /// in installation order.
    fn run_probes<'a>(
        &self,
        kind: PadProbeType,
        data: PadProbeData<'a>,
        offset: u64,
        size: u32,
    ) -> Result<Probed<'a>, FlowError> {
        let matching: Vec<(ProbeId, bool, ProbeCallback)> = {
            let st = self.lock_state();
            let (mut blocking, others): (Vec<_>, Vec<_>) = st
                .probes
                .iter()
                .filter(|p| !p.mask.contains(PadProbeType::IDLE) && p.mask.matches(kind))
                .map(|p| (p.id, p.mask.contains(PadProbeType::BLOCK), p.callback.clone()))
                .partition(|(_, block, _)| *block);
            blocking.extend(others);
            blocking
        };
        let Some(first) = matching.first().map(|(id, _, _)| *id) else {
            return Ok(Probed::Pass(data));
        };

        let mut info = PadProbeInfo {
            id: first,
            mask: kind,
            data,
            offset,
            size,
            flow_result: Ok(()),
        };
        for (id, block, callback) in matching {
            if !self.has_probe(id) {
                continue;
            }
            info.id = id;
            match self.call_probe(&callback, &mut info)? {
                PadProbeReturn::Ok if block && !kind.contains(PadProbeType::EVENT_FLUSH) => {
                    trace!(pad = %self.name(), probe = id.get(), "pad blocked");
                    self.wait_blocked(id)?;
                }
                PadProbeReturn::Ok | PadProbeReturn::Pass => {}
                PadProbeReturn::Remove => self.remove_probe(id),
                PadProbeReturn::Drop => {
                    trace!(pad = %self.name(), probe = id.get(), "probe dropped item");
                    return Ok(Probed::Dropped);
                }
                PadProbeReturn::Handled => {
                    return Ok(Probed::Handled(info.flow_result, info.data));
                }
            }
        }
        Ok(Probed::Pass(info.data))
    }

    // ========================================================================
    // Push mode
    // ========================================================================

    /// Push a buffer to the peer of this source pad.
    ///
    /// Negotiates caps first if the pad has none (or was asked to
    /// reconfigure), then delivers pending sticky events, runs probes and
    /// calls the peer's chain handler.
    pub fn push(&self, buffer: Buffer) -> FlowResult {
        let res = self.push_data(Item::Buffer(buffer));
        self.store_flow(&res);
        res
    }

    /// Push a buffer list to the peer of this source pad.
    pub fn push_list(&self, list: BufferList) -> FlowResult {
        let res = self.push_data(Item::List(list));
        self.store_flow(&res);
        res
    }

    fn push_data(&self, item: Item) -> FlowResult {
        if self.direction() != PadDirection::Src {
            warn!(pad = %self.path(), "push on a sink pad");
            return Err(FlowError::Error);
        }
        {
            let st = self.lock_state();
            if st.flags.contains(PadFlags::FLUSHING) {
                return Err(FlowError::Flushing);
            }
            if st.flags.contains(PadFlags::EOS) {
                return Err(FlowError::Eos);
            }
            if st.mode == PadMode::Pull {
                return Err(FlowError::Error);
            }
        }
        self.negotiate_lazily()?;

        let _busy = self.begin_traversal()?;
        let kind = item.probe_type() | PadProbeType::PUSH;
        let data = match self.run_probes(kind, item.into_probe_data(), 0, 0)? {
            Probed::Pass(data) => data,
            Probed::Dropped => return Ok(()),
            Probed::Handled(res, _) => return res,
        };
        let Some(item) = Item::from_probe_data(data) else {
            return Ok(());
        };

        match self.check_sticky() {
            Ok(()) | Err(FlowError::NotLinked) => {}
            Err(e) => return Err(e),
        }
        let peer = self.peer().ok_or(FlowError::NotLinked)?;
        peer.chain_data(item)
    }

    /// Deliver a buffer to this sink pad as if its peer pushed it.
    pub fn chain(&self, buffer: Buffer) -> FlowResult {
        let res = self.chain_data(Item::Buffer(buffer));
        self.store_flow(&res);
        res
    }

    /// Deliver a buffer list to this sink pad as if its peer pushed it.
    pub fn chain_list(&self, list: BufferList) -> FlowResult {
        let res = self.chain_data(Item::List(list));
        self.store_flow(&res);
        res
    }

    fn chain_data(&self, item: Item) -> FlowResult {
        if self.direction() != PadDirection::Sink {
            return Err(FlowError::Error);
        }
        let _stream = self.stream_lock();
        let has_caps = {
            let st = self.lock_state();
            if st.flags.contains(PadFlags::FLUSHING) {
                return Err(FlowError::Flushing);
            }
            if st.flags.contains(PadFlags::EOS) {
                return Err(FlowError::Eos);
            }
            if st.mode == PadMode::Pull {
                return Err(FlowError::Error);
            }
            st.caps.is_some()
        };
        if !has_caps && !self.query_caps(None).is_any() {
            debug!(pad = %self.path(), "data before caps");
            return Err(FlowError::NotNegotiated);
        }

        let _busy = self.begin_traversal()?;
        let kind = item.probe_type() | PadProbeType::PUSH;
        let data = match self.run_probes(kind, item.into_probe_data(), 0, 0)? {
            Probed::Pass(data) => data,
            Probed::Dropped => return Ok(()),
            Probed::Handled(res, _) => return res,
        };
        let Some(item) = Item::from_probe_data(data) else {
            return Ok(());
        };

        let parent = self.parent_element();
        let handlers = self.handlers();
        match item {
            Item::Buffer(buffer) => match &handlers.chain {
                Some(f) => f(self, parent.as_ref(), buffer),
                None => Err(FlowError::NotSupported),
            },
            Item::List(list) => match (&handlers.chain_list, &handlers.chain) {
                (Some(f), _) => f(self, parent.as_ref(), list),
                (None, Some(f)) => list
                    .into_iter()
                    .try_for_each(|buffer| f(self, parent.as_ref(), buffer)),
                (None, None) => Err(FlowError::NotSupported),
            },
        }
    }

    // ========================================================================
    // Pull mode
    // ========================================================================

    /// Pull `size` bytes at `offset` from the peer of this sink pad.
    ///
    /// The pad must be active in pull mode. A probe dropping the buffer makes
    /// the pull fail with [`FlowError::Error`].
    pub fn pull_range(&self, offset: u64, size: u32) -> Result<Buffer, FlowError> {
        let res = self.pull_range_inner(offset, size);
        self.store_flow(&res);
        res
    }

    fn pull_range_inner(&self, offset: u64, size: u32) -> Result<Buffer, FlowError> {
        if self.direction() != PadDirection::Sink {
            return Err(FlowError::Error);
        }
        if self.mode() != PadMode::Pull {
            return Err(FlowError::Flushing);
        }
        let _busy = self.begin_traversal()?;
        let peer = self.peer().ok_or(FlowError::NotLinked)?;
        let buffer = peer.get_range_inner(offset, size)?;
        self.probe_pulled(buffer, offset, size)
    }

    /// Produce `size` bytes at `offset` from this source pad's pull handler.
    pub fn get_range(&self, offset: u64, size: u32) -> Result<Buffer, FlowError> {
        let res = self.get_range_inner(offset, size);
        self.store_flow(&res);
        res
    }

    fn get_range_inner(&self, offset: u64, size: u32) -> Result<Buffer, FlowError> {
        if self.direction() != PadDirection::Src {
            return Err(FlowError::Error);
        }
        let _stream = self.stream_lock();
        {
            let st = self.lock_state();
            if st.flags.contains(PadFlags::FLUSHING) || st.mode != PadMode::Pull {
                return Err(FlowError::Flushing);
            }
        }
        let _busy = self.begin_traversal()?;
        let Some(getrange) = self.handlers().getrange.clone() else {
            return Err(FlowError::NotSupported);
        };
        let parent = self.parent_element();
        let mut buffer = getrange(self, parent.as_ref(), offset, size)?;
        if buffer.len() > size as usize {
            buffer.truncate(size as usize);
        }
        self.probe_pulled(buffer, offset, size)
    }

    fn probe_pulled(&self, buffer: Buffer, offset: u64, size: u32) -> Result<Buffer, FlowError> {
        let kind = PadProbeType::BUFFER | PadProbeType::PULL;
        match self.run_probes(kind, PadProbeData::Buffer(buffer), offset, size)? {
            Probed::Pass(PadProbeData::Buffer(b)) => Ok(b),
            Probed::Handled(Ok(()), PadProbeData::Buffer(b)) => Ok(b),
            Probed::Handled(Err(e), _) => Err(e),
            _ => Err(FlowError::Error),
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Send an event into this pad, as its peer would.
    ///
    /// Downstream events go to sink pads, upstream events to source pads.
    /// Serialized downstream events take the stream lock. Sticky events are
    /// stored once the handler accepts them.
    pub fn send_event(&self, event: Event) -> bool {
        self.send_event_inner(event).is_ok()
    }

    pub(crate) fn send_event_inner(&self, mut event: Event) -> FlowResult {
        let event_type = event.event_type();
        let direction = self.direction();
        let allowed = match direction {
            PadDirection::Sink => event_type.is_downstream(),
            PadDirection::Src => event_type.is_upstream(),
        };
        if !allowed {
            warn!(pad = %self.path(), event = event.name(), "event sent in wrong direction");
            return Err(FlowError::Error);
        }

        let serialized = direction == PadDirection::Sink && event_type.is_serialized();
        let _stream = serialized.then(|| self.stream_lock());

        {
            let mut st = self.lock_state();
            match event_type {
                EventType::FlushStart => {
                    st.flags.insert(PadFlags::FLUSHING);
                    self.0.cond.notify_all();
                }
                EventType::FlushStop => {
                    if st.mode == PadMode::None {
                        return Err(FlowError::Flushing);
                    }
                    st.flags.remove(PadFlags::FLUSHING | PadFlags::EOS);
                    st.remove_flush_cleared_sticky();
                }
                _ => {
                    if st.flags.contains(PadFlags::FLUSHING) {
                        return Err(FlowError::Flushing);
                    }
                    if serialized
                        && st.flags.contains(PadFlags::EOS)
                        && event_type != EventType::StreamStart
                    {
                        return Err(FlowError::Eos);
                    }
                }
            }
        }

        if direction == PadDirection::Sink
            && let Event::Caps(caps) = &event
            && !self.accept_caps(caps)
        {
            warn!(pad = %self.path(), %caps, "caps refused");
            return Err(FlowError::NotNegotiated);
        }
        if let Event::Segment(segment) = &mut event {
            let offset = self.offset();
            if offset != 0 {
                segment.apply_offset(offset);
            }
        }

        let _busy = if event_type.is_flush() {
            None
        } else {
            Some(self.begin_traversal()?)
        };
        let kind = event_probe_kind(event_type, direction == PadDirection::Sink);
        event = match self.run_probes(kind, PadProbeData::Event(event), 0, 0)? {
            Probed::Pass(PadProbeData::Event(e)) => e,
            Probed::Pass(_) | Probed::Dropped => return Ok(()),
            Probed::Handled(res, _) => return res,
        };

        if direction == PadDirection::Src && event_type == EventType::Reconfigure {
            self.mark_reconfigure();
        }

        let sticky = (direction == PadDirection::Sink && event.is_sticky()).then(|| event.clone());
        let parent = self.parent_element();
        let handled = match &self.handlers().event {
            Some(f) => f(self, parent.as_ref(), event),
            None => Pad::event_default(self, parent.as_ref(), event),
        };
        if !handled {
            return Err(if event_type == EventType::Caps {
                FlowError::NotNegotiated
            } else {
                FlowError::Error
            });
        }
        if let Some(event) = sticky {
            self.lock_state().store_sticky(event, true);
        }
        Ok(())
    }

    /// Push an event out of this pad to its peer.
    ///
    /// Source pads push downstream events, sink pads upstream events. Sticky
    /// events are stored first; pushing one to an unlinked pad succeeds and
    /// delivers it once the pad gets linked.
    pub fn push_event(&self, event: Event) -> bool {
        self.push_event_inner(event).is_ok()
    }

    pub(crate) fn push_event_inner(&self, event: Event) -> FlowResult {
        let event_type = event.event_type();
        let direction = self.direction();
        let allowed = match direction {
            PadDirection::Src => event_type.is_downstream(),
            PadDirection::Sink => event_type.is_upstream(),
        };
        if !allowed {
            warn!(pad = %self.path(), event = event.name(), "event pushed in wrong direction");
            return Err(FlowError::Error);
        }

        let stored = {
            let mut st = self.lock_state();
            match event_type {
                EventType::FlushStart => {
                    st.flags.insert(PadFlags::FLUSHING);
                    self.0.cond.notify_all();
                }
                EventType::FlushStop => {
                    if st.mode != PadMode::None {
                        st.flags.remove(PadFlags::FLUSHING);
                    }
                    st.flags.remove(PadFlags::EOS);
                    st.remove_flush_cleared_sticky();
                }
                _ => {
                    if st.flags.contains(PadFlags::FLUSHING) {
                        return Err(FlowError::Flushing);
                    }
                    if direction == PadDirection::Src
                        && event_type.is_serialized()
                        && st.flags.contains(PadFlags::EOS)
                        && event_type != EventType::StreamStart
                    {
                        return Err(FlowError::Eos);
                    }
                }
            }
            if direction == PadDirection::Src && event.is_sticky() {
                st.store_sticky(event.clone(), false);
                true
            } else {
                false
            }
        };

        if stored {
            return match self.check_sticky() {
                Ok(()) | Err(FlowError::NotLinked) => Ok(()),
                Err(e) => Err(e),
            };
        }
        if direction == PadDirection::Src && event_type.is_serialized() {
            match self.check_sticky() {
                Ok(()) | Err(FlowError::NotLinked) => {}
                Err(e) => return Err(e),
            }
        }
        self.push_event_to_peer(event)
    }

    /// Deliver pending sticky events to the peer, in storage order.
    fn check_sticky(&self) -> FlowResult {
        loop {
            let event = {
                let st = self.lock_state();
                let Some(entry) = st.sticky.iter().find(|e| !e.received) else {
                    return Ok(());
                };
                if st.peer.as_ref().and_then(WeakPad::upgrade).is_none() {
                    return Err(FlowError::NotLinked);
                }
                entry.event.clone()
            };
            let event_type = event.event_type();
            let res = self.push_event_to_peer(event.clone());
            match res {
                Err(FlowError::NotLinked) | Err(FlowError::Flushing) => return res,
                Err(_) if event_type == EventType::Caps => {
                    return Err(FlowError::NotNegotiated);
                }
                Err(e) => {
                    debug!(pad = %self.path(), event = event.name(), %e, "sticky event not delivered");
                }
                Ok(()) => {}
            }
            let mut st = self.lock_state();
            if let Some(entry) = st.sticky.iter_mut().find(|e| e.event == event) {
                entry.received = true;
            }
        }
    }

    fn push_event_to_peer(&self, mut event: Event) -> FlowResult {
        let event_type = event.event_type();
        let _busy = if event_type.is_flush() {
            None
        } else {
            Some(self.begin_traversal()?)
        };
        let kind = event_probe_kind(event_type, self.direction() == PadDirection::Src);
        event = match self.run_probes(kind, PadProbeData::Event(event), 0, 0)? {
            Probed::Pass(PadProbeData::Event(e)) => e,
            Probed::Pass(_) | Probed::Dropped => return Ok(()),
            Probed::Handled(res, _) => return res,
        };
        if let Event::Segment(segment) = &mut event {
            let offset = self.offset();
            if offset != 0 {
                segment.apply_offset(offset);
            }
        }
        let peer = self.peer().ok_or(FlowError::NotLinked)?;
        trace!(pad = %self.name(), peer = %peer.name(), event = event.name(), "pushing event");
        peer.send_event_inner(event)
    }

    /// Default event handling: push the event on every internally linked pad.
    ///
    /// Succeeds if any push succeeded, or if there was nothing to forward to.
    pub fn event_default(pad: &Pad, _parent: Option<&Element>, event: Event) -> bool {
        let links = pad.internal_links();
        if links.is_empty() {
            return true;
        }
        let mut result = false;
        for link in &links {
            result |= link.push_event(event.clone());
        }
        result
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Ask this pad a query.
    pub fn query(&self, query: &mut Query) -> bool {
        let kind = match self.direction() {
            PadDirection::Sink => PadProbeType::QUERY_DOWNSTREAM,
            PadDirection::Src => PadProbeType::QUERY_UPSTREAM,
        } | PadProbeType::PUSH;
        match self.run_probes(kind, PadProbeData::Query(&mut *query), 0, 0) {
            Ok(Probed::Pass(_)) => {}
            Ok(Probed::Handled(res, _)) => return res.is_ok(),
            Ok(Probed::Dropped) | Err(_) => return false,
        }
        let parent = self.parent_element();
        match &self.handlers().query {
            Some(f) => f(self, parent.as_ref(), query),
            None => Pad::query_default(self, parent.as_ref(), query),
        }
    }

    /// Ask the peer of this pad a query. Fails when unlinked.
    pub fn peer_query(&self, query: &mut Query) -> bool {
        let kind = match self.direction() {
            PadDirection::Src => PadProbeType::QUERY_DOWNSTREAM,
            PadDirection::Sink => PadProbeType::QUERY_UPSTREAM,
        } | PadProbeType::PUSH;
        match self.run_probes(kind, PadProbeData::Query(&mut *query), 0, 0) {
            Ok(Probed::Pass(_)) => {}
            Ok(Probed::Handled(res, _)) => return res.is_ok(),
            Ok(Probed::Dropped) | Err(_) => return false,
        }
        match self.peer() {
            Some(peer) => peer.query(query),
            None => false,
        }
    }

    /// Default query handling.
    ///
    /// Caps and accept-caps queries are answered from templates, current
    /// caps or internal links depending on the pad flags. Scheduling queries
    /// are forwarded and otherwise answered with push mode (plus pull mode if
    /// the pad has a pull handler). Everything else is forwarded to the peers
    /// of internally linked pads.
    pub fn query_default(pad: &Pad, _parent: Option<&Element>, query: &mut Query) -> bool {
        match query {
            Query::Caps { .. } => {
                pad.query_caps_default(query);
                true
            }
            Query::AcceptCaps { caps, result } => {
                let caps = caps.clone();
                *result = pad.accept_caps_default(&caps);
                true
            }
            Query::Scheduling { .. } => {
                if pad.direction() == PadDirection::Sink
                    && pad.internal_links().iter().any(|p| p.peer_query(query))
                {
                    return true;
                }
                if let Query::Scheduling { modes, flags } = query {
                    *modes = if pad.handlers().getrange.is_some() {
                        *flags |= SchedulingFlags::SEEKABLE;
                        vec![PadMode::Pull, PadMode::Push]
                    } else {
                        vec![PadMode::Push]
                    };
                }
                true
            }
            _ => pad.internal_links().iter().any(|p| p.peer_query(query)),
        }
    }

    fn query_caps_default(&self, query: &mut Query) {
        let st_caps = self.current_caps();
        let flags = self.flags();
        if flags.contains(PadFlags::FIXED_CAPS)
            && let Some(caps) = st_caps
        {
            query.set_caps_result(caps);
            return;
        }
        if flags.contains(PadFlags::PROXY_CAPS) && self.proxy_query_caps(query) {
            return;
        }
        let caps = match (&self.0.template, st_caps) {
            (Some(t), _) => t.caps().clone(),
            (None, Some(current)) => current,
            (None, None) => Caps::new_any(),
        };
        query.set_caps_result(caps);
    }

    fn accept_caps_default(&self, caps: &Caps) -> bool {
        let flags = self.flags();
        if flags.contains(PadFlags::PROXY_CAPS) {
            let mut q = Query::accept_caps(caps.clone());
            if self.proxy_query_accept_caps(&mut q) {
                return matches!(q, Query::AcceptCaps { result: true, .. });
            }
        }
        let allowed = if flags.contains(PadFlags::ACCEPT_TEMPLATE) {
            self.template_caps()
        } else {
            self.query_caps(None)
        };
        caps.is_subset(&allowed)
    }

    /// Answer a caps query with what the peers of internally linked pads
    /// accept, restricted to this pad's template.
    pub fn proxy_query_caps(&self, query: &mut Query) -> bool {
        let Query::Caps { filter, .. } = query else {
            return false;
        };
        let filter = filter.clone();
        let mut result = self.template_caps();
        for link in self.internal_links() {
            let peer_caps = link.peer_query_caps(filter.as_ref());
            result = peer_caps.intersect(&result);
        }
        query.set_caps_result(result);
        true
    }

    /// Answer an accept-caps query: every peer of an internally linked pad
    /// must accept the caps.
    pub fn proxy_query_accept_caps(&self, query: &mut Query) -> bool {
        let Query::AcceptCaps { caps, result } = query else {
            return false;
        };
        *result = caps.is_subset(&self.template_caps())
            && self
                .internal_links()
                .iter()
                .all(|link| link.peer_query_accept_caps(caps));
        true
    }

    // ========================================================================
    // Caps helpers
    // ========================================================================

    /// Formats this pad can handle, restricted to `filter` in its order.
    pub fn query_caps(&self, filter: Option<&Caps>) -> Caps {
        let mut query = Query::caps(filter.cloned());
        let answered = self.query(&mut query);
        match (answered.then(|| query.caps_result()).flatten(), filter) {
            (Some(result), Some(f)) => f.intersect(result),
            (Some(result), None) => result.clone(),
            (None, Some(f)) => f.clone(),
            (None, None) => Caps::new_any(),
        }
    }

    /// [`query_caps`](Self::query_caps) on the peer; the filter (or `ANY`)
    /// when unlinked.
    pub fn peer_query_caps(&self, filter: Option<&Caps>) -> Caps {
        let mut query = Query::caps(filter.cloned());
        let answered = self.peer_query(&mut query);
        match (answered.then(|| query.caps_result()).flatten(), filter) {
            (Some(result), Some(f)) => f.intersect(result),
            (Some(result), None) => result.clone(),
            (None, Some(f)) => f.clone(),
            (None, None) => Caps::new_any(),
        }
    }

    /// Whether this pad accepts `caps`.
    pub fn accept_caps(&self, caps: &Caps) -> bool {
        let mut query = Query::accept_caps(caps.clone());
        self.query(&mut query) && matches!(query, Query::AcceptCaps { result: true, .. })
    }

    /// Whether the peer accepts `caps`. An unlinked pad accepts anything.
    pub fn peer_query_accept_caps(&self, caps: &Caps) -> bool {
        if !self.is_linked() {
            return true;
        }
        let mut query = Query::accept_caps(caps.clone());
        self.peer_query(&mut query) && matches!(query, Query::AcceptCaps { result: true, .. })
    }

    /// Formats both this pad and its peer can handle, in this pad's order.
    ///
    /// `None` when unlinked.
    pub fn allowed_caps(&self) -> Option<Caps> {
        if !self.is_linked() {
            return None;
        }
        let mine = self.query_caps(None);
        Some(self.peer_query_caps(Some(&mine)))
    }

    /// Set caps with a `Caps` event: pushed from source pads, sent into sink
    /// pads.
    pub fn set_caps(&self, caps: Caps) -> bool {
        match self.direction() {
            PadDirection::Src => self.push_event(Event::Caps(caps)),
            PadDirection::Sink => self.send_event(Event::Caps(caps)),
        }
    }

    /// Pick and push caps if the pad has none or must reconfigure.
    fn negotiate_lazily(&self) -> FlowResult {
        let (current, reconfigure) = {
            let st = self.lock_state();
            (
                st.caps.clone(),
                st.flags.contains(PadFlags::NEED_RECONFIGURE),
            )
        };
        if current.is_some() && !reconfigure {
            return Ok(());
        }
        if !self.is_linked() {
            return Ok(());
        }
        self.unset_flags(PadFlags::NEED_RECONFIGURE);

        if let Some(caps) = &current
            && self.peer_query_accept_caps(caps)
        {
            return Ok(());
        }
        let Some(allowed) = self.allowed_caps() else {
            return Ok(());
        };
        if allowed.is_any() {
            return Ok(());
        }
        let fixed = allowed.fixate();
        if fixed.is_empty() {
            warn!(pad = %self.path(), "no common caps with peer");
            return Err(FlowError::NotNegotiated);
        }
        debug!(pad = %self.path(), caps = %fixed, "negotiated caps");
        match self.push_event_inner(Event::Caps(fixed)) {
            Ok(()) | Err(FlowError::NotLinked) => Ok(()),
            Err(FlowError::Flushing) => Err(FlowError::Flushing),
            Err(_) => Err(FlowError::NotNegotiated),
        }
    }

    // ========================================================================
    // Position and duration
    // ========================================================================

    /// Current position in `format`.
    pub fn query_position(&self, format: Format) -> Option<u64> {
        let mut q = Query::position(format);
        if !self.query(&mut q) {
            return None;
        }
        match q {
            Query::Position { result, .. } => result,
            _ => None,
        }
    }

    /// Stream duration in `format`.
    pub fn query_duration(&self, format: Format) -> Option<u64> {
        let mut q = Query::duration(format);
        if !self.query(&mut q) {
            return None;
        }
        match q {
            Query::Duration { result, .. } => result,
            _ => None,
        }
    }

    /// Convert `src` to `dest_format`. Same-format conversions are answered
    /// without asking.
    pub fn query_convert(&self, src: FormattedValue, dest_format: Format) -> Option<u64> {
        if src.format == dest_format {
            return src.value;
        }
        let mut q = Query::convert(src, dest_format);
        if !self.query(&mut q) {
            return None;
        }
        match q {
            Query::Convert { result, .. } => result,
            _ => None,
        }
    }

    /// [`query_position`](Self::query_position) on the peer.
    pub fn peer_query_position(&self, format: Format) -> Option<u64> {
        self.peer()?.query_position(format)
    }

    /// [`query_duration`](Self::query_duration) on the peer.
    pub fn peer_query_duration(&self, format: Format) -> Option<u64> {
        self.peer()?.query_duration(format)
    }

    /// [`query_convert`](Self::query_convert) on the peer.
    pub fn peer_query_convert(&self, src: FormattedValue, dest_format: Format) -> Option<u64> {
        self.peer()?.query_convert(src, dest_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Structure;
    use crate::event::{Segment, StreamStart};
    use crate::pad::PadLinkCheck;
    use std::sync::{Arc, Mutex};

    fn raw_caps() -> Caps {
        Caps::from(Structure::new("audio/x-raw").field("rate", 48000i64))
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn linked_pair(caps: Caps) -> (Pad, Pad, Log) {
        let log: Log = Arc::default();
        let (l1, l2) = (Arc::clone(&log), Arc::clone(&log));
        let src = Pad::builder("src", PadDirection::Src).caps(caps.clone()).build();
        let sink = Pad::builder("sink", PadDirection::Sink)
            .caps(caps)
            .chain_function(move |_, _, buffer| {
                l1.lock().unwrap().push(format!("buffer:{}", buffer.len()));
                Ok(())
            })
            .event_function(move |pad, parent, event| {
                l2.lock().unwrap().push(event.name().to_string());
                Pad::event_default(pad, parent, event)
            })
            .build();
        src.link(&sink).unwrap();
        src.set_active(true).unwrap();
        sink.set_active(true).unwrap();
        (src, sink, log)
    }

    #[test]
    fn test_push_negotiates_lazily() {
        let (src, sink, log) = linked_pair(raw_caps());
        assert_eq!(src.push(Buffer::with_size(8)), Ok(()));
        assert_eq!(src.current_caps(), Some(raw_caps()));
        assert_eq!(sink.current_caps(), Some(raw_caps()));
        assert_eq!(*log.lock().unwrap(), vec!["caps", "buffer:8"]);
        assert!(!src.needs_reconfigure());
    }

    #[test]
    fn test_push_unlinked() {
        let src = Pad::new("src", PadDirection::Src);
        src.set_active(true).unwrap();
        assert_eq!(src.push(Buffer::with_size(1)), Err(FlowError::NotLinked));
        assert_eq!(src.last_flow_result(), FlowError::NotLinked.into());
    }

    #[test]
    fn test_push_inactive_is_flushing() {
        let src = Pad::new("src", PadDirection::Src);
        let sink = Pad::new("sink", PadDirection::Sink);
        src.link(&sink).unwrap();
        assert_eq!(src.push(Buffer::with_size(1)), Err(FlowError::Flushing));
        src.set_active(true).unwrap();
        assert_eq!(src.push(Buffer::with_size(1)), Err(FlowError::Flushing));
    }

    #[test]
    fn test_sticky_events_delivered_in_order() {
        let (src, _sink, log) = linked_pair(raw_caps());
        assert!(src.push_event(Event::Segment(Segment::default())));
        assert!(src.push_event(Event::StreamStart(StreamStart::new("s"))));
        assert!(src.push_event(Event::Caps(raw_caps())));
        assert_eq!(*log.lock().unwrap(), vec!["segment", "stream-start", "caps"]);
    }

    #[test]
    fn test_sticky_events_replayed_after_relink() {
        let src = Pad::new("src", PadDirection::Src);
        src.set_active(true).unwrap();
        // Unlinked: stored, reported as success
        assert!(src.push_event(Event::StreamStart(StreamStart::new("s1"))));
        assert_eq!(src.stream_id().as_deref(), Some("s1"));

        let seen: Log = Arc::default();
        let s = Arc::clone(&seen);
        let sink = Pad::builder("sink", PadDirection::Sink)
            .chain_function(|_, _, _| Ok(()))
            .event_function(move |_, _, event| {
                s.lock().unwrap().push(event.name().to_string());
                true
            })
            .build();
        sink.set_active(true).unwrap();
        src.link(&sink).unwrap();
        assert_eq!(src.push(Buffer::with_size(1)), Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec!["stream-start"]);
        assert_eq!(sink.stream_id().as_deref(), Some("s1"));
    }

    #[test]
    fn test_eos_blocks_data_until_flush() {
        let (src, sink, _log) = linked_pair(Caps::new_any());
        assert!(src.push_event(Event::Eos));
        assert!(sink.has_flags(PadFlags::EOS));
        assert_eq!(src.push(Buffer::with_size(1)), Err(FlowError::Eos));
        assert_eq!(sink.chain(Buffer::with_size(1)), Err(FlowError::Eos));

        assert!(src.push_event(Event::FlushStart));
        assert!(src.push_event(Event::FlushStop { reset_time: true }));
        assert!(!src.has_flags(PadFlags::EOS));
        assert!(!sink.has_flags(PadFlags::EOS));
        assert_eq!(src.push(Buffer::with_size(1)), Ok(()));
    }

    #[test]
    fn test_refused_caps_is_not_negotiated() {
        let src = Pad::new("src", PadDirection::Src);
        let sink = Pad::builder("sink", PadDirection::Sink)
            .caps(raw_caps())
            .chain_function(|_, _, _| Ok(()))
            .build();
        src.link_full(&sink, PadLinkCheck::empty()).unwrap();
        src.set_active(true).unwrap();
        sink.set_active(true).unwrap();
        let other = Caps::new_simple("video/x-raw");
        assert!(!src.push_event(Event::Caps(other)));
        assert_eq!(src.push(Buffer::with_size(1)), Err(FlowError::NotNegotiated));
    }

    #[test]
    fn test_sink_without_caps_refuses_data() {
        let sink = Pad::builder("sink", PadDirection::Sink)
            .caps(raw_caps())
            .chain_function(|_, _, _| Ok(()))
            .build();
        sink.set_active(true).unwrap();
        assert_eq!(sink.chain(Buffer::with_size(1)), Err(FlowError::NotNegotiated));
        assert!(sink.set_caps(raw_caps()));
        assert_eq!(sink.chain(Buffer::with_size(1)), Ok(()));
    }

    #[test]
    fn test_chain_list_falls_back_to_chain() {
        let (src, _sink, log) = linked_pair(Caps::new_any());
        let list: BufferList = [Buffer::with_size(1), Buffer::with_size(2)]
            .into_iter()
            .collect();
        assert_eq!(src.push_list(list), Ok(()));
        assert_eq!(*log.lock().unwrap(), vec!["buffer:1", "buffer:2"]);
    }

    #[test]
    fn test_caps_queries() {
        let (src, sink, _log) = linked_pair(raw_caps());
        assert_eq!(src.query_caps(None), raw_caps());
        assert_eq!(src.allowed_caps(), Some(raw_caps()));
        assert!(src.peer_query_accept_caps(&raw_caps()));
        assert!(!sink.accept_caps(&Caps::new_simple("video/x-raw")));

        let unlinked = Pad::new("lonely", PadDirection::Src);
        assert_eq!(unlinked.allowed_caps(), None);
        assert!(unlinked.peer_query_accept_caps(&Caps::new_simple("x/y")));
        assert!(unlinked.peer_query_caps(None).is_any());
    }

    #[test]
    fn test_query_filter_order() {
        let caps: Caps = "a/x; b/x".parse().unwrap();
        let pad = Pad::builder("src", PadDirection::Src).caps(caps).build();
        let filter: Caps = "b/x; a/x".parse().unwrap();
        assert_eq!(pad.query_caps(Some(&filter)), filter);
    }

    #[test]
    fn test_fixed_caps() {
        let (src, sink, _log) = linked_pair(Caps::from(
            Structure::new("audio/x-raw").field("rate", 8000i64..=48000i64),
        ));
        sink.use_fixed_caps();
        let a = Caps::from(Structure::new("audio/x-raw").field("rate", 8000i64));
        let b = Caps::from(Structure::new("audio/x-raw").field("rate", 16000i64));
        assert!(src.push_event(Event::Caps(a.clone())));
        assert_eq!(sink.query_caps(None), a);
        assert!(!sink.accept_caps(&b));
    }

    #[test]
    fn test_pull_range() {
        let src = Pad::builder("src", PadDirection::Src)
            .getrange_function(|_, _, offset, size| {
                let data: Vec<u8> = (offset..offset + size as u64 + 4).map(|b| b as u8).collect();
                Ok(Buffer::from_slice(&data).with_offset(offset))
            })
            .build();
        let sink = Pad::new("sink", PadDirection::Sink);
        src.link(&sink).unwrap();

        assert_eq!(sink.pull_range(0, 4), Err(FlowError::Flushing));
        sink.activate_mode(PadMode::Pull, true).unwrap();
        assert_eq!(src.mode(), PadMode::Pull);

        let buffer = sink.pull_range(10, 4).unwrap();
        assert_eq!(buffer.as_slice(), &[10, 11, 12, 13]);
        assert_eq!(sink.peer_query_caps(None), Caps::new_any());

        let mut q = Query::scheduling();
        assert!(sink.peer_query(&mut q));
        assert!(q.has_scheduling_mode(PadMode::Pull));

        sink.set_active(false).unwrap();
        assert_eq!(src.mode(), PadMode::None);
        assert_eq!(sink.pull_range(0, 4), Err(FlowError::Flushing));
    }

    #[test]
    fn test_segment_offset_applied() {
        let seen: Arc<Mutex<Option<Segment>>> = Arc::default();
        let s = Arc::clone(&seen);
        let src = Pad::new("src", PadDirection::Src);
        let sink = Pad::builder("sink", PadDirection::Sink)
            .event_function(move |_, _, event| {
                if let Event::Segment(seg) = event {
                    *s.lock().unwrap() = Some(seg);
                }
                true
            })
            .build();
        src.link(&sink).unwrap();
        src.set_active(true).unwrap();
        sink.set_active(true).unwrap();
        src.set_offset(1_000);
        assert!(src.push_event(Event::Segment(Segment::default())));
        assert_eq!(seen.lock().unwrap().as_ref().map(|s| s.base), Some(1_000));
        // Stored copy keeps the original base
        match src.sticky_event(EventType::Segment) {
            Some(Event::Segment(seg)) => assert_eq!(seg.base, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_upstream_reconfigure_marks_src() {
        let (src, sink, _log) = linked_pair(Caps::new_any());
        src.check_reconfigure();
        assert!(sink.push_event(Event::Reconfigure));
        assert!(src.needs_reconfigure());
    }
}
