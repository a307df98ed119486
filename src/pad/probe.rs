//! Pad probe types.
//!
//! A probe is a callback installed on a pad that observes (and may block,
//! drop or consume) the buffers, events and queries crossing it.

use crate::buffer::{Buffer, BufferList};
use crate::event::Event;
use crate::pad::{FlowError, Pad};
use crate::query::Query;
use bitflags::bitflags;
use std::num::NonZeroU64;
use std::sync::Arc;

bitflags! {
    /// Selects which traversals a probe sees.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PadProbeType: u32 {
        /// Fire when the pad becomes idle and keep it blocked while installed.
        const IDLE = 1 << 0;
        /// Block the traversal while the probe is installed.
        const BLOCK = 1 << 1;

        /// Buffers.
        const BUFFER = 1 << 4;
        /// Buffer lists.
        const BUFFER_LIST = 1 << 5;
        /// Downstream events.
        const EVENT_DOWNSTREAM = 1 << 6;
        /// Upstream events.
        const EVENT_UPSTREAM = 1 << 7;
        /// Flush events (never matched by the plain event bits).
        const EVENT_FLUSH = 1 << 8;
        /// Downstream queries.
        const QUERY_DOWNSTREAM = 1 << 9;
        /// Upstream queries.
        const QUERY_UPSTREAM = 1 << 10;

        /// Traversal in push mode.
        const PUSH = 1 << 12;
        /// Traversal in pull mode.
        const PULL = 1 << 13;

        /// Block on buffers.
        const BLOCKING = Self::IDLE.bits() | Self::BLOCK.bits();
        /// All downstream data.
        const DATA_DOWNSTREAM = Self::BUFFER.bits()
            | Self::BUFFER_LIST.bits()
            | Self::EVENT_DOWNSTREAM.bits();
        /// All upstream data.
        const DATA_UPSTREAM = Self::EVENT_UPSTREAM.bits();
        /// Every kind of data.
        const DATA_BOTH = Self::DATA_DOWNSTREAM.bits() | Self::DATA_UPSTREAM.bits();
        /// Block on downstream data.
        const BLOCK_DOWNSTREAM = Self::BLOCK.bits() | Self::DATA_DOWNSTREAM.bits();
        /// Block on upstream data.
        const BLOCK_UPSTREAM = Self::BLOCK.bits() | Self::DATA_UPSTREAM.bits();
        /// Both event directions.
        const EVENT_BOTH = Self::EVENT_DOWNSTREAM.bits() | Self::EVENT_UPSTREAM.bits();
        /// Both query directions.
        const QUERY_BOTH = Self::QUERY_DOWNSTREAM.bits() | Self::QUERY_UPSTREAM.bits();
        /// Everything.
        const ALL_BOTH = Self::DATA_BOTH.bits() | Self::QUERY_BOTH.bits();
        /// Both scheduling modes.
        const SCHEDULING = Self::PUSH.bits() | Self::PULL.bits();
    }
}

impl PadProbeType {
    /// Bits describing the data type.
    pub const DATA_MASK: Self = Self::BUFFER
        .union(Self::BUFFER_LIST)
        .union(Self::EVENT_DOWNSTREAM)
        .union(Self::EVENT_UPSTREAM)
        .union(Self::EVENT_FLUSH)
        .union(Self::QUERY_DOWNSTREAM)
        .union(Self::QUERY_UPSTREAM);

    /// Whether a probe installed with this mask sees a traversal of `kind`.
    ///
    /// `kind` carries exactly one data bit and one scheduling bit. A mask
    /// without data bits matches every data type; a mask without scheduling
    /// bits matches both modes.
    pub fn matches(self, kind: PadProbeType) -> bool {
        let data = self & Self::DATA_MASK;
        let kind_data = kind & Self::DATA_MASK;
        if kind_data.contains(Self::EVENT_FLUSH) {
            if !data.contains(Self::EVENT_FLUSH) {
                return false;
            }
        } else if !data.is_empty() && !data.intersects(kind_data) {
            return false;
        }

        let sched = self & Self::SCHEDULING;
        sched.is_empty() || sched.intersects(kind & Self::SCHEDULING)
    }
}

/// What a probe wants done with the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadProbeReturn {
    /// Pass the item. Blocking probes keep the pad blocked.
    Ok,
    /// Discard the item; the traversal reports success.
    Drop,
    /// Remove this probe and pass the item.
    Remove,
    /// Pass the item without blocking.
    Pass,
    /// The probe consumed the item; the traversal returns the flow result
    /// stored in the probe info.
    Handled,
}

/// The item crossing the pad.
#[derive(Debug)]
pub enum PadProbeData<'a> {
    /// A buffer.
    Buffer(Buffer),
    /// A buffer list.
    BufferList(BufferList),
    /// An event.
    Event(Event),
    /// A query.
    Query(&'a mut Query),
    /// Nothing (idle probes, pull requests before data exists).
    None,
}

/// Information passed to a probe callback.
#[derive(Debug)]
pub struct PadProbeInfo<'a> {
    /// Id of the probe being called.
    pub id: ProbeId,
    /// Type of this traversal.
    pub mask: PadProbeType,
    /// The item. Callbacks may replace or modify it.
    pub data: PadProbeData<'a>,
    /// Offset requested by a pull.
    pub offset: u64,
    /// Size requested by a pull.
    pub size: u32,
    /// Flow result returned when the probe answers [`PadProbeReturn::Handled`].
    pub flow_result: Result<(), FlowError>,
}

impl PadProbeInfo<'_> {
    /// The buffer, if this traversal carries one.
    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.data {
            PadProbeData::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// The buffer, mutably.
    pub fn buffer_mut(&mut self) -> Option<&mut Buffer> {
        match &mut self.data {
            PadProbeData::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// The event, if this traversal carries one.
    pub fn event(&self) -> Option<&Event> {
        match &self.data {
            PadProbeData::Event(e) => Some(e),
            _ => None,
        }
    }

    /// The query, if this traversal carries one.
    pub fn query(&mut self) -> Option<&mut Query> {
        match &mut self.data {
            PadProbeData::Query(q) => Some(q),
            _ => None,
        }
    }
}

/// Handle of an installed probe. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(NonZeroU64);

impl ProbeId {
    pub(crate) fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw id value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Probe callback.
pub type ProbeCallback =
    Arc<dyn Fn(&Pad, &mut PadProbeInfo<'_>) -> PadProbeReturn + Send + Sync + 'static>;

pub(crate) struct Probe {
    pub(crate) id: ProbeId,
    pub(crate) mask: PadProbeType,
    pub(crate) callback: ProbeCallback,
    /// Set once an idle probe fired; the pad stays blocked until removal.
    pub(crate) idle_fired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUFFER_PUSH: PadProbeType = PadProbeType::BUFFER.union(PadProbeType::PUSH);
    const FLUSH_PUSH: PadProbeType = PadProbeType::EVENT_FLUSH.union(PadProbeType::PUSH);
    const QUERY_PULL: PadProbeType = PadProbeType::QUERY_DOWNSTREAM.union(PadProbeType::PULL);

    #[test]
    fn test_data_matching() {
        assert!(PadProbeType::BUFFER.matches(BUFFER_PUSH));
        assert!(PadProbeType::BLOCK_DOWNSTREAM.matches(BUFFER_PUSH));
        assert!(!PadProbeType::EVENT_DOWNSTREAM.matches(BUFFER_PUSH));
        assert!(PadProbeType::BLOCK.matches(BUFFER_PUSH));
    }

    #[test]
    fn test_flush_needs_explicit_bit() {
        assert!(!PadProbeType::EVENT_BOTH.matches(FLUSH_PUSH));
        assert!(!PadProbeType::BLOCK.matches(FLUSH_PUSH));
        assert!((PadProbeType::EVENT_DOWNSTREAM | PadProbeType::EVENT_FLUSH).matches(FLUSH_PUSH));
    }

    #[test]
    fn test_scheduling_matching() {
        assert!(PadProbeType::QUERY_DOWNSTREAM.matches(QUERY_PULL));
        assert!(!(PadProbeType::QUERY_DOWNSTREAM | PadProbeType::PUSH).matches(QUERY_PULL));
        assert!((PadProbeType::QUERY_DOWNSTREAM | PadProbeType::PULL).matches(QUERY_PULL));
    }

    #[test]
    fn test_probe_id_nonzero() {
        assert!(ProbeId::new(0).is_none());
        assert_eq!(ProbeId::new(3).map(ProbeId::get), Some(3));
    }
}
