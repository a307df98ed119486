//! Events travelling through pads alongside buffers.
//!
//! Events are categorized by their flow direction:
//!
//! - **Downstream events** flow with data (stream-start, caps, segment, EOS)
//! - **Upstream events** flow against data (seek, QoS, reconfigure)
//! - **Flush events** travel either way and bypass data ordering
//!
//! Serialized events are ordered against buffers on the same pad. Sticky
//! events are remembered by the pad that saw them and replayed to a new peer
//! before any further data.
//!
//! # Example
//!
//! ```rust
//! use padflow::event::{Event, EventType};
//!
//! let eos = Event::Eos;
//! assert!(eos.is_downstream());
//! assert!(eos.is_sticky());
//! assert_eq!(eos.event_type(), EventType::Eos);
//! assert!(!Event::FlushStart.is_serialized());
//! ```

mod tags;

pub use tags::{TagList, TagMergeMode, TagValue};

use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::format::Format;
use bitflags::bitflags;

// ============================================================================
// Event Enum
// ============================================================================

/// Events that flow through pads.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Downstream
    /// Start of a new stream.
    StreamStart(StreamStart),

    /// Negotiated format for the following buffers.
    Caps(Caps),

    /// Playback segment (timeline) for the following buffers.
    Segment(Segment),

    /// Stream metadata.
    Tag(TagList),

    /// No data for a period of time.
    Gap {
        /// Start of the gap.
        timestamp: ClockTime,
        /// Length of the gap, if known.
        duration: Option<ClockTime>,
    },

    /// No more data follows.
    Eos,

    // Upstream
    /// Seek request.
    Seek(Seek),

    /// Quality of Service feedback.
    Qos(Qos),

    /// Ask upstream to renegotiate.
    Reconfigure,

    // Both directions
    /// Enter flushing: drop data and wake blocked threads.
    FlushStart,

    /// Leave flushing; optionally reset running time.
    FlushStop {
        /// Whether running time restarts from zero.
        reset_time: bool,
    },

    /// Application-defined event.
    Custom(CustomEvent),
}

/// Event kind without payload.
///
/// Sticky kinds are declared in the order they are stored and replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    /// [`Event::StreamStart`].
    StreamStart,
    /// [`Event::Caps`].
    Caps,
    /// [`Event::Segment`].
    Segment,
    /// [`Event::Tag`].
    Tag,
    /// Custom downstream sticky event.
    CustomDownstreamSticky,
    /// [`Event::Eos`].
    Eos,
    /// [`Event::Gap`].
    Gap,
    /// Custom serialized downstream event.
    CustomDownstream,
    /// [`Event::Seek`].
    Seek,
    /// [`Event::Qos`].
    Qos,
    /// [`Event::Reconfigure`].
    Reconfigure,
    /// Custom upstream event.
    CustomUpstream,
    /// [`Event::FlushStart`].
    FlushStart,
    /// [`Event::FlushStop`].
    FlushStop,
}

impl EventType {
    /// Whether events of this kind flow downstream.
    pub fn is_downstream(self) -> bool {
        !matches!(
            self,
            Self::Seek | Self::Qos | Self::Reconfigure | Self::CustomUpstream
        )
    }

    /// Whether events of this kind flow upstream.
    pub fn is_upstream(self) -> bool {
        matches!(
            self,
            Self::Seek
                | Self::Qos
                | Self::Reconfigure
                | Self::CustomUpstream
                | Self::FlushStart
                | Self::FlushStop
        )
    }

    /// Whether events of this kind are ordered against data.
    pub fn is_serialized(self) -> bool {
        matches!(
            self,
            Self::StreamStart
                | Self::Caps
                | Self::Segment
                | Self::Tag
                | Self::CustomDownstreamSticky
                | Self::Eos
                | Self::Gap
                | Self::CustomDownstream
                | Self::FlushStop
        )
    }

    /// Whether events of this kind are remembered by the pad.
    pub fn is_sticky(self) -> bool {
        self <= Self::Eos
    }

    /// Whether a flush-stop removes the sticky event of this kind.
    pub fn is_cleared_by_flush(self) -> bool {
        matches!(self, Self::Segment | Self::Eos)
    }

    /// Whether this is a flush event.
    pub fn is_flush(self) -> bool {
        matches!(self, Self::FlushStart | Self::FlushStop)
    }
}

impl Event {
    /// Kind of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::StreamStart(_) => EventType::StreamStart,
            Event::Caps(_) => EventType::Caps,
            Event::Segment(_) => EventType::Segment,
            Event::Tag(_) => EventType::Tag,
            Event::Gap { .. } => EventType::Gap,
            Event::Eos => EventType::Eos,
            Event::Seek(_) => EventType::Seek,
            Event::Qos(_) => EventType::Qos,
            Event::Reconfigure => EventType::Reconfigure,
            Event::FlushStart => EventType::FlushStart,
            Event::FlushStop { .. } => EventType::FlushStop,
            Event::Custom(c) => match c.kind {
                CustomKind::Downstream => EventType::CustomDownstream,
                CustomKind::DownstreamSticky => EventType::CustomDownstreamSticky,
                CustomKind::Upstream => EventType::CustomUpstream,
            },
        }
    }

    /// Whether the event travels with the data.
    pub fn is_downstream(&self) -> bool {
        self.event_type().is_downstream()
    }

    /// Whether the event travels against the data.
    pub fn is_upstream(&self) -> bool {
        self.event_type().is_upstream()
    }

    /// Whether the event stays ordered with buffers.
    pub fn is_serialized(&self) -> bool {
        self.event_type().is_serialized()
    }

    /// Check if the pad remembers this event.
    pub fn is_sticky(&self) -> bool {
        self.event_type().is_sticky()
    }

    /// Key identifying the sticky slot this event occupies.
    ///
    /// Custom sticky events with different names occupy different slots.
    pub fn sticky_key(&self) -> (EventType, &str) {
        match self {
            Event::Custom(c) => (self.event_type(), c.name.as_str()),
            _ => (self.event_type(), ""),
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &str {
        match self {
            Event::StreamStart(_) => "stream-start",
            Event::Caps(_) => "caps",
            Event::Segment(_) => "segment",
            Event::Tag(_) => "tag",
            Event::Gap { .. } => "gap",
            Event::Eos => "eos",
            Event::Seek(_) => "seek",
            Event::Qos(_) => "qos",
            Event::Reconfigure => "reconfigure",
            Event::FlushStart => "flush-start",
            Event::FlushStop { .. } => "flush-stop",
            Event::Custom(c) => &c.name,
        }
    }
}

// ============================================================================
// Stream Start
// ============================================================================

bitflags! {
    /// Flags for stream start events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StreamFlags: u32 {
        /// Sparse stream (e.g., subtitles).
        const SPARSE = 1 << 0;
        /// Should be selected by default.
        const SELECT = 1 << 1;
        /// Should not be selected by default.
        const UNSELECT = 1 << 2;
    }
}

/// Stream start payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart {
    /// Unique stream identifier.
    pub stream_id: String,
    /// Streams belonging together share a group id.
    pub group_id: Option<u32>,
    /// Stream flags.
    pub flags: StreamFlags,
}

impl StreamStart {
    /// Create a stream start with no group and no flags.
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            group_id: None,
            flags: StreamFlags::empty(),
        }
    }
}

// ============================================================================
// Segment
// ============================================================================

/// Playback segment: maps stream positions to running time.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Unit of the positions below.
    pub format: Format,
    /// Playback rate (1.0 = normal speed).
    pub rate: f64,
    /// First position in the segment.
    pub start: u64,
    /// Last position, `None` for open-ended.
    pub stop: Option<u64>,
    /// Stream time of `start`.
    pub time: u64,
    /// Running time of `start`.
    pub base: u64,
    /// Last known position.
    pub position: u64,
}

impl Segment {
    /// A segment in the given unit covering everything.
    pub fn new(format: Format) -> Self {
        Self {
            format,
            rate: 1.0,
            start: 0,
            stop: None,
            time: 0,
            base: 0,
            position: 0,
        }
    }

    /// Convert a position to running time.
    ///
    /// Returns `None` for positions outside the segment.
    pub fn to_running_time(&self, position: u64) -> Option<u64> {
        if position < self.start || self.stop.is_some_and(|stop| position > stop) {
            return None;
        }
        let elapsed = position - self.start;
        let scaled = if self.rate.abs() == 1.0 {
            elapsed
        } else {
            (elapsed as f64 / self.rate.abs()) as u64
        };
        Some(self.base.saturating_add(scaled))
    }

    /// Shift the running time of this segment by a signed offset.
    ///
    /// Negative offsets that would push `base` below zero advance `start`
    /// instead.
    pub fn apply_offset(&mut self, offset: i64) {
        let delta = offset.unsigned_abs();
        if offset >= 0 {
            self.base = self.base.saturating_add(delta);
        } else if self.base >= delta {
            self.base -= delta;
        } else {
            let rest = delta - self.base;
            self.base = 0;
            self.start = self.start.saturating_add(rest);
            self.time = self.time.saturating_add(rest);
        }
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new(Format::Time)
    }
}

// ============================================================================
// Seek
// ============================================================================

bitflags! {
    /// Seek behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SeekFlags: u32 {
        /// Flush the pipeline before seeking.
        const FLUSH = 1 << 0;
        /// Seek to the exact position.
        const ACCURATE = 1 << 1;
        /// Seek to the nearest keyframe.
        const KEY_UNIT = 1 << 2;
        /// Post a segment-done message instead of EOS.
        const SEGMENT = 1 << 3;
    }
}

/// How a seek position is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekType {
    /// Leave unchanged.
    #[default]
    None,
    /// Absolute position.
    Set,
    /// Relative to the end.
    End,
}

/// Seek request payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Seek {
    /// New playback rate.
    pub rate: f64,
    /// Unit of start/stop.
    pub format: Format,
    /// Flags.
    pub flags: SeekFlags,
    /// How `start` is interpreted.
    pub start_type: SeekType,
    /// New start position.
    pub start: u64,
    /// How `stop` is interpreted.
    pub stop_type: SeekType,
    /// New stop position.
    pub stop: u64,
}

impl Seek {
    /// Flushing seek to an absolute time.
    pub fn time(position: ClockTime) -> Self {
        Self {
            rate: 1.0,
            format: Format::Time,
            flags: SeekFlags::FLUSH,
            start_type: SeekType::Set,
            start: position.nanos(),
            stop_type: SeekType::None,
            stop: 0,
        }
    }
}

// ============================================================================
// QoS
// ============================================================================

/// Reason for a QoS event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosType {
    /// Downstream is faster than real time.
    Overflow,
    /// Downstream is too slow.
    Underflow,
    /// Upstream should throttle.
    Throttle,
}

/// QoS feedback payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Qos {
    /// Reason.
    pub kind: QosType,
    /// Processing speed relative to real time.
    pub proportion: f64,
    /// Lateness in nanoseconds (negative = early).
    pub diff: i64,
    /// Running time of the buffer that triggered the event.
    pub timestamp: ClockTime,
}

// ============================================================================
// Custom Events
// ============================================================================

/// Direction and stickiness of a custom event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomKind {
    /// Serialized downstream.
    Downstream,
    /// Serialized downstream and sticky.
    DownstreamSticky,
    /// Upstream.
    Upstream,
}

/// Application-defined event.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    /// Direction and stickiness.
    pub kind: CustomKind,
    /// Event name.
    pub name: String,
    /// Payload.
    pub fields: TagList,
}

impl CustomEvent {
    /// Create a custom event with no payload.
    pub fn new(kind: CustomKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            fields: TagList::new(),
        }
    }

    /// Builder-style payload setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.fields.set(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_direction() {
        assert!(Event::Eos.is_downstream());
        assert!(!Event::Eos.is_upstream());
        assert!(Event::Seek(Seek::time(ClockTime::ZERO)).is_upstream());
        assert!(Event::Reconfigure.is_upstream());
        assert!(Event::FlushStart.is_downstream() && Event::FlushStart.is_upstream());
    }

    #[test]
    fn test_sticky_order() {
        let mut kinds = vec![
            EventType::Eos,
            EventType::Tag,
            EventType::StreamStart,
            EventType::CustomDownstreamSticky,
            EventType::Segment,
            EventType::Caps,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                EventType::StreamStart,
                EventType::Caps,
                EventType::Segment,
                EventType::Tag,
                EventType::CustomDownstreamSticky,
                EventType::Eos,
            ]
        );
        assert!(!EventType::Gap.is_sticky());
        assert!(!EventType::FlushStop.is_sticky());
    }

    #[test]
    fn test_serialization() {
        assert!(Event::Eos.is_serialized());
        assert!(!Event::FlushStart.is_serialized());
        assert!(Event::FlushStop { reset_time: true }.is_serialized());
        assert!(!Event::Qos(Qos {
            kind: QosType::Underflow,
            proportion: 1.5,
            diff: 10,
            timestamp: ClockTime::ZERO,
        })
        .is_serialized());
    }

    #[test]
    fn test_custom_sticky_key() {
        let a = Event::Custom(CustomEvent::new(CustomKind::DownstreamSticky, "a"));
        let b = Event::Custom(CustomEvent::new(CustomKind::DownstreamSticky, "b"));
        assert!(a.is_sticky());
        assert_ne!(a.sticky_key(), b.sticky_key());
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn test_segment_running_time() {
        let mut segment = Segment::new(Format::Time);
        segment.start = 100;
        segment.base = 1000;
        assert_eq!(segment.to_running_time(150), Some(1050));
        assert_eq!(segment.to_running_time(50), None);

        segment.apply_offset(500);
        assert_eq!(segment.base, 1500);
        segment.apply_offset(-2000);
        assert_eq!(segment.base, 0);
        assert_eq!(segment.start, 600);
    }
}
