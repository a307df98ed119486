//! Queries: questions asked to a pad and answered in place.
//!
//! A query is passed by `&mut` to the pad's query handler, which fills in the
//! result and returns whether it answered.

use crate::caps::Caps;
use crate::event::TagList;
use crate::format::{Format, FormattedValue};
use crate::pad::PadMode;
use bitflags::bitflags;

bitflags! {
    /// Scheduling properties of an upstream pad.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SchedulingFlags: u32 {
        /// Random access is possible.
        const SEEKABLE = 1 << 0;
        /// Pull mode works but is slower than push.
        const SEQUENTIAL = 1 << 1;
        /// Data arrives in bandwidth-limited chunks.
        const BANDWIDTH_LIMITED = 1 << 2;
    }
}

/// A query and its (possibly not yet filled in) answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Which formats can the pad handle?
    Caps {
        /// Restrict the answer to these formats, in this preference order.
        filter: Option<Caps>,
        /// Answer.
        result: Option<Caps>,
    },
    /// Would the pad accept exactly these caps?
    AcceptCaps {
        /// Candidate caps.
        caps: Caps,
        /// Answer.
        result: bool,
    },
    /// Current playback position.
    Position {
        /// Requested unit.
        format: Format,
        /// Answer.
        result: Option<u64>,
    },
    /// Total stream duration.
    Duration {
        /// Requested unit.
        format: Format,
        /// Answer.
        result: Option<u64>,
    },
    /// Convert a value between units.
    Convert {
        /// Value to convert.
        src: FormattedValue,
        /// Target unit.
        dest_format: Format,
        /// Answer.
        result: Option<u64>,
    },
    /// Which scheduling modes does the upstream pad support?
    Scheduling {
        /// Supported modes, preferred first.
        modes: Vec<PadMode>,
        /// Properties.
        flags: SchedulingFlags,
    },
    /// Application-defined query.
    Custom {
        /// Query name.
        name: String,
        /// Questions and answers.
        fields: TagList,
    },
}

impl Query {
    /// New caps query.
    pub fn caps(filter: Option<Caps>) -> Self {
        Self::Caps {
            filter,
            result: None,
        }
    }

    /// New accept-caps query.
    pub fn accept_caps(caps: Caps) -> Self {
        Self::AcceptCaps {
            caps,
            result: false,
        }
    }

    /// New position query.
    pub fn position(format: Format) -> Self {
        Self::Position {
            format,
            result: None,
        }
    }

    /// New duration query.
    pub fn duration(format: Format) -> Self {
        Self::Duration {
            format,
            result: None,
        }
    }

    /// New convert query.
    pub fn convert(src: FormattedValue, dest_format: Format) -> Self {
        Self::Convert {
            src,
            dest_format,
            result: None,
        }
    }

    /// New scheduling query.
    pub fn scheduling() -> Self {
        Self::Scheduling {
            modes: Vec::new(),
            flags: SchedulingFlags::empty(),
        }
    }

    /// New custom query.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom {
            name: name.into(),
            fields: TagList::new(),
        }
    }

    /// Human-readable query name.
    pub fn name(&self) -> &str {
        match self {
            Self::Caps { .. } => "caps",
            Self::AcceptCaps { .. } => "accept-caps",
            Self::Position { .. } => "position",
            Self::Duration { .. } => "duration",
            Self::Convert { .. } => "convert",
            Self::Scheduling { .. } => "scheduling",
            Self::Custom { name, .. } => name,
        }
    }

    /// The answer of a caps query.
    pub fn caps_result(&self) -> Option<&Caps> {
        match self {
            Self::Caps { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    /// Fill in the answer of a caps query, applying its filter.
    pub fn set_caps_result(&mut self, caps: Caps) {
        if let Self::Caps { filter, result } = self {
            *result = Some(match filter {
                Some(f) => f.intersect(&caps),
                None => caps,
            });
        }
    }

    /// Whether the scheduling answer includes `mode`.
    pub fn has_scheduling_mode(&self, mode: PadMode) -> bool {
        matches!(self, Self::Scheduling { modes, .. } if modes.contains(&mode))
    }
}
