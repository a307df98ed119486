//! Link checks and link errors.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Which checks [`link_full`](super::Pad::link_full) performs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PadLinkCheck: u32 {
        /// Both pads' elements must be in the same container.
        const HIERARCHY = 1 << 0;
        /// Template caps must intersect.
        const TEMPLATE_CAPS = 1 << 1;
        /// Query caps must intersect.
        const CAPS = 1 << 2;
        /// Skip reconfiguring the source pad after linking.
        const NO_RECONFIGURE = 1 << 3;

        /// Checks performed by [`link`](super::Pad::link).
        const DEFAULT = Self::HIERARCHY.bits() | Self::CAPS.bits();
    }
}

impl Default for PadLinkCheck {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Why two pads could not be linked.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadLinkError {
    /// The pads' elements do not share a container.
    #[error("pads are in different containers")]
    WrongHierarchy,

    /// One of the pads already has a peer.
    #[error("pad is already linked")]
    WasLinked,

    /// The pads do not form a source/sink pair.
    #[error("pads have wrong direction")]
    WrongDirection,

    /// The pads have no common format, linking would break negotiation.
    #[error("pads have no common format")]
    NoFormat,

    /// The pads cannot agree on a scheduling mode.
    #[error("pads cannot cooperate in scheduling")]
    NoSched,

    /// A link handler refused the link.
    #[error("link refused")]
    Refused,
}
