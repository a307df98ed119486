//! Ghost pads.
//!
//! A ghost pad exposes a pad of a child element on its bin. It owns an
//! internal proxy pad of the opposite direction, linked to the target.
//! Buffers, events, queries, pulls and activation crossing either pad are
//! forwarded to the other one.

use super::{FlowError, Pad, PadBuilder, PadDirection, PadLinkCheck, PadLinkError, PadTemplate};
use super::GhostRole;
use std::ops::Deref;

/// A pad of a bin proxying a pad inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostPad(Pad);

impl GhostPad {
    /// Create a ghost pad without target.
    pub fn new(name: &str, direction: PadDirection) -> GhostPad {
        Self::build(name, Pad::builder(name, direction))
    }

    /// Create a ghost pad without target from a template.
    pub fn from_template(template: &PadTemplate, name: Option<&str>) -> GhostPad {
        let name = name.unwrap_or(template.name());
        Self::build(name, Pad::builder_from_template(template, Some(name)))
    }

    /// Create a ghost pad with the direction of `target` and proxy it.
    pub fn with_target(name: &str, target: &Pad) -> Result<GhostPad, PadLinkError> {
        let ghost = Self::new(name, target.direction());
        ghost.set_target(Some(target))?;
        Ok(ghost)
    }

    /// The ghost pad behind `pad`, if it is one.
    pub fn from_pad(pad: &Pad) -> Option<GhostPad> {
        pad.is_ghost().then(|| GhostPad(pad.clone()))
    }

    fn build(name: &str, builder: PadBuilder) -> GhostPad {
        let ghost = with_forwarding(builder).build();
        let proxy = with_forwarding(Pad::builder(
            &format!("{name}:proxy"),
            ghost.direction().opposite(),
        ))
        .build();
        proxy.set_ghost_role(GhostRole::Proxy(ghost.downgrade()));
        ghost.set_ghost_role(GhostRole::Ghost(proxy));
        GhostPad(ghost)
    }

    /// The ghost pad as a plain pad.
    pub fn as_pad(&self) -> &Pad {
        &self.0
    }

    /// The internal proxy pad, linked to the target.
    pub fn internal(&self) -> Pad {
        match self.0.ghost_internal() {
            Some(p) => p,
            None => unreachable!("ghost pad without proxy"),
        }
    }

    /// The proxied pad.
    pub fn target(&self) -> Option<Pad> {
        self.internal().peer()
    }

    /// Replace the proxied pad. `None` only removes the current target.
    pub fn set_target(&self, target: Option<&Pad>) -> Result<(), PadLinkError> {
        let internal = self.internal();
        if let Some(old) = internal.peer() {
            match internal.direction() {
                PadDirection::Src => internal.unlink(&old),
                PadDirection::Sink => old.unlink(&internal),
            };
        }
        let Some(target) = target else {
            return Ok(());
        };
        if target.direction() != self.0.direction() {
            return Err(PadLinkError::WrongDirection);
        }
        match internal.direction() {
            PadDirection::Src => internal.link_full(target, PadLinkCheck::empty())?,
            PadDirection::Sink => target.link_full(&internal, PadLinkCheck::empty())?,
        }
        let mode = self.0.mode();
        if self.0.is_active() && !internal.is_active() {
            internal
                .activate_mode(mode, true)
                .map_err(|_| PadLinkError::NoSched)?;
        }
        tracing::debug!(ghost = %self.0.path(), target = %target.path(), "ghost target set");
        Ok(())
    }
}

fn with_forwarding(builder: PadBuilder) -> PadBuilder {
    builder
        .chain_function(|pad, _, buffer| match pad.ghost_internal() {
            Some(other) => other.push(buffer),
            None => Err(FlowError::NotLinked),
        })
        .chain_list_function(|pad, _, list| match pad.ghost_internal() {
            Some(other) => other.push_list(list),
            None => Err(FlowError::NotLinked),
        })
        .event_function(|pad, _, event| match pad.ghost_internal() {
            Some(other) => other.push_event(event),
            None => true,
        })
        .query_function(|pad, parent, query| match pad.ghost_internal() {
            Some(other) => other.peer_query(query),
            None => Pad::query_default(pad, parent, query),
        })
        .getrange_function(|pad, _, offset, size| match pad.ghost_internal() {
            Some(other) => other.pull_range(offset, size),
            None => Err(FlowError::NotLinked),
        })
        .activatemode_function(|pad, _, mode, active| match pad.ghost_internal() {
            Some(other) => other.activate_mode(mode, active).is_ok(),
            None => true,
        })
        .iterate_internal_links_function(|pad, _| pad.ghost_internal().into_iter().collect())
}

impl Deref for GhostPad {
    type Target = Pad;

    fn deref(&self) -> &Pad {
        &self.0
    }
}

impl From<GhostPad> for Pad {
    fn from(ghost: GhostPad) -> Pad {
        ghost.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::caps::Caps;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ghost_forwards_buffers() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let target = Pad::builder("sink", PadDirection::Sink)
            .chain_function(move |_, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();
        let ghost = GhostPad::with_target("sink", &target).unwrap();
        assert_eq!(ghost.target(), Some(target.clone()));
        assert_eq!(ghost.direction(), PadDirection::Sink);

        let upstream = Pad::new("src", PadDirection::Src);
        upstream.link(&ghost).unwrap();
        upstream.set_active(true).unwrap();
        ghost.set_active(true).unwrap();
        target.set_active(true).unwrap();
        assert!(ghost.internal().is_active());

        assert_eq!(upstream.push(Buffer::with_size(4)), Ok(()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ghost_caps_come_from_target() {
        let caps = Caps::new_simple("video/x-raw");
        let target = Pad::builder("src", PadDirection::Src).caps(caps.clone()).build();
        let ghost = GhostPad::with_target("src", &target).unwrap();
        let downstream = Pad::new("sink", PadDirection::Sink);
        ghost.link(&downstream).unwrap();
        assert_eq!(downstream.peer_query_caps(None), caps);
    }

    #[test]
    fn test_retarget() {
        let a = Pad::new("a", PadDirection::Src);
        let b = Pad::new("b", PadDirection::Src);
        let ghost = GhostPad::with_target("src", &a).unwrap();
        ghost.set_target(Some(&b)).unwrap();
        assert!(!a.is_linked());
        assert_eq!(ghost.target(), Some(b.clone()));
        ghost.set_target(None).unwrap();
        assert!(ghost.target().is_none());

        let wrong = Pad::new("sink", PadDirection::Sink);
        assert_eq!(ghost.set_target(Some(&wrong)), Err(PadLinkError::WrongDirection));
    }

    #[test]
    fn test_from_pad() {
        let ghost = GhostPad::new("src", PadDirection::Src);
        let pad: Pad = ghost.clone().into();
        assert_eq!(GhostPad::from_pad(&pad), Some(ghost));
        assert!(GhostPad::from_pad(&Pad::new("x", PadDirection::Src)).is_none());
    }
}
