//! Pad templates describing the pads an element can have.

use super::PadDirection;
use crate::caps::Caps;

/// When pads created from a template exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PadPresence {
    /// Always present.
    #[default]
    Always,
    /// Created dynamically based on the stream.
    Sometimes,
    /// Created on application request.
    Request,
}

/// Description of a pad an element can have.
///
/// ```rust
/// use padflow::caps::Caps;
/// use padflow::pad::{PadDirection, PadTemplate};
///
/// let tmpl = PadTemplate::src(Caps::new_simple("video/x-raw"));
/// assert_eq!(tmpl.name(), "src");
/// assert_eq!(tmpl.direction(), PadDirection::Src);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PadTemplate {
    name: String,
    direction: PadDirection,
    presence: PadPresence,
    caps: Caps,
}

impl PadTemplate {
    /// Create a template.
    pub fn new(
        name: impl Into<String>,
        direction: PadDirection,
        presence: PadPresence,
        caps: Caps,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            presence,
            caps,
        }
    }

    /// Always-present sink template named "sink".
    pub fn sink(caps: Caps) -> Self {
        Self::new("sink", PadDirection::Sink, PadPresence::Always, caps)
    }

    /// Always-present source template named "src".
    pub fn src(caps: Caps) -> Self {
        Self::new("src", PadDirection::Src, PadPresence::Always, caps)
    }

    /// Name, or name pattern such as `src_%u` for request pads.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction.
    pub fn direction(&self) -> PadDirection {
        self.direction
    }

    /// Presence.
    pub fn presence(&self) -> PadPresence {
        self.presence
    }

    /// Caps of pads created from this template.
    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    /// Expand a `%u`/`%d` pattern with `index`.
    pub fn pad_name(&self, index: u32) -> String {
        self.name.replace("%u", &index.to_string()).replace("%d", &index.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_pattern() {
        let tmpl = PadTemplate::new(
            "src_%u",
            PadDirection::Src,
            PadPresence::Request,
            Caps::new_any(),
        );
        assert_eq!(tmpl.pad_name(3), "src_3");
        assert_eq!(tmpl.presence(), PadPresence::Request);
    }
}
