//! Stream identifiers.

use super::{Pad, PadDirection};
use crate::element::Element;

/// 64-bit FNV-1a; ids must not change between builds.
fn path_hash(path: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    path.bytes()
        .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME))
}

impl Pad {
    /// Create the id for a stream leaving this source pad of `parent`.
    ///
    /// When `parent` has exactly one sink pad and it carries a stream id,
    /// the new id starts with it. Otherwise a hash of the element path is
    /// used. `stream_id` tells apart several streams produced by one element
    /// and is appended after a `/`.
    pub fn create_stream_id(&self, parent: &Element, stream_id: Option<&str>) -> String {
        if self.direction() != PadDirection::Src {
            tracing::warn!(pad = %self.path(), "stream id requested on a sink pad");
        }
        let sink_pads = parent.sink_pads();
        let upstream = match sink_pads.as_slice() {
            [only] => only.stream_id(),
            _ => None,
        }
        .unwrap_or_else(|| format!("{:016x}", path_hash(&parent.path_string())));
        match stream_id {
            Some(id) => format!("{upstream}/{id}"),
            None => upstream,
        }
    }

    /// [`create_stream_id`](Self::create_stream_id) with a fixed-width
    /// numeric suffix, so ids sort in index order.
    pub fn create_stream_id_indexed(&self, parent: &Element, index: u32) -> String {
        self.create_stream_id(parent, Some(&format!("{index:010}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementImpl;
    use crate::event::{Event, StreamStart};

    struct Plain;
    impl ElementImpl for Plain {}

    #[test]
    fn test_indexed_ids_sort_by_index() {
        let element = Element::new("demux", Plain);
        let pad = Pad::new("src", PadDirection::Src);
        let ids: Vec<String> = [0, 9, 999, 1000, u32::MAX]
            .into_iter()
            .map(|i| pad.create_stream_id_indexed(&element, i))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(ids[2].ends_with("/0000000999"));
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(path_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(path_hash("a"), 0xaf63_dc4c_8601_ec8c);

        let element = Element::new("src", Plain);
        let pad = Pad::new("src", PadDirection::Src);
        let first = pad.create_stream_id(&element, None);
        assert_eq!(first, pad.create_stream_id(&element, None));
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn test_upstream_id_needs_single_sink_pad() {
        let element = Element::new("filter", Plain);
        let sink = Pad::new("sink", PadDirection::Sink);
        element.add_pad(sink.clone()).unwrap();
        sink.set_active(true).unwrap();
        sink.store_sticky_event(Event::StreamStart(StreamStart::new("upstream")))
            .unwrap();

        let src = Pad::new("src", PadDirection::Src);
        assert_eq!(src.create_stream_id(&element, Some("a")), "upstream/a");

        // With two inputs the upstream id is ambiguous.
        element
            .add_pad(Pad::new("sink_1", PadDirection::Sink))
            .unwrap();
        let id = src.create_stream_id(&element, None);
        assert!(!id.starts_with("upstream"));
    }
}
