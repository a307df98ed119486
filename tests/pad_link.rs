//! Pad linking: checks, negotiation on first push and ghost pads between
//! containers.

use padflow::buffer::Buffer;
use padflow::caps::Caps;
use padflow::element::Element;
use padflow::elements::{Identity, NullSink, TestSrc};
use padflow::pad::{
    FlowError, GhostPad, Pad, PadDirection, PadLinkCheck, PadLinkError, PadPresence, PadTemplate,
};
use padflow::pipeline::{Bin, Pipeline};

fn caps(s: &str) -> Caps {
    s.parse().unwrap()
}

fn pad_with_caps(name: &str, direction: PadDirection, formats: &str) -> Pad {
    let template = PadTemplate::new(name, direction, PadPresence::Always, caps(formats));
    Pad::builder_from_template(&template, Some(name))
        .chain_function(|_, _, _| Ok(()))
        .build()
}

#[test]
fn test_two_pads_negotiate_on_push() {
    let src = pad_with_caps("src", PadDirection::Src, "audio/x-raw, rate=48000");
    let sink = pad_with_caps("sink", PadDirection::Sink, "audio/x-raw, rate=48000");

    src.link(&sink).unwrap();
    src.set_active(true).unwrap();
    sink.set_active(true).unwrap();
    assert_eq!(src.push(Buffer::with_size(16)), Ok(()));

    let expected = caps("audio/x-raw, rate=48000");
    assert_eq!(src.current_caps(), Some(expected.clone()));
    assert_eq!(sink.current_caps(), Some(expected));
}

#[test]
fn test_can_link_agrees_with_link() {
    let cases = [
        ("audio/x-raw", "audio/x-raw", true),
        ("audio/x-raw", "video/x-raw", false),
        ("ANY", "video/x-raw", true),
        ("audio/x-raw; video/x-raw", "video/x-raw", true),
    ];
    for (src_caps, sink_caps, linkable) in cases {
        let src = pad_with_caps("src", PadDirection::Src, src_caps);
        let sink = pad_with_caps("sink", PadDirection::Sink, sink_caps);
        assert_eq!(Pad::can_link(&src, &sink), linkable, "{src_caps} -> {sink_caps}");
        assert_eq!(src.link(&sink).is_ok(), linkable, "{src_caps} -> {sink_caps}");
        assert_eq!(src.is_linked(), linkable);
    }
}

#[test]
fn test_link_errors() {
    let src = Pad::new("src", PadDirection::Src);
    let sink = Pad::new("sink", PadDirection::Sink);
    let other_sink = Pad::new("other", PadDirection::Sink);

    assert_eq!(sink.link(&src), Err(PadLinkError::WrongDirection));
    src.link(&sink).unwrap();
    assert_eq!(src.link(&other_sink), Err(PadLinkError::WasLinked));

    let audio = pad_with_caps("a", PadDirection::Src, "audio/x-raw");
    let video = pad_with_caps("v", PadDirection::Sink, "video/x-raw");
    assert_eq!(audio.link(&video), Err(PadLinkError::NoFormat));
    // Skipping the caps check links anyway; data then fails to negotiate.
    audio
        .link_full(&video, PadLinkCheck::HIERARCHY)
        .unwrap();
    audio.set_active(true).unwrap();
    video.set_active(true).unwrap();
    assert_eq!(audio.push(Buffer::with_size(1)), Err(FlowError::NotNegotiated));
}

#[test]
fn test_unlink_clears_both_peers() {
    let src = Pad::new("src", PadDirection::Src);
    let sink = Pad::new("sink", PadDirection::Sink);
    src.link(&sink).unwrap();
    assert!(src.peer().is_some_and(|p| p.ptr_eq(&sink)));

    assert!(src.unlink(&sink));
    assert!(src.peer().is_none());
    assert!(sink.peer().is_none());
    assert!(!src.unlink(&sink));

    src.set_active(true).unwrap();
    assert_eq!(src.push(Buffer::with_size(1)), Err(FlowError::NotLinked));
}

#[test]
fn test_elements_in_different_bins_need_ghost_pads() {
    let pipeline = Pipeline::new("p");
    let inner = Bin::new("inner");
    let src = Element::new("src", TestSrc::default());
    let identity = Element::new("identity", Identity::default());
    let sink = Element::new("sink", NullSink::default());
    pipeline.add(&src).unwrap();
    pipeline.add(inner.as_element()).unwrap();
    pipeline.add(&sink).unwrap();
    inner.add(&identity).unwrap();

    // Direct pad links across the bin boundary are refused.
    let src_pad = src.static_pad("src").unwrap();
    let identity_sink = identity.static_pad("sink").unwrap();
    assert_eq!(src_pad.link(&identity_sink), Err(PadLinkError::WrongHierarchy));

    // Element linking creates the ghost pads.
    src.link(&identity).unwrap();
    identity.link(&sink).unwrap();

    let ghost_sink = inner.as_element().sink_pads().pop().unwrap();
    let ghost = GhostPad::from_pad(&ghost_sink).unwrap();
    assert!(ghost.target().is_some_and(|t| t.ptr_eq(&identity_sink)));
    assert!(src_pad.peer().is_some_and(|p| p.ptr_eq(&ghost_sink)));
    assert_eq!(inner.as_element().src_pads().len(), 1);
}

#[test]
fn test_link_elements_in_different_pipelines_fails() {
    let a = Pipeline::new("a");
    let b = Pipeline::new("b");
    let src = Element::new("src", TestSrc::default());
    let sink = Element::new("sink", NullSink::default());
    a.add(&src).unwrap();
    b.add(&sink).unwrap();
    assert!(src.link(&sink).is_err());
}
