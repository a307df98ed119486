//! End-to-end pipelines: launch descriptions, built-in elements, ghost pads
//! and EOS aggregation.

use padflow::buffer::Buffer;
use padflow::caps::Caps;
use padflow::core::{Core, CoreConfig};
use padflow::element::{Element, State};
use padflow::elements::{AppSink, AppSrc, Identity, NullSink, TestSrc};
use padflow::error::Error;
use padflow::pipeline::{Bin, Pipeline};
use std::time::Duration;

const LIMIT: Option<Duration> = Some(Duration::from_secs(10));

fn core() -> Core {
    Core::init(CoreConfig::default())
}

fn sink_of(pipeline: &Pipeline, name: &str) -> Element {
    pipeline.by_name(name).unwrap()
}

#[test]
fn test_launch_runs_to_eos() {
    let pipeline = core()
        .parse_launch("testsrc num-buffers=25 blocksize=100 ! identity name=tap ! nullsink name=out")
        .unwrap();
    pipeline.set_state(State::Playing).unwrap();
    pipeline.bus().wait_for_termination(LIMIT).unwrap();

    let tap = pipeline.by_name("tap").unwrap();
    assert_eq!(tap.imp::<Identity>().unwrap().buffer_count(), 25);

    let out = sink_of(&pipeline, "out");
    let sink = out.imp::<NullSink>().unwrap();
    assert_eq!(sink.rendered(), 25);
    assert_eq!(sink.bytes(), 2500);
    assert!(sink.is_eos());

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(out.current_state(), State::Null);
}

#[test]
fn test_inline_caps_negotiate() {
    let pipeline = core()
        .parse_launch(
            r#"testsrc num-buffers=3 caps="video/x-raw, width=320" ! video/x-raw ! nullsink name=out"#,
        )
        .unwrap();
    pipeline.set_state(State::Playing).unwrap();
    pipeline.bus().wait_for_termination(LIMIT).unwrap();

    let out = sink_of(&pipeline, "out");
    let expected: Caps = "video/x-raw, width=320".parse().unwrap();
    assert_eq!(out.static_pad("sink").unwrap().current_caps(), Some(expected));
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_inline_caps_refuse_other_formats() {
    let pipeline = core()
        .parse_launch(r#"testsrc caps="audio/x-raw" ! video/x-raw ! nullsink name=out"#)
        .unwrap();
    let res = pipeline.run(LIMIT);
    assert!(matches!(res, Err(Error::Pipeline { .. })), "{res:?}");
    assert_eq!(
        sink_of(&pipeline, "out").imp::<NullSink>().unwrap().rendered(),
        0
    );
}

#[test]
fn test_datasrc_push_mode_chunks() {
    let pipeline = core()
        .parse_launch(r#"datasrc data="hello world" blocksize=4 ! nullsink name=out"#)
        .unwrap();
    pipeline.set_state(State::Playing).unwrap();
    pipeline.bus().wait_for_termination(LIMIT).unwrap();

    let out = sink_of(&pipeline, "out");
    let sink = out.imp::<NullSink>().unwrap();
    assert_eq!(sink.rendered(), 3);
    assert_eq!(sink.bytes(), 11);
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_appsrc_to_appsink() {
    let pipeline = Pipeline::new("app");
    let src = Element::new("src", AppSrc::default());
    let sink = Element::new("sink", AppSink::default());
    pipeline.add_many(&[&src, &sink]).unwrap();
    src.link(&sink).unwrap();

    let input = src.imp::<AppSrc>().unwrap().handle();
    let output = sink.imp::<AppSink>().unwrap().handle();

    pipeline.set_state(State::Playing).unwrap();
    for chunk in [&b"one"[..], b"two", b"three"] {
        input.push_buffer(Buffer::from_slice(chunk)).unwrap();
    }
    input.end_of_stream().unwrap();
    pipeline.bus().wait_for_termination(LIMIT).unwrap();

    let received: Vec<Vec<u8>> = std::iter::from_fn(|| output.try_pull_buffer())
        .map(|b| b.as_slice().to_vec())
        .collect();
    assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    assert!(output.is_eos());
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_data_flows_through_ghost_pads() {
    let pipeline = Pipeline::new("nested");
    let inner = Bin::new("inner");
    let src = Element::new("src", TestSrc::default());
    src.set_property("num-buffers", 4).unwrap();
    let identity = Element::new("identity", Identity::default());
    let sink = Element::new("sink", NullSink::default());
    pipeline.add_many(&[&src, inner.as_element(), &sink]).unwrap();
    inner.add(&identity).unwrap();
    src.link(&identity).unwrap();
    identity.link(&sink).unwrap();

    pipeline.run(LIMIT).unwrap();
    assert_eq!(identity.imp::<Identity>().unwrap().buffer_count(), 4);
    assert_eq!(sink.imp::<NullSink>().unwrap().rendered(), 4);
    assert_eq!(inner.as_element().current_state(), State::Null);
}

#[test]
fn test_eos_waits_for_every_sink() {
    let pipeline = Pipeline::new("branches");
    let mut sinks = Vec::new();
    for (i, count) in [2, 40].into_iter().enumerate() {
        let src = Element::new(&format!("src{i}"), TestSrc::default());
        src.set_property("num-buffers", count).unwrap();
        let sink = Element::new(&format!("sink{i}"), NullSink::default());
        pipeline.add_many(&[&src, &sink]).unwrap();
        src.link(&sink).unwrap();
        sinks.push((sink, count as u64));
    }

    pipeline.set_state(State::Playing).unwrap();
    pipeline.bus().wait_for_termination(LIMIT).unwrap();
    for (sink, count) in &sinks {
        let imp = sink.imp::<NullSink>().unwrap();
        assert!(imp.is_eos(), "{} saw no EOS", sink.name());
        assert_eq!(imp.rendered(), *count);
    }
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_pipeline_can_run_twice() {
    let pipeline = core()
        .parse_launch("testsrc num-buffers=5 ! nullsink name=out")
        .unwrap();
    pipeline.run(LIMIT).unwrap();
    pipeline.run(LIMIT).unwrap();
    let out = sink_of(&pipeline, "out");
    assert_eq!(out.imp::<NullSink>().unwrap().rendered(), 5);
}

#[test]
fn test_core_builds_named_elements() {
    let core = core();
    let identity = core.make_element("identity", Some("tap")).unwrap();
    assert_eq!(identity.name(), "tap");
    assert_eq!(identity.factory_name().as_deref(), Some("identity"));
    assert!(matches!(
        core.make_element("no-such-element", None),
        Err(Error::NotFound { .. })
    ));
}
