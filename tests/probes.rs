//! Probe dispatch on linked pads: ordering, blocking, idle probes and the
//! effect of each probe return value.

use padflow::buffer::Buffer;
use padflow::clock::ClockTime;
use padflow::pad::{FlowError, Pad, PadDirection, PadProbeReturn, PadProbeType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A linked, active src/sink pair; the sink records every chained buffer.
fn linked_pair() -> (Pad, Pad, Arc<Mutex<Vec<Buffer>>>) {
    let received: Arc<Mutex<Vec<Buffer>>> = Arc::default();
    let r = Arc::clone(&received);
    let src = Pad::new("src", PadDirection::Src);
    let sink = Pad::builder("sink", PadDirection::Sink)
        .chain_function(move |_, _, buffer| {
            r.lock().unwrap().push(buffer);
            Ok(())
        })
        .build();
    src.link(&sink).unwrap();
    src.set_active(true).unwrap();
    sink.set_active(true).unwrap();
    (src, sink, received)
}

fn wait_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_block_probes_run_first() {
    let (src, _sink, _received) = linked_pair();
    let order: Arc<Mutex<Vec<&str>>> = Arc::default();

    for (name, mask) in [
        ("data-1", PadProbeType::BUFFER),
        ("block", PadProbeType::BLOCK | PadProbeType::BUFFER),
        ("data-2", PadProbeType::BUFFER),
    ] {
        let order = Arc::clone(&order);
        src.add_probe(mask, move |_, _| {
            order.lock().unwrap().push(name);
            PadProbeReturn::Pass
        })
        .unwrap();
    }

    src.push(Buffer::with_size(4)).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["block", "data-1", "data-2"]);
}

#[test]
fn test_idle_probe_fires_immediately_on_idle_pad() {
    let (src, _sink, _received) = linked_pair();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);

    let id = src.add_probe(PadProbeType::IDLE, move |_, info| {
        assert!(info.mask.contains(PadProbeType::IDLE));
        f.fetch_add(1, Ordering::SeqCst);
        PadProbeReturn::Remove
    });

    assert!(id.is_none(), "removed idle probe has no id");
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!src.is_blocked());
}

#[test]
fn test_idle_probe_keeps_pad_blocked_until_removed() {
    let (src, _sink, received) = linked_pair();
    let id = src
        .add_probe(PadProbeType::IDLE, |_, _| PadProbeReturn::Ok)
        .unwrap();
    assert!(src.is_blocked());

    let pusher = {
        let src = src.clone();
        thread::spawn(move || src.push(Buffer::with_size(1)))
    };
    wait_until("push to block", || src.is_blocking());
    assert!(received.lock().unwrap().is_empty());

    src.remove_probe(id);
    assert_eq!(pusher.join().unwrap(), Ok(()));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[test]
fn test_block_probe_waits_for_removal() {
    let (src, _sink, received) = linked_pair();
    let id = src
        .add_probe(PadProbeType::BLOCK_DOWNSTREAM, |_, _| PadProbeReturn::Ok)
        .unwrap();

    let pusher = {
        let src = src.clone();
        thread::spawn(move || src.push(Buffer::with_size(2)))
    };
    wait_until("push to block", || src.is_blocking());
    assert!(src.is_blocked());
    assert!(received.lock().unwrap().is_empty());

    src.remove_probe(id);
    assert_eq!(pusher.join().unwrap(), Ok(()));
    assert_eq!(received.lock().unwrap().len(), 1);
    assert!(!src.is_blocking());
}

#[test]
fn test_flushing_releases_blocked_push() {
    let (src, _sink, _received) = linked_pair();
    src.add_probe(PadProbeType::BLOCK_DOWNSTREAM, |_, _| PadProbeReturn::Ok)
        .unwrap();

    let pusher = {
        let src = src.clone();
        thread::spawn(move || src.push(Buffer::with_size(2)))
    };
    wait_until("push to block", || src.is_blocking());

    src.set_active(false).unwrap();
    assert_eq!(pusher.join().unwrap(), Err(FlowError::Flushing));
}

#[test]
fn test_drop_discards_buffer() {
    let (src, _sink, received) = linked_pair();
    src.add_probe(PadProbeType::BUFFER, |_, _| PadProbeReturn::Drop)
        .unwrap();
    assert_eq!(src.push(Buffer::with_size(8)), Ok(()));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn test_handled_returns_probe_flow_result() {
    let (src, _sink, received) = linked_pair();
    src.add_probe(PadProbeType::BUFFER, |_, info| {
        info.flow_result = Err(FlowError::Eos);
        PadProbeReturn::Handled
    })
    .unwrap();
    assert_eq!(src.push(Buffer::with_size(8)), Err(FlowError::Eos));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn test_remove_return_fires_once() {
    let (src, _sink, received) = linked_pair();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    src.add_probe(PadProbeType::BUFFER, move |_, _| {
        c.fetch_add(1, Ordering::SeqCst);
        PadProbeReturn::Remove
    })
    .unwrap();

    src.push(Buffer::with_size(1)).unwrap();
    src.push(Buffer::with_size(1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(received.lock().unwrap().len(), 2);
}

#[test]
fn test_remove_from_inside_callback() {
    let (src, _sink, _received) = linked_pair();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    src.add_probe(PadProbeType::BUFFER, move |pad, info| {
        c.fetch_add(1, Ordering::SeqCst);
        pad.remove_probe(info.id);
        // Unknown or already removed ids are ignored.
        pad.remove_probe(info.id);
        PadProbeReturn::Ok
    })
    .unwrap();

    src.push(Buffer::with_size(1)).unwrap();
    src.push(Buffer::with_size(1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_probe_can_modify_buffer() {
    let (src, _sink, received) = linked_pair();
    src.add_probe(PadProbeType::BUFFER, |_, info| {
        if let Some(buffer) = info.buffer_mut() {
            buffer.set_pts(Some(ClockTime::from_nanos(42)));
        }
        PadProbeReturn::Ok
    })
    .unwrap();

    src.push(Buffer::with_size(1)).unwrap();
    let received = received.lock().unwrap();
    assert_eq!(received[0].pts(), Some(ClockTime::from_nanos(42)));
}

#[test]
fn test_event_probe_does_not_see_buffers() {
    let (src, _sink, _received) = linked_pair();
    let events = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&events);
    src.add_probe(PadProbeType::EVENT_DOWNSTREAM, move |_, info| {
        assert!(info.event().is_some());
        e.fetch_add(1, Ordering::SeqCst);
        PadProbeReturn::Ok
    })
    .unwrap();

    src.push(Buffer::with_size(1)).unwrap();
    assert_eq!(events.load(Ordering::SeqCst), 0);
    assert!(src.push_event(padflow::event::Event::Eos));
    assert_eq!(events.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_probe_is_an_error() {
    let (src, _sink, received) = linked_pair();
    src.add_probe(PadProbeType::BUFFER, |_, _| panic!("probe failure"))
        .unwrap();
    assert_eq!(src.push(Buffer::with_size(1)), Err(FlowError::Error));
    assert!(received.lock().unwrap().is_empty());
}
