//! Element and pipeline state machine: stepwise transitions, failures,
//! asynchronous preroll and live sources.

use padflow::bus::MessageView;
use padflow::element::{
    Element, ElementImpl, State, StateChange, StateChangeError, StateChangeResult,
    StateChangeSuccess,
};
use padflow::elements::{NullSink, TestSrc};
use padflow::pipeline::Pipeline;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

#[derive(Default)]
struct Recorder {
    log: Arc<Mutex<Vec<StateChange>>>,
    fail_on: Option<StateChange>,
}

impl ElementImpl for Recorder {
    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        if self.fail_on == Some(transition) {
            return Err(StateChangeError);
        }
        self.log.lock().unwrap().push(transition);
        element.default_change_state(transition)
    }
}

fn recorder(fail_on: Option<StateChange>) -> (Element, Arc<Mutex<Vec<StateChange>>>) {
    let log: Arc<Mutex<Vec<StateChange>>> = Arc::default();
    let element = Element::new(
        "recorder",
        Recorder {
            log: Arc::clone(&log),
            fail_on,
        },
    );
    (element, log)
}

#[test]
fn test_transitions_are_stepwise() {
    let (element, log) = recorder(None);

    assert_eq!(element.set_state(State::Playing), Ok(StateChangeSuccess::Success));
    assert_eq!(element.current_state(), State::Playing);
    assert_eq!(element.pending_state(), State::VoidPending);

    assert_eq!(element.set_state(State::Null), Ok(StateChangeSuccess::Success));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            StateChange::NullToReady,
            StateChange::ReadyToPaused,
            StateChange::PausedToPlaying,
            StateChange::PlayingToPaused,
            StateChange::PausedToReady,
            StateChange::ReadyToNull,
        ]
    );
}

#[test]
fn test_same_state_is_a_no_op() {
    let (element, log) = recorder(None);
    element.set_state(State::Ready).unwrap();
    element.set_state(State::Ready).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![StateChange::NullToReady]);
    element.set_state(State::Null).unwrap();
}

#[test]
fn test_failed_step_stops_at_last_good_state() {
    let (element, log) = recorder(Some(StateChange::ReadyToPaused));

    assert_eq!(element.set_state(State::Playing), Err(StateChangeError));
    assert_eq!(element.current_state(), State::Ready);
    assert_eq!(element.pending_state(), State::VoidPending);
    let (res, current, _) = element.state(Some(Duration::ZERO));
    assert_eq!(res, Err(StateChangeError));
    assert_eq!(current, State::Ready);

    // A later request starts from the current state.
    assert_eq!(element.set_state(State::Null), Ok(StateChangeSuccess::Success));
    assert_eq!(
        *log.lock().unwrap(),
        vec![StateChange::NullToReady, StateChange::ReadyToNull]
    );
}

#[test]
fn test_state_changed_messages_per_step() {
    let pipeline = Pipeline::new("p");
    let (element, _log) = recorder(None);
    pipeline.add(&element).unwrap();
    let bus = pipeline.bus();

    pipeline.set_state(State::Playing).unwrap();

    let steps: Vec<(State, State, State)> = std::iter::from_fn(|| bus.pop())
        .filter(|m| m.is_from(&element))
        .filter_map(|m| match *m.view() {
            MessageView::StateChanged { old, new, pending } => Some((old, new, pending)),
            _ => None,
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            (State::Null, State::Ready, State::Playing),
            (State::Ready, State::Paused, State::Playing),
            (State::Paused, State::Playing, State::VoidPending),
        ]
    );
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_pipeline_prerolls_asynchronously() {
    let pipeline = Pipeline::new("preroll");
    let src = Element::new("src", TestSrc::default());
    let sink = Element::new("sink", NullSink::default());
    pipeline.add_many(&[&src, &sink]).unwrap();
    src.link(&sink).unwrap();

    assert_eq!(pipeline.set_state(State::Paused), Ok(StateChangeSuccess::Async));
    let (res, current, pending) = pipeline.state(TIMEOUT);
    assert_eq!(res, Ok(StateChangeSuccess::Success));
    assert_eq!(current, State::Paused);
    assert_eq!(pending, State::VoidPending);
    assert_eq!(sink.current_state(), State::Paused);

    // Prerolled but not rendered: the first buffer waits for Playing.
    assert_eq!(sink.imp::<NullSink>().unwrap().rendered(), 0);

    let bus = pipeline.bus();
    let async_done = std::iter::from_fn(|| bus.pop())
        .any(|m| m.is_from(pipeline.as_element()) && matches!(m.view(), MessageView::AsyncDone));
    assert!(async_done);

    pipeline.set_state(State::Playing).unwrap();
    let (res, current, _) = pipeline.state(TIMEOUT);
    assert_eq!(res, Ok(StateChangeSuccess::Success));
    assert_eq!(current, State::Playing);

    assert_eq!(pipeline.set_state(State::Null), Ok(StateChangeSuccess::Success));
    assert_eq!(sink.current_state(), State::Null);
    assert_eq!(src.current_state(), State::Null);
}

#[test]
fn test_downgrade_while_prerolling() {
    let pipeline = Pipeline::new("abort");
    let src = Element::new("src", TestSrc::default());
    src.set_property("is-live", true).unwrap();
    let sink = Element::new("sink", NullSink::default());
    pipeline.add_many(&[&src, &sink]).unwrap();
    src.link(&sink).unwrap();

    // A live source produces nothing in Paused, so the sink cannot preroll.
    assert_eq!(pipeline.set_state(State::Paused), Ok(StateChangeSuccess::NoPreroll));
    assert_eq!(sink.pending_state(), State::Paused);

    assert_eq!(pipeline.set_state(State::Ready), Ok(StateChangeSuccess::Success));
    assert_eq!(sink.current_state(), State::Ready);
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_live_pipeline_reaches_playing() {
    let pipeline = Pipeline::new("live");
    let src = Element::new("src", TestSrc::default());
    src.set_property("is-live", true).unwrap();
    let sink = Element::new("sink", NullSink::default());
    pipeline.add_many(&[&src, &sink]).unwrap();
    src.link(&sink).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let (res, current, _) = pipeline.state(TIMEOUT);
    assert!(res.is_ok());
    assert_eq!(current, State::Playing);

    let imp = sink.imp::<NullSink>().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while imp.rendered() < 3 {
        assert!(std::time::Instant::now() < deadline, "live source produced nothing");
        std::thread::sleep(Duration::from_millis(1));
    }
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_child_synced_with_running_pipeline() {
    let pipeline = Pipeline::new("sync");
    pipeline.set_state(State::Paused).unwrap();

    let (element, log) = recorder(None);
    pipeline.add(&element).unwrap();
    assert_eq!(element.current_state(), State::Null);
    element.sync_state_with_parent().unwrap();
    assert_eq!(element.current_state(), State::Paused);
    assert_eq!(log.lock().unwrap().len(), 2);

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(element.current_state(), State::Null);
}
