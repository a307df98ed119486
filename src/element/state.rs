//! Element states and the stepwise state machine.
//!
//! [`Element::set_state`] never skips a state: a change from `Null` to
//! `Playing` runs `NullToReady`, `ReadyToPaused` and `PausedToPlaying` in
//! order, each through [`ElementImpl::change_state`](super::ElementImpl::change_state).
//! A step returning [`StateChangeSuccess::Async`] leaves the element in its
//! current state until [`Element::commit_state`] is called, typically from a
//! streaming thread once a sink has prerolled.

use super::Element;
use crate::bus::MessageView;
use crate::pad::panic_message;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;
use std::sync::{PoisonError, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace};

// ============================================================================
// State types
// ============================================================================

/// Element state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    /// No state change is pending.
    VoidPending,
    /// Initial state, no resources allocated.
    #[default]
    Null,
    /// Resources allocated, pads inactive.
    Ready,
    /// Pads active, data may be prerolled but the clock is not running.
    Paused,
    /// Data flows.
    Playing,
}

impl State {
    /// Lower-case name.
    pub fn name(self) -> &'static str {
        match self {
            State::VoidPending => "void-pending",
            State::Null => "null",
            State::Ready => "ready",
            State::Paused => "paused",
            State::Playing => "playing",
        }
    }

    /// The state one step from `self` towards `target`.
    pub(crate) fn step_towards(self, target: State) -> State {
        use State::*;
        match self.cmp(&target) {
            std::cmp::Ordering::Less => match self {
                VoidPending | Null => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            },
            std::cmp::Ordering::Greater => match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Null | VoidPending => Null,
            },
            std::cmp::Ordering::Equal => self,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single step of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    /// `Null` to `Ready`.
    NullToReady,
    /// `Ready` to `Paused`: pads are activated.
    ReadyToPaused,
    /// `Paused` to `Playing`.
    PausedToPlaying,
    /// `Playing` to `Paused`.
    PlayingToPaused,
    /// `Paused` to `Ready`: pads are deactivated.
    PausedToReady,
    /// `Ready` to `Null`.
    ReadyToNull,
}

impl StateChange {
    /// The transition between two adjacent states.
    pub fn new(current: State, next: State) -> Option<StateChange> {
        use State::*;
        match (current, next) {
            (Null, Ready) => Some(StateChange::NullToReady),
            (Ready, Paused) => Some(StateChange::ReadyToPaused),
            (Paused, Playing) => Some(StateChange::PausedToPlaying),
            (Playing, Paused) => Some(StateChange::PlayingToPaused),
            (Paused, Ready) => Some(StateChange::PausedToReady),
            (Ready, Null) => Some(StateChange::ReadyToNull),
            _ => None,
        }
    }

    /// State before the transition.
    pub fn current(self) -> State {
        match self {
            StateChange::NullToReady => State::Null,
            StateChange::ReadyToPaused | StateChange::ReadyToNull => State::Ready,
            StateChange::PausedToPlaying | StateChange::PausedToReady => State::Paused,
            StateChange::PlayingToPaused => State::Playing,
        }
    }

    /// State after the transition.
    pub fn next(self) -> State {
        match self {
            StateChange::ReadyToNull => State::Null,
            StateChange::NullToReady | StateChange::PausedToReady => State::Ready,
            StateChange::ReadyToPaused | StateChange::PlayingToPaused => State::Paused,
            StateChange::PausedToPlaying => State::Playing,
        }
    }

    /// Whether the transition goes towards `Playing`.
    pub fn is_upward(self) -> bool {
        self.next() > self.current()
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.current(), self.next())
    }
}

/// Successful outcome of a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChangeSuccess {
    /// The change completed.
    Success,
    /// The change completes later, see [`Element::commit_state`].
    Async,
    /// The change completed but the element cannot produce data in
    /// `Paused` (live sources).
    NoPreroll,
}

/// A state change failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("state change failed")]
pub struct StateChangeError;

/// Result of a state change.
pub type StateChangeResult = Result<StateChangeSuccess, StateChangeError>;

// ============================================================================
// State data
// ============================================================================

#[derive(Debug)]
pub(crate) struct StateData {
    pub(crate) current: State,
    pub(crate) next: State,
    pub(crate) pending: State,
    pub(crate) target: State,
    /// `Async` while a change is in progress.
    pub(crate) last_return: StateChangeResult,
}

impl Default for StateData {
    fn default() -> Self {
        Self {
            current: State::Null,
            next: State::VoidPending,
            pending: State::VoidPending,
            target: State::Null,
            last_return: Ok(StateChangeSuccess::Success),
        }
    }
}

enum Step {
    Done(StateChangeResult),
    Next(StateChange),
}

// ============================================================================
// State machine
// ============================================================================

impl Element {
    /// Change the element's state to `state`, one step at a time.
    ///
    /// Returns `Async` when a step completes later; the remaining steps then
    /// run when the element commits. An upgrade requested during an async
    /// change updates the target and returns `Async`; a downgrade pre-empts
    /// the async step.
    pub fn set_state(&self, state: State) -> StateChangeResult {
        let ret = {
            let _guard = self
                .inner()
                .state_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let _span = crate::observability::span_state_change(self, state).entered();
            self.set_state_locked(state)
        };
        self.commit_deferred();
        ret
    }

    fn set_state_locked(&self, state: State) -> StateChangeResult {
        let (current, next) = {
            let mut st = self.lock_state_data();
            if st.last_return.is_err() {
                st.next = State::VoidPending;
                st.pending = State::VoidPending;
                st.last_return = Ok(StateChangeSuccess::Success);
            }

            let mut current = st.current;
            let old_pending = st.pending;
            st.target = state;
            st.pending = state;

            if old_pending != State::VoidPending {
                if old_pending <= state || st.next == state {
                    debug!(element = %self.name(), %state, "state change already in progress");
                    return Ok(StateChangeSuccess::Async);
                }
                if st.next > state && st.last_return == Ok(StateChangeSuccess::Async) {
                    // Downgrade: pretend the async step completed.
                    current = st.next;
                }
            }

            let next = current.step_towards(state);
            if current == next {
                st.pending = State::VoidPending;
                st.next = State::VoidPending;
                self.inner().state_cond.notify_all();
                return st.last_return;
            }
            st.next = next;
            st.last_return = Ok(StateChangeSuccess::Async);
            (current, next)
        };

        match StateChange::new(current, next) {
            Some(transition) => self.change_state(transition),
            None => {
                self.abort_state();
                Err(StateChangeError)
            }
        }
    }

    /// Run `transition` and the steps following it.
    fn change_state(&self, transition: StateChange) -> StateChangeResult {
        let mut transition = transition;
        loop {
            debug!(element = %self.name(), %transition, "changing state");
            let ret = match catch_unwind(AssertUnwindSafe(|| {
                self.inner().imp.change_state(self, transition)
            })) {
                Ok(ret) => ret,
                Err(payload) => {
                    let msg = panic_message(&*payload);
                    error!(element = %self.name(), %transition, panic = %msg, "state change panicked");
                    self.post_error(
                        "state change failed",
                        Some(format!("{transition}: {msg}")),
                    );
                    Err(StateChangeError)
                }
            };

            let ret = match ret {
                Err(e) => {
                    debug!(element = %self.name(), %transition, "state change failed");
                    self.abort_state();
                    return Err(e);
                }
                Ok(StateChangeSuccess::Async) if transition.is_upward() => {
                    debug!(element = %self.name(), %transition, "state change is async");
                    self.post_view(MessageView::AsyncStart);
                    return Ok(StateChangeSuccess::Async);
                }
                Ok(StateChangeSuccess::Async) => Ok(StateChangeSuccess::Success),
                Ok(other) => Ok(other),
            };

            match self.complete_step(ret) {
                Step::Done(ret) => return ret,
                Step::Next(t) => transition = t,
            }
        }
    }

    /// Record the end of the current step and find the next one.
    fn complete_step(&self, ret: StateChangeResult) -> Step {
        let (old, new, pending, step) = {
            let mut st = self.lock_state_data();
            st.last_return = ret;
            if st.pending == State::VoidPending || st.next == State::VoidPending {
                return Step::Done(ret);
            }
            let old = st.current;
            let new = st.next;
            st.current = new;

            if st.pending == new {
                st.pending = State::VoidPending;
                st.next = State::VoidPending;
                self.inner().state_cond.notify_all();
                (old, new, State::VoidPending, Step::Done(ret))
            } else {
                let next = new.step_towards(st.pending);
                st.next = next;
                st.last_return = Ok(StateChangeSuccess::Async);
                let step = match StateChange::new(new, next) {
                    Some(t) => Step::Next(t),
                    None => Step::Done(ret),
                };
                (old, new, st.pending, step)
            }
        };

        trace!(element = %self.name(), %old, %new, %pending, "state changed");
        if old != new {
            self.post_view(MessageView::StateChanged { old, new, pending });
        }
        step
    }

    fn abort_state(&self) {
        let mut st = self.lock_state_data();
        debug!(element = %self.name(), current = %st.current, next = %st.next, "aborting state change");
        st.pending = State::VoidPending;
        st.next = State::VoidPending;
        st.last_return = Err(StateChangeError);
        self.inner().state_cond.notify_all();
    }

    /// Complete an outstanding async state change.
    ///
    /// Posts `AsyncDone` and continues towards the target state. Safe to call
    /// from any thread; when a state change is running on another thread the
    /// commit happens as soon as that change returns.
    pub fn commit_state(&self) {
        self.inner().commit_pending.store(true, Ordering::SeqCst);
        self.commit_deferred();
    }

    pub(crate) fn commit_deferred(&self) {
        while self.inner().commit_pending.load(Ordering::SeqCst) {
            let step = {
                let _guard = match self.inner().state_lock.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::Poisoned(p)) => p.into_inner(),
                    Err(TryLockError::WouldBlock) => return,
                };
                if self.inner().commit_pending.swap(false, Ordering::SeqCst) {
                    self.commit_locked()
                } else {
                    None
                }
            };
            // Posted without the state lock: a parent reacting to it may
            // change this element's state again.
            if let Some(step) = step {
                self.post_view(MessageView::AsyncDone);
                if let Step::Next(transition) = step {
                    self.continue_after_commit(transition);
                }
            }
        }
    }

    fn commit_locked(&self) -> Option<Step> {
        {
            let st = self.lock_state_data();
            if st.last_return != Ok(StateChangeSuccess::Async) || st.next == State::VoidPending {
                trace!(element = %self.name(), "nothing to commit");
                return None;
            }
        }
        if !self.inner().imp.can_commit(self) {
            return None;
        }
        debug!(element = %self.name(), "committing state");
        Some(self.complete_step(Ok(StateChangeSuccess::Success)))
    }

    fn continue_after_commit(&self, transition: StateChange) {
        let _guard = self
            .inner()
            .state_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        {
            let st = self.lock_state_data();
            if st.current != transition.current()
                || st.next != transition.next()
                || st.last_return != Ok(StateChangeSuccess::Async)
            {
                debug!(element = %self.name(), %transition, "state changed during commit, not continuing");
                return;
            }
        }
        if self.change_state(transition).is_err() {
            self.post_error(
                "state change failed",
                Some(format!("{transition} after async commit")),
            );
        }
    }

    /// Wait for a pending async change and return `(result, current, pending)`.
    ///
    /// `None` waits forever. When the timeout expires the result is `Async`.
    pub fn state(&self, timeout: Option<Duration>) -> (StateChangeResult, State, State) {
        let mut st = self.lock_state_data();
        let deadline = timeout.map(|t| Instant::now() + t);
        while st.last_return == Ok(StateChangeSuccess::Async) {
            match deadline {
                None => {
                    st = self
                        .inner()
                        .state_cond
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    st = self
                        .inner()
                        .state_cond
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        (st.last_return, st.current, st.pending)
    }

    /// Current state, without waiting.
    pub fn current_state(&self) -> State {
        self.lock_state_data().current
    }

    /// State being changed to, or `VoidPending`.
    pub fn pending_state(&self) -> State {
        self.lock_state_data().pending
    }

    /// Final state requested by the last `set_state`.
    pub fn target_state(&self) -> State {
        self.lock_state_data().target
    }

    /// Set the state to the parent's target state.
    pub fn sync_state_with_parent(&self) -> StateChangeResult {
        let Some(parent) = self.parent() else {
            return Err(StateChangeError);
        };
        let target = {
            let st = parent.lock_state_data();
            if st.pending != State::VoidPending {
                st.pending
            } else {
                st.current
            }
        };
        debug!(element = %self.name(), parent = %parent.name(), %target, "syncing state with parent");
        self.set_state(target)
    }

    /// Default behaviour for a step: activate pads going to `Paused`,
    /// deactivate them going to `Ready`.
    pub fn default_change_state(&self, transition: StateChange) -> StateChangeResult {
        match transition {
            StateChange::ReadyToPaused => self.activate_pads(true)?,
            StateChange::PausedToReady => self.activate_pads(false)?,
            _ => {}
        }
        Ok(StateChangeSuccess::Success)
    }

    /// Activate or deactivate all pads, source pads first.
    fn activate_pads(&self, active: bool) -> Result<(), StateChangeError> {
        let pads = self.src_pads().into_iter().chain(self.sink_pads());
        let mut ok = true;
        for pad in pads {
            if let Err(e) = pad.set_active(active) {
                error!(pad = %pad.path(), active, error = %e, "pad activation failed");
                ok = false;
                if active {
                    break;
                }
            }
        }
        if ok { Ok(()) } else { Err(StateChangeError) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_towards() {
        assert_eq!(State::Null.step_towards(State::Playing), State::Ready);
        assert_eq!(State::Playing.step_towards(State::Null), State::Paused);
        assert_eq!(State::Paused.step_towards(State::Paused), State::Paused);
    }

    #[test]
    fn test_transitions() {
        let t = StateChange::new(State::Ready, State::Paused).unwrap();
        assert_eq!(t, StateChange::ReadyToPaused);
        assert!(t.is_upward());
        assert_eq!(t.to_string(), "ready->paused");
        assert!(!StateChange::PausedToReady.is_upward());
        assert!(StateChange::new(State::Null, State::Playing).is_none());
    }

    struct FailsAfterPreroll;

    impl crate::element::ElementImpl for FailsAfterPreroll {
        fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
            match transition {
                StateChange::ReadyToPaused => {
                    element.default_change_state(transition)?;
                    Ok(StateChangeSuccess::Async)
                }
                StateChange::PausedToPlaying => Err(StateChangeError),
                _ => element.default_change_state(transition),
            }
        }
    }

    #[test]
    fn test_failure_after_commit_is_reported() {
        let element = Element::new("e", FailsAfterPreroll);
        let bus = crate::bus::Bus::new();
        element.set_bus(Some(bus.clone()));

        assert_eq!(element.set_state(State::Playing), Ok(StateChangeSuccess::Async));
        element.commit_state();

        let (res, current, pending) = element.state(Some(Duration::ZERO));
        assert_eq!(res, Err(StateChangeError));
        assert_eq!(current, State::Paused);
        assert_eq!(pending, State::VoidPending);

        let failure = std::iter::from_fn(|| bus.pop()).find_map(|m| match m.view() {
            MessageView::Error { debug, .. } => debug.clone(),
            _ => None,
        });
        assert_eq!(failure.as_deref(), Some("paused->playing after async commit"));
    }
}
