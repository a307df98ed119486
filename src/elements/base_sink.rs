//! Preroll handling shared by the sinks.
//!
//! A sink going to `Paused` completes its state change asynchronously: the
//! first buffer (or EOS) commits the state and then blocks the streaming
//! thread until the sink is `Playing` or flushing.

use crate::bus::MessageView;
use crate::element::{Element, StateChange, StateChangeResult, StateChangeSuccess};
use crate::event::Event;
use crate::pad::{FlowError, FlowResult};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct SinkState {
    prerolled: bool,
    playing: bool,
    flushing: bool,
    eos: bool,
}

#[derive(Debug)]
pub(crate) struct SinkCore {
    state: Mutex<SinkState>,
    cond: Condvar,
}

impl Default for SinkCore {
    fn default() -> Self {
        Self {
            state: Mutex::new(SinkState {
                flushing: true,
                ..SinkState::default()
            }),
            cond: Condvar::new(),
        }
    }
}

impl SinkCore {
    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `transition` for a sink. `is_async` makes `ReadyToPaused` wait
    /// for preroll.
    pub(crate) fn change_state(
        &self,
        element: &Element,
        transition: StateChange,
        is_async: bool,
    ) -> StateChangeResult {
        match transition {
            StateChange::ReadyToPaused => {
                let mut st = self.lock();
                *st = SinkState::default();
            }
            StateChange::PausedToPlaying => {
                self.lock().playing = true;
                self.cond.notify_all();
            }
            StateChange::PlayingToPaused => {
                self.lock().playing = false;
            }
            StateChange::PausedToReady => {
                self.lock().flushing = true;
                self.cond.notify_all();
            }
            _ => {}
        }

        element.default_change_state(transition)?;

        if transition == StateChange::ReadyToPaused && is_async && !self.lock().prerolled {
            debug!(element = %element.name(), "waiting for preroll");
            return Ok(StateChangeSuccess::Async);
        }
        Ok(StateChangeSuccess::Success)
    }

    /// Commit the pending state on the first item, then block until playing.
    ///
    /// Called from the streaming thread with the sink pad's stream lock held.
    pub(crate) fn preroll(&self, element: &Element) -> FlowResult {
        let commit = {
            let mut st = self.lock();
            if st.flushing {
                return Err(FlowError::Flushing);
            }
            !std::mem::replace(&mut st.prerolled, true)
        };
        if commit {
            debug!(element = %element.name(), "prerolled");
            element.commit_state();
        }

        let mut st = self.lock();
        while !st.playing && !st.flushing {
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        if st.flushing {
            Err(FlowError::Flushing)
        } else {
            Ok(())
        }
    }

    /// Event handling common to all sinks. `false` refuses the event.
    ///
    /// `Eos` prerolls like a buffer and is posted on the bus once playing.
    pub(crate) fn handle_event(&self, element: &Element, event: &Event) -> bool {
        match event {
            Event::StreamStart(_) => {
                element.post_view(MessageView::StreamStart);
                true
            }
            Event::Eos => {
                if !self.set_eos() {
                    return true;
                }
                if self.preroll(element).is_err() {
                    return false;
                }
                debug!(element = %element.name(), "end of stream");
                element.post_view(MessageView::Eos);
                true
            }
            Event::FlushStart => {
                self.flush_start();
                true
            }
            Event::FlushStop { .. } => {
                self.flush_stop();
                true
            }
            _ => true,
        }
    }

    /// Block while `blocked` holds and the sink is not flushing.
    pub(crate) fn wait_while(&self, mut blocked: impl FnMut() -> bool) -> FlowResult {
        let mut st = self.lock();
        while !st.flushing && blocked() {
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        if st.flushing {
            Err(FlowError::Flushing)
        } else {
            Ok(())
        }
    }

    /// Wake threads in [`wait_while`](Self::wait_while).
    pub(crate) fn notify(&self) {
        let _st = self.lock();
        self.cond.notify_all();
    }

    pub(crate) fn flush_start(&self) {
        self.lock().flushing = true;
        self.cond.notify_all();
    }

    pub(crate) fn flush_stop(&self) {
        let mut st = self.lock();
        st.flushing = false;
        st.eos = false;
    }

    /// Mark EOS; returns `false` if it was already marked.
    pub(crate) fn set_eos(&self) -> bool {
        !std::mem::replace(&mut self.lock().eos, true)
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.lock().eos
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    pub(crate) fn is_prerolled(&self) -> bool {
        self.lock().prerolled
    }
}
