//! Message bus: the channel from a pipeline to the application.
//!
//! Elements post [`Message`]s; the top-level pipeline puts them on its
//! [`Bus`], an unbounded FIFO backed by a `kanal` channel. The application
//! consumes them by popping (blocking, with a timeout, or async) or by
//! registering watches that run from [`Bus::dispatch_pending`] or a
//! [`MainLoop`].
//!
//! # Example
//!
//! ```rust
//! use padflow::bus::{Bus, Message, MessageView};
//! use std::time::Duration;
//!
//! let bus = Bus::new();
//! bus.post(Message::new(None, MessageView::Eos));
//! let msg = bus.timed_pop(Some(Duration::from_secs(1))).unwrap();
//! assert!(matches!(msg.view(), MessageView::Eos));
//! ```

use crate::element::{Element, State, WeakElement};
use crate::error::{Error, Result};
use crate::event::TagList;
use bitflags::bitflags;
use kanal::{Receiver, Sender};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ============================================================================
// Messages
// ============================================================================

/// Payload of a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageView {
    /// All sinks reached end of stream.
    Eos,
    /// A fatal error; the pipeline should be stopped.
    Error {
        /// Human-readable description.
        description: String,
        /// Supplementary detail for debugging.
        debug: Option<String>,
    },
    /// A non-fatal problem.
    Warning {
        /// Human-readable description.
        description: String,
        /// Supplementary detail for debugging.
        debug: Option<String>,
    },
    /// Informational notice.
    Info {
        /// Human-readable description.
        description: String,
        /// Supplementary detail for debugging.
        debug: Option<String>,
    },
    /// The source completed a state step.
    StateChanged {
        /// State before the step.
        old: State,
        /// State after the step.
        new: State,
        /// Final state still to reach, or `VoidPending`.
        pending: State,
    },
    /// The source started an async state change.
    AsyncStart,
    /// The source completed an async state change.
    AsyncDone,
    /// All sinks started a new stream.
    StreamStart,
    /// Application-defined message.
    Application {
        /// Message name.
        name: String,
        /// Fields.
        payload: TagList,
    },
}

bitflags! {
    /// Message kinds, for filtering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageType: u32 {
        /// [`MessageView::Eos`].
        const EOS = 1 << 0;
        /// [`MessageView::Error`].
        const ERROR = 1 << 1;
        /// [`MessageView::Warning`].
        const WARNING = 1 << 2;
        /// [`MessageView::Info`].
        const INFO = 1 << 3;
        /// [`MessageView::StateChanged`].
        const STATE_CHANGED = 1 << 4;
        /// [`MessageView::AsyncStart`].
        const ASYNC_START = 1 << 5;
        /// [`MessageView::AsyncDone`].
        const ASYNC_DONE = 1 << 6;
        /// [`MessageView::StreamStart`].
        const STREAM_START = 1 << 7;
        /// [`MessageView::Application`].
        const APPLICATION = 1 << 8;
        /// Every kind.
        const ANY = u32::MAX;
    }
}

static MESSAGE_SEQNUM: AtomicU64 = AtomicU64::new(1);

/// An immutable notification from an element.
#[derive(Clone)]
pub struct Message {
    src: Option<WeakElement>,
    src_path: String,
    seqnum: u64,
    view: MessageView,
}

impl Message {
    /// Create a message from `src`, or from the application when `None`.
    pub fn new(src: Option<&Element>, view: MessageView) -> Message {
        Message {
            src: src.map(Element::downgrade),
            src_path: src.map(Element::path_string).unwrap_or_default(),
            seqnum: MESSAGE_SEQNUM.fetch_add(1, Ordering::Relaxed),
            view,
        }
    }

    /// The element that posted the message, if it still exists.
    pub fn src(&self) -> Option<Element> {
        self.src.as_ref().and_then(WeakElement::upgrade)
    }

    /// Path of the posting element at posting time; empty for application
    /// messages.
    pub fn src_path(&self) -> &str {
        &self.src_path
    }

    /// Whether `element` posted the message.
    pub fn is_from(&self, element: &Element) -> bool {
        self.src().is_some_and(|s| s.ptr_eq(element))
    }

    /// Sequence number, increasing in posting order.
    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    /// Payload.
    pub fn view(&self) -> &MessageView {
        &self.view
    }

    /// Kind of the payload.
    pub fn message_type(&self) -> MessageType {
        match self.view {
            MessageView::Eos => MessageType::EOS,
            MessageView::Error { .. } => MessageType::ERROR,
            MessageView::Warning { .. } => MessageType::WARNING,
            MessageView::Info { .. } => MessageType::INFO,
            MessageView::StateChanged { .. } => MessageType::STATE_CHANGED,
            MessageView::AsyncStart => MessageType::ASYNC_START,
            MessageView::AsyncDone => MessageType::ASYNC_DONE,
            MessageView::StreamStart => MessageType::STREAM_START,
            MessageView::Application { .. } => MessageType::APPLICATION,
        }
    }

    /// Whether the message ends a [`MainLoop::run`].
    pub fn is_terminal(&self) -> bool {
        self.message_type()
            .intersects(MessageType::EOS | MessageType::ERROR)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("src", &self.src_path)
            .field("seqnum", &self.seqnum)
            .field("view", &self.view)
            .finish()
    }
}

// ============================================================================
// Bus
// ============================================================================

/// What a sync handler decides about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusSyncReply {
    /// Queue the message.
    Pass,
    /// Discard the message.
    Drop,
}

/// Handler running in the posting thread.
pub type SyncHandler = Arc<dyn Fn(&Bus, &Message) -> BusSyncReply + Send + Sync + 'static>;

type Watch = Arc<Mutex<dyn FnMut(&Message) -> ControlFlow<()> + Send + 'static>>;

/// Identifier of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

enum BusItem {
    Message(Message),
    Wakeup,
}

struct BusInner {
    tx: Sender<BusItem>,
    rx: Receiver<BusItem>,
    flushing: AtomicBool,
    sync_handler: RwLock<Option<SyncHandler>>,
    watches: Mutex<Vec<(WatchId, Watch)>>,
    next_watch: AtomicU64,
}

/// An ordered message queue.
#[derive(Clone)]
pub struct Bus(Arc<BusInner>);

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Create an empty bus.
    pub fn new() -> Bus {
        let (tx, rx) = kanal::unbounded();
        Bus(Arc::new(BusInner {
            tx,
            rx,
            flushing: AtomicBool::new(false),
            sync_handler: RwLock::new(None),
            watches: Mutex::new(Vec::new()),
            next_watch: AtomicU64::new(1),
        }))
    }

    /// Post a message. Returns `false` when it was dropped.
    pub fn post(&self, message: Message) -> bool {
        if self.is_flushing() {
            trace!(message = ?message.view(), "bus flushing, dropping message");
            return false;
        }
        let handler = self.0.sync_handler.read().unwrap().clone();
        if let Some(handler) = handler
            && handler(self, &message) == BusSyncReply::Drop
        {
            trace!(seqnum = message.seqnum(), "sync handler dropped message");
            return false;
        }
        trace!(src = %message.src_path(), message = ?message.view(), "posting message");
        self.0.tx.send(BusItem::Message(message)).is_ok()
    }

    /// Install or remove the handler run in the posting thread.
    pub fn set_sync_handler<F>(&self, handler: Option<F>)
    where
        F: Fn(&Bus, &Message) -> BusSyncReply + Send + Sync + 'static,
    {
        *self.0.sync_handler.write().unwrap() = handler.map(|f| Arc::new(f) as SyncHandler);
    }

    /// Drop queued messages and every message posted while flushing.
    pub fn set_flushing(&self, flushing: bool) {
        self.0.flushing.store(flushing, Ordering::SeqCst);
        if flushing {
            let mut dropped = 0usize;
            while let Ok(Some(_)) = self.0.rx.try_recv() {
                dropped += 1;
            }
            debug!(dropped, "bus flushed");
        }
    }

    /// Whether the bus drops messages.
    pub fn is_flushing(&self) -> bool {
        self.0.flushing.load(Ordering::SeqCst)
    }

    /// Whether messages are queued.
    pub fn have_pending(&self) -> bool {
        !self.0.rx.is_empty()
    }

    /// Next queued message, without waiting.
    pub fn pop(&self) -> Option<Message> {
        loop {
            match self.0.rx.try_recv() {
                Ok(Some(BusItem::Message(m))) => return Some(m),
                Ok(Some(BusItem::Wakeup)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Next message, waiting up to `timeout` (`None` waits forever).
    pub fn timed_pop(&self, timeout: Option<Duration>) -> Option<Message> {
        self.timed_pop_filtered(timeout, MessageType::ANY)
    }

    /// Next message of one of the `types`, waiting up to `timeout`.
    ///
    /// Messages of other kinds are discarded.
    pub fn timed_pop_filtered(
        &self,
        timeout: Option<Duration>,
        types: MessageType,
    ) -> Option<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let item = match deadline {
                None => self.0.rx.recv().ok()?,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        match self.0.rx.try_recv() {
                            Ok(Some(item)) => item,
                            _ => return None,
                        }
                    } else {
                        self.0.rx.recv_timeout(left).ok()?
                    }
                }
            };
            match item {
                BusItem::Message(m) if m.message_type().intersects(types) => return Some(m),
                BusItem::Message(m) => trace!(seqnum = m.seqnum(), "discarding filtered message"),
                BusItem::Wakeup => {}
            }
        }
    }

    /// Wait for the next message asynchronously.
    ///
    /// Returns `None` when the bus is closed.
    pub async fn next_message(&self) -> Option<Message> {
        loop {
            match self.0.rx.as_async().recv().await {
                Ok(BusItem::Message(m)) => return Some(m),
                Ok(BusItem::Wakeup) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Block until `Eos` or `Error`.
    ///
    /// An `Error` message becomes [`Error::Pipeline`]; so does running out
    /// of time.
    pub fn wait_for_termination(&self, timeout: Option<Duration>) -> Result<()> {
        match self.timed_pop_filtered(timeout, MessageType::EOS | MessageType::ERROR) {
            Some(msg) => match msg.view {
                MessageView::Error { description, debug } => {
                    Err(Error::Pipeline { description, debug })
                }
                _ => Ok(()),
            },
            None => Err(Error::Pipeline {
                description: "timed out waiting for end of stream".to_string(),
                debug: None,
            }),
        }
    }

    // ========================================================================
    // Watches
    // ========================================================================

    /// Register a watch. It runs on the dispatching thread for every message
    /// and is removed when it returns `ControlFlow::Break`.
    pub fn add_watch<F>(&self, watch: F) -> WatchId
    where
        F: FnMut(&Message) -> ControlFlow<()> + Send + 'static,
    {
        let id = WatchId(self.0.next_watch.fetch_add(1, Ordering::Relaxed));
        self.0.watches.lock().unwrap().push((id, Arc::new(Mutex::new(watch))));
        id
    }

    /// Unregister a watch. Returns `false` for unknown ids.
    pub fn remove_watch(&self, id: WatchId) -> bool {
        let mut watches = self.0.watches.lock().unwrap();
        let before = watches.len();
        watches.retain(|(w, _)| *w != id);
        watches.len() != before
    }

    /// Dispatch every queued message to the watches, without waiting.
    ///
    /// Returns the number of messages dispatched.
    pub fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        while let Some(msg) = self.pop() {
            self.dispatch(&msg);
            count += 1;
        }
        count
    }

    fn dispatch(&self, message: &Message) {
        // Watches run without the list lock so they can add or remove watches.
        let running: Vec<(WatchId, Watch)> = self.0.watches.lock().unwrap().clone();
        let mut done = Vec::new();
        for (id, watch) in running {
            let mut guard = watch.lock().unwrap_or_else(PoisonError::into_inner);
            if (&mut *guard)(message).is_break() {
                done.push(id);
            }
        }
        if !done.is_empty() {
            self.0
                .watches
                .lock()
                .unwrap()
                .retain(|(id, _)| !done.contains(id));
        }
    }

    fn wakeup(&self) {
        let _ = self.0.tx.send(BusItem::Wakeup);
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("pending", &self.0.rx.len())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

// ============================================================================
// Main loop
// ============================================================================

/// Blocks on a bus and dispatches its messages to the watches.
#[derive(Clone, Debug)]
pub struct MainLoop {
    bus: Bus,
    quit: Arc<AtomicBool>,
}

impl MainLoop {
    /// Create a loop for `bus`.
    pub fn new(bus: &Bus) -> MainLoop {
        MainLoop {
            bus: bus.clone(),
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dispatch messages until `Eos` or `Error` was dispatched (returned) or
    /// [`quit`](Self::quit) is called (`None`).
    pub fn run(&self) -> Option<Message> {
        self.quit.store(false, Ordering::SeqCst);
        debug!("main loop running");
        loop {
            if self.quit.load(Ordering::SeqCst) {
                debug!("main loop quit");
                return None;
            }
            match self.bus.0.rx.recv() {
                Ok(BusItem::Message(msg)) => {
                    self.bus.dispatch(&msg);
                    if msg.is_terminal() {
                        debug!(message = ?msg.view(), "main loop terminated");
                        return Some(msg);
                    }
                }
                Ok(BusItem::Wakeup) => {}
                Err(_) => return None,
            }
        }
    }

    /// Make [`run`](Self::run) return. May be called from any thread,
    /// including a watch.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.bus.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn app(name: &str) -> Message {
        Message::new(
            None,
            MessageView::Application {
                name: name.to_string(),
                payload: TagList::new(),
            },
        )
    }

    #[test]
    fn test_fifo_order() {
        let bus = Bus::new();
        for name in ["a", "b", "c"] {
            assert!(bus.post(app(name)));
        }
        let names: Vec<String> = std::iter::from_fn(|| bus.pop())
            .filter_map(|m| match m.view() {
                MessageView::Application { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_seqnum_increases() {
        let a = app("a");
        let b = app("b");
        assert!(b.seqnum() > a.seqnum());
    }

    #[test]
    fn test_sync_handler_drop() {
        let bus = Bus::new();
        bus.set_sync_handler(Some(|_: &Bus, m: &Message| {
            if m.message_type() == MessageType::APPLICATION {
                BusSyncReply::Drop
            } else {
                BusSyncReply::Pass
            }
        }));
        assert!(!bus.post(app("x")));
        assert!(bus.post(Message::new(None, MessageView::Eos)));
        assert!(matches!(bus.pop().unwrap().view(), MessageView::Eos));
        assert!(bus.pop().is_none());
    }

    #[test]
    fn test_flushing_drops() {
        let bus = Bus::new();
        bus.post(app("queued"));
        bus.set_flushing(true);
        assert!(!bus.have_pending());
        assert!(!bus.post(app("late")));
        bus.set_flushing(false);
        assert!(bus.post(app("again")));
        assert!(bus.have_pending());
    }

    #[test]
    fn test_filtered_pop_discards_others() {
        let bus = Bus::new();
        bus.post(app("skip"));
        bus.post(Message::new(None, MessageView::Eos));
        let msg = bus
            .timed_pop_filtered(Some(Duration::from_millis(100)), MessageType::EOS)
            .unwrap();
        assert_eq!(msg.message_type(), MessageType::EOS);
        assert!(bus.pop().is_none());
        assert!(bus.timed_pop(Some(Duration::from_millis(5))).is_none());
    }

    #[test]
    fn test_watch_break_removes() {
        let bus = Bus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        bus.add_watch(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Break(())
        });
        bus.post(app("1"));
        bus.post(app("2"));
        assert_eq!(bus.dispatch_pending(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_removed_from_another_watch() {
        let bus = Bus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let victim = Arc::new(Mutex::new(None));
        let v = Arc::clone(&victim);
        let b = bus.clone();
        bus.add_watch(move |_| {
            if let Some(id) = v.lock().unwrap().take() {
                assert!(b.remove_watch(id));
            }
            ControlFlow::Continue(())
        });
        let id = bus.add_watch(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });
        *victim.lock().unwrap() = Some(id);

        bus.post(app("1"));
        bus.post(app("2"));
        assert_eq!(bus.dispatch_pending(), 2);
        // Still ran for the message being dispatched when it was removed.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_dispatch_reaches_every_watch() {
        const MESSAGES: usize = 200;
        let bus = Bus::new();
        let counters: Vec<Arc<AtomicUsize>> = (0..2).map(|_| Arc::default()).collect();
        for counter in &counters {
            let c = Arc::clone(counter);
            bus.add_watch(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            });
        }
        for i in 0..MESSAGES {
            bus.post(app(&i.to_string()));
        }

        let dispatchers: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                thread::spawn(move || bus.dispatch_pending())
            })
            .collect();
        let dispatched: usize = dispatchers.into_iter().map(|t| t.join().unwrap()).sum();

        assert_eq!(dispatched, MESSAGES);
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), MESSAGES);
        }
    }

    #[test]
    fn test_main_loop_stops_on_error() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.add_watch(move |m| {
            s.lock().unwrap().push(m.message_type());
            ControlFlow::Continue(())
        });
        bus.post(app("before"));
        bus.post(Message::new(
            None,
            MessageView::Error {
                description: "boom".into(),
                debug: None,
            },
        ));
        bus.post(app("after"));

        let main_loop = MainLoop::new(&bus);
        let last = main_loop.run().unwrap();
        assert_eq!(last.message_type(), MessageType::ERROR);
        assert_eq!(
            *seen.lock().unwrap(),
            [MessageType::APPLICATION, MessageType::ERROR]
        );
        assert!(bus.have_pending());
    }

    #[test]
    fn test_main_loop_quit_from_thread() {
        let bus = Bus::new();
        let main_loop = MainLoop::new(&bus);
        let ml = main_loop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            ml.quit();
        });
        assert!(main_loop.run().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_termination_error() {
        let bus = Bus::new();
        bus.post(Message::new(
            None,
            MessageView::Error {
                description: "bad".into(),
                debug: Some(String::new()),
            },
        ));
        match bus.wait_for_termination(Some(Duration::from_secs(1))) {
            Err(Error::Pipeline { description, .. }) => assert_eq!(description, "bad"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
