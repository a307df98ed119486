//! Streaming threads.
//!
//! A [`Task`] calls its function in a loop on a dedicated thread while
//! started, parks while paused and exits when stopped. Stopping never
//! waits; use [`Task::join`] to wait for the thread to exit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskState {
    /// No thread is running the function.
    #[default]
    Stopped,
    /// The thread is parked.
    Paused,
    /// The function is called in a loop.
    Started,
}

struct Shared {
    state: Mutex<Status>,
    cond: Condvar,
}

struct Status {
    state: TaskState,
    /// The thread is inside its loop and will observe state changes.
    running: bool,
}

type TaskFn = Arc<Mutex<dyn FnMut() + Send + 'static>>;

/// A looping streaming thread.
pub struct Task {
    name: String,
    shared: Arc<Shared>,
    func: TaskFn,
    thread: Mutex<Option<(ThreadId, JoinHandle<()>)>>,
}

impl Task {
    /// Create a stopped task.
    pub fn new(name: impl Into<String>, func: impl FnMut() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(Status {
                    state: TaskState::Stopped,
                    running: false,
                }),
                cond: Condvar::new(),
            }),
            func: Arc::new(Mutex::new(func)),
            thread: Mutex::new(None),
        }
    }

    /// Task name, also used as thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.shared.state.lock().unwrap().state
    }

    /// Start calling the function, spawning the thread if needed.
    pub fn start(&self) -> std::io::Result<()> {
        self.set_state(TaskState::Started)
    }

    /// Park the thread after the current iteration, spawning it if needed.
    pub fn pause(&self) -> std::io::Result<()> {
        self.set_state(TaskState::Paused)
    }

    /// Ask the thread to exit after the current iteration. Does not wait.
    pub fn stop(&self) {
        self.shared.state.lock().unwrap().state = TaskState::Stopped;
        self.shared.cond.notify_all();
    }

    /// Stop the task and wait for its thread to exit.
    ///
    /// Calling this from the task's own thread only stops it.
    pub fn join(&self) {
        self.stop();
        let handle = {
            let mut thread = self.thread.lock().unwrap();
            match thread.as_ref() {
                Some((id, _)) if *id == thread::current().id() => return,
                _ => thread.take(),
            }
        };
        if let Some((_, handle)) = handle
            && handle.join().is_err()
        {
            tracing::error!(task = %self.name, "task thread panicked");
        }
    }

    /// Whether the calling thread is this task's thread.
    pub fn is_current_thread(&self) -> bool {
        self.thread
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|(id, _)| *id == thread::current().id())
    }

    fn set_state(&self, new: TaskState) -> std::io::Result<()> {
        let mut thread = self.thread.lock().unwrap();
        {
            let mut status = self.shared.state.lock().unwrap();
            status.state = new;
            self.shared.cond.notify_all();
            if status.running {
                return Ok(());
            }
            status.running = true;
        }
        if let Some((_, old)) = thread.take() {
            let _ = old.join();
        }

        let shared = Arc::clone(&self.shared);
        let func = Arc::clone(&self.func);
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run(&name, &shared, &func));
        match spawned {
            Ok(handle) => {
                *thread = Some((handle.thread().id(), handle));
                Ok(())
            }
            Err(e) => {
                let mut status = self.shared.state.lock().unwrap();
                status.running = false;
                status.state = TaskState::Stopped;
                Err(e)
            }
        }
    }
}

fn run(name: &str, shared: &Shared, func: &Mutex<dyn FnMut() + Send>) {
    tracing::debug!(task = %name, "task thread started");
    loop {
        {
            let mut status = shared.state.lock().unwrap();
            while status.state == TaskState::Paused {
                status = shared.cond.wait(status).unwrap();
            }
            if status.state == TaskState::Stopped {
                status.running = false;
                break;
            }
        }
        let mut f = func.lock().unwrap_or_else(PoisonError::into_inner);
        if catch_unwind(AssertUnwindSafe(|| (&mut *f)())).is_err() {
            tracing::error!(task = %name, "task function panicked, stopping");
            let mut status = shared.state.lock().unwrap();
            status.state = TaskState::Stopped;
            status.running = false;
            break;
        }
    }
    tracing::debug!(task = %name, "task thread stopped");
}

impl Drop for Task {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
