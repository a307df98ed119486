//! # padflow
//!
//! A media pipeline element graph with pad-based dataflow, probes and
//! flow-control semantics.
//!
//! Elements expose typed, directional [`Pad`](pad::Pad)s. Linking two pads
//! checks direction, hierarchy and format compatibility
//! ([`Caps`](caps::Caps)); buffers and events then travel across the link in
//! push or pull mode, observed and gated by probes, with formats negotiated
//! lazily on the first transfer. Elements move through a four-state machine
//! (`Null`, `Ready`, `Paused`, `Playing`); [`Bin`](pipeline::Bin)s propagate
//! state changes sinks first, and a [`Pipeline`](pipeline::Pipeline) reports
//! errors, EOS and state changes on its [`Bus`](bus::Bus).
//!
//! ## Features
//!
//! - **Pads and ghost pads**: linking across container boundaries
//! - **Caps negotiation**: intersection, subset and fixation of format sets
//! - **Probes**: blocking, data and idle callbacks on every pad
//! - **Streaming tasks**: one thread per driving pad, paused on flow errors
//! - **Asynchronous state changes**: sinks preroll on their first buffer
//! - **Launch descriptions**: `testsrc ! identity ! nullsink`
//!
//! ## Quick Start
//!
//! ```rust
//! use padflow::prelude::*;
//!
//! let core = Core::init(CoreConfig::default());
//! let pipeline = core
//!     .parse_launch("testsrc num-buffers=10 ! identity name=tap ! nullsink")
//!     .unwrap();
//! pipeline.run(None).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod bus;
pub mod caps;
pub mod clock;
pub mod config;
pub mod core;
pub mod element;
pub mod elements;
pub mod error;
pub mod event;
pub mod format;
pub mod iterator;
pub mod observability;
pub mod pad;
pub mod pipeline;
pub mod plugin;
pub mod query;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::bus::{Bus, Message, MessageView};
    pub use crate::caps::{Caps, Structure};
    pub use crate::core::{Core, CoreConfig};
    pub use crate::element::{Element, ElementImpl, State, StateChange, StateChangeSuccess};
    pub use crate::error::{Error, Result};
    pub use crate::event::Event;
    pub use crate::pad::{FlowError, FlowResult, Pad, PadDirection, PadProbeReturn, PadProbeType};
    pub use crate::pipeline::{Bin, Pipeline};
    pub use crate::query::Query;
}

pub use error::{Error, Result};
