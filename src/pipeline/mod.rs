//! Containers: bins and pipelines, and textual pipeline descriptions.
//!
//! - [`Bin`]: an element containing other elements
//! - [`Pipeline`]: a top-level bin owning the [`Bus`]
//! - [`parser`]: the `elem prop=value ! elem` description syntax
//! - [`factory`]: turning a parsed description into a linked pipeline
//!
//! # Example
//!
//! ```rust
//! use padflow::core::{Core, CoreConfig};
//! use padflow::element::State;
//!
//! let core = Core::init(CoreConfig::default());
//! let pipeline = core.parse_launch("testsrc num-buffers=3 ! identity ! nullsink").unwrap();
//! pipeline.set_state(State::Playing).unwrap();
//! pipeline.bus().wait_for_termination(None).unwrap();
//! pipeline.set_state(State::Null).unwrap();
//! ```

mod bin;
pub mod factory;
pub mod parser;

pub use bin::{Bin, BinImpl};
pub use factory::build_pipeline;
pub use parser::{ParsedElement, ParsedPipeline, parse_pipeline};

use crate::bus::Bus;
use crate::element::{Element, State};
use crate::error::Result;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

static PIPELINE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A top-level bin with a bus.
///
/// The bus stops accepting messages when the pipeline goes to `Null` and
/// accepts them again when it leaves `Null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pipeline(Bin);

impl Pipeline {
    /// Create an empty pipeline. An empty name is replaced with
    /// `pipeline<N>`.
    pub fn new(name: &str) -> Pipeline {
        let name = if name.is_empty() {
            format!("pipeline{}", PIPELINE_COUNTER.fetch_add(1, Ordering::Relaxed))
        } else {
            name.to_string()
        };
        let bin = Bin::new(&name);
        bin.as_element().set_bus(Some(Bus::new()));
        Pipeline(bin)
    }

    /// The pipeline behind `element`, if it is one.
    pub fn from_element(element: &Element) -> Option<Pipeline> {
        let bin = Bin::from_element(element)?;
        element.own_bus().is_some().then_some(Pipeline(bin))
    }

    /// The pipeline's bus.
    pub fn bus(&self) -> Bus {
        match self.0.as_element().own_bus() {
            Some(bus) => bus,
            None => unreachable!("pipeline without bus"),
        }
    }

    /// The pipeline as a bin.
    pub fn as_bin(&self) -> &Bin {
        &self.0
    }

    /// Play until `Eos` or `Error`, then shut down to `Null`.
    ///
    /// An `Error` message, a failed state change or running out of time is
    /// returned as an error; the pipeline is in `Null` either way.
    pub fn run(&self, timeout: Option<Duration>) -> Result<()> {
        info!(pipeline = %self.name(), "running pipeline");
        let result = self
            .set_state(State::Playing)
            .map_err(Into::into)
            .and_then(|_| self.bus().wait_for_termination(timeout));
        self.set_state(State::Null)?;
        result
    }
}

impl Deref for Pipeline {
    type Target = Bin;

    fn deref(&self) -> &Bin {
        &self.0
    }
}

impl From<Pipeline> for Element {
    fn from(pipeline: Pipeline) -> Element {
        pipeline.0.into()
    }
}
