//! Test and utility source/sink elements.
//!
//! - [`TestSrc`]: Generates test pattern buffers
//! - [`DataSrc`]: Serves buffers from inline data, in push or pull mode
//! - [`NullSink`]: Discards everything (useful for benchmarking)

mod datasrc;
mod null;
mod testsrc;

pub use datasrc::DataSrc;
pub use null::{HandoffCallback, NullSink};
pub use testsrc::{TestPattern, TestSrc};
