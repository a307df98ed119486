//! Observability: structured logging and spans via `tracing`.
//!
//! The framework logs through `tracing` macros:
//!
//! | Level | What |
//! |-------|------|
//! | `trace` | every buffer, event and query crossing a pad |
//! | `debug` | links, activation, state steps, bus traffic |
//! | `warn` | refused caps, failed activations |
//! | `error` | fatal flow results, panics in tasks, probes and handlers |
//!
//! Spans wrap state changes and streaming tasks; [`TracingConfig`] selects
//! which spans are created. Install a subscriber (e.g. `tracing-subscriber`)
//! in the application to see the output.

mod tracing_support;

pub use tracing_support::{TracingConfig, span_element, span_pad, span_state_change};
