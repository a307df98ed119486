//! Built-in pipeline elements.
//!
//! ## Sources
//! - [`TestSrc`]: Generates test pattern buffers
//! - [`DataSrc`]: Serves inline data, in push or pull mode
//! - [`AppSrc`]: Injects buffers from application code
//!
//! ## Sinks
//! - [`NullSink`]: Discards all buffers (useful for benchmarking)
//! - [`AppSink`]: Extracts buffers to application code
//!
//! ## Transforms
//! - [`Identity`]: Passes buffers unchanged, with inspection callbacks
//! - [`CapsFilter`]: Restricts the formats negotiated through it
//!
//! All of them are registered by [`plugin`] under the name
//! `coreelements`, which [`Core::init`](crate::core::Core::init) loads by
//! default.

pub mod app;
mod base_sink;
mod base_src;
mod capsfilter;
mod identity;
pub mod testing;

pub use app::{AppSink, AppSinkHandle, AppSinkStats, AppSrc, AppSrcHandle, AppSrcStats};
pub use capsfilter::CapsFilter;
pub use identity::{BufferCallback, Identity, IdentityStats};
pub use testing::{DataSrc, NullSink, TestPattern, TestSrc};

use crate::element::{Element, PropertyValue};
use crate::error::Error;
use crate::pipeline::parser::CAPSFILTER_FACTORY;
use crate::plugin::{ElementFactory, Plugin, Rank};

/// Name of the plugin returned by [`plugin`].
pub const PLUGIN_NAME: &str = "coreelements";

/// The built-in elements as a plugin.
pub fn plugin() -> Plugin {
    Plugin::new(PLUGIN_NAME)
        .with_description("Standard sources, sinks and filters")
        .with_license("MIT OR Apache-2.0")
        .with_element(
            ElementFactory::for_impl::<TestSrc>("testsrc")
                .with_long_name("Test source")
                .with_klass("Source/Testing")
                .with_description("Generates buffers filled with a test pattern"),
        )
        .with_element(
            ElementFactory::for_impl::<DataSrc>("datasrc")
                .with_long_name("Data source")
                .with_klass("Source")
                .with_description("Serves an in-memory byte string"),
        )
        .with_element(
            ElementFactory::for_impl::<AppSrc>("appsrc")
                .with_long_name("Application source")
                .with_klass("Source/Generic")
                .with_description("Injects buffers from application code"),
        )
        .with_element(
            ElementFactory::for_impl::<NullSink>("nullsink")
                .with_long_name("Null sink")
                .with_klass("Sink")
                .with_description("Discards all buffers")
                .with_rank(Rank::Marginal),
        )
        .with_element(
            ElementFactory::for_impl::<AppSink>("appsink")
                .with_long_name("Application sink")
                .with_klass("Sink/Generic")
                .with_description("Hands buffers to application code"),
        )
        .with_element(
            ElementFactory::for_impl::<Identity>("identity")
                .with_long_name("Identity")
                .with_klass("Generic")
                .with_description("Passes buffers through unchanged"),
        )
        .with_element(
            ElementFactory::for_impl::<CapsFilter>(CAPSFILTER_FACTORY)
                .with_long_name("Caps filter")
                .with_klass("Generic")
                .with_description("Restricts the formats negotiated through it"),
        )
}

/// `InvalidProperty` for a value of the wrong kind.
pub(crate) fn invalid_value(property: &str, value: &PropertyValue, expected: &str) -> Error {
    Error::InvalidProperty {
        property: property.to_string(),
        reason: format!("expected {expected}, got {value}"),
    }
}

/// `UnknownProperty` for `element`.
pub(crate) fn unknown_property(element: &Element, name: &str) -> Error {
    Error::UnknownProperty {
        element: element.name().to_string(),
        property: name.to_string(),
    }
}
