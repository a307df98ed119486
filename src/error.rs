//! Error types for padflow.

use crate::element::StateChangeError;
use crate::iterator::IterError;
use crate::pad::PadLinkError;
use thiserror::Error;

/// Result type alias using padflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for padflow operations.
///
/// Dataflow calls do not use this type; they return [`FlowError`](crate::pad::FlowError)
/// so callers can react to individual flow conditions.
#[derive(Error, Debug)]
pub enum Error {
    /// A named object (element, pad, plugin, feature) does not exist.
    #[error("no {kind} named '{name}'")]
    NotFound {
        /// Kind of object that was looked up.
        kind: &'static str,
        /// Name that was looked up.
        name: String,
    },

    /// A name is already used inside a container.
    #[error("name '{name}' already used in '{container}'")]
    NameConflict {
        /// The conflicting name.
        name: String,
        /// The container (element or bin) that owns the name.
        container: String,
    },

    /// The object already has a parent.
    #[error("'{0}' already has a parent")]
    AlreadyParented(String),

    /// The object has no parent (or not the expected one).
    #[error("'{0}' is not a child of this container")]
    NotParented(String),

    /// Linking two pads failed.
    #[error("link failed: {0}")]
    PadLink(#[from] PadLinkError),

    /// A state change failed.
    #[error(transparent)]
    StateChange(#[from] StateChangeError),

    /// Pad activation failed.
    #[error("activation failed: {0}")]
    Activation(String),

    /// A pipeline description could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A caps description could not be parsed.
    #[error("invalid caps: {0}")]
    Caps(String),

    /// The element does not have the property.
    #[error("element '{element}' has no property '{property}'")]
    UnknownProperty {
        /// Element name.
        element: String,
        /// Property name.
        property: String,
    },

    /// The property value is not acceptable.
    #[error("invalid value for property '{property}': {reason}")]
    InvalidProperty {
        /// Property name.
        property: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Iteration over a changing collection failed.
    #[error(transparent)]
    Iterator(#[from] IterError),

    /// A fatal error was reported by the pipeline on its bus.
    #[error("pipeline error: {description}")]
    Pipeline {
        /// Primary description.
        description: String,
        /// Supplementary debug detail, possibly empty.
        debug: Option<String>,
    },

    /// The core has been shut down.
    #[error("core has been shut down")]
    ShutDown,
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}
