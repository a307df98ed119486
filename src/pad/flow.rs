//! Flow codes returned by dataflow operations.

use thiserror::Error;

/// Why a dataflow operation did not complete.
///
/// `NotLinked`, `Flushing` and `NotNegotiated` are expected during normal
/// operation (unlinked branches, state changes, format mismatch). `Error` is
/// element specific and should be reported on the bus by whoever drives the
/// stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowError {
    /// The pad has no peer.
    #[error("not linked")]
    NotLinked,

    /// The pad is inactive or being flushed.
    #[error("flushing")]
    Flushing,

    /// The stream has ended.
    #[error("end of stream")]
    Eos,

    /// No common format could be agreed, or data arrived before a format.
    #[error("not negotiated")]
    NotNegotiated,

    /// The operation has no handler on this pad.
    #[error("not supported")]
    NotSupported,

    /// Element-specific failure.
    #[error("error")]
    Error,
}

/// Outcome of a dataflow call.
pub type FlowResult = Result<(), FlowError>;

/// Stored flow outcome, including success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowReturn {
    /// The last operation succeeded.
    #[default]
    Ok,
    /// The last operation returned [`FlowError::NotLinked`].
    NotLinked,
    /// The last operation returned [`FlowError::Flushing`].
    Flushing,
    /// The last operation returned [`FlowError::Eos`].
    Eos,
    /// The last operation returned [`FlowError::NotNegotiated`].
    NotNegotiated,
    /// The last operation returned [`FlowError::NotSupported`].
    NotSupported,
    /// The last operation returned [`FlowError::Error`].
    Error,
}

impl FlowReturn {
    /// Whether this is a fatal outcome a streaming task should report.
    ///
    /// `Flushing` is a normal shutdown path and `Eos` is handled separately.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::NotLinked | Self::NotNegotiated | Self::NotSupported | Self::Error)
    }

    /// Convert back into a result.
    pub fn into_result(self) -> FlowResult {
        match self {
            Self::Ok => Ok(()),
            Self::NotLinked => Err(FlowError::NotLinked),
            Self::Flushing => Err(FlowError::Flushing),
            Self::Eos => Err(FlowError::Eos),
            Self::NotNegotiated => Err(FlowError::NotNegotiated),
            Self::NotSupported => Err(FlowError::NotSupported),
            Self::Error => Err(FlowError::Error),
        }
    }
}

impl From<FlowError> for FlowReturn {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::NotLinked => Self::NotLinked,
            FlowError::Flushing => Self::Flushing,
            FlowError::Eos => Self::Eos,
            FlowError::NotNegotiated => Self::NotNegotiated,
            FlowError::NotSupported => Self::NotSupported,
            FlowError::Error => Self::Error,
        }
    }
}

impl<T> From<&Result<T, FlowError>> for FlowReturn {
    fn from(r: &Result<T, FlowError>) -> Self {
        match r {
            Ok(_) => Self::Ok,
            Err(e) => (*e).into(),
        }
    }
}
