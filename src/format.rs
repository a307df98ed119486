//! Units used by segments, seeks and position/duration queries.

use std::fmt;

/// The unit a position or duration is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Unspecified.
    #[default]
    Undefined,
    /// Element-defined default unit (samples, frames).
    Default,
    /// Bytes.
    Bytes,
    /// Nanoseconds.
    Time,
    /// Buffer count.
    Buffers,
    /// Percentage scaled to 0..=1_000_000.
    Percent,
}

impl Format {
    /// Scale used by [`Format::Percent`] values.
    pub const PERCENT_MAX: u64 = 1_000_000;

    /// Short name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Default => "default",
            Self::Bytes => "bytes",
            Self::Time => "time",
            Self::Buffers => "buffers",
            Self::Percent => "percent",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormattedValue {
    /// Unit.
    pub format: Format,
    /// Value, `None` when unknown.
    pub value: Option<u64>,
}

impl FormattedValue {
    /// Create a formatted value.
    pub fn new(format: Format, value: Option<u64>) -> Self {
        Self { format, value }
    }
}
