//! Stream metadata carried by tag events.
//!
//! ```rust
//! use padflow::event::{TagList, TagMergeMode};
//!
//! let mut tags = TagList::new();
//! tags.set("title", "Test pattern");
//! tags.set("bitrate", 1_500_000u64);
//!
//! let mut update = TagList::new();
//! update.set("title", "Renamed");
//! tags.merge(&update, TagMergeMode::Keep);
//! assert_eq!(tags.get_string("title"), Some("Test pattern"));
//! ```

use std::collections::BTreeMap;

/// Value stored in a tag list.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// String value.
    String(String),
    /// Unsigned integer (durations, bitrates).
    UInt(u64),
    /// Signed integer.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// Boolean value.
    Bool(bool),
}

impl TagValue {
    /// Get as string.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as unsigned integer.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Get as signed integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Get as boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<u64> for TagValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// How to combine two tag lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMergeMode {
    /// Replace the whole list.
    Replace,
    /// New values win.
    #[default]
    Append,
    /// Existing values win.
    Keep,
}

/// Ordered key/value metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagList {
    tags: BTreeMap<String, TagValue>,
}

impl TagList {
    /// Create an empty tag list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a tag.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a tag.
    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    /// Get a string tag.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(TagValue::as_string)
    }

    /// Get an unsigned integer tag.
    pub fn get_uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(TagValue::as_uint)
    }

    /// Remove a tag.
    pub fn remove(&mut self, key: &str) -> Option<TagValue> {
        self.tags.remove(key)
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterate over tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge another tag list into this one.
    pub fn merge(&mut self, other: &TagList, mode: TagMergeMode) {
        match mode {
            TagMergeMode::Replace => self.tags = other.tags.clone(),
            TagMergeMode::Append => {
                for (k, v) in &other.tags {
                    self.tags.insert(k.clone(), v.clone());
                }
            }
            TagMergeMode::Keep => {
                for (k, v) in &other.tags {
                    self.tags.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
    }
}
