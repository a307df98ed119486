//! Capabilities: structured descriptions of acceptable data formats.
//!
//! A [`Caps`] is either `ANY` (accepts everything), `EMPTY` (accepts
//! nothing), or an ordered list of [`Structure`]s. Earlier structures are
//! preferred over later ones, and every operation that produces caps from
//! two inputs keeps the order of the first input.
//!
//! ```rust
//! use padflow::caps::Caps;
//!
//! let src: Caps = "video/x-raw, format={ I420, RGB }, width=[ 16, 4096 ]".parse().unwrap();
//! let sink: Caps = "video/x-raw, format=RGB, width=640".parse().unwrap();
//!
//! let common = src.intersect(&sink);
//! assert_eq!(common.to_string(), "video/x-raw, format=RGB, width=640");
//! assert!(common.is_fixed());
//! ```

mod parse;
mod value;

pub use value::{CapsValue, Value};

use smallvec::SmallVec;
use std::fmt;

// ============================================================================
// Structure
// ============================================================================

/// A single format descriptor: a media type name and ordered fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Structure {
    name: String,
    fields: SmallVec<[(String, CapsValue<Value>); 4]>,
}

impl Structure {
    /// Create a structure with no fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: SmallVec::new(),
        }
    }

    /// Builder-style field setter.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<CapsValue<Value>>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field, replacing an existing field with the same name in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<CapsValue<Value>>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Remove a field. Returns the old constraint if present.
    pub fn remove(&mut self, name: &str) -> Option<CapsValue<Value>> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Media type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a field constraint.
    pub fn get(&self, name: &str) -> Option<&CapsValue<Value>> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Look up a fixed integer field.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_fixed()?.as_int()
    }

    /// Look up a fixed string field.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_fixed()?.as_str()
    }

    /// Iterate over the fields in order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &CapsValue<Value>)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of fields.
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// Whether every field holds exactly one value.
    pub fn is_fixed(&self) -> bool {
        self.fields.iter().all(|(_, v)| v.is_fixed())
    }

    /// Intersect two structures.
    ///
    /// Fields present in only one structure are kept unchanged; fields present
    /// in both are intersected. Field order follows `self`, then the remaining
    /// fields of `other`.
    pub fn intersect(&self, other: &Structure) -> Option<Structure> {
        if self.name != other.name {
            return None;
        }

        let mut out = Structure::new(self.name.clone());
        for (name, value) in &self.fields {
            let merged = match other.get(name) {
                Some(theirs) => value.intersect(theirs)?,
                None => value.clone(),
            };
            out.fields.push((name.clone(), merged));
        }
        for (name, value) in &other.fields {
            if self.get(name).is_none() {
                out.fields.push((name.clone(), value.clone()));
            }
        }
        Some(out)
    }

    /// Whether every format described by `self` is also described by `other`.
    ///
    /// `other` may constrain fewer fields than `self`, never more.
    pub fn is_subset(&self, other: &Structure) -> bool {
        self.name == other.name
            && other.fields.iter().all(|(name, theirs)| match self.get(name) {
                Some(ours) => ours.is_subset(theirs),
                None => theirs.is_any(),
            })
    }

    /// Reduce every field to a single value.
    ///
    /// Unconstrained fields are removed since they have no preferred value.
    pub fn fixate(&self) -> Structure {
        let fields = self
            .fields
            .iter()
            .filter_map(|(name, value)| {
                value
                    .fixate()
                    .map(|v| (name.clone(), CapsValue::Fixed(v)))
            })
            .collect();
        Structure {
            name: self.name.clone(),
            fields,
        }
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (name, value) in &self.fields {
            write!(f, ", {name}={value}")?;
        }
        Ok(())
    }
}

impl From<Value> for CapsValue<Value> {
    fn from(v: Value) -> Self {
        CapsValue::Fixed(v)
    }
}

impl From<i64> for CapsValue<Value> {
    fn from(v: i64) -> Self {
        CapsValue::Fixed(Value::Int(v))
    }
}

impl From<i32> for CapsValue<Value> {
    fn from(v: i32) -> Self {
        CapsValue::Fixed(Value::from(v))
    }
}

impl From<bool> for CapsValue<Value> {
    fn from(v: bool) -> Self {
        CapsValue::Fixed(Value::Bool(v))
    }
}

impl From<&str> for CapsValue<Value> {
    fn from(v: &str) -> Self {
        CapsValue::Fixed(Value::from(v))
    }
}

impl From<std::ops::RangeInclusive<i64>> for CapsValue<Value> {
    fn from(r: std::ops::RangeInclusive<i64>) -> Self {
        let (min, max) = r.into_inner();
        CapsValue::Range {
            min: Value::Int(min),
            max: Value::Int(max),
        }
    }
}

impl From<Vec<&str>> for CapsValue<Value> {
    fn from(v: Vec<&str>) -> Self {
        CapsValue::List(v.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<i64>> for CapsValue<Value> {
    fn from(v: Vec<i64>) -> Self {
        CapsValue::List(v.into_iter().map(Value::Int).collect())
    }
}

// ============================================================================
// Caps
// ============================================================================

/// An ordered set of format descriptors.
#[derive(Clone, Debug, PartialEq)]
pub struct Caps {
    any: bool,
    structures: SmallVec<[Structure; 2]>,
}

impl Caps {
    /// Caps accepting every format.
    pub fn new_any() -> Self {
        Self {
            any: true,
            structures: SmallVec::new(),
        }
    }

    /// Caps accepting no format.
    pub fn new_empty() -> Self {
        Self {
            any: false,
            structures: SmallVec::new(),
        }
    }

    /// Caps with a single field-less structure.
    pub fn new_simple(name: impl Into<String>) -> Self {
        Self::from_structure(Structure::new(name))
    }

    /// Caps with a single structure.
    pub fn from_structure(structure: Structure) -> Self {
        let mut structures = SmallVec::new();
        structures.push(structure);
        Self {
            any: false,
            structures,
        }
    }

    /// Whether these caps accept every format.
    #[inline]
    pub fn is_any(&self) -> bool {
        self.any
    }

    /// Whether these caps accept no format.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.any && self.structures.is_empty()
    }

    /// Whether these caps describe exactly one format.
    pub fn is_fixed(&self) -> bool {
        !self.any && self.structures.len() == 1 && self.structures[0].is_fixed()
    }

    /// Number of structures.
    pub fn len(&self) -> usize {
        self.structures.len()
    }

    /// Get a structure by index.
    pub fn structure(&self, idx: usize) -> Option<&Structure> {
        self.structures.get(idx)
    }

    /// Iterate over the structures in preference order.
    pub fn iter(&self) -> impl Iterator<Item = &Structure> {
        self.structures.iter()
    }

    /// Append a structure. Appending to `ANY` has no effect.
    pub fn append_structure(&mut self, structure: Structure) {
        if !self.any {
            self.structures.push(structure);
        }
    }

    /// Append all structures of `other`, skipping ones already described.
    pub fn merge(&mut self, other: Caps) {
        if self.any {
            return;
        }
        if other.any {
            *self = Caps::new_any();
            return;
        }
        for s in other.structures {
            if !self.structures.iter().any(|own| s.is_subset(own)) {
                self.structures.push(s);
            }
        }
    }

    /// Compute the formats described by both `self` and `other`.
    ///
    /// The result is ordered by `self`'s preference.
    pub fn intersect(&self, other: &Caps) -> Caps {
        if self.any {
            return other.clone();
        }
        if other.any {
            return self.clone();
        }

        let mut out = Caps::new_empty();
        for ours in &self.structures {
            for theirs in &other.structures {
                if let Some(s) = ours.intersect(theirs)
                    && !out.structures.contains(&s)
                {
                    out.structures.push(s);
                }
            }
        }
        out
    }

    /// Whether `self` and `other` share at least one format.
    pub fn can_intersect(&self, other: &Caps) -> bool {
        if self.any || other.any {
            return !(self.is_empty() || other.is_empty());
        }
        self.structures
            .iter()
            .any(|a| other.structures.iter().any(|b| a.intersect(b).is_some()))
    }

    /// Whether every format of `self` is also described by `other`.
    pub fn is_subset(&self, other: &Caps) -> bool {
        if other.any {
            return true;
        }
        if self.any {
            return false;
        }
        self.structures
            .iter()
            .all(|s| other.structures.iter().any(|o| s.is_subset(o)))
    }

    /// Pick the preferred single format.
    ///
    /// Returns empty caps for `ANY` and `EMPTY`.
    pub fn fixate(&self) -> Caps {
        match self.structures.first() {
            Some(s) if !self.any => Caps::from_structure(s.fixate()),
            _ => Caps::new_empty(),
        }
    }
}

impl Default for Caps {
    fn default() -> Self {
        Self::new_any()
    }
}

impl From<Structure> for Caps {
    fn from(s: Structure) -> Self {
        Caps::from_structure(s)
    }
}

impl FromIterator<Structure> for Caps {
    fn from_iter<I: IntoIterator<Item = Structure>>(iter: I) -> Self {
        Caps {
            any: false,
            structures: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return write!(f, "ANY");
        }
        if self.structures.is_empty() {
            return write!(f, "EMPTY");
        }
        for (i, s) in self.structures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{s}")?;
        }
        Ok(())
    }
}
