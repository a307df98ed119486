//! Plugin and element-factory descriptions.

use crate::element::{Element, ElementImpl};
use crate::pad::PadTemplate;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Builds an element with the given (non-empty) name.
pub type ElementConstructor = Arc<dyn Fn(&str) -> Element + Send + Sync>;

/// Preference between factories offering the same kind of element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Rank {
    /// Never chosen automatically.
    #[default]
    None,
    /// Chosen only if nothing else fits.
    Marginal,
    /// Fallback choice.
    Secondary,
    /// Preferred choice.
    Primary,
}

/// A named way of creating one kind of element.
///
/// Elements created through a factory are named `<factory><N>` unless a name
/// is given, and remember the factory name.
#[derive(Clone)]
pub struct ElementFactory {
    name: String,
    long_name: String,
    klass: String,
    description: String,
    rank: Rank,
    templates: Vec<PadTemplate>,
    constructor: ElementConstructor,
    counter: Arc<AtomicU64>,
}

impl ElementFactory {
    /// A factory calling `constructor` for each new element.
    pub fn new<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&str) -> Element + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            long_name: name.clone(),
            name,
            klass: String::new(),
            description: String::new(),
            rank: Rank::None,
            templates: Vec::new(),
            constructor: Arc::new(constructor),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A factory for a default-constructible behaviour type. The pad
    /// templates are taken from a default instance.
    pub fn for_impl<T: ElementImpl + Default>(name: impl Into<String>) -> Self {
        Self::new(name, |element_name| Element::new(element_name, T::default()))
            .with_templates(T::default().pad_templates())
    }

    /// Human-readable name.
    pub fn with_long_name(mut self, long_name: impl Into<String>) -> Self {
        self.long_name = long_name.into();
        self
    }

    /// Classification such as `Source/Test` or `Sink`.
    pub fn with_klass(mut self, klass: impl Into<String>) -> Self {
        self.klass = klass.into();
        self
    }

    /// Free-form description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the rank.
    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    /// Advertise pad templates without instantiating an element.
    pub fn with_templates(mut self, templates: Vec<PadTemplate>) -> Self {
        self.templates = templates;
        self
    }

    /// Factory name, e.g. `testsrc`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable name.
    pub fn long_name(&self) -> &str {
        &self.long_name
    }

    /// Classification.
    pub fn klass(&self) -> &str {
        &self.klass
    }

    /// Description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Advertised pad templates.
    pub fn templates(&self) -> &[PadTemplate] {
        &self.templates
    }

    /// Create an element. `None` or an empty name picks `<factory><N>`.
    pub fn create(&self, name: Option<&str>) -> Element {
        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!(
                "{}{}",
                self.name,
                self.counter.fetch_add(1, Ordering::Relaxed)
            ),
        };
        let element = (self.constructor)(&name);
        element.set_factory_name(&self.name);
        element
    }
}

impl fmt::Debug for ElementFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementFactory")
            .field("name", &self.name)
            .field("klass", &self.klass)
            .field("rank", &self.rank)
            .field("templates", &self.templates.len())
            .finish()
    }
}

/// A named group of element factories.
#[derive(Debug, Clone)]
pub struct Plugin {
    name: String,
    version: String,
    description: String,
    license: String,
    factories: Vec<ElementFactory>,
}

impl Plugin {
    /// Empty plugin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: String::new(),
            license: String::new(),
            factories: Vec::new(),
        }
    }

    /// Set the version string.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the license.
    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    /// Add an element factory.
    pub fn with_element(mut self, factory: ElementFactory) -> Self {
        self.factories.push(factory);
        self
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// License.
    pub fn license(&self) -> &str {
        &self.license
    }

    /// The factories this plugin provides.
    pub fn factories(&self) -> &[ElementFactory] {
        &self.factories
    }
}
