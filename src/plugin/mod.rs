//! Plugins, element factories and the registry.
//!
//! A [`Plugin`] is a named bundle of [`ElementFactory`] values. Registering a
//! plugin in a [`Registry`] makes its factories available by name, which is
//! how launch descriptions find their elements.
//!
//! ```rust
//! use padflow::element::ElementImpl;
//! use padflow::plugin::{ElementFactory, Plugin, Rank, Registry};
//!
//! #[derive(Default)]
//! struct Noop;
//! impl ElementImpl for Noop {}
//!
//! let registry = Registry::new();
//! registry
//!     .register_plugin(
//!         Plugin::new("myplugin")
//!             .with_element(ElementFactory::for_impl::<Noop>("noop").with_rank(Rank::Primary)),
//!     )
//!     .unwrap();
//!
//! let element = registry.make_element("noop", None).unwrap();
//! assert_eq!(element.factory_name(), Some("noop"));
//! ```

mod descriptor;
mod registry;

pub use descriptor::{ElementConstructor, ElementFactory, Plugin, Rank};
pub use registry::Registry;
