//! Turning a parsed description into a linked pipeline.

use crate::element::Element;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::pipeline::parser::{ParsedElement, ParsedPipeline};
use crate::plugin::Registry;
use tracing::{debug, instrument};

/// Create every element of `parsed` from `registry`, add them to a new
/// pipeline and link them in order.
///
/// Properties are applied in the order written, except `name` which names
/// the element. The first unknown factory, property or failed link aborts
/// the build; the partly built pipeline is dropped.
#[instrument(level = "debug", skip_all, fields(elements = parsed.elements.len()))]
pub fn build_pipeline(registry: &Registry, parsed: &ParsedPipeline) -> Result<Pipeline> {
    let pipeline = Pipeline::new("");
    let mut previous: Option<Element> = None;

    for desc in &parsed.elements {
        let element = create(registry, desc)?;
        pipeline.add(&element)?;
        if let Some(prev) = &previous {
            debug!(src = %prev.name(), sink = %element.name(), "linking");
            prev.link(&element)?;
        }
        previous = Some(element);
    }
    Ok(pipeline)
}

fn create(registry: &Registry, desc: &ParsedElement) -> Result<Element> {
    let name = desc.element_name();
    let element = registry.make_element(&desc.factory, name.as_deref())?;
    for (key, value) in desc.properties.iter().filter(|(k, _)| k != "name") {
        element.set_property(key, value.clone())?;
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements;
    use crate::error::Error;
    use crate::pipeline::parse_pipeline;

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.register_plugin(elements::plugin()).unwrap();
        registry
    }

    fn build(description: &str) -> Result<Pipeline> {
        build_pipeline(&registry(), &parse_pipeline(description)?)
    }

    #[test]
    fn builds_and_links_chain() {
        let pipeline = build("testsrc name=src num-buffers=2 ! identity ! nullsink name=out").unwrap();
        assert_eq!(pipeline.children().len(), 3);

        let src = pipeline.by_name("src").unwrap();
        assert_eq!(src.property("num-buffers").and_then(|v| v.as_i64()), Some(2));
        let out = pipeline.by_name("out").unwrap();
        assert!(out.static_pad("sink").unwrap().is_linked());
        assert!(src.static_pad("src").unwrap().is_linked());
    }

    #[test]
    fn inline_caps_add_a_capsfilter() {
        let pipeline = build("testsrc ! audio/x-raw, rate=8000 ! nullsink").unwrap();
        let filter = pipeline
            .children()
            .into_iter()
            .find(|e| e.factory_name() == Some("capsfilter"))
            .unwrap();
        let caps = filter.property("caps").and_then(|v| v.as_caps()).unwrap();
        assert_eq!(caps.structure(0).unwrap().get_int("rate"), Some(8000));
    }

    #[test]
    fn unknown_factory() {
        assert!(matches!(
            build("testsrc ! nosuchelement"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn unknown_property() {
        assert!(matches!(
            build("testsrc bogus=1 ! nullsink"),
            Err(Error::UnknownProperty { .. })
        ));
    }

    #[test]
    fn sink_cannot_link_downstream() {
        assert!(matches!(
            build("nullsink ! nullsink"),
            Err(Error::PadLink(_))
        ));
    }
}
