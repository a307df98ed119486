//! CapsFilter: restricts the formats negotiated through it.

use crate::caps::Caps;
use crate::element::{Element, ElementImpl, PropertyValue};
use crate::elements::{invalid_value, unknown_property};
use crate::error::Result;
use crate::pad::{FlowError, Pad, PadFlags, PadTemplate};
use crate::query::Query;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Passes buffers through unchanged and limits caps queries and accepted
/// caps on both pads to the `caps` property (default `ANY`).
///
/// Inline caps in a launch description (`src ! video/x-raw, width=320 !
/// sink`) create one of these.
pub struct CapsFilter {
    filter: RwLock<Caps>,
}

impl Default for CapsFilter {
    fn default() -> Self {
        Self {
            filter: RwLock::new(Caps::new_any()),
        }
    }
}

impl CapsFilter {
    /// The current filter.
    pub fn filter(&self) -> Caps {
        self.filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn query(pad: &Pad, parent: Option<&Element>, query: &mut Query) -> bool {
        let Some(filter) = parent.and_then(|e| e.imp::<CapsFilter>()).map(CapsFilter::filter)
        else {
            return Pad::query_default(pad, parent, query);
        };
        if let Query::AcceptCaps { caps, result } = query
            && !caps.is_subset(&filter)
        {
            debug!(pad = %pad.path(), %caps, %filter, "caps outside filter");
            *result = false;
            return true;
        }
        let answered = Pad::query_default(pad, parent, query);
        if let Query::Caps {
            result: Some(result),
            ..
        } = query
        {
            *result = result.intersect(&filter);
        }
        answered
    }
}

impl ElementImpl for CapsFilter {
    fn constructed(&self, element: &Element) {
        let sink = Pad::builder_from_template(&PadTemplate::sink(Caps::new_any()), None)
            .flags(PadFlags::PROXY_CAPS)
            .chain_function(|_pad, parent, buffer| {
                parent
                    .and_then(|e| e.static_pad("src"))
                    .ok_or(FlowError::Error)?
                    .push(buffer)
            })
            .query_function(CapsFilter::query)
            .build();
        let src = Pad::builder_from_template(&PadTemplate::src(Caps::new_any()), None)
            .flags(PadFlags::PROXY_CAPS)
            .query_function(CapsFilter::query)
            .build();
        for pad in [sink, src] {
            if let Err(e) = element.add_pad(pad) {
                tracing::error!(element = %element.name(), error = %e, "cannot add pad");
            }
        }
    }

    fn set_property(&self, element: &Element, name: &str, value: &PropertyValue) -> Result<()> {
        match name {
            "caps" => {
                let caps = value
                    .as_caps()
                    .ok_or_else(|| invalid_value(name, value, "caps"))?;
                debug!(element = %element.name(), %caps, "new filter");
                *self.filter.write().unwrap_or_else(PoisonError::into_inner) = caps;
                for pad in element.src_pads() {
                    pad.mark_reconfigure();
                }
                Ok(())
            }
            _ => Err(unknown_property(element, name)),
        }
    }

    fn property(&self, _element: &Element, name: &str) -> Option<PropertyValue> {
        (name == "caps").then(|| self.filter().into())
    }

    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![
            PadTemplate::sink(Caps::new_any()),
            PadTemplate::src(Caps::new_any()),
        ]
    }
}
