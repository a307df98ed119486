//! DataSrc: serves an in-memory byte string.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{Element, ElementFlags, ElementImpl, PropertyValue, StateChange, StateChangeResult};
use crate::elements::base_src::{StreamHeader, start_push_loop};
use crate::elements::{invalid_value, unknown_property};
use crate::error::Result;
use crate::format::Format;
use crate::pad::{FlowError, Pad, PadMode, PadTemplate};
use crate::query::Query;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{trace, warn};

/// A source serving bytes from memory, in push or pull mode.
///
/// In pull mode downstream reads any range; in push mode the data is sent
/// in `blocksize` chunks followed by EOS.
///
/// | property    | type   | default |
/// |-------------|--------|---------|
/// | `data`      | string | empty |
/// | `blocksize` | int    | 4096 |
///
/// ```rust
/// use padflow::element::Element;
/// use padflow::elements::DataSrc;
///
/// let src = Element::new("src", DataSrc::default());
/// src.imp::<DataSrc>().unwrap().set_data(&b"hello world"[..]);
/// assert_eq!(src.imp::<DataSrc>().unwrap().len(), 11);
/// ```
pub struct DataSrc {
    data: RwLock<Bytes>,
    blocksize: AtomicU32,
    position: AtomicU64,
}

impl Default for DataSrc {
    fn default() -> Self {
        Self {
            data: RwLock::new(Bytes::new()),
            blocksize: AtomicU32::new(4096),
            position: AtomicU64::new(0),
        }
    }
}

impl DataSrc {
    /// Replace the served data.
    pub fn set_data(&self, data: impl Into<Bytes>) {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data.into();
    }

    /// The served data.
    pub fn data(&self) -> Bytes {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Length of the served data.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Whether there is no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `size` bytes at `offset`.
    pub fn read(&self, offset: u64, size: u32) -> std::result::Result<Buffer, FlowError> {
        let data = self.data();
        let len = data.len() as u64;
        if offset >= len {
            return Err(FlowError::Eos);
        }
        let end = len.min(offset + size as u64);
        trace!(offset, end, "reading range");
        Ok(Buffer::new(data.slice(offset as usize..end as usize)).with_offset(offset))
    }

    fn next_block(&self) -> std::result::Result<Buffer, FlowError> {
        let offset = self.position.load(Ordering::Relaxed);
        let buffer = self.read(offset, self.blocksize.load(Ordering::Relaxed))?;
        self.position
            .store(offset + buffer.len() as u64, Ordering::Relaxed);
        Ok(buffer)
    }

    fn answer_query(&self, query: &mut Query) -> bool {
        match query {
            Query::Position {
                format: Format::Bytes,
                result,
            } => {
                *result = Some(self.position.load(Ordering::Relaxed));
                true
            }
            Query::Duration {
                format: Format::Bytes,
                result,
            } => {
                *result = Some(self.len() as u64);
                true
            }
            _ => false,
        }
    }
}

impl ElementImpl for DataSrc {
    fn constructed(&self, element: &Element) {
        element.set_element_flags(ElementFlags::SOURCE);
        let src = Pad::builder_from_template(&PadTemplate::src(Caps::new_any()), None)
            .getrange_function(|_pad, parent, offset, size| {
                parent
                    .and_then(|e| e.imp::<DataSrc>())
                    .ok_or(FlowError::Error)?
                    .read(offset, size)
            })
            .activatemode_function(|pad, _parent, mode, active| match (mode, active) {
                (PadMode::Push, true) => {
                    let header = StreamHeader {
                        caps: None,
                        format: Format::Bytes,
                    };
                    let started = start_push_loop(pad, header, |element, _pad| {
                        element.imp::<DataSrc>().ok_or(FlowError::Error)?.next_block()
                    });
                    if let Err(e) = &started {
                        warn!(pad = %pad.path(), error = %e, "cannot start streaming");
                    }
                    started.is_ok()
                }
                (PadMode::Push, false) => {
                    pad.stop_task();
                    true
                }
                (_, _) => true,
            })
            .query_function(|pad, parent, query| {
                if let Some(this) = parent.and_then(|e| e.imp::<DataSrc>())
                    && this.answer_query(query)
                {
                    return true;
                }
                Pad::query_default(pad, parent, query)
            })
            .build();
        if let Err(e) = element.add_pad(src) {
            tracing::error!(element = %element.name(), error = %e, "cannot add src pad");
        }
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        if transition == StateChange::ReadyToPaused {
            self.position.store(0, Ordering::Relaxed);
        }
        let ret = element.default_change_state(transition)?;
        if transition == StateChange::ReadyToNull
            && let Some(pad) = element.static_pad("src")
        {
            pad.join_task();
        }
        Ok(ret)
    }

    fn set_property(&self, element: &Element, name: &str, value: &PropertyValue) -> Result<()> {
        match name {
            "data" => self.set_data(value.as_string().into_bytes()),
            "blocksize" => self.blocksize.store(
                value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .filter(|v| *v > 0)
                    .ok_or_else(|| invalid_value(name, value, "a positive integer"))?,
                Ordering::Relaxed,
            ),
            _ => return Err(unknown_property(element, name)),
        }
        Ok(())
    }

    fn property(&self, _element: &Element, name: &str) -> Option<PropertyValue> {
        Some(match name {
            "data" => String::from_utf8_lossy(&self.data()).into_owned().into(),
            "blocksize" => self.blocksize.load(Ordering::Relaxed).into(),
            _ => return None,
        })
    }

    fn query(&self, element: &Element, query: &mut Query) -> bool {
        self.answer_query(query) || element.default_query(query)
    }

    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::src(Caps::new_any())]
    }
}
