//! Identity element with callbacks for debugging.
//!
//! A pass-through element that allows inspection of buffers via callbacks.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{Element, ElementImpl, PropertyValue, StateChange, StateChangeResult};
use crate::elements::{invalid_value, unknown_property};
use crate::error::Result;
use crate::pad::{FlowError, Pad, PadFlags, PadTemplate};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Callback type for buffer inspection.
pub type BufferCallback = Arc<dyn Fn(&Element, &Buffer) + Send + Sync>;

/// Passes buffers through unchanged while counting them and calling
/// callbacks for inspection.
///
/// | property      | type | default |
/// |---------------|------|---------|
/// | `silent`      | bool | `true`; `false` logs every buffer |
/// | `sleep-time`  | int  | 0 (microseconds to sleep per buffer) |
/// | `error-after` | int  | -1 (fail with `Error` after this many buffers) |
///
/// # Example
///
/// ```rust
/// use padflow::element::Element;
/// use padflow::elements::Identity;
///
/// let identity = Element::new("tap", Identity::default());
/// identity.imp::<Identity>().unwrap().on_buffer(|element, buffer| {
///     println!("{}: {} bytes", element.name(), buffer.len());
/// });
/// ```
pub struct Identity {
    callbacks: RwLock<Vec<BufferCallback>>,
    count: AtomicU64,
    bytes: AtomicU64,
    silent: AtomicBool,
    sleep_us: AtomicU64,
    error_after: AtomicI64,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            count: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            silent: AtomicBool::new(true),
            sleep_us: AtomicU64::new(0),
            error_after: AtomicI64::new(-1),
        }
    }
}

impl Identity {
    /// Call `callback` for each buffer, on the streaming thread.
    pub fn on_buffer<F>(&self, callback: F)
    where
        F: Fn(&Element, &Buffer) + Send + Sync + 'static,
    {
        self.callbacks.write().unwrap().push(Arc::new(callback));
    }

    /// Get the number of buffers processed.
    pub fn buffer_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the total bytes processed.
    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Get statistics.
    pub fn stats(&self) -> IdentityStats {
        IdentityStats {
            buffer_count: self.buffer_count(),
            byte_count: self.byte_count(),
        }
    }

    /// Reset statistics.
    pub fn reset_stats(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }

    fn process(&self, element: &Element, buffer: &Buffer) -> std::result::Result<(), FlowError> {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes.fetch_add(buffer.len() as u64, Ordering::Relaxed);

        let error_after = self.error_after.load(Ordering::Relaxed);
        if error_after >= 0 && n > error_after as u64 {
            element.post_error(
                "Failed to process buffer",
                Some(format!("error-after={error_after} reached")),
            );
            return Err(FlowError::Error);
        }
        if !self.silent.load(Ordering::Relaxed) {
            info!(
                element = %element.name(),
                n,
                size = buffer.len(),
                pts = ?buffer.pts(),
                offset = ?buffer.offset(),
                "chain"
            );
        }

        let callbacks = self.callbacks.read().unwrap().clone();
        for cb in &callbacks {
            cb(element, buffer);
        }

        let sleep = self.sleep_us.load(Ordering::Relaxed);
        if sleep > 0 {
            std::thread::sleep(Duration::from_micros(sleep));
        }
        Ok(())
    }
}

impl ElementImpl for Identity {
    fn constructed(&self, element: &Element) {
        let sink = Pad::builder_from_template(&PadTemplate::sink(Caps::new_any()), None)
            .flags(PadFlags::PROXY_CAPS)
            .chain_function(|_pad, parent, buffer| {
                let element = parent.ok_or(FlowError::Error)?;
                let this = element.imp::<Identity>().ok_or(FlowError::Error)?;
                this.process(element, &buffer)?;
                element.static_pad("src").ok_or(FlowError::Error)?.push(buffer)
            })
            .build();
        let src = Pad::builder_from_template(&PadTemplate::src(Caps::new_any()), None)
            .flags(PadFlags::PROXY_CAPS)
            .build();
        for pad in [sink, src] {
            if let Err(e) = element.add_pad(pad) {
                tracing::error!(element = %element.name(), error = %e, "cannot add pad");
            }
        }
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        if transition == StateChange::ReadyToPaused {
            debug!(element = %element.name(), "resetting stats");
            self.reset_stats();
        }
        element.default_change_state(transition)
    }

    fn set_property(&self, element: &Element, name: &str, value: &PropertyValue) -> Result<()> {
        match name {
            "silent" => self.silent.store(
                value.as_bool().ok_or_else(|| invalid_value(name, value, "a boolean"))?,
                Ordering::Relaxed,
            ),
            "sleep-time" => self.sleep_us.store(
                value
                    .as_u64()
                    .ok_or_else(|| invalid_value(name, value, "a non-negative integer"))?,
                Ordering::Relaxed,
            ),
            "error-after" => self.error_after.store(
                value.as_i64().ok_or_else(|| invalid_value(name, value, "an integer"))?,
                Ordering::Relaxed,
            ),
            _ => return Err(unknown_property(element, name)),
        }
        Ok(())
    }

    fn property(&self, _element: &Element, name: &str) -> Option<PropertyValue> {
        Some(match name {
            "silent" => self.silent.load(Ordering::Relaxed).into(),
            "sleep-time" => PropertyValue::Integer(self.sleep_us.load(Ordering::Relaxed) as i64),
            "error-after" => self.error_after.load(Ordering::Relaxed).into(),
            _ => return None,
        })
    }

    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![
            PadTemplate::sink(Caps::new_any()),
            PadTemplate::src(Caps::new_any()),
        ]
    }
}

/// Statistics for Identity element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityStats {
    /// Number of buffers processed.
    pub buffer_count: u64,
    /// Total bytes processed.
    pub byte_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::State;
    use crate::pad::PadDirection;
    use std::sync::atomic::AtomicUsize;

    fn running_identity() -> (Element, Pad, Pad) {
        let identity = Element::new("identity", Identity::default());
        let upstream = Pad::new("up", PadDirection::Src);
        let downstream = Pad::builder("down", PadDirection::Sink)
            .chain_function(|_, _, _| Ok(()))
            .build();
        upstream
            .link(&identity.static_pad("sink").unwrap())
            .unwrap();
        identity
            .static_pad("src")
            .unwrap()
            .link(&downstream)
            .unwrap();
        upstream.set_active(true).unwrap();
        downstream.set_active(true).unwrap();
        identity.set_state(State::Playing).unwrap();
        (identity, upstream, downstream)
    }

    #[test]
    fn test_identity_passthrough_and_stats() {
        let (identity, upstream, _downstream) = running_identity();
        upstream.push(Buffer::from_slice(&[0; 100])).unwrap();
        upstream.push(Buffer::from_slice(&[0; 200])).unwrap();
        upstream.push(Buffer::from_slice(&[0; 50])).unwrap();

        let stats = identity.imp::<Identity>().unwrap().stats();
        assert_eq!(stats.buffer_count, 3);
        assert_eq!(stats.byte_count, 350);
        identity.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_identity_callback() {
        let (identity, upstream, _downstream) = running_identity();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        identity.imp::<Identity>().unwrap().on_buffer(move |_, _| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        for _ in 0..5 {
            upstream.push(Buffer::from_slice(b"x")).unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 5);
        identity.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_identity_error_after() {
        let (identity, upstream, _downstream) = running_identity();
        identity.set_property("error-after", 1).unwrap();
        assert!(upstream.push(Buffer::from_slice(b"a")).is_ok());
        assert_eq!(upstream.push(Buffer::from_slice(b"b")), Err(FlowError::Error));
        identity.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_identity_reset_on_pause() {
        let (identity, upstream, _downstream) = running_identity();
        upstream.push(Buffer::from_slice(b"a")).unwrap();
        identity.set_state(State::Ready).unwrap();
        identity.set_state(State::Paused).unwrap();
        assert_eq!(identity.imp::<Identity>().unwrap().buffer_count(), 0);
        identity.set_state(State::Null).unwrap();
    }
}
