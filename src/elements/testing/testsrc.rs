//! TestSrc: generates test pattern buffers.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::element::{
    Element, ElementFlags, ElementImpl, PropertyValue, StateChange, StateChangeResult,
    StateChangeSuccess,
};
use crate::elements::base_src::{StreamHeader, start_push_loop};
use crate::elements::{invalid_value, unknown_property};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::pad::{FlowError, Pad, PadMode, PadTemplate};
use crate::query::Query;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Test pattern types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPattern {
    /// All zeros.
    #[default]
    Zero,
    /// All ones (0xFF).
    Ones,
    /// Incrementing bytes (0, 1, 2, ..., 255, 0, 1, ...).
    Counter,
    /// Pseudo-random data, reproducible through `seed`.
    Random,
    /// Alternating 0x55/0xAA pattern.
    Alternating,
    /// Buffer sequence number repeated to fill the buffer.
    Sequence,
}

impl TestPattern {
    fn name(self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Ones => "ones",
            Self::Counter => "counter",
            Self::Random => "random",
            Self::Alternating => "alternating",
            Self::Sequence => "sequence",
        }
    }
}

impl fmt::Display for TestPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TestPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "zero" => Self::Zero,
            "ones" => Self::Ones,
            "counter" => Self::Counter,
            "random" => Self::Random,
            "alternating" => Self::Alternating,
            "sequence" => Self::Sequence,
            _ => {
                return Err(Error::InvalidProperty {
                    property: "pattern".to_string(),
                    reason: format!("unknown pattern '{s}'"),
                });
            }
        })
    }
}

#[derive(Debug, Clone)]
struct Settings {
    /// Negative for unlimited.
    num_buffers: i64,
    blocksize: u32,
    pattern: TestPattern,
    is_live: bool,
    caps: Option<Caps>,
    /// Bytes per second, 0 for unlimited.
    rate: u64,
    seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_buffers: -1,
            blocksize: 4096,
            pattern: TestPattern::default(),
            is_live: false,
            caps: None,
            rate: 0,
            seed: 0x853c_49e6_748f_ea9b,
        }
    }
}

#[derive(Debug, Default)]
struct Generator {
    sequence: u64,
    offset: u64,
    counter: u8,
    rng_state: u64,
    started: Option<Instant>,
    last: Option<Instant>,
}

/// A source that generates test pattern buffers on its own streaming thread.
///
/// | property      | type   | default |
/// |---------------|--------|---------|
/// | `num-buffers` | int    | -1 (unlimited) |
/// | `blocksize`   | int    | 4096 |
/// | `pattern`     | string | `zero` |
/// | `is-live`     | bool   | `false` |
/// | `caps`        | caps   | none |
/// | `rate`        | int    | 0 (bytes per second, 0 = unlimited) |
/// | `seed`        | int    | fixed |
///
/// A live source produces only while `Playing` and reports `NoPreroll`
/// when going to `Paused`. Buffers carry their byte offset; live buffers
/// also carry the time since the first buffer as timestamp.
#[derive(Debug, Default)]
pub struct TestSrc {
    settings: Mutex<Settings>,
    generator: Mutex<Generator>,
}

impl TestSrc {
    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generator(&self) -> MutexGuard<'_, Generator> {
        self.generator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers produced since the last `ReadyToPaused`.
    pub fn buffers_produced(&self) -> u64 {
        self.generator().sequence
    }

    /// Bytes produced since the last `ReadyToPaused`.
    pub fn bytes_produced(&self) -> u64 {
        self.generator().offset
    }

    fn is_live(&self) -> bool {
        self.settings().is_live
    }

    fn reset(&self) {
        let seed = self.settings().seed;
        *self.generator() = Generator {
            rng_state: seed,
            ..Generator::default()
        };
    }

    fn start(&self, pad: &Pad) -> Result<()> {
        let header = StreamHeader {
            caps: self.settings().caps.clone(),
            format: Format::Bytes,
        };
        start_push_loop(pad, header, |element, _pad| {
            element
                .imp::<TestSrc>()
                .ok_or(FlowError::Error)?
                .create()
        })
    }

    fn create(&self) -> std::result::Result<Buffer, FlowError> {
        let settings = self.settings().clone();
        let mut generator = self.generator();
        if settings.num_buffers >= 0 && generator.sequence >= settings.num_buffers as u64 {
            debug!(buffers = generator.sequence, "num-buffers reached");
            return Err(FlowError::Eos);
        }

        let pause = generator.rate_limit_delay(settings.rate, settings.blocksize);
        if let Some(pause) = pause {
            drop(generator);
            std::thread::sleep(pause);
            generator = self.generator();
        }

        let mut data = vec![0u8; settings.blocksize as usize];
        generator.fill(settings.pattern, &mut data);

        let now = Instant::now();
        generator.last = Some(now);
        let started = *generator.started.get_or_insert(now);

        let mut buffer = Buffer::new(data).with_offset(generator.offset);
        if settings.is_live {
            buffer.set_pts(Some(ClockTime::from_nanos(
                now.duration_since(started).as_nanos() as u64,
            )));
        }
        generator.sequence += 1;
        generator.offset += settings.blocksize as u64;
        Ok(buffer)
    }

    fn answer_query(&self, query: &mut Query) -> bool {
        let settings = self.settings().clone();
        let generator = self.generator();
        match query {
            Query::Position { format, result } => {
                *result = match format {
                    Format::Buffers | Format::Default => Some(generator.sequence),
                    Format::Bytes => Some(generator.offset),
                    _ => return false,
                };
                true
            }
            Query::Duration { format, result } => {
                if settings.num_buffers < 0 {
                    return false;
                }
                let n = settings.num_buffers as u64;
                *result = match format {
                    Format::Buffers | Format::Default => Some(n),
                    Format::Bytes => Some(n * settings.blocksize as u64),
                    _ => return false,
                };
                true
            }
            _ => false,
        }
    }
}

impl Generator {
    fn next_random(&mut self) -> u64 {
        let mut x = self.rng_state.max(1);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }

    fn fill(&mut self, pattern: TestPattern, data: &mut [u8]) {
        match pattern {
            TestPattern::Zero => data.fill(0),
            TestPattern::Ones => data.fill(0xFF),
            TestPattern::Counter => {
                for byte in data.iter_mut() {
                    *byte = self.counter;
                    self.counter = self.counter.wrapping_add(1);
                }
            }
            TestPattern::Random => {
                for chunk in data.chunks_mut(8) {
                    let bytes = self.next_random().to_le_bytes();
                    chunk.copy_from_slice(&bytes[..chunk.len()]);
                }
            }
            TestPattern::Alternating => {
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = if i % 2 == 0 { 0x55 } else { 0xAA };
                }
            }
            TestPattern::Sequence => {
                let seq = self.sequence.to_le_bytes();
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = seq[i % 8];
                }
            }
        }
    }

    fn rate_limit_delay(&self, rate: u64, blocksize: u32) -> Option<Duration> {
        if rate == 0 {
            return None;
        }
        let last = self.last?;
        let expected = Duration::from_secs_f64(blocksize as f64 / rate as f64);
        expected.checked_sub(last.elapsed())
    }
}

impl ElementImpl for TestSrc {
    fn constructed(&self, element: &Element) {
        element.set_element_flags(ElementFlags::SOURCE);
        let src = Pad::builder_from_template(&PadTemplate::src(Caps::new_any()), None)
            .activatemode_function(|pad, parent, mode, active| {
                let Some(this) = parent.and_then(|e| e.imp::<TestSrc>()) else {
                    return false;
                };
                match (mode, active) {
                    (PadMode::Push, true) if this.is_live() => true,
                    (PadMode::Push, true) => match this.start(pad) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(pad = %pad.path(), error = %e, "cannot start streaming");
                            false
                        }
                    },
                    (PadMode::Push, false) => {
                        pad.stop_task();
                        true
                    }
                    (_, _) => false,
                }
            })
            .query_function(|pad, parent, query| {
                if let Some(this) = parent.and_then(|e| e.imp::<TestSrc>())
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
        let src = element.static_pad("src");
        match transition {
            StateChange::ReadyToPaused => self.reset(),
            StateChange::PausedToPlaying if self.is_live() => {
                if let Some(pad) = &src
                    && let Err(e) = self.start(pad)
                {
                    warn!(element = %element.name(), error = %e, "cannot start live streaming");
                    return Err(crate::element::StateChangeError);
                }
            }
            StateChange::PlayingToPaused if self.is_live() => {
                if let Some(pad) = &src {
                    let _ = pad.pause_task();
                }
            }
            _ => {}
        }

        let ret = element.default_change_state(transition)?;

        if transition == StateChange::ReadyToNull
            && let Some(pad) = &src
        {
            pad.join_task();
        }
        match transition {
            StateChange::ReadyToPaused | StateChange::PlayingToPaused if self.is_live() => {
                Ok(StateChangeSuccess::NoPreroll)
            }
            _ => Ok(ret),
        }
    }

    fn set_property(&self, element: &Element, name: &str, value: &PropertyValue) -> Result<()> {
        let mut settings = self.settings();
        match name {
            "num-buffers" => {
                settings.num_buffers = value
                    .as_i64()
                    .ok_or_else(|| invalid_value(name, value, "an integer"))?;
            }
            "blocksize" => {
                settings.blocksize = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .filter(|v| *v > 0)
                    .ok_or_else(|| invalid_value(name, value, "a positive integer"))?;
            }
            "pattern" => settings.pattern = value.as_string().parse()?,
            "is-live" => {
                settings.is_live = value
                    .as_bool()
                    .ok_or_else(|| invalid_value(name, value, "a boolean"))?;
            }
            "caps" => {
                settings.caps = Some(
                    value
                        .as_caps()
                        .ok_or_else(|| invalid_value(name, value, "caps"))?,
                );
            }
            "rate" => {
                settings.rate = value
                    .as_u64()
                    .ok_or_else(|| invalid_value(name, value, "a non-negative integer"))?;
            }
            "seed" => {
                settings.seed = value
                    .as_u64()
                    .ok_or_else(|| invalid_value(name, value, "a non-negative integer"))?;
            }
            _ => return Err(unknown_property(element, name)),
        }
        Ok(())
    }

    fn property(&self, _element: &Element, name: &str) -> Option<PropertyValue> {
        let settings = self.settings();
        Some(match name {
            "num-buffers" => settings.num_buffers.into(),
            "blocksize" => settings.blocksize.into(),
            "pattern" => settings.pattern.name().into(),
            "is-live" => settings.is_live.into(),
            "caps" => settings.caps.clone()?.into(),
            "rate" => PropertyValue::Integer(settings.rate as i64),
            "seed" => PropertyValue::Integer(settings.seed as i64),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns() {
        let mut generator = Generator {
            rng_state: 7,
            ..Generator::default()
        };
        let mut data = [0u8; 6];

        generator.fill(TestPattern::Ones, &mut data);
        assert_eq!(data, [0xFF; 6]);
        generator.fill(TestPattern::Counter, &mut data);
        assert_eq!(data, [0, 1, 2, 3, 4, 5]);
        generator.fill(TestPattern::Alternating, &mut data);
        assert_eq!(data, [0x55, 0xAA, 0x55, 0xAA, 0x55, 0xAA]);

        let mut a = [0u8; 20];
        let mut b = [0u8; 20];
        Generator { rng_state: 7, ..Generator::default() }.fill(TestPattern::Random, &mut a);
        Generator { rng_state: 7, ..Generator::default() }.fill(TestPattern::Random, &mut b);
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 20]);
    }

    #[test]
    fn pattern_names() {
        assert_eq!("random".parse::<TestPattern>().unwrap(), TestPattern::Random);
        assert_eq!(TestPattern::Sequence.to_string(), "sequence");
        assert!("plaid".parse::<TestPattern>().is_err());
    }

    #[test]
    fn properties() {
        let src = Element::new("src", TestSrc::default());
        src.set_property("num-buffers", 5).unwrap();
        src.set_property("pattern", "counter").unwrap();
        src.set_property("caps", "audio/x-raw").unwrap();
        assert_eq!(src.property("num-buffers"), Some(PropertyValue::Integer(5)));
        assert_eq!(
            src.property("pattern"),
            Some(PropertyValue::String("counter".into()))
        );
        assert!(src.property("caps").is_some());
        assert!(src.set_property("blocksize", 0).is_err());
        assert!(src.set_property("caps", "not caps ,,").is_err());
    }

    #[test]
    fn creates_until_num_buffers() {
        let src = TestSrc::default();
        {
            let mut s = src.settings();
            s.num_buffers = 2;
            s.blocksize = 16;
        }
        src.reset();

        let first = src.create().unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(first.offset(), Some(0));
        assert_eq!(src.create().unwrap().offset(), Some(16));
        assert_eq!(src.create().unwrap_err(), FlowError::Eos);

        let mut q = Query::position(Format::Buffers);
        assert!(src.answer_query(&mut q));
        assert!(matches!(q, Query::Position { result: Some(2), .. }));
        let mut q = Query::duration(Format::Bytes);
        assert!(src.answer_query(&mut q));
        assert!(matches!(q, Query::Duration { result: Some(32), .. }));
    }
}
