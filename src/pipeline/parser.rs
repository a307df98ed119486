//! Launch description parser.
//!
//! ```text
//! testsrc num-buffers=100 is-live=false ! identity name=id0 ! nullsink
//! testsrc ! video/x-raw, width=320, height=240 ! nullsink
//! ```
//!
//! # Syntax
//!
//! - Elements are separated by `!` and linked in order
//! - `key=value` pairs after a factory name are element properties;
//!   `name=...` names the element instead of setting a property
//! - Values are quoted strings, booleans, numbers, or bare words
//! - A segment starting with `type/subtype` is inline caps and becomes a
//!   `capsfilter` element with that `caps` property

use crate::caps::Caps;
use crate::element::PropertyValue;
use crate::error::{Error, Result};
use winnow::Parser;
use winnow::ascii::{alpha1, digit1, multispace0};
use winnow::combinator::{alt, delimited, opt, repeat, separated};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

/// Factory used for inline caps segments.
pub const CAPSFILTER_FACTORY: &str = "capsfilter";

/// One element of a launch description.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedElement {
    /// Factory name, e.g. `testsrc`.
    pub factory: String,
    /// Properties in the order they were written.
    pub properties: Vec<(String, PropertyValue)>,
}

impl ParsedElement {
    /// The value of `name=`, if given.
    pub fn element_name(&self) -> Option<String> {
        self.property("name").map(PropertyValue::as_string)
    }

    /// Look up a property by key. The last occurrence wins.
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// A parsed launch description.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPipeline {
    /// The elements in link order, upstream first.
    pub elements: Vec<ParsedElement>,
}

/// Parse a launch description.
///
/// ```rust
/// use padflow::pipeline::parse_pipeline;
///
/// let parsed = parse_pipeline("testsrc num-buffers=10 ! identity ! nullsink").unwrap();
/// assert_eq!(parsed.elements.len(), 3);
/// assert_eq!(parsed.elements[0].factory, "testsrc");
/// ```
pub fn parse_pipeline(input: &str) -> Result<ParsedPipeline> {
    pipeline
        .parse(input.trim())
        .map_err(|e| Error::Parse(format!("'{input}': {e}")))
}

fn pipeline(input: &mut &str) -> WResult<ParsedPipeline> {
    let elements = separated(1.., segment, link_separator).parse_next(input)?;

    multispace0.parse_next(input)?;
    if !input.is_empty() {
        return Err(ContextError::new());
    }

    Ok(ParsedPipeline { elements })
}

fn segment(input: &mut &str) -> WResult<ParsedElement> {
    let _ = multispace0.parse_next(input)?;
    alt((inline_caps, element)).parse_next(input)
}

fn element(input: &mut &str) -> WResult<ParsedElement> {
    let factory: &str = identifier.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;

    let properties: Vec<(String, PropertyValue)> = repeat(0.., property).parse_next(input)?;

    Ok(ParsedElement {
        factory: factory.to_string(),
        properties,
    })
}

/// `type/subtype[, field=value...]` up to the next unquoted `!`.
fn inline_caps(input: &mut &str) -> WResult<ParsedElement> {
    let checkpoint = *input;
    let media: &str = take_while(1.., |c: char| {
        c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '+')
    })
    .parse_next(input)?;
    if media.is_empty() || !input.starts_with('/') {
        *input = checkpoint;
        return Err(ContextError::new());
    }
    *input = checkpoint;

    let text = caps_text.parse_next(input)?;
    let caps: Caps = text.trim().parse().map_err(|_| ContextError::new())?;

    Ok(ParsedElement {
        factory: CAPSFILTER_FACTORY.to_string(),
        properties: vec![("caps".to_string(), PropertyValue::Caps(caps))],
    })
}

fn caps_text<'a>(input: &mut &'a str) -> WResult<&'a str> {
    repeat::<_, _, (), _, _>(
        1..,
        alt((
            delimited('"', take_till(0.., '"'), '"'),
            take_till(1.., ['!', '"']),
        )),
    )
    .take()
    .parse_next(input)
}

fn link_separator(input: &mut &str) -> WResult<()> {
    let _ = multispace0.parse_next(input)?;
    let _ = '!'.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    Ok(())
}

fn identifier<'a>(input: &mut &'a str) -> WResult<&'a str> {
    (
        alt((alpha1::<_, ContextError>, "_")),
        take_while(0.., |c: char| c.is_alphanumeric() || c == '_' || c == '-'),
    )
        .take()
        .parse_next(input)
}

/// `key=value`; consumes nothing unless an `=` follows the key.
fn property(input: &mut &str) -> WResult<(String, PropertyValue)> {
    let _ = multispace0.parse_next(input)?;
    let checkpoint = *input;

    let key: &str = match identifier.parse_next(input) {
        Ok(k) => k,
        Err(_) => {
            *input = checkpoint;
            return Err(ContextError::new());
        }
    };

    let _ = multispace0.parse_next(input)?;
    if !input.starts_with('=') {
        *input = checkpoint;
        return Err(ContextError::new());
    }
    let _ = '='.parse_next(input)?;

    let _ = multispace0.parse_next(input)?;
    let value = property_value.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;

    Ok((key.to_string(), value))
}

fn property_value(input: &mut &str) -> WResult<PropertyValue> {
    alt((
        quoted_string.map(PropertyValue::String),
        boolean.map(PropertyValue::Bool),
        float.map(PropertyValue::Float),
        integer.map(PropertyValue::Integer),
        bare_string.map(PropertyValue::String),
    ))
    .parse_next(input)
}

fn quoted_string(input: &mut &str) -> WResult<String> {
    alt((
        delimited('"', take_till(0.., '"'), '"'),
        delimited('\'', take_till(0.., '\''), '\''),
    ))
    .map(|s: &str| s.to_string())
    .parse_next(input)
}

/// A boolean keyword not followed by more word characters.
fn boolean(input: &mut &str) -> WResult<bool> {
    let checkpoint = *input;
    let value = alt((
        "true".map(|_| true),
        "false".map(|_| false),
        "yes".map(|_| true),
        "no".map(|_| false),
    ))
    .parse_next(input)?;
    if input
        .chars()
        .next()
        .is_some_and(|c| !c.is_whitespace() && c != '!')
    {
        *input = checkpoint;
        return Err(ContextError::new());
    }
    Ok(value)
}

fn integer(input: &mut &str) -> WResult<i64> {
    let checkpoint = *input;
    let negative = opt('-').parse_next(input)?;
    let digits: &str = digit1.parse_next(input)?;

    if input
        .chars()
        .next()
        .is_some_and(|c| !c.is_whitespace() && c != '!')
    {
        *input = checkpoint;
        return Err(ContextError::new());
    }

    let value: i64 = digits.parse().map_err(|_| ContextError::new())?;
    Ok(if negative.is_some() { -value } else { value })
}

fn float(input: &mut &str) -> WResult<f64> {
    let checkpoint = *input;
    let text: &str = (opt('-'), digit1, '.', digit1).take().parse_next(input)?;
    match text.parse() {
        Ok(value) => Ok(value),
        Err(_) => {
            *input = checkpoint;
            Err(ContextError::new())
        }
    }
}

/// An unquoted word, ending at whitespace or `!`.
fn bare_string(input: &mut &str) -> WResult<String> {
    take_while(1.., |c: char| !c.is_whitespace() && c != '!' && c != '=')
        .map(|s: &str| s.to_string())
        .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_element() {
        let parsed = parse_pipeline("nullsink").unwrap();
        assert_eq!(parsed.elements.len(), 1);
        assert_eq!(parsed.elements[0].factory, "nullsink");
        assert!(parsed.elements[0].properties.is_empty());
    }

    #[test]
    fn chain_with_properties() {
        let parsed =
            parse_pipeline("testsrc num-buffers=100 is-live=false ! identity ! nullsink").unwrap();
        assert_eq!(parsed.elements.len(), 3);

        let src = &parsed.elements[0];
        assert_eq!(src.factory, "testsrc");
        assert_eq!(src.property("num-buffers"), Some(&PropertyValue::Integer(100)));
        assert_eq!(src.property("is-live"), Some(&PropertyValue::Bool(false)));
        assert_eq!(parsed.elements[1].factory, "identity");
        assert_eq!(parsed.elements[2].factory, "nullsink");
    }

    #[test]
    fn value_kinds() {
        let parsed = parse_pipeline(
            r#"src a="hello world" b='x' c=-42 d=2.5 e=yes f=some/path.bin g=12px"#,
        )
        .unwrap();
        let e = &parsed.elements[0];
        assert_eq!(e.property("a"), Some(&PropertyValue::String("hello world".into())));
        assert_eq!(e.property("b"), Some(&PropertyValue::String("x".into())));
        assert_eq!(e.property("c"), Some(&PropertyValue::Integer(-42)));
        assert_eq!(e.property("d"), Some(&PropertyValue::Float(2.5)));
        assert_eq!(e.property("e"), Some(&PropertyValue::Bool(true)));
        assert_eq!(e.property("f"), Some(&PropertyValue::String("some/path.bin".into())));
        assert_eq!(e.property("g"), Some(&PropertyValue::String("12px".into())));
    }

    #[test]
    fn keyword_prefix_is_a_bare_word() {
        let parsed = parse_pipeline("src mode=nothing flag=trueish").unwrap();
        let e = &parsed.elements[0];
        assert_eq!(e.property("mode"), Some(&PropertyValue::String("nothing".into())));
        assert_eq!(e.property("flag"), Some(&PropertyValue::String("trueish".into())));
    }

    #[test]
    fn whitespace_is_optional() {
        let tight = parse_pipeline("a x=1!b!c").unwrap();
        let loose = parse_pipeline("  a   x = 1   !   b  !  c  ").unwrap();
        assert_eq!(tight, loose);
        assert_eq!(tight.elements.len(), 3);
    }

    #[test]
    fn name_property() {
        let parsed = parse_pipeline("identity name=tap ! nullsink").unwrap();
        assert_eq!(parsed.elements[0].element_name().as_deref(), Some("tap"));
        assert_eq!(parsed.elements[1].element_name(), None);
    }

    #[test]
    fn inline_caps_become_capsfilter() {
        let parsed =
            parse_pipeline("testsrc ! video/x-raw, width=320, height=240 ! nullsink").unwrap();
        assert_eq!(parsed.elements.len(), 3);

        let filter = &parsed.elements[1];
        assert_eq!(filter.factory, CAPSFILTER_FACTORY);
        let caps = filter.property("caps").and_then(PropertyValue::as_caps).unwrap();
        let s = caps.structure(0).unwrap();
        assert_eq!(s.name(), "video/x-raw");
        assert_eq!(s.get_int("width"), Some(320));
        assert_eq!(s.get_int("height"), Some(240));
    }

    #[test]
    fn inline_caps_at_the_end() {
        let parsed = parse_pipeline("testsrc ! audio/x-raw").unwrap();
        assert_eq!(parsed.elements[1].factory, CAPSFILTER_FACTORY);
    }

    #[test]
    fn errors() {
        assert!(matches!(parse_pipeline(""), Err(Error::Parse(_))));
        assert!(matches!(parse_pipeline("!"), Err(Error::Parse(_))));
        assert!(matches!(parse_pipeline("a ! ! b"), Err(Error::Parse(_))));
        assert!(matches!(parse_pipeline("a !"), Err(Error::Parse(_))));
        assert!(matches!(parse_pipeline("a ! video/x-raw, width=[ 1"), Err(Error::Parse(_))));
    }
}
