//! Textual caps parsing.
//!
//! ```text
//! video/x-raw, format=(string){ I420, RGB }, width=[ 16, 4096 ]; audio/x-raw
//! ANY
//! EMPTY
//! ```
//!
//! Type annotations such as `(int)` are accepted and ignored; the value
//! syntax decides the type.

use super::{Caps, CapsValue, Structure, Value};
use crate::error::Error;
use std::str::FromStr;
use winnow::Parser;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, delimited, opt, separated};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

impl FromStr for Caps {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        caps.parse(s.trim())
            .map_err(|e| Error::Caps(format!("'{s}': {e}")))
    }
}

impl FromStr for Structure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        structure
            .parse(s.trim())
            .map_err(|e| Error::Caps(format!("'{s}': {e}")))
    }
}

fn caps(input: &mut &str) -> WResult<Caps> {
    if input.eq_ignore_ascii_case("ANY") {
        *input = "";
        return Ok(Caps::new_any());
    }
    if input.eq_ignore_ascii_case("EMPTY") || input.is_empty() {
        *input = "";
        return Ok(Caps::new_empty());
    }

    let structures: Vec<Structure> = separated(1.., structure, separator(';')).parse_next(input)?;
    let _ = opt(separator(';')).parse_next(input)?;
    Ok(structures.into_iter().collect())
}

fn structure(input: &mut &str) -> WResult<Structure> {
    let name: &str = media_type.parse_next(input)?;
    let mut out = Structure::new(name);

    loop {
        let checkpoint = *input;
        if separator(',').parse_next(input).is_err() {
            *input = checkpoint;
            break;
        }
        let (key, value) = field.parse_next(input)?;
        out.set(key, value);
    }

    Ok(out)
}

fn separator<'a>(mut c: char) -> impl Parser<&'a str, (), ContextError> {
    move |input: &mut &'a str| -> WResult<()> {
        let _ = multispace0.parse_next(input)?;
        let _ = c.parse_next(input)?;
        let _ = multispace0.parse_next(input)?;
        Ok(())
    }
}

fn media_type<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '+')
    })
    .parse_next(input)
}

fn identifier<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .parse_next(input)
}

fn field(input: &mut &str) -> WResult<(String, CapsValue<Value>)> {
    let key = identifier.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let _ = opt(type_annotation).parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let value = constraint.parse_next(input)?;
    Ok((key.to_string(), value))
}

fn type_annotation<'a>(input: &mut &'a str) -> WResult<&'a str> {
    delimited('(', identifier, ')').parse_next(input)
}

fn constraint(input: &mut &str) -> WResult<CapsValue<Value>> {
    alt((range, list, scalar.map(CapsValue::Fixed))).parse_next(input)
}

fn range(input: &mut &str) -> WResult<CapsValue<Value>> {
    let _ = ('[', multispace0).parse_next(input)?;
    let min = scalar.parse_next(input)?;
    let _ = separator(',').parse_next(input)?;
    let max = scalar.parse_next(input)?;
    let _ = (multispace0, ']').parse_next(input)?;
    if min > max {
        return Err(ContextError::new());
    }
    Ok(CapsValue::Range { min, max })
}

fn list(input: &mut &str) -> WResult<CapsValue<Value>> {
    let _ = ('{', multispace0).parse_next(input)?;
    let values: Vec<Value> = separated(1.., scalar, separator(',')).parse_next(input)?;
    let _ = (multispace0, '}').parse_next(input)?;
    Ok(CapsValue::List(values))
}

fn scalar(input: &mut &str) -> WResult<Value> {
    alt((
        quoted_string.map(Value::Str),
        integer.map(Value::Int),
        bare_word.map(|w: &str| match w {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Str(w.to_string()),
        }),
    ))
    .parse_next(input)
}

fn quoted_string(input: &mut &str) -> WResult<String> {
    delimited('"', take_till(0.., '"'), '"')
        .map(|s: &str| s.to_string())
        .parse_next(input)
}

fn integer(input: &mut &str) -> WResult<i64> {
    let text: &str = (opt('-'), digit1).take().parse_next(input)?;
    // "720p" is a word, not a number followed by garbage
    if input.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '_') {
        return Err(ContextError::new());
    }
    text.parse().map_err(|_| ContextError::new())
}

fn bare_word<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '+')
    })
    .parse_next(input)
}
