//! Canonical JSON encoding used as the fingerprint input.
//!
//! Rules:
//! - object keys sorted by UTF-8 byte order, no insignificant whitespace
//! - array order preserved
//! - strings emitted as UTF-8; only `"`, `\` and U+0000..U+001F are escaped
//! - integers in plain decimal; finite floats use the shortest round-trip
//!   digits without exponent, integral floats collapse to the integer form
//!   (`1.0` -> `1`) and `-0.0` becomes `0`
//! - numbers written with a fraction or exponent are read as `f64`, so
//!   integral floats past 2^53 round (`9007199254740993.0` -> `9007199254740992`);
//!   plain integers within `i64`/`u64` are exact
//!
//! No Unicode normalization is applied to strings or keys.

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalizationError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("non-finite number at {pointer}")]
    NonFiniteNumber { pointer: String },
    #[error("expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Parse `text` and return its canonical bytes.
pub fn canonicalize_str(text: &str) -> Result<Vec<u8>, CanonicalizationError> {
    let value: Value = serde_json::from_str(text)?;
    canonicalize(&value)
}

pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CanonicalizationError> {
    let mut out = Vec::with_capacity(512);
    let mut path = Vec::new();
    write_value(&mut out, value, &mut path)?;
    Ok(out)
}

pub fn require_object(value: &Value) -> Result<(), CanonicalizationError> {
    let found = match value {
        Value::Object(_) => return Ok(()),
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
    };
    Err(CanonicalizationError::NotAnObject { found })
}

/// Canonical text for a finite float, `None` for NaN/infinity.
pub fn format_float(value: f64) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    if value == 0.0 {
        return Some("0".to_string());
    }
    // f64 Display is shortest round-trip and never uses an exponent.
    Some(format!("{value}"))
}

fn write_value<'a>(
    out: &mut Vec<u8>,
    value: &'a Value,
    path: &mut Vec<Segment<'a>>,
) -> Result<(), CanonicalizationError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(number) => match number_text(number) {
            Some(text) => out.extend_from_slice(text.as_bytes()),
            None => {
                return Err(CanonicalizationError::NonFiniteNumber {
                    pointer: render_pointer(path),
                })
            }
        },
        Value::String(text) => write_string(out, text)?,
        Value::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                path.push(Segment::Index(index));
                write_value(out, item, path)?;
                path.pop();
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(out, map, path)?,
    }
    Ok(())
}

fn write_object<'a>(
    out: &mut Vec<u8>,
    map: &'a Map<String, Value>,
    path: &mut Vec<Segment<'a>>,
) -> Result<(), CanonicalizationError> {
    let mut entries = map.iter().collect::<Vec<_>>();
    entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push(b'{');
    for (index, (key, value)) in entries.into_iter().enumerate() {
        if index > 0 {
            out.push(b',');
        }
        write_string(out, key)?;
        out.push(b':');
        path.push(Segment::Key(key));
        write_value(out, value, path)?;
        path.pop();
    }
    out.push(b'}');
    Ok(())
}

fn write_string(out: &mut Vec<u8>, text: &str) -> Result<(), CanonicalizationError> {
    serde_json::to_writer(&mut *out, text)?;
    Ok(())
}

fn number_text(number: &Number) -> Option<String> {
    if let Some(unsigned) = number.as_u64() {
        return Some(unsigned.to_string());
    }
    if let Some(signed) = number.as_i64() {
        return Some(signed.to_string());
    }
    format_float(number.as_f64()?)
}

fn render_pointer(path: &[Segment<'_>]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter()
        .map(|segment| match segment {
            Segment::Key(key) => format!("/{}", key.replace('~', "~0").replace('/', "~1")),
            Segment::Index(index) => format!("/{index}"),
        })
        .collect()
}
