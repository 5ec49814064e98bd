//! Dot-path extraction from JSON response bodies.
//!
//! Paths are dot-separated object keys with optional `[index]`
//! subscripts: `data.user.id`, `data.items[0].id`, `[1].name`.
//! A purely numeric key indexes an array, so `items.0` equals
//! `items[0]`. The empty path selects the whole body.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{CaptureError, ParseErrorKind};

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .expect("failed to compile identifier regex")
});

/// Prefix selecting a response header instead of the body.
pub const HEADER_PREFIX: &str = "header.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, CaptureError> {
    let mut segments = Vec::new();
    if path.trim().is_empty() {
        return Ok(segments);
    }

    for part in path.trim().split('.') {
        if part.is_empty() {
            return Err(CaptureError::new(path, "empty path segment"));
        }
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        }
        while !rest.is_empty() {
            let Some(open) = rest.strip_prefix('[') else {
                return Err(CaptureError::new(
                    path,
                    format!("unexpected '{rest}' after subscript"),
                ));
            };
            let Some(end) = open.find(']') else {
                return Err(CaptureError::new(path, "unclosed '['"));
            };
            let index = open[..end].trim().parse::<usize>().map_err(|_| {
                CaptureError::new(
                    path,
                    format!("invalid array index '{}'", &open[..end]),
                )
            })?;
            segments.push(PathSegment::Index(index));
            rest = &open[end + 1..];
        }
    }

    Ok(segments)
}

/// Check a declared capture: the name must be an identifier and the
/// path must be a header reference or a well-formed body path.
pub fn validate(name: &str, path: &str) -> Result<(), ParseErrorKind> {
    if !IDENTIFIER_RE.is_match(name) {
        return Err(ParseErrorKind::InvalidCaptureName(name.to_string()));
    }
    if path.trim().is_empty() {
        return Err(ParseErrorKind::InvalidCapture(format!("{name}: <empty path>")));
    }
    if !path.starts_with(HEADER_PREFIX) {
        parse_path(path)
            .map_err(|e| ParseErrorKind::InvalidCapture(e.to_string()))?;
    }
    Ok(())
}

/// Resolve `path` against a parsed body.
pub fn extract<'a>(
    body: &'a Value,
    path: &str,
) -> Result<&'a Value, CaptureError> {
    let mut current = body;

    for segment in parse_path(path)? {
        current = match (&segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => {
                map.get(key).ok_or_else(|| {
                    CaptureError::new(path, format!("missing key '{key}'"))
                })?
            }
            (PathSegment::Key(key), Value::Array(items)) => {
                let index = key.parse::<usize>().map_err(|_| {
                    CaptureError::new(
                        path,
                        format!("cannot read key '{key}' of an array"),
                    )
                })?;
                index_array(items, index, path)?
            }
            (PathSegment::Index(index), Value::Array(items)) => {
                index_array(items, *index, path)?
            }
            (PathSegment::Key(key), other) => {
                return Err(CaptureError::new(
                    path,
                    format!("cannot read key '{key}' of {}", type_name(other)),
                ));
            }
            (PathSegment::Index(index), other) => {
                return Err(CaptureError::new(
                    path,
                    format!("cannot index {} with [{index}]", type_name(other)),
                ));
            }
        };
    }

    Ok(current)
}

/// Resolve a capture path against a response. `header.<Name>` reads a
/// response header (case-insensitive); anything else needs a JSON body.
pub fn extract_from_response(
    body: Option<&Value>,
    headers: &BTreeMap<String, String>,
    path: &str,
) -> Result<Value, CaptureError> {
    if let Some(name) = path.strip_prefix(HEADER_PREFIX) {
        return header_value(headers, name)
            .map(|v| Value::String(v.to_string()))
            .ok_or_else(|| {
                CaptureError::new(path, format!("missing header '{name}'"))
            });
    }
    match body {
        Some(json) => extract(json, path).cloned(),
        None => Err(CaptureError::new(path, "response body is not JSON")),
    }
}

pub fn header_value<'a>(
    headers: &'a BTreeMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn index_array<'a>(
    items: &'a [Value],
    index: usize,
    path: &str,
) -> Result<&'a Value, CaptureError> {
    items.get(index).ok_or_else(|| {
        CaptureError::new(
            path,
            format!("index {index} out of range (length {})", items.len()),
        )
    })
}
