//! Assertion grammar and evaluator.
//!
//! One assertion per line, `lhs op rhs`:
//!
//! ```text
//! status == 201
//! duration < 500ms
//! body.data.username == {{username}}
//! body.data.items[0].id exists
//! header.Content-Type == "application/json"
//! ```
//!
//! Every assertion of a step is evaluated; a missing left-hand path is
//! always a failure, never vacuously true.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture;
use crate::scope::VariableScope;
use crate::template;

static ASSERTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(status|duration|body(?:[.\[][^\s=!<>]*)?|header\.[^\s=!<>]+)\s*(==|!=|<=|>=|<|>|not-exists|exists)\s*(.*?)\s*$",
    )
    .expect("failed to compile assertion regex")
});

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s*(ms|s)?$")
        .expect("failed to compile duration regex")
});

/// Response fact an assertion inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Status,
    Duration,
    /// Dot path into the JSON body; empty selects the whole body.
    Body(String),
    Header(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Exists,
    NotExists,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "exists" => Some(Operator::Exists),
            "not-exists" => Some(Operator::NotExists),
            _ => None,
        }
    }

    fn is_presence(&self) -> bool {
        matches!(self, Operator::Exists | Operator::NotExists)
    }

    fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge
        )
    }
}

/// Right-hand side, typed once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
    /// A JSON array or object, compared structurally.
    Json(Value),
    /// Text containing `{{...}}`, resolved against the run scope
    /// right before comparison.
    Template(String),
}

impl Literal {
    fn parse(raw: &str, subject: &Subject) -> Result<Self, String> {
        let raw = raw.trim();
        let unquoted = strip_quotes(raw);

        if template::has_placeholders(raw) {
            return Ok(Literal::Template(unquoted.unwrap_or(raw).to_string()));
        }
        if *subject == Subject::Duration {
            let text = unquoted.unwrap_or(raw);
            return parse_duration_ms(text)
                .map(Literal::Number)
                .ok_or_else(|| format!("invalid duration '{text}'"));
        }
        if let Some(text) = unquoted {
            return Ok(Literal::String(text.to_string()));
        }
        match raw {
            "true" => return Ok(Literal::Bool(true)),
            "false" => return Ok(Literal::Bool(false)),
            "null" => return Ok(Literal::Null),
            _ => {}
        }
        if let Ok(n) = raw.parse::<f64>() {
            return Ok(Literal::Number(n));
        }
        if raw.starts_with('[') || raw.starts_with('{') {
            if let Ok(value @ (Value::Array(_) | Value::Object(_))) = serde_json::from_str(raw) {
                return Ok(Literal::Json(value));
            }
        }
        Ok(Literal::String(raw.to_string()))
    }
}

/// A parsed assertion. Serialized as its source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Assertion {
    pub subject: Subject,
    pub op: Operator,
    pub expected: Option<Literal>,
    source: String,
}

impl Assertion {
    pub fn parse(line: &str) -> Result<Self, String> {
        let caps = ASSERTION_RE
            .captures(line)
            .ok_or_else(|| format!("expected `lhs op rhs`, got '{}'", line.trim()))?;
        let lhs = caps.get(1).map_or("", |m| m.as_str());
        let op_text = caps.get(2).map_or("", |m| m.as_str());
        let rhs = caps.get(3).map_or("", |m| m.as_str());

        let subject = match lhs {
            "status" => Subject::Status,
            "duration" => Subject::Duration,
            "body" => Subject::Body(String::new()),
            other => match other.strip_prefix(capture::HEADER_PREFIX) {
                Some(name) => Subject::Header(name.to_string()),
                None => {
                    let path = other.strip_prefix("body").unwrap_or(other);
                    let path = path.strip_prefix('.').unwrap_or(path);
                    capture::parse_path(path).map_err(|e| e.to_string())?;
                    Subject::Body(path.to_string())
                }
            },
        };
        let op = Operator::parse(op_text)
            .ok_or_else(|| format!("unknown operator '{op_text}'"))?;

        let expected = if op.is_presence() {
            if !rhs.is_empty() {
                return Err(format!("'{op_text}' takes no right-hand side"));
            }
            None
        } else {
            if rhs.is_empty() {
                return Err(format!("'{op_text}' needs a right-hand side"));
            }
            Some(Literal::parse(rhs, &subject)?)
        };

        Ok(Self {
            subject,
            op,
            expected,
            source: line.trim().to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl FromStr for Assertion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Assertion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Assertion> for String {
    fn from(value: Assertion) -> Self {
        value.source
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// The response facts assertions are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ResponseFacts<'a> {
    pub status: u16,
    pub duration_ms: u64,
    pub headers: &'a BTreeMap<String, String>,
    /// Parsed JSON body, when the body is JSON.
    pub json: Option<&'a Value>,
    pub raw_body: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssertionResult {
    pub pass: bool,
    pub detail: String,
}

impl AssertionResult {
    fn pass(assertion: &Assertion, detail: impl fmt::Display) -> Self {
        Self {
            pass: true,
            detail: format!("{assertion}: {detail}"),
        }
    }

    fn fail(assertion: &Assertion, detail: impl fmt::Display) -> Self {
        Self {
            pass: false,
            detail: format!("{assertion}: {detail}"),
        }
    }
}

/// Right-hand side after template resolution.
#[derive(Debug, Clone, PartialEq)]
enum Expected {
    Value(Value),
    /// Resolved template text; compared leniently against the actual
    /// JSON type.
    Text(String),
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Value(v) => write!(f, "{v}"),
            Expected::Text(t) => write!(f, "{t:?}"),
        }
    }
}

/// Evaluate one assertion. `None` means no response was received, in
/// which case every assertion fails.
pub fn evaluate(
    assertion: &Assertion,
    response: Option<&ResponseFacts<'_>>,
    scope: &VariableScope,
) -> AssertionResult {
    let Some(response) = response else {
        return AssertionResult::fail(assertion, "no response received");
    };

    let actual = match &assertion.subject {
        Subject::Status => Ok(Value::from(response.status)),
        Subject::Duration => Ok(Value::from(response.duration_ms)),
        Subject::Body(path) => match response.json {
            Some(json) => capture::extract(json, path).cloned().map_err(|e| e.reason),
            None if path.is_empty() => Ok(Value::String(response.raw_body.to_string())),
            None => Err("response body is not JSON".to_string()),
        },
        Subject::Header(name) => capture::header_value(response.headers, name)
            .map(|v| Value::String(v.to_string()))
            .ok_or_else(|| format!("missing header '{name}'")),
    };

    match (assertion.op, actual) {
        (Operator::Exists, Ok(_)) => AssertionResult::pass(assertion, "present"),
        (Operator::Exists, Err(reason)) => AssertionResult::fail(assertion, reason),
        (Operator::NotExists, Ok(value)) => {
            AssertionResult::fail(assertion, format!("present with value {value}"))
        }
        (Operator::NotExists, Err(_)) => AssertionResult::pass(assertion, "absent"),
        (_, Err(reason)) => AssertionResult::fail(assertion, reason),
        (op, Ok(actual)) => {
            let expected = match resolve_expected(assertion, scope) {
                Ok(expected) => expected,
                Err(reason) => return AssertionResult::fail(assertion, reason),
            };
            compare(assertion, op, &actual, &expected)
        }
    }
}

/// Evaluate every assertion, without stopping at the first failure.
pub fn evaluate_all(
    assertions: &[Assertion],
    response: Option<&ResponseFacts<'_>>,
    scope: &VariableScope,
) -> Vec<AssertionResult> {
    assertions
        .iter()
        .map(|a| evaluate(a, response, scope))
        .collect()
}

fn resolve_expected(
    assertion: &Assertion,
    scope: &VariableScope,
) -> Result<Expected, String> {
    let Some(literal) = &assertion.expected else {
        return Err("missing right-hand side".to_string());
    };
    let expected = match literal {
        Literal::Number(n) => Expected::Value(number(*n)),
        Literal::String(s) => Expected::Value(Value::String(s.clone())),
        Literal::Bool(b) => Expected::Value(Value::Bool(*b)),
        Literal::Null => Expected::Value(Value::Null),
        Literal::Json(v) => Expected::Value(v.clone()),
        Literal::Template(text) => {
            match template::resolve_value(text, scope).map_err(|e| e.to_string())? {
                Value::String(resolved) => Expected::Text(resolved),
                typed => Expected::Value(typed),
            }
        }
    };

    // Duration literals carry units until resolved.
    if assertion.subject == Subject::Duration {
        if let Expected::Text(text) = &expected {
            return parse_duration_ms(text)
                .map(|ms| Expected::Value(number(ms)))
                .ok_or_else(|| format!("invalid duration '{text}'"));
        }
    }
    Ok(expected)
}

fn compare(
    assertion: &Assertion,
    op: Operator,
    actual: &Value,
    expected: &Expected,
) -> AssertionResult {
    if op.is_ordering() {
        let (Some(lhs), Some(rhs)) = (actual.as_f64(), expected_number(expected)) else {
            return AssertionResult::fail(
                assertion,
                format!(
                    "type mismatch: '{}' needs numbers, got {} and {expected}",
                    op_symbol(op),
                    actual
                ),
            );
        };
        let holds = match op {
            Operator::Lt => lhs < rhs,
            Operator::Le => lhs <= rhs,
            Operator::Gt => lhs > rhs,
            _ => lhs >= rhs,
        };
        return if holds {
            AssertionResult::pass(assertion, format!("{actual} {} {expected}", op_symbol(op)))
        } else {
            AssertionResult::fail(
                assertion,
                format!("expected {} {expected}, got {actual}", op_symbol(op)),
            )
        };
    }

    let equal = values_equal(actual, expected);
    match (op, equal) {
        (Operator::Eq, true) | (Operator::Ne, false) => {
            AssertionResult::pass(assertion, format!("got {actual}"))
        }
        (Operator::Eq, false) => {
            AssertionResult::fail(assertion, format!("expected {expected}, got {actual}"))
        }
        _ => AssertionResult::fail(
            assertion,
            format!("expected anything but {expected}, got {actual}"),
        ),
    }
}

/// Structural equality; numbers compare by value so `200 == 200.0`.
fn values_equal(actual: &Value, expected: &Expected) -> bool {
    match expected {
        Expected::Value(Value::Number(n)) => {
            matches!((actual.as_f64(), n.as_f64()), (Some(a), Some(b)) if a == b)
        }
        Expected::Value(v) => actual == v,
        Expected::Text(text) => match actual {
            Value::String(s) => s == text,
            other => serde_json::from_str::<Value>(text).is_ok_and(|parsed| {
                values_equal(other, &Expected::Value(parsed))
            }),
        },
    }
}

fn expected_number(expected: &Expected) -> Option<f64> {
    match expected {
        Expected::Value(v) => v.as_f64(),
        Expected::Text(t) => t.trim().parse::<f64>().ok(),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn op_symbol(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "==",
        Operator::Ne => "!=",
        Operator::Lt => "<",
        Operator::Le => "<=",
        Operator::Gt => ">",
        Operator::Ge => ">=",
        Operator::Exists => "exists",
        Operator::NotExists => "not-exists",
    }
}

/// `500`, `500ms`, `1.5s` to milliseconds.
pub fn parse_duration_ms(text: &str) -> Option<f64> {
    let caps = DURATION_RE.captures(text.trim())?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    match caps.get(2).map(|m| m.as_str()) {
        Some("s") => Some(value * 1000.0),
        _ => Some(value),
    }
}

fn strip_quotes(raw: &str) -> Option<&str> {
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        Some(&raw[1..raw.len() - 1])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        headers: BTreeMap<String, String>,
        json: Value,
        raw: String,
    }

    impl Fixture {
        fn new(json: Value) -> Self {
            let mut headers = BTreeMap::new();
            headers.insert("content-type".to_string(), "application/json".to_string());
            Self {
                raw: json.to_string(),
                json,
                headers,
            }
        }

        fn facts(&self, status: u16, duration_ms: u64) -> ResponseFacts<'_> {
            ResponseFacts {
                status,
                duration_ms,
                headers: &self.headers,
                json: Some(&self.json),
                raw_body: &self.raw,
            }
        }
    }

    fn check(line: &str, facts: &ResponseFacts<'_>, scope: &VariableScope) -> AssertionResult {
        evaluate(&Assertion::parse(line).unwrap(), Some(facts), scope)
    }

    #[test]
    fn parses_all_subjects() {
        assert_eq!(Assertion::parse("status == 200").unwrap().subject, Subject::Status);
        assert_eq!(
            Assertion::parse("duration < 2s").unwrap().expected,
            Some(Literal::Number(2000.0))
        );
        assert_eq!(
            Assertion::parse("body.data.items[0].id exists").unwrap().subject,
            Subject::Body("data.items[0].id".to_string())
        );
        assert_eq!(
            Assertion::parse("header.Content-Type == \"application/json\"")
                .unwrap()
                .subject,
            Subject::Header("Content-Type".to_string())
        );
    }

    #[test]
    fn parses_without_spaces() {
        let a = Assertion::parse("status==404").unwrap();
        assert_eq!(a.op, Operator::Eq);
        assert_eq!(a.expected, Some(Literal::Number(404.0)));
    }

    #[test]
    fn literal_kinds() {
        let rhs = |l: &str| Assertion::parse(l).unwrap().expected.unwrap();
        assert_eq!(rhs("body.a == true"), Literal::Bool(true));
        assert_eq!(rhs("body.a == null"), Literal::Null);
        assert_eq!(rhs("body.a == 'x y'"), Literal::String("x y".to_string()));
        assert_eq!(rhs("body.a == bare"), Literal::String("bare".to_string()));
        assert_eq!(rhs("body.a == [1, 2]"), Literal::Json(json!([1, 2])));
        assert_eq!(rhs("body.a == [oops"), Literal::String("[oops".to_string()));
        assert_eq!(
            rhs("body.a == {{name}}"),
            Literal::Template("{{name}}".to_string())
        );
        assert_eq!(
            rhs("body.a == \"{{name}}\""),
            Literal::Template("{{name}}".to_string())
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Assertion::parse("status").is_err());
        assert!(Assertion::parse("status ==").is_err());
        assert!(Assertion::parse("latency < 5").is_err());
        assert!(Assertion::parse("body.a exists 1").is_err());
        assert!(Assertion::parse("duration < soon").is_err());
        assert!(Assertion::parse("body.a[x] exists").is_err());
    }

    #[test]
    fn round_trips_through_serde_as_source_text() {
        let a = Assertion::parse("  body.id  >= 3 ").unwrap();
        let text = serde_json::to_string(&a).unwrap();
        assert_eq!(text, "\"body.id  >= 3\"");
        let back: Assertion = serde_json::from_str(&text).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn status_comparisons() {
        let fx = Fixture::new(json!({}));
        let facts = fx.facts(404, 10);
        let scope = VariableScope::new();
        assert!(check("status == 404", &facts, &scope).pass);
        assert!(check("status >= 400", &facts, &scope).pass);
        assert!(!check("status < 300", &facts, &scope).pass);
        assert!(check("status != 200", &facts, &scope).pass);
    }

    #[test]
    fn duration_units_are_normalized() {
        let fx = Fixture::new(json!({}));
        let facts = fx.facts(200, 1200);
        let scope = VariableScope::new();
        assert!(check("duration < 2s", &facts, &scope).pass);
        assert!(!check("duration < 1000ms", &facts, &scope).pass);
        assert!(check("duration >= 1200", &facts, &scope).pass);
        assert!(check("duration < \"1500ms\"", &facts, &scope).pass);
        assert!(!check("duration < '1s'", &facts, &scope).pass);
    }

    #[test]
    fn body_equality_is_structural() {
        let fx = Fixture::new(json!({"data": {"tags": ["a", "b"], "n": 3, "ok": true}}));
        let facts = fx.facts(200, 1);
        let scope = VariableScope::new();
        assert!(check("body.data.n == 3", &facts, &scope).pass);
        assert!(check("body.data.ok == true", &facts, &scope).pass);
        assert!(check("body.data.tags[1] == \"b\"", &facts, &scope).pass);
        assert!(!check("body.data.n == \"3\"", &facts, &scope).pass);
        assert!(check("body.data.tags == [\"a\", \"b\"]", &facts, &scope).pass);
        assert!(check("body.data.tags != [\"b\",\"a\"]", &facts, &scope).pass);
        assert!(!check("body.data == {\"n\": 3}", &facts, &scope).pass);
    }

    #[test]
    fn template_rhs_uses_scope() {
        let fx = Fixture::new(json!({"data": {"username": "alice", "id": 42}}));
        let facts = fx.facts(200, 1);
        let mut scope = VariableScope::new();
        scope.set_captured("username", json!("alice"));
        scope.set_captured("id", json!(42));
        scope.set_captured("id_text", json!("42"));
        assert!(check("body.data.username == {{username}}", &facts, &scope).pass);
        assert!(check("body.data.id == {{id}}", &facts, &scope).pass);
        assert!(check("body.data.id == {{id_text}}", &facts, &scope).pass);
        assert!(check("body.data.id <= {{id_text}}", &facts, &scope).pass);
    }

    #[test]
    fn unresolved_template_fails_assertion() {
        let fx = Fixture::new(json!({"data": {"username": "alice"}}));
        let facts = fx.facts(200, 1);
        let result = check("body.data.username == {{username}}", &facts, &VariableScope::new());
        assert!(!result.pass);
        assert!(result.detail.contains("unresolved variable 'username'"));
    }

    #[test]
    fn ordering_requires_numbers() {
        let fx = Fixture::new(json!({"name": "alice"}));
        let facts = fx.facts(200, 1);
        let result = check("body.name > 3", &facts, &VariableScope::new());
        assert!(!result.pass);
        assert!(result.detail.contains("type mismatch"));
    }

    #[test]
    fn missing_path_is_never_vacuously_true() {
        let fx = Fixture::new(json!({"data": {}}));
        let facts = fx.facts(200, 1);
        let scope = VariableScope::new();
        assert!(!check("body.data.id == 1", &facts, &scope).pass);
        assert!(!check("body.data.id != 1", &facts, &scope).pass);
        assert!(!check("body.data.id exists", &facts, &scope).pass);
        assert!(check("body.data.id not-exists", &facts, &scope).pass);
    }

    #[test]
    fn exists_ignores_value() {
        let fx = Fixture::new(json!({"data": {"deleted_at": null}}));
        let facts = fx.facts(200, 1);
        assert!(check("body.data.deleted_at exists", &facts, &VariableScope::new()).pass);
    }

    #[test]
    fn header_assertions() {
        let fx = Fixture::new(json!({}));
        let facts = fx.facts(200, 1);
        let scope = VariableScope::new();
        assert!(check("header.Content-Type == application/json", &facts, &scope).pass);
        assert!(check("header.X-Missing not-exists", &facts, &scope).pass);
    }

    #[test]
    fn no_response_fails_everything() {
        let scope = VariableScope::new();
        let assertions: Vec<Assertion> = ["status == 200", "duration < 1s", "body.id not-exists"]
            .iter()
            .map(|l| Assertion::parse(l).unwrap())
            .collect();
        let results = evaluate_all(&assertions, None, &scope);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.pass));
        assert!(results[0].detail.contains("no response"));
    }

    #[test]
    fn evaluates_every_assertion() {
        let fx = Fixture::new(json!({"a": 1}));
        let facts = fx.facts(500, 1);
        let assertions: Vec<Assertion> = ["status == 200", "body.a == 2", "body.a == 1"]
            .iter()
            .map(|l| Assertion::parse(l).unwrap())
            .collect();
        let results = evaluate_all(&assertions, Some(&facts), &VariableScope::new());
        let failed: Vec<_> = results.iter().filter(|r| !r.pass).collect();
        assert_eq!(failed.len(), 2);
    }
}
