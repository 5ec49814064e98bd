//! `{{name}}` placeholder expansion.
//!
//! Non-builtin names resolve against the run's [`VariableScope`]
//! (captures first, then environment variables). Names starting with
//! `$` are builtins and produce a fresh value on every occurrence:
//!
//! - `{{$timestamp}}` - Unix time in seconds
//! - `{{$timestampMs}}` - Unix time in milliseconds
//! - `{{$isoTimestamp}}` - RFC 3339 UTC timestamp
//! - `{{$randomInt}}` - integer in `0..10000`
//! - `{{$randomString}}` - 8 alphanumeric characters
//! - `{{$uuid}}` - random UUID v4

use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use tracing::trace;

use crate::error::UnresolvedVariableError;
use crate::scope::{VariableScope, VariableSource};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(\$?[A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .expect("failed to compile placeholder regex")
});

/// Expand every placeholder in `template`.
///
/// Fails on the first name that is neither in scope nor a builtin.
pub fn resolve(
    template: &str,
    scope: &VariableScope,
) -> Result<String, UnresolvedVariableError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&render(&lookup(name.as_str(), scope)?.value));
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(out)
}

/// Resolve a template to a JSON value.
///
/// A template consisting of exactly one non-builtin placeholder keeps
/// the variable's JSON type (`{{id}}` with `id = 42` yields the number
/// 42). Anything else resolves to a string.
pub fn resolve_value(
    template: &str,
    scope: &VariableScope,
) -> Result<Value, UnresolvedVariableError> {
    if let Some(caps) = PLACEHOLDER_RE.captures(template.trim()) {
        let whole_match = caps
            .get(0)
            .is_some_and(|m| m.as_str().len() == template.trim().len());
        if let (true, Some(name)) = (whole_match, caps.get(1)) {
            return lookup(name.as_str(), scope).map(|resolved| resolved.value);
        }
    }
    resolve(template, scope).map(Value::String)
}

/// Return `true` when `text` contains at least one placeholder.
pub fn has_placeholders(text: &str) -> bool {
    PLACEHOLDER_RE.is_match(text)
}

pub fn is_builtin(name: &str) -> bool {
    name.starts_with('$')
}

/// A placeholder's value and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub source: VariableSource,
}

/// Resolve a single placeholder name. Builtins are generated fresh;
/// everything else comes from the scope.
pub fn lookup(name: &str, scope: &VariableScope) -> Result<Resolved, UnresolvedVariableError> {
    let unresolved = || UnresolvedVariableError {
        name: name.to_string(),
    };
    if is_builtin(name) {
        let value = generate_builtin(name).ok_or_else(unresolved)?;
        return Ok(Resolved {
            value: Value::String(value),
            source: VariableSource::Builtin,
        });
    }
    let scoped = scope.get(name).ok_or_else(unresolved)?;
    trace!("Resolved '{}' from {:?}", name, scoped.source);
    Ok(Resolved {
        value: scoped.value.clone(),
        source: scoped.source,
    })
}

/// String form used when a value is spliced into text: strings are
/// inserted raw, everything else as compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn generate_builtin(name: &str) -> Option<String> {
    let now = Utc::now();
    match name {
        "$timestamp" => Some(now.timestamp().to_string()),
        "$timestampMs" => Some(now.timestamp_millis().to_string()),
        "$isoTimestamp" => {
            Some(now.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        "$randomInt" => Some(rand::rng().random_range(0..10_000_u32).to_string()),
        "$randomString" => Some(
            rand::rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect(),
        ),
        "$uuid" => Some(uuid::Uuid::new_v4().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Environment;
    use serde_json::json;

    fn scope_with(pairs: &[(&str, Value)]) -> VariableScope {
        let mut scope = VariableScope::new();
        for (k, v) in pairs {
            scope.set_captured(*k, v.clone());
        }
        scope
    }

    #[test]
    fn replaces_scope_values() {
        let scope = scope_with(&[("id", json!(42)), ("name", json!("alice"))]);
        assert_eq!(
            resolve("/users/{{id}}?n={{ name }}", &scope).unwrap(),
            "/users/42?n=alice"
        );
    }

    #[test]
    fn captured_value_round_trips_as_literal() {
        let scope = scope_with(&[("id", json!(42))]);
        assert_eq!(resolve("{{id}}", &scope).unwrap(), "42");
        assert_eq!(resolve_value("{{id}}", &scope).unwrap(), json!(42));
    }

    #[test]
    fn environment_is_fallback() {
        let env = Environment::new("dev").with_variable("host", "example.org");
        let scope = VariableScope::from_environment(&env);
        assert_eq!(resolve("{{host}}", &scope).unwrap(), "example.org");
    }

    #[test]
    fn unresolved_name_is_reported() {
        let err = resolve("Bearer {{access_token}}", &VariableScope::new())
            .unwrap_err();
        assert_eq!(err.name, "access_token");
    }

    #[test]
    fn unknown_builtin_is_unresolved() {
        let err = resolve("{{$nope}}", &VariableScope::new()).unwrap_err();
        assert_eq!(err.name, "$nope");
    }

    #[test]
    fn builtins_bypass_scope() {
        let scope = scope_with(&[("$uuid", json!("shadow"))]);
        let out = resolve("{{$uuid}}", &scope).unwrap();
        assert_ne!(out, "shadow");
        assert_eq!(out.len(), 36);
    }

    #[test]
    fn lookup_reports_provenance() {
        let env = Environment::new("dev").with_variable("host", "example.org");
        let mut scope = VariableScope::from_environment(&env);
        scope.set_captured("id", json!(3));

        assert_eq!(lookup("host", &scope).unwrap().source, VariableSource::Environment);
        assert_eq!(
            lookup("id", &scope).unwrap(),
            Resolved {
                value: json!(3),
                source: VariableSource::Captured
            }
        );
        let builtin = lookup("$uuid", &scope).unwrap();
        assert_eq!(builtin.source, VariableSource::Builtin);
        assert!(builtin.value.is_string());
    }

    #[test]
    fn builtins_are_generated_per_occurrence() {
        let out = resolve("{{$uuid}} {{$uuid}}", &VariableScope::new()).unwrap();
        let parts: Vec<&str> = out.split(' ').collect();
        assert_eq!(parts.len(), 2);
        assert_ne!(parts[0], parts[1]);
    }

    #[test]
    fn numeric_builtins_parse() {
        let scope = VariableScope::new();
        assert!(resolve("{{$timestamp}}", &scope)
            .unwrap()
            .parse::<i64>()
            .is_ok());
        let n: u32 = resolve("{{$randomInt}}", &scope).unwrap().parse().unwrap();
        assert!(n < 10_000);
        assert_eq!(resolve("{{$randomString}}", &scope).unwrap().len(), 8);
    }

    #[test]
    fn mixed_template_resolves_to_string() {
        let scope = scope_with(&[("id", json!(7))]);
        assert_eq!(
            resolve_value("item-{{id}}", &scope).unwrap(),
            json!("item-7")
        );
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let body = r#"{"a": {"b": 1}}"#;
        assert_eq!(resolve(body, &VariableScope::new()).unwrap(), body);
        assert!(!has_placeholders(body));
    }
}
