//! Per-run variable scope and the explicit run context that carries it.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::Environment;

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSource {
    Environment,
    Captured,
    Builtin,
}

/// A value looked up in a [`VariableScope`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopedValue<'a> {
    pub value: &'a Value,
    pub source: VariableSource,
}

/// Variables visible to one run.
///
/// Captures shadow environment variables of the same name for the
/// rest of the run. Writes are last-wins. A scope is never shared
/// between runs.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    captured: HashMap<String, Value>,
    environment: HashMap<String, Value>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fresh scope with an environment's variables.
    pub fn from_environment(environment: &Environment) -> Self {
        let environment = environment
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Self {
            captured: HashMap::new(),
            environment,
        }
    }

    pub fn set_captured(&mut self, name: impl Into<String>, value: Value) {
        self.captured.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<ScopedValue<'_>> {
        if let Some(value) = self.captured.get(name) {
            return Some(ScopedValue {
                value,
                source: VariableSource::Captured,
            });
        }
        self.environment.get(name).map(|value| ScopedValue {
            value,
            source: VariableSource::Environment,
        })
    }
}

/// Everything a run needs besides the scenario itself. Passed
/// explicitly into the scheduler; there is no process-wide "current
/// environment".
#[derive(Debug, Clone)]
pub struct RunContext {
    pub environment: Environment,
    pub scope: VariableScope,
}

impl RunContext {
    pub fn new(environment: Environment) -> Self {
        Self {
            scope: VariableScope::from_environment(&environment),
            environment,
        }
    }
}
