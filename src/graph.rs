//! Step graphs: editor-authored steps joined by edges.
//!
//! A graph document is YAML or JSON:
//!
//! ```yaml
//! name: project branches
//! steps:
//!   - id: create
//!     method: POST
//!     url: /projects
//!     body: {"name": "demo"}
//!     captures:
//!       - name: id
//!         path: data.id
//!     asserts:
//!       - status == 201
//!   - id: fetch
//!     method: GET
//!     url: /projects/{{project_id}}
//! edges:
//!   - source: create
//!     target: fetch
//!     variable_mapping:
//!       id: project_id
//! ```
//!
//! [`plan`] turns any scenario into an [`ExecutionPlan`]: a
//! deterministic topological order plus, per step, its upstream steps
//! and inbound variable renames.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

use crate::assertion::Assertion;
use crate::capture;
use crate::error::{ParseError, ParseErrorKind};
use crate::markdown_parser::slugify;
use crate::model::{
    Capture, Edge, HttpMethod, Position, Scenario, ScenarioKind, Step, StepOptions,
};

#[derive(Debug, Deserialize)]
struct GraphDocument {
    #[serde(default)]
    id: Option<String>,
    name: String,
    steps: Vec<GraphStep>,
    #[serde(default)]
    edges: Vec<GraphEdge>,
}

#[derive(Debug, Deserialize)]
struct GraphStep {
    id: String,
    #[serde(default)]
    name: Option<String>,
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    /// Raw string, or any JSON value that is serialized as the body.
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    captures: Vec<Capture>,
    #[serde(default)]
    asserts: Vec<String>,
    #[serde(default)]
    sort_order: Option<u32>,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default)]
    options: StepOptions,
}

#[derive(Debug, Deserialize)]
struct GraphEdge {
    #[serde(alias = "source_step_id")]
    source: String,
    #[serde(alias = "target_step_id")]
    target: String,
    #[serde(default)]
    variable_mapping: BTreeMap<String, String>,
}

/// Dispatch order and dependency wiring for one scenario. Indices
/// refer to `scenario.steps()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub order: Vec<usize>,
    /// Direct upstream steps of each step.
    pub upstream: Vec<Vec<usize>>,
    /// `(source, mapping)` for each edge ending at a step.
    pub inbound: Vec<Vec<(usize, BTreeMap<String, String>)>>,
}

/// Parse a YAML or JSON graph document into a validated scenario.
pub fn parse_graph(input: &str) -> Result<Scenario, ParseError> {
    let doc: GraphDocument = serde_yaml::from_str(input)
        .map_err(|e| ParseError::new(ParseErrorKind::Malformed(format!("invalid graph document: {e}"))))?;

    let mut steps = Vec::with_capacity(doc.steps.len());
    for (idx, raw) in doc.steps.into_iter().enumerate() {
        steps.push(convert_step(raw, idx)?);
    }
    let edges = doc
        .edges
        .into_iter()
        .map(|e| Edge {
            source_step_id: e.source,
            target_step_id: e.target,
            variable_mapping: e.variable_mapping,
        })
        .collect();

    let scenario = Scenario {
        id: doc.id.unwrap_or_else(|| slugify(&doc.name)),
        name: doc.name,
        source: None,
        kind: ScenarioKind::Graph { steps, edges },
    };
    validate(&scenario)?;
    Ok(scenario)
}

fn convert_step(raw: GraphStep, idx: usize) -> Result<Step, ParseError> {
    let label = raw.name.clone().unwrap_or_else(|| raw.id.clone());
    let fail = |kind: ParseErrorKind| ParseError::in_step(label.clone(), kind);

    let method: HttpMethod = raw.method.parse().map_err(fail)?;
    let body = match raw.body {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    };
    let asserts = raw
        .asserts
        .iter()
        .map(|line| {
            Assertion::parse(line).map_err(|reason| {
                fail(ParseErrorKind::InvalidAssertion(format!("{line}: {reason}")))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut step = Step::new(raw.id, method, raw.url);
    step.name = label;
    step.headers = raw.headers;
    step.body = body;
    step.captures = raw.captures;
    step.asserts = asserts;
    step.sort_order = raw
        .sort_order
        .unwrap_or_else(|| u32::try_from(idx).unwrap_or(u32::MAX));
    step.position = raw.position;
    step.options = raw.options;
    Ok(step)
}

/// Structural checks shared by parsed and programmatically built
/// scenarios: non-empty ids and urls, unique ids, valid capture names,
/// edges between known steps, and no cycles. Returns the plan on
/// success.
pub fn validate(scenario: &Scenario) -> Result<ExecutionPlan, ParseError> {
    let steps = scenario.steps();
    if steps.is_empty() {
        return Err(ParseError::new(ParseErrorKind::NoSteps));
    }

    let mut seen = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(ParseError::in_step(
                step.name.clone(),
                ParseErrorKind::Malformed("step id is empty".to_string()),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ParseError::in_step(
                step.name.clone(),
                ParseErrorKind::DuplicateStepId(step.id.clone()),
            ));
        }
        if step.url.trim().is_empty() {
            return Err(ParseError::in_step(step.name.clone(), ParseErrorKind::EmptyUrl));
        }
        for c in &step.captures {
            capture::validate(&c.name, &c.path)
                .map_err(|kind| ParseError::in_step(step.name.clone(), kind))?;
        }
    }

    plan(scenario)
}

/// Compute the execution plan.
///
/// Scripts run by `(sort_order, declaration index)`, each step
/// depending on the one before it. Graphs use Kahn's algorithm; among
/// ready steps the one with the lowest `(sort_order, declaration index)`
/// goes first, so the order is stable across runs.
pub fn plan(scenario: &Scenario) -> Result<ExecutionPlan, ParseError> {
    let steps = scenario.steps();
    let n = steps.len();

    if let ScenarioKind::Script { .. } = scenario.kind {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| (steps[i].sort_order, i));
        let mut upstream = vec![Vec::new(); n];
        let mut inbound = vec![Vec::new(); n];
        for pair in order.windows(2) {
            upstream[pair[1]].push(pair[0]);
            inbound[pair[1]].push((pair[0], BTreeMap::new()));
        }
        return Ok(ExecutionPlan {
            order,
            upstream,
            inbound,
        });
    }

    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut inbound: Vec<Vec<(usize, BTreeMap<String, String>)>> = vec![Vec::new(); n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for edge in scenario.edges() {
        let source = *index.get(edge.source_step_id.as_str()).ok_or_else(|| {
            ParseError::new(ParseErrorKind::UnknownStep(edge.source_step_id.clone()))
        })?;
        let target = *index.get(edge.target_step_id.as_str()).ok_or_else(|| {
            ParseError::new(ParseErrorKind::UnknownStep(edge.target_step_id.clone()))
        })?;
        if !upstream[target].contains(&source) {
            upstream[target].push(source);
            dependents[source].push(target);
        }
        inbound[target].push((source, edge.variable_mapping.clone()));
    }

    let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<(u32, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| Reverse((steps[i].sort_order, i)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, idx))) = ready.pop() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse((steps[dependent].sort_order, dependent)));
            }
        }
    }

    if order.len() != n {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let in_cycle = steps
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed.contains(i))
            .map(|(_, s)| s.id.clone())
            .collect();
        return Err(ParseError::new(ParseErrorKind::CycleDetected(in_cycle)));
    }

    Ok(ExecutionPlan {
        order,
        upstream,
        inbound,
    })
}
