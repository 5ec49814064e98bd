//! Scenario, run and history data model.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assertion::Assertion;
use crate::error::ParseErrorKind;

/// A named target deployment: base URL plus the lowest-precedence
/// variables for template resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Headers sent with every request; step headers win on conflict.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub is_active: bool,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ParseErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            _ => Err(ParseErrorKind::InvalidMethod(s.to_string())),
        }
    }
}

/// Extract `path` from the response into the variable `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub name: String,
    pub path: String,
}

/// Per-step execution knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Overrides the run's default request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra attempts after a network error. Assertion failures are
    /// never retried.
    #[serde(default)]
    pub retry: u32,
    /// Base wait before a retry, doubled per attempt.
    #[serde(default)]
    pub retry_wait_ms: u64,
}

/// Editor canvas coordinates. Ignored by execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One HTTP request definition with its captures and assertions.
/// Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub method: HttpMethod,
    /// URL template, absolute or relative to the environment base URL.
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub captures: Vec<Capture>,
    #[serde(default)]
    pub asserts: Vec<Assertion>,
    #[serde(default)]
    pub sort_order: u32,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub options: StepOptions,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        method: HttpMethod,
        url: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            captures: Vec::new(),
            asserts: Vec::new(),
            sort_order: 0,
            position: None,
            options: StepOptions::default(),
        }
    }
}

/// Dependency between two graph steps. `variable_mapping` maps a
/// capture name in the source step to the name the target references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source_step_id: String,
    pub target_step_id: String,
    #[serde(default)]
    pub variable_mapping: BTreeMap<String, String>,
}

/// The validated shape of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Steps run in `sort_order`, each depending on the previous one.
    Script { steps: Vec<Step> },
    /// Steps plus acyclic edges.
    Graph { steps: Vec<Step>, edges: Vec<Edge> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub source: Option<PathBuf>,
    pub kind: ScenarioKind,
}

impl Scenario {
    pub fn steps(&self) -> &[Step] {
        match &self.kind {
            ScenarioKind::Script { steps } => steps,
            ScenarioKind::Graph { steps, .. } => steps,
        }
    }

    pub fn edges(&self) -> &[Edge] {
        match &self.kind {
            ScenarioKind::Script { .. } => &[],
            ScenarioKind::Graph { edges, .. } => edges,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Passed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        })
    }
}

/// The request actually sent, after template resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    pub request_snapshot: Option<RequestSnapshot>,
    pub response_snapshot: Option<ResponseSnapshot>,
    pub duration_ms: u64,
    /// Every violated assertion, not just the first.
    pub assertion_failures: Vec<String>,
    /// Unresolved variable, network error or skip reason.
    pub error: Option<String>,
    /// Values this step wrote into the run scope.
    #[serde(default)]
    pub captured: BTreeMap<String, serde_json::Value>,
}

impl StepResult {
    pub fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            name: step.name.clone(),
            status: StepStatus::Pending,
            request_snapshot: None,
            response_snapshot: None,
            duration_ms: 0,
            assertion_failures: Vec::new(),
            error: None,
            captured: BTreeMap::new(),
        }
    }
}

/// One execution of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub scenario_id: String,
    pub scenario_name: String,
    pub environment: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub canceled: bool,
}

impl Run {
    pub fn new(scenario: &Scenario, environment: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scenario_id: scenario.id.clone(),
            scenario_name: scenario.name.clone(),
            environment: environment.to_string(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            step_results: scenario.steps().iter().map(StepResult::pending).collect(),
            canceled: false,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.step_results
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// A persisted request/response pair. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Assigned by the store; ignored on insert.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Project root the request was issued from.
    #[serde(default)]
    pub project: Option<String>,
    pub method: String,
    pub url: String,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Option<String>,
    pub response_status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub duration_ms: u64,
    /// Network error when no response was received.
    #[serde(default)]
    pub error: Option<String>,
}

/// Batch of finished runs, as written to report files and the
/// console sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub runs: Vec<Run>,
    pub total_duration_ms: u64,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("post".parse::<HttpMethod>(), Ok(HttpMethod::Post));
        assert_eq!("DELETE".parse::<HttpMethod>(), Ok(HttpMethod::Delete));
        assert!(matches!(
            "FETCH".parse::<HttpMethod>(),
            Err(ParseErrorKind::InvalidMethod(m)) if m == "FETCH"
        ));
    }

    #[test]
    fn new_run_starts_pending_with_one_result_per_step() {
        let scenario = Scenario {
            id: "s".to_string(),
            name: "s".to_string(),
            source: None,
            kind: ScenarioKind::Script {
                steps: vec![
                    Step::new("a", HttpMethod::Get, "/a"),
                    Step::new("b", HttpMethod::Get, "/b"),
                ],
            },
        };
        let run = Run::new(&scenario, "dev");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.step_results.len(), 2);
        assert_eq!(run.count(StepStatus::Pending), 2);
        assert_eq!(run.step("b").map(|r| r.status), Some(StepStatus::Pending));
    }

    #[test]
    fn terminal_statuses() {
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }
}
