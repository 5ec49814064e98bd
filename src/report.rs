//! Progress events, console output and report files.
//!
//! The scheduler publishes [`ProgressEvent`]s through an [`EventSink`]
//! without ever waiting on the consumer: when the bounded channel is
//! full the event is dropped with a warning.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{Run, RunStatus, StepResult, StepStatus};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// One step status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub run_id: String,
    pub scenario: String,
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    /// Known once the step is terminal.
    pub duration_ms: Option<u64>,
    /// Assertion failures and errors, for terminal failed/skipped steps.
    #[serde(default)]
    pub details: Vec<String>,
}

impl StepEvent {
    pub fn from_result(run: &Run, result: &StepResult) -> Self {
        let terminal = result.status.is_terminal();
        let mut details = result.assertion_failures.clone();
        if let Some(error) = &result.error {
            details.insert(0, error.clone());
        }
        Self {
            run_id: run.id.clone(),
            scenario: run.scenario_name.clone(),
            step_id: result.step_id.clone(),
            name: result.name.clone(),
            status: result.status,
            duration_ms: terminal.then_some(result.duration_ms),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProgressEvent {
    Step(StepEvent),
    /// Terminal event of a run; nothing follows it for that run.
    Done {
        run_id: String,
        scenario: String,
        status: RunStatus,
        canceled: bool,
    },
}

impl ProgressEvent {
    pub fn done(run: &Run) -> Self {
        ProgressEvent::Done {
            run_id: run.id.clone(),
            scenario: run.scenario_name.clone(),
            status: run.status,
            canceled: run.canceled,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            ProgressEvent::Step(step) => &step.run_id,
            ProgressEvent::Done { run_id, .. } => run_id,
        }
    }
}

/// Sending half of the progress channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

/// Bounded progress channel.
pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}

impl EventSink {
    /// Publish without blocking. Returns `false` when the event was not
    /// delivered.
    pub fn emit(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    "Progress subscriber is lagging; dropped event for run {}",
                    event.run_id()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Progress subscriber has gone away");
                false
            }
        }
    }
}

/// Renders events and runs as console text.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleReporter {
    color: bool,
}

impl ConsoleReporter {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if self.color {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn badge(&self, status: StepStatus) -> String {
        match status {
            StepStatus::Passed => self.paint("✓", "32"),
            StepStatus::Failed => self.paint("✗", "31"),
            StepStatus::Skipped => self.paint("-", "33"),
            StepStatus::Pending | StepStatus::Running => self.paint("…", "2"),
        }
    }

    /// The line for a step that reached a terminal state; `None` for
    /// non-terminal transitions and run-level events.
    pub fn step_line(&self, event: &ProgressEvent) -> Option<String> {
        let ProgressEvent::Step(step) = event else {
            return None;
        };
        if !step.status.is_terminal() {
            return None;
        }
        let mut line = format!(
            "  {} [{}] {} ({} ms)",
            self.badge(step.status),
            step.scenario,
            step.name,
            step.duration_ms.unwrap_or(0)
        );
        for detail in &step.details {
            let _ = write!(line, "\n      {}", self.paint(detail, "31"));
        }
        Some(line)
    }

    /// Per-run table of every step plus the totals footer.
    pub fn summary(&self, runs: &[Run], total_duration_ms: u64) -> String {
        let mut out = String::new();
        let (mut passed, mut failed, mut skipped) = (0, 0, 0);

        for run in runs {
            let status = if run.passed() {
                self.paint("PASS", "32")
            } else {
                self.paint("FAIL", "31")
            };
            let canceled = if run.canceled { " (canceled)" } else { "" };
            let _ = writeln!(
                out,
                "{status} {} [{}] ({} ms){canceled}",
                run.scenario_name,
                run.environment,
                run.duration_ms()
            );
            for (i, step) in run.step_results.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "  {}. {} {:<40} {:>7} {:>6} ms",
                    i + 1,
                    self.badge(step.status),
                    step.name,
                    step.status.to_string(),
                    step.duration_ms
                );
                if let Some(error) = &step.error {
                    let _ = writeln!(out, "       {}", self.paint(error, "31"));
                }
                for failure in &step.assertion_failures {
                    let _ = writeln!(out, "       {}", self.paint(failure, "31"));
                }
            }
            passed += run.count(StepStatus::Passed);
            failed += run.count(StepStatus::Failed);
            skipped += run.count(StepStatus::Skipped);
        }

        let _ = write!(
            out,
            "Summary: {} run(s), {} passed, {} failed, {} skipped step(s), {} ms",
            runs.len(),
            self.paint(&passed.to_string(), "32"),
            self.paint(&failed.to_string(), "31"),
            self.paint(&skipped.to_string(), "33"),
            total_duration_ms
        );
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Json,
    Yaml,
    Text,
}

/// Write one run record into `report_dir`, creating the directory.
pub fn save_run_report(run: &Run, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)
            .with_context(|| format!("Failed to create report dir {}", report_dir.display()))?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = run.scenario_name.replace([' ', '/'], "_");
    let short_id: String = run.id.chars().take(8).collect();

    let (extension, content) = match format {
        ReportFormat::Json => ("json", serde_json::to_string_pretty(run)?),
        ReportFormat::Yaml => ("yaml", serde_yaml::to_string(run)?),
        ReportFormat::Text => ("txt", render_text(run)),
    };

    let file_path =
        report_dir.join(format!("{sanitized_name}-{timestamp}-{short_id}.{extension}"));
    fs::write(&file_path, content)
        .with_context(|| format!("Failed to write report {}", file_path.display()))?;
    Ok(file_path)
}

/// Plain-text rendering of a run, without colors.
pub fn render_text(run: &Run) -> String {
    let mut content = String::new();
    let _ = writeln!(content, "Scenario: {}", run.scenario_name);
    let _ = writeln!(content, "Run: {}", run.id);
    let _ = writeln!(content, "Environment: {}", run.environment);
    let _ = writeln!(
        content,
        "Status: {}{}",
        run.status,
        if run.canceled { " (canceled)" } else { "" }
    );
    let _ = writeln!(content, "Duration: {} ms\n", run.duration_ms());
    content.push_str("Steps:\n");
    for (i, step) in run.step_results.iter().enumerate() {
        let _ = writeln!(content, "  {}. {} ({})", i + 1, step.name, step.status);
        if let Some(snapshot) = &step.request_snapshot {
            let _ = writeln!(content, "     Request: {} {}", snapshot.method, snapshot.url);
        }
        if let Some(snapshot) = &step.response_snapshot {
            let _ = writeln!(content, "     Response: {}", snapshot.status);
        }
        if let Some(error) = &step.error {
            let _ = writeln!(content, "     Error: {error}");
        }
        for failure in &step.assertion_failures {
            let _ = writeln!(content, "     Assertion failed: {failure}");
        }
        let _ = writeln!(content, "     Duration: {} ms", step.duration_ms);
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpMethod, Scenario, ScenarioKind, Step};

    fn sample_run() -> Run {
        let scenario = Scenario {
            id: "auth".to_string(),
            name: "auth flow".to_string(),
            source: None,
            kind: ScenarioKind::Script {
                steps: vec![
                    Step::new("login", HttpMethod::Post, "/login"),
                    Step::new("profile", HttpMethod::Get, "/me"),
                ],
            },
        };
        let mut run = Run::new(&scenario, "dev");
        run.status = RunStatus::Failed;
        run.step_results[0].status = StepStatus::Failed;
        run.step_results[0].duration_ms = 12;
        run.step_results[0].assertion_failures = vec!["status == 200: expected 200, got 500".to_string()];
        run.step_results[1].status = StepStatus::Skipped;
        run.step_results[1].error = Some("upstream step 'login' did not pass".to_string());
        run
    }

    fn step_event(status: StepStatus) -> ProgressEvent {
        ProgressEvent::Step(StepEvent {
            run_id: "r1".to_string(),
            scenario: "auth flow".to_string(),
            step_id: "login".to_string(),
            name: "login".to_string(),
            status,
            duration_ms: status.is_terminal().then_some(5),
            details: Vec::new(),
        })
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (sink, mut rx) = channel(1);
        assert!(sink.emit(step_event(StepStatus::Running)));
        assert!(!sink.emit(step_event(StepStatus::Passed)));
        assert_eq!(rx.recv().await, Some(step_event(StepStatus::Running)));
    }

    #[test]
    fn closed_channel_reports_undelivered() {
        let (sink, rx) = channel(4);
        drop(rx);
        assert!(!sink.emit(step_event(StepStatus::Running)));
    }

    #[test]
    fn step_event_carries_details_of_terminal_results() {
        let run = sample_run();
        let event = StepEvent::from_result(&run, &run.step_results[1]);
        assert_eq!(event.status, StepStatus::Skipped);
        assert_eq!(event.duration_ms, Some(0));
        assert_eq!(event.details, vec!["upstream step 'login' did not pass".to_string()]);
    }

    #[test]
    fn console_prints_only_terminal_steps() {
        let reporter = ConsoleReporter::new(false);
        assert!(reporter.step_line(&step_event(StepStatus::Running)).is_none());
        let line = reporter.step_line(&step_event(StepStatus::Passed)).unwrap();
        assert_eq!(line, "  ✓ [auth flow] login (5 ms)");
        assert!(reporter.step_line(&ProgressEvent::done(&sample_run())).is_none());
    }

    #[test]
    fn summary_counts_statuses() {
        let reporter = ConsoleReporter::new(false);
        let summary = reporter.summary(&[sample_run()], 40);
        assert!(summary.starts_with("FAIL auth flow [dev]"));
        assert!(summary.contains("expected 200, got 500"));
        assert!(summary.contains("did not pass"));
        assert!(summary.ends_with("1 run(s), 0 passed, 1 failed, 1 skipped step(s), 40 ms"));
    }

    #[test]
    fn saves_reports_in_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let run = sample_run();
        for format in [ReportFormat::Json, ReportFormat::Yaml, ReportFormat::Text] {
            let path = save_run_report(&run, dir.path(), format).unwrap();
            assert!(path.exists());
        }
        let json_path = save_run_report(&run, dir.path(), ReportFormat::Json).unwrap();
        let parsed: Run =
            serde_json::from_str(&fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(parsed.id, run.id);
        assert!(render_text(&run).contains("Assertion failed: status == 200"));
    }
}
