//! Scenario execution.
//!
//! One run walks its scenario's execution plan on a single task, so
//! captures always land in the run's scope in a deterministic order.
//! Independent runs execute concurrently under a worker limit, each
//! with a private [`RunContext`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::assertion::{self, ResponseFacts};
use crate::capture;
use crate::error::{EnvironmentError, KestError, NetworkError, StepError};
use crate::graph::{self, ExecutionPlan};
use crate::history::{self, HistoryRecorder};
use crate::http::{self, HttpExecutor, HttpRequest, HttpResponse};
use crate::model::{Environment, Run, RunStatus, Scenario, Step, StepResult, StepStatus};
use crate::report::{EventSink, ProgressEvent, StepEvent};
use crate::scope::{RunContext, VariableScope};
use crate::template;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

/// Knobs that apply to every step of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Used when a step sets no timeout of its own.
    pub default_timeout: Duration,
    /// Skip every remaining step, independent branches included, after
    /// the first failure.
    pub abort_on_failure: bool,
    /// Project root stamped on history records.
    pub project: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            abort_on_failure: false,
            project: None,
        }
    }
}

/// Cooperative cancellation shared by every run of a runner. Checked
/// between step dispatches; in-flight requests complete but their
/// results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs a scenario to completion.
#[async_trait]
pub trait ScenarioRunner: Send + Sync {
    /// Execute `scenario` with a private context and return the final
    /// run record. Only parse and environment problems are errors;
    /// everything that goes wrong inside a step is in the record.
    async fn run(&self, scenario: &Scenario, context: RunContext) -> Result<Run, KestError>;
}

/// Default scheduler.
#[derive(Clone)]
pub struct FlowRunner {
    executor: Arc<dyn HttpExecutor>,
    recorder: Option<Arc<HistoryRecorder>>,
    events: Option<EventSink>,
    cancel: CancelToken,
    options: RunOptions,
}

impl FlowRunner {
    pub fn new(executor: Arc<dyn HttpExecutor>) -> Self {
        Self {
            executor,
            recorder: None,
            events: None,
            cancel: CancelToken::new(),
            options: RunOptions::default(),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<HistoryRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run independent scenarios concurrently, at most `workers` at a
    /// time. Results come back in input order.
    pub async fn run_all(
        &self,
        jobs: Vec<(Scenario, RunContext)>,
        workers: usize,
    ) -> Vec<Result<Run, KestError>> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks: JoinSet<(usize, Result<Run, KestError>)> = JoinSet::new();
        let total = jobs.len();

        for (index, (scenario, context)) in jobs.into_iter().enumerate() {
            let runner = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // Held until the run finishes; the semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                (index, runner.run(&scenario, context).await)
            });
        }

        let mut results: Vec<Option<Result<Run, KestError>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(join_error) => {
                    let message = if join_error.is_panic() {
                        "run task panicked"
                    } else {
                        "run task was cancelled"
                    };
                    error!("{}", message);
                }
            }
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(KestError::Task("run did not complete".to_string()))))
            .collect()
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn emit_step(&self, run: &Run, index: usize) {
        if self.events.is_some() {
            self.emit(ProgressEvent::Step(StepEvent::from_result(
                run,
                &run.step_results[index],
            )));
        }
    }

    fn skip(&self, run: &mut Run, index: usize, reason: String) {
        debug!("Skipping step '{}': {}", run.step_results[index].step_id, reason);
        let result = &mut run.step_results[index];
        result.status = StepStatus::Skipped;
        result.error = Some(reason);
        self.emit_step(run, index);
    }

    /// Why step `index` must not run, if anything.
    fn skip_reason(&self, run: &Run, plan: &ExecutionPlan, index: usize, aborted: bool) -> Option<String> {
        if self.cancel.is_canceled() {
            return Some("run canceled".to_string());
        }
        if aborted {
            return Some("aborted after an earlier failure".to_string());
        }
        plan.upstream[index]
            .iter()
            .map(|&up| &run.step_results[up])
            .find(|up| up.status != StepStatus::Passed)
            .map(|up| format!("upstream step '{}' {}", up.step_id, up.status))
    }

    /// Copy renamed captures from upstream steps into the scope.
    fn apply_mappings(run: &Run, plan: &ExecutionPlan, index: usize, scope: &mut VariableScope) {
        for (source, mapping) in &plan.inbound[index] {
            let captured = &run.step_results[*source].captured;
            for (from, to) in mapping {
                match captured.get(from) {
                    Some(value) => scope.set_captured(to.clone(), value.clone()),
                    None => debug!(
                        "Mapping '{}' -> '{}' has no source capture in step '{}'",
                        from, to, run.step_results[*source].step_id
                    ),
                }
            }
        }
    }

    fn build_request(
        &self,
        step: &Step,
        scope: &VariableScope,
        environment: &Environment,
    ) -> Result<HttpRequest, StepError> {
        let url = template::resolve(&step.url, scope)?;
        let url = http::resolve_url(environment.base_url.as_deref(), &url)?;

        let mut headers = BTreeMap::new();
        for (name, value) in &step.headers {
            headers.insert(name.clone(), template::resolve(value, scope)?);
        }
        let body = step
            .body
            .as_deref()
            .map(|b| template::resolve(b, scope))
            .transpose()?;
        let headers = http::merge_headers(&environment.headers, headers, body.is_some());

        let timeout = step
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.options.default_timeout);

        Ok(HttpRequest {
            method: step.method,
            url,
            headers,
            body,
            timeout,
        })
    }

    /// Send with the step's retry policy. Only network errors are
    /// retried; the wait doubles per attempt.
    #[instrument(skip(self, step, request), fields(step = %step.id, url = %request.url))]
    async fn send(&self, step: &Step, request: &HttpRequest) -> Result<HttpResponse, NetworkError> {
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let outcome = self.executor.execute(request).await;

            if let Some(recorder) = &self.recorder {
                let mut record = history::record_for(request, &outcome, self.options.project.clone());
                if outcome.is_err() {
                    record.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                }
                if let Err(err) = recorder.record(&record).await {
                    warn!("Failed to record history: {}", err);
                }
            }

            match outcome {
                Err(err) if attempt < step.options.retry && !self.cancel.is_canceled() => {
                    let wait = retry_wait(step.options.retry_wait_ms, attempt);
                    warn!(
                        "Request failed (attempt {}/{}), retrying in {} ms: {}",
                        attempt + 1,
                        step.options.retry + 1,
                        wait.as_millis(),
                        err
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Resolve, send, capture and assert one step.
    async fn execute_step(
        &self,
        step: &Step,
        scope: &mut VariableScope,
        environment: &Environment,
        result: &mut StepResult,
    ) {
        let started = Instant::now();
        let elapsed = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let request = match self.build_request(step, scope, environment) {
            Ok(request) => request,
            Err(err) => {
                error!("Step '{}' could not be sent: {}", step.id, err);
                result.status = StepStatus::Failed;
                result.error = Some(err.to_string());
                result.duration_ms = elapsed();
                return;
            }
        };
        result.request_snapshot = Some(request.snapshot());

        let response = match self.send(step, &request).await {
            Ok(response) => response,
            Err(err) => {
                error!("Step '{}' failed: {}", step.id, err);
                result.status = StepStatus::Failed;
                result.error = Some(StepError::from(err).to_string());
                result.assertion_failures = assertion::evaluate_all(&step.asserts, None, scope)
                    .into_iter()
                    .map(|r| r.detail)
                    .collect();
                result.duration_ms = elapsed();
                return;
            }
        };
        result.response_snapshot = Some(response.snapshot());
        result.duration_ms = response.duration_ms;

        let json = response.json();
        for c in &step.captures {
            match capture::extract_from_response(json.as_ref(), &response.headers, &c.path) {
                Ok(value) => {
                    debug!("Captured '{}' = {}", c.name, value);
                    scope.set_captured(c.name.clone(), value.clone());
                    result.captured.insert(c.name.clone(), value);
                }
                Err(err) => warn!("Capture '{}' in step '{}' left unset: {}", c.name, step.id, err),
            }
        }

        let facts = ResponseFacts {
            status: response.status,
            duration_ms: response.duration_ms,
            headers: &response.headers,
            json: json.as_ref(),
            raw_body: &response.body,
        };
        result.assertion_failures = assertion::evaluate_all(&step.asserts, Some(&facts), scope)
            .into_iter()
            .filter(|r| !r.pass)
            .map(|r| r.detail)
            .collect();
        result.status = if result.assertion_failures.is_empty() {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        };
    }
}

fn retry_wait(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_RETRY_WAIT)
}

fn check_environment(environment: &Environment) -> Result<(), EnvironmentError> {
    if let Some(base_url) = &environment.base_url {
        let parsed = url::Url::parse(base_url).map_err(|e| EnvironmentError::InvalidBaseUrl {
            name: environment.name.clone(),
            base_url: base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EnvironmentError::InvalidBaseUrl {
                name: environment.name.clone(),
                base_url: base_url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl ScenarioRunner for FlowRunner {
    #[instrument(skip(self, scenario, context), fields(name = %scenario.name, env = %context.environment.name))]
    async fn run(&self, scenario: &Scenario, context: RunContext) -> Result<Run, KestError> {
        let plan = graph::validate(scenario)?;
        check_environment(&context.environment)?;

        let RunContext {
            environment,
            mut scope,
        } = context;
        let mut run = Run::new(scenario, &environment.name);
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        let total = plan.order.len();
        let mut aborted = false;

        info!("Starting scenario: {} ({} step(s))", scenario.name, total);

        for (position, &index) in plan.order.iter().enumerate() {
            let step = &scenario.steps()[index];

            if let Some(reason) = self.skip_reason(&run, &plan, index, aborted) {
                run.canceled |= self.cancel.is_canceled();
                self.skip(&mut run, index, reason);
                continue;
            }

            Self::apply_mappings(&run, &plan, index, &mut scope);

            info!("Running step {}/{}: {}", position + 1, total, step.name);
            run.step_results[index].status = StepStatus::Running;
            self.emit_step(&run, index);

            let mut result = run.step_results[index].clone();
            self.execute_step(step, &mut scope, &environment, &mut result).await;

            if self.cancel.is_canceled() {
                info!("Run canceled while step '{}' was in flight; discarding its result", step.id);
                run.canceled = true;
                self.skip(&mut run, index, "run canceled while request was in flight".to_string());
                continue;
            }

            if result.status == StepStatus::Failed {
                aborted = self.options.abort_on_failure;
            }
            info!("Step '{}' {} ({} ms)", step.id, result.status, result.duration_ms);
            run.step_results[index] = result;
            self.emit_step(&run, index);
        }

        run.status = if run.canceled || run.count(StepStatus::Failed) > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };
        run.finished_at = Some(Utc::now());
        self.emit(ProgressEvent::done(&run));

        info!(
            "Scenario finished: {} ({} ms) - {} passed, {} failed, {} skipped",
            scenario.name,
            run.duration_ms(),
            run.count(StepStatus::Passed),
            run.count(StepStatus::Failed),
            run.count(StepStatus::Skipped)
        );

        Ok(run)
    }
}
