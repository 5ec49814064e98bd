//! Kest CLI - Markdown-driven API flow runner.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kest::assertion::Assertion;
use kest::capture;
use kest::config::{self, KestConfig};
use kest::history::{HistoryFilter, HistoryRecorder};
use kest::model::{Capture, Environment, HistoryRecord, Run, Scenario, ScenarioKind, Step};
use kest::report::{self, ConsoleReporter, ProgressEvent, ReportFormat};
use kest::sink::ConsoleSink;
use kest::{sse, CancelToken, FlowRunner, HttpMethod, ReqwestExecutor, RunContext, RunOptions};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Kest - run Markdown API flows, inspect and replay request history.
#[derive(Parser, Debug)]
#[command(name = "kest", version, about)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Config file (default: nearest .kest/config.yaml).
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a flow file, graph file or directory of scenarios.
    Run(RunArgs),
    /// Send one ad-hoc request through the flow engine.
    Request(RequestArgs),
    /// List recent requests.
    History {
        /// Number of records to show.
        #[arg(short = 'n', default_value_t = 20)]
        limit: usize,
        /// Include requests from every project.
        #[arg(long)]
        global: bool,
        /// Only this HTTP method.
        #[arg(long)]
        method: Option<String>,
        /// Only URLs containing this text.
        #[arg(long)]
        url: Option<String>,
    },
    /// Show one history record with request and response bodies.
    Show { id: i64 },
    /// Re-send a recorded request.
    Replay {
        id: i64,
        /// Header override, `Name: value`.
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// Manage environments.
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },
}

#[derive(Subcommand, Debug)]
enum EnvCommand {
    /// List environments; the active one is starred.
    List,
    /// Make an environment the active one.
    Use { name: String },
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Environment to run against instead of the active one.
    #[arg(short = 'e', long = "env", env = "KEST_ENV")]
    env: Option<String>,

    /// Default per-step timeout in milliseconds.
    #[arg(short = 't', long = "timeout")]
    timeout_ms: Option<u64>,

    /// Output format.
    #[arg(long = "format", default_value = "text")]
    format: OutputFormat,

    /// Directory to save run report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report file format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Console to submit finished runs to.
    #[arg(long = "console-url", env = "KEST_CONSOLE_URL")]
    console_url: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Scenario file or directory.
    path: PathBuf,

    /// Run scenarios concurrently.
    #[arg(long)]
    parallel: bool,

    /// Concurrent runs with --parallel (default from config).
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    /// Skip every remaining step after the first failure.
    #[arg(long = "fail-fast")]
    fail_fast: bool,

    #[command(flatten)]
    exec: ExecArgs,
}

#[derive(Args, Debug)]
struct RequestArgs {
    method: String,
    url: String,

    /// Request header, `Name: value`.
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body.
    #[arg(short = 'd', long = "data")]
    data: Option<String>,

    /// Capture, `name=path`.
    #[arg(short = 'c', long = "capture")]
    captures: Vec<String>,

    /// Assertion, e.g. `status == 200`.
    #[arg(short = 'a', long = "assert")]
    asserts: Vec<String>,

    #[command(flatten)]
    exec: ExecArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Sse,
    Json,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "warn" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    // stdout carries SSE frames and JSON output
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

/// Loaded config plus the project it belongs to.
struct Workspace {
    config: KestConfig,
    config_path: Option<PathBuf>,
    project: Option<PathBuf>,
}

impl Workspace {
    /// Find and load the config. With `check_active` a dangling
    /// `active_env` is an error; `env use` skips the check so it can
    /// repair one.
    fn load(explicit: Option<PathBuf>, check_active: bool) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        let config_path = explicit.or_else(|| config::discover(&cwd));
        let config = match &config_path {
            Some(path) => {
                let config = KestConfig::load(path)?;
                if check_active {
                    config
                        .validate()
                        .with_context(|| format!("Invalid config {}", path.display()))?;
                }
                config
            }
            None => {
                debug!("No {} found; using defaults", config::CONFIG_FILE);
                KestConfig::default()
            }
        };
        let project = config_path.as_deref().and_then(config::project_root);
        Ok(Self {
            config,
            config_path,
            project,
        })
    }

    /// Selected environment. Without any config an anonymous
    /// environment is used, so absolute URLs still work.
    fn environment(&self, selected: Option<&str>) -> Result<Environment> {
        if selected.is_none() && self.config.environments.is_empty() {
            return Ok(Environment::new("default"));
        }
        Ok(self.config.active_environment(selected)?)
    }

    fn project_label(&self) -> Option<String> {
        self.project.as_ref().map(|p| p.display().to_string())
    }

    async fn recorder(&self) -> Option<Arc<HistoryRecorder>> {
        let db_path = config::kest_home().join(config::HISTORY_DB);
        let log_dir = self
            .project
            .as_ref()
            .map(|p| p.join(config::CONFIG_DIR).join(config::LOG_DIR));
        match HistoryRecorder::open(&db_path, log_dir).await {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                warn!("History disabled: {}", e);
                None
            }
        }
    }

    async fn require_recorder(&self) -> Result<HistoryRecorder> {
        let db_path = config::kest_home().join(config::HISTORY_DB);
        HistoryRecorder::open(&db_path, None)
            .await
            .with_context(|| format!("Failed to open history at {}", db_path.display()))
    }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid header '{raw}', expected 'Name: value'"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("invalid header '{raw}', empty name");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Consume progress events according to the output format.
fn spawn_progress(
    mut rx: mpsc::Receiver<ProgressEvent>,
    format: OutputFormat,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match format {
            OutputFormat::Text => {
                let reporter = ConsoleReporter::new(std::io::stdout().is_terminal());
                while let Some(event) = rx.recv().await {
                    if let Some(line) = reporter.step_line(&event) {
                        println!("{line}");
                    }
                }
            }
            OutputFormat::Sse => {
                let mut stdout = tokio::io::stdout();
                if let Err(e) = sse::write_stream(&mut rx, &mut stdout).await {
                    error!("Event stream closed: {}", e);
                }
            }
            OutputFormat::Json => while rx.recv().await.is_some() {},
        }
    })
}

/// Run scenarios, print and deliver results. Returns `true` when every
/// run passed.
async fn execute(
    ws: &Workspace,
    scenarios: Vec<Scenario>,
    exec: &ExecArgs,
    jobs: usize,
    fail_fast: bool,
) -> Result<bool> {
    let environment = ws.environment(exec.env.as_deref())?;
    info!(
        "Running {} scenario(s) against '{}'",
        scenarios.len(),
        environment.name
    );

    let timeout_ms = exec.timeout_ms.unwrap_or(ws.config.defaults.timeout_ms);
    let (events, rx) = report::channel(report::DEFAULT_EVENT_CAPACITY);
    let progress = spawn_progress(rx, exec.format);

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; canceling remaining steps");
            on_interrupt.cancel();
        }
    });

    let mut runner = FlowRunner::new(Arc::new(ReqwestExecutor::new()))
        .with_events(events)
        .with_cancel_token(cancel)
        .with_options(RunOptions {
            default_timeout: Duration::from_millis(timeout_ms),
            abort_on_failure: fail_fast,
            project: ws.project_label(),
        });
    if let Some(recorder) = ws.recorder().await {
        runner = runner.with_recorder(recorder);
    }

    let total_start = Instant::now();
    let job_list = scenarios
        .into_iter()
        .map(|s| (s, RunContext::new(environment.clone())))
        .collect();
    let results = runner.run_all(job_list, jobs).await;
    drop(runner);
    if let Err(e) = progress.await {
        error!("Progress reporter failed: {}", e);
    }
    let total_ms = u64::try_from(total_start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut runs: Vec<Run> = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(run) => runs.push(run),
            Err(e) => {
                error!("Scenario aborted: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }

    match exec.format {
        OutputFormat::Text => {
            let reporter = ConsoleReporter::new(std::io::stdout().is_terminal());
            println!("\n{}", reporter.summary(&runs, total_ms));
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        OutputFormat::Sse => {}
    }

    if let Some(dir) = &exec.report_dir {
        for run in &runs {
            match report::save_run_report(run, dir, exec.report_format) {
                Ok(path) => info!("Report saved: {}", path.display()),
                Err(e) => error!("Failed to save report: {:#}", e),
            }
        }
    }

    let console_url = exec.console_url.clone().or_else(|| ws.config.console.url.clone());
    if let Some(url) = console_url {
        match ConsoleSink::new(url) {
            Ok(mut sink) => {
                if let Some(token) = &ws.config.console.token {
                    sink = sink.with_token(token.clone());
                }
                let delivered = sink.submit_all(&runs).await;
                info!("Delivered {}/{} run(s) to console", delivered, runs.len());
            }
            Err(e) => error!("Console sink unavailable: {:#}", e),
        }
    }

    if let Some(e) = first_error {
        eprintln!("\x1b[31mError: {e}\x1b[0m");
        return Ok(false);
    }
    Ok(runs.iter().all(Run::passed))
}

fn request_scenario(args: &RequestArgs) -> Result<Scenario> {
    let method: HttpMethod = args
        .method
        .parse()
        .map_err(|e| anyhow!("{e}"))?;
    let mut step = Step::new("request", method, args.url.clone());
    step.name = format!("{} {}", method, args.url);
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        step.headers.insert(name, value);
    }
    step.body = args.data.clone();
    for raw in &args.captures {
        let (name, path) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid capture '{raw}', expected name=path"))?;
        let (name, path) = (name.trim(), path.trim());
        capture::validate(name, path).map_err(|e| anyhow!("invalid capture '{raw}': {e}"))?;
        step.captures.push(Capture {
            name: name.to_string(),
            path: path.to_string(),
        });
    }
    for raw in &args.asserts {
        let assertion =
            Assertion::parse(raw).map_err(|e| anyhow!("invalid assertion '{raw}': {e}"))?;
        step.asserts.push(assertion);
    }
    Ok(Scenario {
        id: "request".to_string(),
        name: "request".to_string(),
        source: None,
        kind: ScenarioKind::Script { steps: vec![step] },
    })
}

fn print_history_line(record: &HistoryRecord) {
    let status = match (record.response_status, &record.error) {
        (Some(status), _) if status < 400 => format!("\x1b[32m{status}\x1b[0m"),
        (Some(status), _) => format!("\x1b[31m{status}\x1b[0m"),
        (None, _) => "\x1b[31mERR\x1b[0m".to_string(),
    };
    println!(
        "#{:<6} {}  {:<7} {:<60} {} {:>6} ms",
        record.id,
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.method,
        record.url,
        status,
        record.duration_ms
    );
}

fn print_record(record: &HistoryRecord) {
    print_history_line(record);
    if let Some(project) = &record.project {
        println!("Project: {project}");
    }
    println!("\n> {} {}", record.method, record.url);
    for (name, value) in &record.request_headers {
        println!("> {name}: {value}");
    }
    if let Some(body) = &record.request_body {
        println!("\n{}", pretty_body(body));
    }
    if let Some(error) = &record.error {
        println!("\n\x1b[31mError: {error}\x1b[0m");
        return;
    }
    if let Some(status) = record.response_status {
        println!("\n< {status}");
    }
    for (name, value) in &record.response_headers {
        println!("< {name}: {value}");
    }
    if let Some(body) = &record.response_body {
        println!("\n{}", pretty_body(body));
    }
}

fn pretty_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| body.to_string())
}

fn config_path_for_write(ws: &Workspace) -> Result<&Path> {
    ws.config_path.as_deref().ok_or_else(|| {
        anyhow!(
            "no {}/{} found in this directory or its parents",
            config::CONFIG_DIR,
            config::CONFIG_FILE
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let repairing = matches!(
        cli.command,
        Command::Env {
            command: EnvCommand::Use { .. }
        }
    );
    let ws = Workspace::load(cli.config, !repairing)?;

    let success = match cli.command {
        Command::Run(args) => {
            if !args.path.exists() {
                bail!("Path does not exist: {}", args.path.display());
            }
            let scenarios = config::load_path(&args.path)?;
            if scenarios.is_empty() {
                bail!("No scenarios found in {}", args.path.display());
            }
            let jobs = if args.parallel {
                args.jobs.unwrap_or(ws.config.defaults.jobs)
            } else {
                1
            };
            execute(&ws, scenarios, &args.exec, jobs, args.fail_fast).await?
        }
        Command::Request(args) => {
            let scenario = request_scenario(&args)?;
            execute(&ws, vec![scenario], &args.exec, 1, false).await?
        }
        Command::History {
            limit,
            global,
            method,
            url,
        } => {
            let recorder = ws.require_recorder().await?;
            let filter = HistoryFilter {
                limit,
                project: if global { None } else { ws.project_label() },
                method,
                url_contains: url,
            };
            let records = recorder.query(&filter).await?;
            if records.is_empty() {
                println!("No history records.");
            }
            for record in &records {
                print_history_line(record);
            }
            true
        }
        Command::Show { id } => {
            let recorder = ws.require_recorder().await?;
            print_record(&recorder.get(id).await?);
            true
        }
        Command::Replay { id, headers } => {
            let recorder = ws.require_recorder().await?;
            let overrides = headers
                .iter()
                .map(|raw| parse_header(raw))
                .collect::<Result<BTreeMap<_, _>>>()?;
            let timeout = Duration::from_millis(ws.config.defaults.timeout_ms);
            let record = recorder
                .replay(id, &overrides, &ReqwestExecutor::new(), timeout)
                .await?;
            println!("Replayed #{id} as #{}", record.id);
            print_record(&record);
            record.error.is_none()
        }
        Command::Env { command } => match command {
            EnvCommand::List => {
                for name in ws.config.environment_names() {
                    let marker = if ws.config.active_env.as_deref() == Some(name.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    let base_url = ws.config.environments[&name]
                        .base_url
                        .as_deref()
                        .unwrap_or("-");
                    println!("{marker} {name:<16} {base_url}");
                }
                true
            }
            EnvCommand::Use { name } => {
                let path = config_path_for_write(&ws)?;
                let mut config = ws.config.clone();
                config.use_environment(&name)?;
                config.save(path)?;
                println!("Active environment: {name}");
                true
            }
        },
    };

    if !success {
        exit(1);
    }

    Ok(())
}
