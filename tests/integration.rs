use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, path::PathBuf};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use kest::config::{self, KestConfig};
use kest::history::{HistoryFilter, HistoryRecorder};
use kest::report;
use kest::{
    sse, Environment, FlowRunner, ReqwestExecutor, RunContext, RunStatus, Scenario,
    ScenarioRunner, StepStatus,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
struct AppState {
    users: Arc<Mutex<HashMap<String, String>>>,
    projects: Arc<Mutex<BTreeMap<u64, String>>>,
    next_project: Arc<Mutex<u64>>,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let username = body["username"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();
    let mut users = state.users.lock().unwrap();
    if username.is_empty() || users.contains_key(&username) {
        return (StatusCode::CONFLICT, Json(json!({"error": "username taken"})));
    }
    users.insert(username.clone(), password);
    (StatusCode::CREATED, Json(json!({"data": {"username": username}})))
}

async fn login(State(state): State<AppState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let username = body["username"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();
    let users = state.users.lock().unwrap();
    match users.get(username) {
        Some(stored) if stored == password => (
            StatusCode::OK,
            Json(json!({"data": {"access_token": format!("tok-{username}")}})),
        ),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad credentials"}))),
    }
}

async fn profile(State(state): State<AppState>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let username = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer tok-"))
        .map(str::to_string);
    match username {
        Some(name) if state.users.lock().unwrap().contains_key(&name) => {
            (StatusCode::OK, Json(json!({"data": {"username": name}})))
        }
        _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))),
    }
}

async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, [(header::HeaderName, String); 1], Json<Value>) {
    let name = body["name"].as_str().unwrap_or("unnamed").to_string();
    let id = {
        let mut next = state.next_project.lock().unwrap();
        *next += 1;
        *next
    };
    state.projects.lock().unwrap().insert(id, name.clone());
    (
        StatusCode::CREATED,
        [(header::LOCATION, format!("/projects/{id}"))],
        Json(json!({"data": {"id": id, "name": name}})),
    )
}

async fn get_project(State(state): State<AppState>, Path(id): Path<u64>) -> (StatusCode, Json<Value>) {
    match state.projects.lock().unwrap().get(&id) {
        Some(name) => (StatusCode::OK, Json(json!({"data": {"id": id, "name": name}}))),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "project not found"}))),
    }
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> (StatusCode, Json<Value>) {
    match state.projects.lock().unwrap().remove(&id) {
        Some(_) => (StatusCode::OK, Json(json!({"deleted": true}))),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "project not found"}))),
    }
}

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route("/health", get(|| async { Json(json!({"ok": true})) }))
            .route("/register", post(register))
            .route("/login", post(login))
            .route("/users/profile", get(profile))
            .route("/projects", post(create_project))
            .route("/projects/:id", get(get_project).delete(delete_project))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Json(json!({"slow": true}))
                }),
            )
            .with_state(AppState::default());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn environment(&self, name: &str) -> Environment {
        Environment::new(name)
            .with_base_url(self.base_url.clone())
            .with_variable("user_prefix", name)
            .with_variable("password", format!("pw-{name}"))
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn fixture(path: &str, base_url: &str) -> String {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let fixture_path = manifest_dir.join("tests/fixtures").join(path);
    let content = fs::read_to_string(&fixture_path)
        .unwrap_or_else(|e| panic!("failed to read {fixture_path:?}: {e}"));
    content.replace("__BASE_URL__", base_url)
}

fn load_scenario(path: &str, base_url: &str) -> Scenario {
    let content = fixture(path, base_url);
    if path.contains(".graph.") {
        kest::graph::parse_graph(&content)
            .unwrap_or_else(|e| panic!("failed to parse graph {path}: {e}"))
    } else {
        kest::markdown_parser::parse_script(&content, None)
            .unwrap_or_else(|e| panic!("failed to parse flow {path}: {e}"))
    }
}

fn runner() -> FlowRunner {
    FlowRunner::new(Arc::new(ReqwestExecutor::new()))
}

#[tokio::test]
async fn auth_flow_passes_with_captures() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("auth_flow.flow.md", &server.base_url);

    let run = runner()
        .run(&scenario, RunContext::new(server.environment("dev")))
        .await
        .expect("runner returned error for auth flow");

    assert!(run.passed(), "auth flow should pass: {:#?}", run.step_results);
    assert_eq!(run.count(StepStatus::Passed), 3);
    let username = run.step("step-1").unwrap().captured["username"].as_str().unwrap();
    assert!(username.starts_with("dev_"));
    let profile = run.step("step-3").unwrap();
    let sent = profile.request_snapshot.as_ref().unwrap();
    assert_eq!(sent.headers["Authorization"], format!("Bearer tok-{username}"));

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_capture_path_fails_dependent_step_and_skips_rest() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("auth_flow_missing_capture.flow.md", &server.base_url);

    let run = runner()
        .run(&scenario, RunContext::new(server.environment("dev")))
        .await
        .expect("runner returned error");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step("step-2").unwrap().status, StepStatus::Passed);
    assert!(!run.step("step-2").unwrap().captured.contains_key("access_token"));

    let profile = run.step("step-3").unwrap();
    assert_eq!(profile.status, StepStatus::Failed);
    assert_eq!(profile.error.as_deref(), Some("unresolved variable 'access_token'"));
    assert!(profile.request_snapshot.is_none());

    assert_eq!(run.step("step-4").unwrap().status, StepStatus::Skipped);

    server.shutdown().await;
}

#[tokio::test]
async fn project_lifecycle_uses_absolute_urls_and_header_captures() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("project_lifecycle.flow.md", &server.base_url);

    // No base_url: absolute URLs must not need one.
    let run = runner()
        .run(&scenario, RunContext::new(Environment::new("bare")))
        .await
        .expect("runner returned error");

    assert!(run.passed(), "lifecycle should pass: {:#?}", run.step_results);
    let create = run.step("step-1").unwrap();
    let id = create.captured["project_id"].as_u64().unwrap();
    assert_eq!(create.captured["location"], json!(format!("/projects/{id}")));

    server.shutdown().await;
}

#[tokio::test]
async fn graph_failure_only_skips_its_own_branch() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("graph_branches.graph.yaml", &server.base_url);

    let run = runner()
        .run(&scenario, RunContext::new(server.environment("dev")))
        .await
        .expect("runner returned error");

    let status = |id: &str| run.step(id).unwrap().status;
    assert_eq!(status("create"), StepStatus::Passed);
    assert_eq!(status("fetch"), StepStatus::Passed);
    assert_eq!(status("broken"), StepStatus::Failed);
    assert_eq!(status("after_broken"), StepStatus::Skipped);
    assert_eq!(status("health"), StepStatus::Passed);
    assert_eq!(run.status, RunStatus::Failed);

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_runs_in_different_environments_stay_isolated() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("auth_flow.flow.md", &server.base_url);

    let names = ["dev", "staging", "qa", "perf", "demo", "canary"];
    let jobs = names
        .iter()
        .map(|name| (scenario.clone(), RunContext::new(server.environment(name))))
        .collect();
    let results = runner().run_all(jobs, 4).await;

    for (name, result) in names.iter().zip(results) {
        let run = result.expect("run failed to start");
        assert_eq!(run.environment, *name);
        assert!(run.passed(), "{name} run failed: {:#?}", run.step_results);
        let username = run.step("step-1").unwrap().captured["username"].as_str().unwrap().to_string();
        assert!(username.starts_with(&format!("{name}_")), "{name} saw {username}");
        assert_eq!(
            run.step("step-2").unwrap().captured["access_token"],
            json!(format!("tok-{username}"))
        );
    }

    server.shutdown().await;
}

#[tokio::test]
async fn step_timeout_is_a_network_failure() {
    let server = TestServer::spawn().await;
    let scenario = kest::markdown_parser::parse_script(
        "## Step 1: slow\n\n```kest\nGET /slow\n\n[Asserts]\nstatus == 200\n\n[Options]\ntimeout: 200ms\n```\n",
        Some("slow"),
    )
    .unwrap();

    let run = runner()
        .run(&scenario, RunContext::new(server.environment("dev")))
        .await
        .unwrap();

    let step = run.step("step-1").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(step.assertion_failures.len(), 1);
    assert!(step.response_snapshot.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn history_records_every_request_and_replays() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("project_lifecycle.flow.md", &server.base_url);
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");
    let recorder = Arc::new(
        HistoryRecorder::open(&dir.path().join("history.db"), Some(log_dir.clone()))
            .await
            .unwrap(),
    );

    let run = runner()
        .with_recorder(Arc::clone(&recorder))
        .run(&scenario, RunContext::new(Environment::new("bare")))
        .await
        .unwrap();
    assert!(run.passed());

    let records = recorder.query(&HistoryFilter::default()).await.unwrap();
    assert_eq!(records.len(), 4);
    let logged: usize = fs::read_dir(&log_dir)
        .unwrap()
        .map(|entry| fs::read_to_string(entry.unwrap().path()).unwrap().lines().count())
        .sum();
    assert_eq!(logged, 4);

    // Newest first: gone, delete, fetch, create.
    let fetch = &records[2];
    assert_eq!(fetch.method, "GET");
    assert_eq!(fetch.response_status, Some(200));

    let mut overrides = BTreeMap::new();
    overrides.insert("X-Replay".to_string(), "1".to_string());
    let replayed = recorder
        .replay(fetch.id, &overrides, &ReqwestExecutor::new(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_ne!(replayed.id, fetch.id);
    assert_eq!(replayed.url, fetch.url);
    assert_eq!(replayed.response_status, Some(404));
    assert_eq!(replayed.request_headers.get("X-Replay").map(String::as_str), Some("1"));

    let original = recorder.get(fetch.id).await.unwrap();
    assert_eq!(original.response_status, Some(200));

    let deletes = recorder
        .query(&HistoryFilter {
            method: Some("DELETE".to_string()),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(deletes.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn sse_stream_follows_execution_order() {
    let server = TestServer::spawn().await;
    let scenario = load_scenario("auth_flow_missing_capture.flow.md", &server.base_url);
    let (events, mut rx) = report::channel(report::DEFAULT_EVENT_CAPACITY);

    let runner = runner().with_events(events);
    let run = runner
        .run(&scenario, RunContext::new(server.environment("dev")))
        .await
        .unwrap();
    drop(runner);

    let mut out: Vec<u8> = Vec::new();
    sse::write_stream(&mut rx, &mut out).await.unwrap();
    let frames = sse::parse_sse_events(&String::from_utf8(out).unwrap());

    let seen: Vec<String> = frames
        .iter()
        .map(|f| {
            let data = f.data_json.as_ref().unwrap();
            assert_eq!(data["run_id"], json!(run.id));
            match f.event_type.as_str() {
                "step" => format!(
                    "{}:{}",
                    data["step_id"].as_str().unwrap(),
                    data["status"].as_str().unwrap()
                ),
                other => format!("{other}:{}", data["status"].as_str().unwrap()),
            }
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            "step-1:running",
            "step-1:passed",
            "step-2:running",
            "step-2:passed",
            "step-3:running",
            "step-3:failed",
            "step-4:skipped",
            "done:failed",
        ]
    );
    let passed = &frames[1].data_json.as_ref().unwrap()["data"];
    assert!(passed["duration_ms"].is_u64());

    server.shutdown().await;
}

#[tokio::test]
async fn project_config_selects_environment_and_loads_directory() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let config_yaml = format!(
        "active_env: local\nenvironments:\n  local:\n    base_url: {}\n    variables:\n      user_prefix: cfg\n      password: pw\n",
        server.base_url
    );
    let config_path = dir.path().join(config::CONFIG_DIR).join(config::CONFIG_FILE);
    fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    fs::write(&config_path, config_yaml).unwrap();
    let flows = dir.path().join("flows");
    fs::create_dir_all(&flows).unwrap();
    fs::write(flows.join("auth.flow.md"), fixture("auth_flow.flow.md", &server.base_url)).unwrap();
    fs::write(flows.join("README.md"), "# not a flow\n").unwrap();

    let found = config::discover(&flows).unwrap();
    let cfg = KestConfig::load(&found).unwrap();
    let environment = cfg.active_environment(None).unwrap();
    let scenarios = config::load_path(&flows).unwrap();
    assert_eq!(scenarios.len(), 1);

    let run = runner()
        .run(&scenarios[0], RunContext::new(environment))
        .await
        .unwrap();
    assert!(run.passed(), "{:#?}", run.step_results);
    assert_eq!(run.environment, "local");

    server.shutdown().await;
}
