use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tr_core::config::DispatcherConfig;
use tr_core::version::Version;
use tr_daemon::dispatcher::{DispatchError, Dispatcher, HttpDispatcher, API_KEY_HEADER};
use tr_harness::process::ProcessRegistry;
use tr_harness::shutdown::ShutdownSignal;

#[derive(Default)]
struct Recorded {
    calls: Vec<String>,
    api_keys: Vec<Option<String>>,
    register_bodies: Vec<Value>,
    job_results: Vec<(String, Value)>,
    jobs: Option<Value>,
    heartbeat_status: Option<u16>,
}

type Shared = Arc<Mutex<Recorded>>;

fn record(state: &Shared, call: &str, headers: &HeaderMap) {
    let mut rec = state.lock().expect("lock");
    rec.calls.push(call.to_string());
    rec.api_keys.push(
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
}

async fn register(State(s): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    record(&s, "register", &headers);
    s.lock().expect("lock").register_bodies.push(body);
    StatusCode::OK
}

async fn refresh(State(s): State<Shared>, headers: HeaderMap, Path(_id): Path<String>) -> StatusCode {
    record(&s, "re-register", &headers);
    StatusCode::OK
}

async fn heartbeat(State(s): State<Shared>, headers: HeaderMap, Path(_id): Path<String>) -> StatusCode {
    record(&s, "heartbeat", &headers);
    let status = s.lock().expect("lock").heartbeat_status.unwrap_or(200);
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn unregister(State(s): State<Shared>, headers: HeaderMap, Path(_id): Path<String>) -> StatusCode {
    record(&s, "unregister", &headers);
    StatusCode::NO_CONTENT
}

async fn jobs(State(s): State<Shared>, headers: HeaderMap, Path(_id): Path<String>) -> Response {
    record(&s, "jobs", &headers);
    match s.lock().expect("lock").jobs.take() {
        Some(jobs) => Json(jobs).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn job_result(
    State(s): State<Shared>,
    headers: HeaderMap,
    Path((_id, job)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    record(&s, "job-result", &headers);
    s.lock().expect("lock").job_results.push((job, body));
    StatusCode::OK
}

async fn start_test_server() -> (String, Shared) {
    let state: Shared = Arc::default();
    let router = Router::new()
        .route("/api/v1/TaskWorker/clients", post(register))
        .route("/api/v1/TaskWorker/clients/{id}", put(refresh).delete(unregister))
        .route("/api/v1/TaskWorker/clients/{id}/heartbeat", post(heartbeat))
        .route("/api/v1/TaskWorker/clients/{id}/jobs", get(jobs))
        .route("/api/v1/TaskWorker/clients/{id}/jobs/{job}", post(job_result))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    (format!("http://{addr}/"), state)
}

fn dispatcher(host: String, api_key: Option<&str>) -> HttpDispatcher {
    let config = DispatcherConfig {
        host,
        request_timeout_secs: 5,
        api_key: api_key.map(str::to_string),
    };
    HttpDispatcher::new(&config, Version::new(1, 2, 0, 0)).expect("client")
}

#[tokio::test]
async fn lifecycle_sends_key_and_tracks_registration() {
    let (host, state) = start_test_server().await;
    let d = dispatcher(host, Some("secret"));

    assert!(!d.is_registered());
    assert!(matches!(d.send_heartbeat().await, Err(DispatchError::NotRegistered)));

    d.register().await.expect("register");
    assert!(d.is_registered());
    d.send_heartbeat().await.expect("heartbeat");
    d.re_register().await.expect("re-register");
    d.unregister().await.expect("unregister");
    assert!(!d.is_registered());

    let rec = state.lock().expect("lock");
    assert_eq!(rec.calls, vec!["register", "heartbeat", "re-register", "unregister"]);
    assert!(rec.api_keys.iter().all(|k| k.as_deref() == Some("secret")));
    assert_eq!(rec.register_bodies[0]["client_id"], json!(d.client_id()));
    assert_eq!(rec.register_bodies[0]["client_version"], json!("1.2.0.0"));
}

#[tokio::test]
async fn rejected_heartbeat_reports_status() {
    let (host, state) = start_test_server().await;
    let d = dispatcher(host, None);
    d.register().await.expect("register");
    state.lock().expect("lock").heartbeat_status = Some(503);

    match d.send_heartbeat().await {
        Err(DispatchError::Rejected { operation, status }) => {
            assert_eq!(operation, "heartbeat");
            assert_eq!(status, 503);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(state.lock().expect("lock").api_keys[0], None);
}

#[tokio::test]
async fn unregister_without_registration_is_a_no_op() {
    let (host, state) = start_test_server().await;
    let d = dispatcher(host, None);
    d.unregister().await.expect("no-op");
    assert!(state.lock().expect("lock").calls.is_empty());
}

#[tokio::test]
async fn no_pending_jobs_is_ok() {
    let (host, _state) = start_test_server().await;
    let d = dispatcher(host, None);
    d.register().await.expect("register");

    d.fetch_and_execute_tasks(&ShutdownSignal::new(), &ProcessRegistry::new())
        .await
        .expect("nothing to do");
}

#[cfg(unix)]
#[tokio::test]
async fn jobs_run_and_report_results() {
    let (host, state) = start_test_server().await;
    let d = dispatcher(host, None);
    d.register().await.expect("register");
    state.lock().expect("lock").jobs = Some(json!([
        { "id": "ok", "command": ["true"] },
        { "id": "bad", "command": ["sh", "-c", "exit 4"] },
    ]));

    let processes = ProcessRegistry::new();
    let result = d
        .fetch_and_execute_tasks(&ShutdownSignal::new(), &processes)
        .await;

    assert!(matches!(result, Err(DispatchError::Job { ref id, .. }) if id == "bad"));
    assert_eq!(processes.reap_exited().await, 0);
    assert_eq!(processes.kill_all().await, 0);

    let rec = state.lock().expect("lock");
    assert_eq!(rec.job_results.len(), 2);
    assert_eq!(rec.job_results[0].0, "ok");
    assert_eq!(rec.job_results[0].1["status"], json!("completed"));
    assert_eq!(rec.job_results[1].0, "bad");
    assert_eq!(rec.job_results[1].1["status"], json!("failed"));
    assert_eq!(rec.job_results[1].1["exit_code"], json!(4));
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_mid_job_is_cancellation() {
    let (host, state) = start_test_server().await;
    let d = dispatcher(host, None);
    d.register().await.expect("register");
    state.lock().expect("lock").jobs = Some(json!([{ "id": "slow", "command": ["sleep", "30"] }]));

    let cancel = ShutdownSignal::new();
    let processes = ProcessRegistry::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.trigger();
    });

    let result = d.fetch_and_execute_tasks(&cancel, &processes).await;
    assert!(result.expect_err("cancelled").is_cancelled());
    assert_eq!(processes.kill_all().await, 1);
    assert!(state.lock().expect("lock").job_results.is_empty());
}
