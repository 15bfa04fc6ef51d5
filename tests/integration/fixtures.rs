// tests/integration/fixtures.rs

//! In-process HTTP doubles for workers and coordinators, served by axum
//! on ephemeral ports.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

/// State of one mock worker: it adopts whatever role is announced to it
/// and reports ready immediately.
#[derive(Default)]
pub struct WorkerState {
    pub current_role: Mutex<String>,
    pub ready: Mutex<bool>,
    /// (role, request body) in arrival order.
    pub announces: Mutex<Vec<(String, Value)>>,
    pub task_polls: Mutex<u32>,
    /// Remaining 500 responses before `/v1/config` starts succeeding.
    pub config_failures: Mutex<u32>,
}

pub struct MockWorker {
    pub addr: SocketAddr,
    pub state: Arc<WorkerState>,
}

impl MockWorker {
    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

async fn worker_config(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    {
        let mut failures = state.config_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))).into_response();
        }
    }
    Json(json!({
        "model_name": "llama",
        "max_seq_len": 8192,
        "max_output_len": 1024,
        "total_slots_num": 200,
        "total_block_num": 4096,
        "block_size": 128,
        "group_id": 0
    }))
    .into_response()
}

async fn worker_status(State(state): State<Arc<WorkerState>>) -> Json<Value> {
    let role = state.current_role.lock().clone();
    let role_status = if *state.ready.lock() { "ready" } else { "unknown" };
    Json(json!({
        "service": {
            "role_status": role_status,
            "current_role": role,
            "model_name": "llama"
        },
        "resource": { "avail_slots_num": 150, "avail_block_num": 3000 }
    }))
}

async fn worker_role_prefill(
    State(state): State<Arc<WorkerState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.announces.lock().push(("prefill".into(), body));
    *state.current_role.lock() = "prefill".into();
    *state.ready.lock() = true;
    Json(json!({}))
}

async fn worker_role_decode(
    State(state): State<Arc<WorkerState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.announces.lock().push(("decode".into(), body));
    *state.current_role.lock() = "decode".into();
    *state.ready.lock() = true;
    Json(json!({}))
}

async fn worker_tasks(State(state): State<Arc<WorkerState>>) -> Json<Value> {
    *state.task_polls.lock() += 1;
    Json(json!({ "tasks": [] }))
}

/// Starts a mock worker on an ephemeral port.
pub async fn spawn_worker() -> MockWorker {
    let state = Arc::new(WorkerState::default());
    *state.current_role.lock() = "undefined".into();
    let app = Router::new()
        .route("/v1/config", get(worker_config))
        .route("/v1/status", get(worker_status))
        .route("/v1/role/prefill", post(worker_role_prefill))
        .route("/v1/role/decode", post(worker_role_decode))
        .route("/v1/instances/tasks", get(worker_tasks))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());
    MockWorker { addr, state }
}

/// State of one mock coordinator: records everything pushed to it.
#[derive(Default)]
pub struct CoordinatorState {
    pub refreshes: Mutex<Vec<Value>>,
    pub offlines: Mutex<Vec<Value>>,
    pub info_polls: Mutex<u32>,
}

pub struct MockCoordinator {
    pub addr: SocketAddr,
    pub state: Arc<CoordinatorState>,
}

async fn coordinator_refresh(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.refreshes.lock().push(body);
    Json(json!({}))
}

async fn coordinator_offline(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.offlines.lock().push(body);
    Json(json!({}))
}

async fn coordinator_info(State(state): State<Arc<CoordinatorState>>) -> Json<Value> {
    *state.info_polls.lock() += 1;
    Json(json!({ "nodes": [], "request_stats": {
        "mean_input_len": 0.0, "mean_output_len": 0.0,
        "p99_input_len": 0, "p99_output_len": 0, "sample_count": 0
    }}))
}

/// Starts a mock coordinator on an ephemeral port.
pub async fn spawn_coordinator() -> MockCoordinator {
    let state = Arc::new(CoordinatorState::default());
    let app = Router::new()
        .route("/v1/instances/refresh", post(coordinator_refresh))
        .route("/v1/instances/offline", post(coordinator_offline))
        .route("/v1/coordinator_info", get(coordinator_info))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());
    MockCoordinator { addr, state }
}
