//! Stub KataGo HTTP bridge for integration tests.
//!
//! Runs an axum server on its own thread and runtime so the code under test
//! can block its own runtime freely. The server can start late to simulate a
//! slow engine load.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::runtime::Builder;
use tokio::sync::oneshot;

/// Canned answer for one endpoint.
#[derive(Clone, Debug)]
pub struct StubResponse {
    pub status: u16,
    pub body: String,
    pub content_type: &'static str,
    pub delay: Duration,
}

impl StubResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            content_type: "application/json",
            delay: Duration::ZERO,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            content_type: "text/plain",
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Behaviour of the stub server.
#[derive(Clone, Debug)]
pub struct StubBehavior {
    pub select_move: StubResponse,
    pub score: StubResponse,
    /// Delay before the server starts accepting connections.
    pub start_delay: Duration,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            select_move: StubResponse::json(
                200,
                json!({
                    "move": "Q16",
                    "win_prob": 0.5274,
                    "score": 0.61,
                    "best_moves": [
                        {"move": "Q16", "psv": 1200},
                        {"move": "D4", "psv": 980},
                        {"move": "Q4", "psv": 410},
                        {"move": "C3", "psv": 12}
                    ]
                }),
            ),
            score: StubResponse::json(
                200,
                json!({
                    "win_prob": 0.5274,
                    "score": 0.61,
                    "ownership": [0.12, -0.4, 0.9]
                }),
            ),
            start_delay: Duration::ZERO,
        }
    }
}

/// Request seen by the stub.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub endpoint: &'static str,
    pub engine_id: String,
    pub body: Value,
}

#[derive(Clone)]
struct StubState {
    behavior: Arc<StubBehavior>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubState {
    fn record(&self, endpoint: &'static str, engine_id: String, body: &Bytes) {
        let body = serde_json::from_slice(body).unwrap_or(Value::Null);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                endpoint,
                engine_id,
                body,
            });
        }
    }
}

/// Handle for the stub server; shuts it down on drop.
pub struct StubServer {
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map_or_else(|_| Vec::new(), |entries| entries.clone())
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Returns a free loopback address.
pub fn allocate_addr() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);
    addr
}

/// Base URL nothing listens on.
pub fn unreachable_base_url() -> String {
    format!("http://{}", allocate_addr())
}

/// Spawn a stub server. Blocks until it accepts connections unless
/// `start_delay` is set.
pub fn spawn_stub(behavior: StubBehavior) -> StubServer {
    let addr = allocate_addr();
    let start_delay = behavior.start_delay;
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = StubState {
        behavior: Arc::new(behavior),
        requests: Arc::clone(&requests),
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::channel::<()>();

    let join = thread::spawn(move || {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("stub runtime");
        runtime.block_on(async move {
            if !start_delay.is_zero() {
                tokio::time::sleep(start_delay).await;
            }
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .expect("bind stub listener");
            let _ = ready_tx.send(());

            let app = Router::new()
                .route("/", get(root))
                .route("/select-move/{engine_id}", post(select_move))
                .route("/score/{engine_id}", post(score))
                .with_state(state);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("stub server");
        });
    });

    if start_delay.is_zero() {
        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("stub server did not start");
    }

    StubServer {
        base_url: format!("http://{}", addr),
        shutdown: Some(shutdown_tx),
        join: Some(join),
        requests,
    }
}

async fn root() -> &'static str {
    "KataGo HTTP bridge"
}

async fn select_move(
    State(state): State<StubState>,
    Path(engine_id): Path<String>,
    body: Bytes,
) -> Response {
    state.record("select-move", engine_id, &body);
    respond(&state.behavior.select_move).await
}

async fn score(
    State(state): State<StubState>,
    Path(engine_id): Path<String>,
    body: Bytes,
) -> Response {
    state.record("score", engine_id, &body);
    respond(&state.behavior.score).await
}

async fn respond(response: &StubResponse) -> Response {
    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body.clone(),
    )
        .into_response()
}
