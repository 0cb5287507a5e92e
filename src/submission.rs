use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::conductor::{ConductorEvent, Shared};
use crate::parser;
use crate::safety::ShutdownHandle;

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static SUBMISSIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("submissions_total", "Submissions received, by outcome"),
        &["outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= STATE ============================= */

/// Handle bridging HTTP requests to the conductor task: an event channel for
/// grading and a read-only snapshot for everything else.
#[derive(Clone)]
pub struct ApiState {
    pub events: mpsc::Sender<ConductorEvent>,
    pub shared: Shared,
    pub shutdown: ShutdownHandle,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    solution: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/* ============================= HANDLERS ============================= */

async fn submit_handler(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let stage = match state.shared.read() {
        Ok(view) => view.stage,
        Err(_) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "conductor state unavailable".to_string(),
            );
        }
    };
    if !stage.is_grading() {
        SUBMISSIONS_TOTAL.with_label_values(&["rejected"]).inc();
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("cannot submit at stage {stage}"),
        );
    }

    // Literal-encode the solution so quotes, backticks, and newlines survive
    // the fenced wire format.
    let wrapped = parser::wrap_submission(&request.solution);
    let (reply_tx, reply_rx) = oneshot::channel();
    let event = ConductorEvent::Submit {
        wrapped,
        reply: reply_tx,
    };
    if state.events.send(event).await.is_err() {
        SUBMISSIONS_TOTAL.with_label_values(&["rejected"]).inc();
        return error_response(StatusCode::BAD_REQUEST, "session has ended".to_string());
    }

    match reply_rx.await {
        Ok(Ok(snapshot)) => {
            SUBMISSIONS_TOTAL.with_label_values(&["graded"]).inc();
            (StatusCode::OK, Json(snapshot)).into_response()
        }
        Ok(Err(e)) => {
            SUBMISSIONS_TOTAL.with_label_values(&["rejected"]).inc();
            warn!(error = %e, "submission_rejected");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(_) => {
            SUBMISSIONS_TOTAL.with_label_values(&["rejected"]).inc();
            error_response(StatusCode::BAD_REQUEST, "session has ended".to_string())
        }
    }
}

async fn status_handler(State(state): State<ApiState>) -> Response {
    match state.shared.read() {
        Ok(view) => Json(serde_json::json!({ "stage": view.stage })).into_response(),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "conductor state unavailable".to_string(),
        ),
    }
}

async fn get_app_handler(State(state): State<ApiState>) -> Response {
    match state.shared.read() {
        Ok(view) => Json(serde_json::json!({
            "app_name": view.app_name,
            "namespace": view.namespace,
            "description": view.description,
        }))
        .into_response(),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "conductor state unavailable".to_string(),
        ),
    }
}

async fn get_problem_handler(State(state): State<ApiState>) -> Response {
    match state.shared.read() {
        Ok(view) => Json(serde_json::json!({ "problem_id": view.problem_id })).into_response(),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "conductor state unavailable".to_string(),
        ),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= SERVER ============================= */

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/submit", post(submit_handler))
        .route("/status", get(status_handler))
        .route("/get_app", get(get_app_handler))
        .route("/get_problem", get(get_problem_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the submission API until shutdown is requested, then drain in-flight
/// requests for at most five seconds. No signal handlers are installed here;
/// the conductor owns SIGINT.
pub async fn serve(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind submission API on {addr}"))?;
    info!(addr = %addr, "submission_api_started");

    let mut graceful_rx = shutdown.subscribe();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.recv().await;
        })
        .into_future();
    tokio::pin!(server);

    let mut drain_rx = shutdown.subscribe();
    tokio::select! {
        result = &mut server => {
            result.context("submission API server failed")?;
        }
        _ = async {
            let _ = drain_rx.recv().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        } => {
            warn!("submission_api_drain_timeout");
        }
    }

    info!("submission_api_stopped");
    Ok(())
}

/* ============================= TESTS ============================= */
