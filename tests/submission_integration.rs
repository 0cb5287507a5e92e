mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{FakeApp, FakeHealth, FakeInjector, FakeProbe, make_problem};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tower::ServiceExt;

use faultbench::conductor::{Conductor, Shared, Stage};
use faultbench::config::Config;
use faultbench::safety::ShutdownHandle;
use faultbench::submission::{ApiState, build_router};

// ══════════════════════════════════════════════════════════════════
// Submission API against a live conductor task
//
// The HTTP surface is driven with in-process requests; grading flows
// through the real event channel into the real state machine.
// ══════════════════════════════════════════════════════════════════

struct HttpRig {
    router: Router,
    shared: Shared,
    injector: Arc<FakeInjector>,
    _logs: tempfile::TempDir,
}

async fn start_http_rig() -> HttpRig {
    let app = Arc::new(FakeApp::default());
    let injector = Arc::new(FakeInjector::default());
    let health = Arc::new(FakeHealth::default());
    health.healthy.store(true, Ordering::SeqCst);

    let logs = tempfile::tempdir().unwrap();
    let config = Config {
        logs_dir: logs.path().to_path_buf(),
        ..Config::default()
    };

    let mut conductor = Conductor::new(
        config,
        make_problem(app, injector.clone(), false),
        Arc::new(FakeProbe { emulated: false }),
        health,
        ShutdownHandle::new(),
    );
    conductor.set_mitigation_timing(Duration::from_millis(100), Duration::from_millis(10));

    let shared = conductor.shared();
    let (events, events_rx) = mpsc::channel(16);
    tokio::spawn(conductor.run(events_rx));

    // Wait for setup to finish so grading can start.
    for _ in 0..200 {
        if shared.read().unwrap().stage == Stage::Noop {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let router = build_router(ApiState {
        events,
        shared: shared.clone(),
        shutdown: ShutdownHandle::new(),
    });
    HttpRig {
        router,
        shared,
        injector,
        _logs: logs,
    }
}

fn submit_request(solution: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/submit")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({ "solution": solution }).to_string()))
        .unwrap()
}

async fn json_of(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_full_grading_session_over_http() {
    let rig = start_http_rig().await;

    // Status shows the baseline stage.
    let resp = rig
        .router
        .clone()
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_of(resp).await, serde_json::json!({"stage": "noop"}));

    // Baseline, then the fault appears.
    let resp = rig.router.clone().oneshot(submit_request("No")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(rig.injector.injects.load(Ordering::SeqCst), 1);

    let resp = rig.router.clone().oneshot(submit_request("Yes")).await.unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["Detection"]["success"], true);
    assert!(body["TTD"].as_f64().is_some());

    let resp = rig.router.clone().oneshot(submit_request("geo")).await.unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["Localization"]["success"], true);

    let resp = rig
        .router
        .clone()
        .oneshot(submit_request("scaled the deployment back up"))
        .await
        .unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["Mitigation"]["success"], true);
    assert!(body["TTM"].as_f64().unwrap() >= body["TTD"].as_f64().unwrap());

    // Session is over: further submissions are rejected.
    for _ in 0..200 {
        if rig.shared.read().unwrap().stage == Stage::Done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let resp = rig.router.clone().oneshot(submit_request("again?")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_detection_format_keeps_stage_and_returns_snapshot() {
    let rig = start_http_rig().await;

    let resp = rig
        .router
        .clone()
        .oneshot(submit_request("it is somewhat degraded"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_of(resp).await;
    assert_eq!(body["NOOP Detection"]["score"], "Invalid Format");
    assert_eq!(body["NOOP Detection"]["success"], false);

    // Stage did not advance and no fault was injected.
    assert_eq!(rig.shared.read().unwrap().stage, Stage::Noop);
    assert_eq!(rig.injector.injects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_solution_with_quotes_and_newlines_survives_the_wire() {
    let rig = start_http_rig().await;

    let resp = rig.router.clone().oneshot(submit_request("No")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // A messy free-text answer is still parsed; it grades as invalid format
    // for the yes/no oracle rather than breaking the wire protocol.
    let messy = "the `geo` service said:\n\"error: connection refused\"";
    let resp = rig.router.clone().oneshot(submit_request(messy)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_of(resp).await;
    assert_eq!(body["Detection"]["score"], "Invalid Format");
    assert_eq!(rig.shared.read().unwrap().stage, Stage::Detection);
}

#[tokio::test]
async fn test_get_app_reflects_problem() {
    let rig = start_http_rig().await;
    let resp = rig
        .router
        .clone()
        .oneshot(Request::builder().uri("/get_app").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["app_name"], "hotel-reservation");
    assert_eq!(body["namespace"], "hotel-reservation");

    let resp = rig
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/get_problem")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        json_of(resp).await,
        serde_json::json!({"problem_id": "misconfig-app-hotel-reservation"})
    );
}
