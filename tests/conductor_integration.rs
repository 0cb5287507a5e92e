mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeApp, FakeHealth, FakeInjector, FakeProbe, make_problem};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use faultbench::conductor::{
    Conductor, ConductorEvent, ResultsSnapshot, RunOutcome, RunReport, Shared, Stage,
    tasklist_from_names,
};
use faultbench::config::Config;
use faultbench::error::HarnessError;
use faultbench::oracle::DetectionOracle;
use faultbench::parser;
use faultbench::problem::{DetectionMode, Problem, ProblemOracles};
use faultbench::safety::ShutdownHandle;

// ══════════════════════════════════════════════════════════════════
// Conductor integration tests (no cluster required)
//
// Exercises the full session pipeline over fakes: deploy → noop
// baseline → inject → staged grading → recover → undeploy, plus the
// skip, interrupt, and abort paths.
// ══════════════════════════════════════════════════════════════════

struct Rig {
    app: Arc<FakeApp>,
    injector: Arc<FakeInjector>,
    health: Arc<FakeHealth>,
    shared: Shared,
    events: mpsc::Sender<ConductorEvent>,
    run: JoinHandle<anyhow::Result<RunReport>>,
    _logs: tempfile::TempDir,
}

fn test_config(logs_dir: &std::path::Path) -> Config {
    Config {
        logs_dir: logs_dir.to_path_buf(),
        ..Config::default()
    }
}

fn start_rig_with(problem_builder: impl FnOnce(Arc<FakeApp>, Arc<FakeInjector>) -> Problem, emulated: bool) -> Rig {
    let app = Arc::new(FakeApp::default());
    let injector = Arc::new(FakeInjector::default());
    let health = Arc::new(FakeHealth::default());
    health.healthy.store(true, Ordering::SeqCst);

    let logs = tempfile::tempdir().expect("tempdir");
    let problem = problem_builder(app.clone(), injector.clone());

    let mut conductor = Conductor::new(
        test_config(logs.path()),
        problem,
        Arc::new(FakeProbe { emulated }),
        health.clone(),
        ShutdownHandle::new(),
    );
    conductor.set_mitigation_timing(Duration::from_millis(100), Duration::from_millis(10));

    let shared = conductor.shared();
    let (events, events_rx) = mpsc::channel(16);
    let run = tokio::spawn(conductor.run(events_rx));

    Rig {
        app,
        injector,
        health,
        shared,
        events,
        run,
        _logs: logs,
    }
}

fn start_rig() -> Rig {
    start_rig_with(|app, injector| make_problem(app, injector, false), false)
}

fn stage_of(shared: &Shared) -> Stage {
    shared.read().unwrap().stage
}

async fn wait_for_stage(shared: &Shared, want: Stage) {
    for _ in 0..200 {
        if stage_of(shared) == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stage never reached {want:?}, stuck at {:?}", stage_of(shared));
}

async fn submit(
    events: &mpsc::Sender<ConductorEvent>,
    solution: &str,
) -> Result<ResultsSnapshot, HarnessError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    events
        .send(ConductorEvent::Submit {
            wrapped: parser::wrap_submission(solution),
            reply: reply_tx,
        })
        .await
        .expect("conductor accepts events");
    reply_rx.await.expect("conductor replies")
}

async fn submit_raw(
    events: &mpsc::Sender<ConductorEvent>,
    wrapped: &str,
) -> Result<ResultsSnapshot, HarnessError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    events
        .send(ConductorEvent::Submit {
            wrapped: wrapped.to_string(),
            reply: reply_tx,
        })
        .await
        .expect("conductor accepts events");
    reply_rx.await.expect("conductor replies")
}

// ── Happy path ──

#[tokio::test]
async fn test_happy_path_full_pipeline() {
    let rig = start_rig();
    wait_for_stage(&rig.shared, Stage::Noop).await;

    // Baseline before the fault exists: "No" is the truthful answer, graded
    // against the problem's expected post-fault "Yes".
    let snapshot = submit(&rig.events, "No").await.unwrap();
    assert_eq!(snapshot.reports["NOOP Detection"].success, Some(false));
    assert_eq!(rig.injector.injects.load(Ordering::SeqCst), 1);
    assert_eq!(stage_of(&rig.shared), Stage::Detection);

    let snapshot = submit(&rig.events, "Yes").await.unwrap();
    assert_eq!(snapshot.reports["Detection"].success, Some(true));
    assert!(snapshot.ttd.is_some());
    assert_eq!(stage_of(&rig.shared), Stage::Localization);

    let snapshot = submit(&rig.events, "geo").await.unwrap();
    assert_eq!(snapshot.reports["Localization"].success, Some(true));
    assert!(snapshot.reports["Localization"].is_subset);
    assert!(snapshot.ttl.is_some());
    assert_eq!(stage_of(&rig.shared), Stage::Mitigation);

    let snapshot = submit(&rig.events, "restarted the pod").await.unwrap();
    assert_eq!(snapshot.reports["Mitigation"].success, Some(true));
    assert!(snapshot.ttm.is_some());

    let report = rig.run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(stage_of(&rig.shared), Stage::Done);

    // Stage-completion timings are strictly ordered.
    let (ttd, ttl, ttm) = (
        report.results.ttd.unwrap(),
        report.results.ttl.unwrap(),
        report.results.ttm.unwrap(),
    );
    assert!(ttd < ttl && ttl < ttm, "TTD={ttd} TTL={ttl} TTM={ttm}");

    // One deploy, leftover cleanup plus final cleanup, workload kicked off.
    assert_eq!(rig.app.deploys.load(Ordering::SeqCst), 1);
    assert_eq!(rig.app.cleanups.load(Ordering::SeqCst), 2);
    assert!(rig.app.workload_started.load(Ordering::SeqCst));

    // One inject; leftover repair plus exactly one post-session recovery.
    assert_eq!(rig.injector.injects.load(Ordering::SeqCst), 1);
    assert_eq!(rig.injector.recovers.load(Ordering::SeqCst), 2);
    assert!(!rig.injector.active.load(Ordering::SeqCst));

    // Results landed in the per-session directory.
    let agent_dir = rig._logs.path().join("agent").join("misconfig-app-hotel-reservation");
    let session = std::fs::read_dir(&agent_dir).unwrap().next().unwrap().unwrap();
    let results: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(session.path().join("results.json")).unwrap())
            .unwrap();
    assert_eq!(results["outcome"], "COMPLETED");
    assert_eq!(results["results"]["Detection"]["success"], true);
}

// ── Grading semantics ──

#[tokio::test]
async fn test_wrong_detection_still_advances() {
    let rig = start_rig();
    wait_for_stage(&rig.shared, Stage::Noop).await;

    submit(&rig.events, "No").await.unwrap();
    let snapshot = submit(&rig.events, "No").await.unwrap();

    assert_eq!(snapshot.reports["Detection"].success, Some(false));
    // Failure does not short-circuit: the tasklist decides what runs next.
    assert_eq!(stage_of(&rig.shared), Stage::Localization);

    submit(&rig.events, "geo").await.unwrap();
    submit(&rig.events, "mitigated").await.unwrap();
    let report = rig.run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_invalid_format_leaves_stage_unchanged() {
    let rig = start_rig();
    wait_for_stage(&rig.shared, Stage::Noop).await;

    // Wrong shape for the stage: recorded as Invalid Format, no fault yet.
    let snapshot = submit(&rig.events, "maybe, hard to say").await.unwrap();
    assert!(snapshot.reports["NOOP Detection"].is_invalid_format());
    assert_eq!(rig.injector.injects.load(Ordering::SeqCst), 0);
    assert_eq!(stage_of(&rig.shared), Stage::Noop);

    // The retried submission replaces the placeholder and moves on.
    let snapshot = submit(&rig.events, "No").await.unwrap();
    assert!(!snapshot.reports["NOOP Detection"].is_invalid_format());
    assert_eq!(stage_of(&rig.shared), Stage::Detection);

    // A submission the parser rejects outright changes nothing at all.
    let before = stage_of(&rig.shared);
    let err = submit_raw(&rig.events, "```\nsubmit(\"\n```").await.unwrap_err();
    assert!(matches!(err, HarnessError::Parse(_)));
    assert_eq!(stage_of(&rig.shared), before);
    assert!(!rig.shared.read().unwrap().results.reports.contains_key("Detection"));

    submit(&rig.events, "Yes").await.unwrap();
    submit(&rig.events, "geo").await.unwrap();
    submit(&rig.events, "ok").await.unwrap();
    rig.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stages_without_oracles_are_skipped() {
    let rig = start_rig_with(
        |app, injector| Problem {
            problem_id: "detection-only".to_string(),
            app,
            injector,
            faulty_targets: vec![],
            requires_privileged_runtime: false,
            oracles: ProblemOracles {
                detection: Some(DetectionMode::YesNo(DetectionOracle::new("Yes"))),
                localization: None,
                mitigation_enabled: false,
            },
        },
        false,
    );
    wait_for_stage(&rig.shared, Stage::Noop).await;

    submit(&rig.events, "No").await.unwrap();
    let snapshot = submit(&rig.events, "Yes").await.unwrap();

    // Localization and mitigation have no oracles: straight to done.
    assert!(!snapshot.reports.contains_key("Localization"));
    assert!(!snapshot.reports.contains_key("Mitigation"));

    let report = rig.run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(!rig.injector.active.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_configured_tasklist_limits_grading() {
    let rig = {
        let app = Arc::new(FakeApp::default());
        let injector = Arc::new(FakeInjector::default());
        let health = Arc::new(FakeHealth::default());
        health.healthy.store(true, Ordering::SeqCst);
        let logs = tempfile::tempdir().unwrap();

        let mut conductor = Conductor::new(
            test_config(logs.path()),
            make_problem(app.clone(), injector.clone(), false),
            Arc::new(FakeProbe { emulated: false }),
            health.clone(),
            ShutdownHandle::new(),
        );
        conductor
            .set_tasklist(tasklist_from_names(&["detection".to_string()]).unwrap());

        let shared = conductor.shared();
        let (events, events_rx) = mpsc::channel(16);
        let run = tokio::spawn(conductor.run(events_rx));
        Rig {
            app,
            injector,
            health,
            shared,
            events,
            run,
            _logs: logs,
        }
    };
    wait_for_stage(&rig.shared, Stage::Noop).await;

    submit(&rig.events, "No").await.unwrap();
    let snapshot = submit(&rig.events, "Yes").await.unwrap();
    assert_eq!(snapshot.reports["Detection"].success, Some(true));

    let report = rig.run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    // Stages after detection were configured out; cleanup still ran.
    assert!(!report.results.reports.contains_key("Localization"));
    assert!(!report.results.reports.contains_key("Mitigation"));
    assert_eq!(rig.app.cleanups.load(Ordering::SeqCst), 2);
    assert!(!rig.injector.active.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_failed_mitigation_reported() {
    let rig = start_rig();
    rig.health.healthy.store(false, Ordering::SeqCst);
    wait_for_stage(&rig.shared, Stage::Noop).await;

    submit(&rig.events, "No").await.unwrap();
    submit(&rig.events, "Yes").await.unwrap();
    submit(&rig.events, "geo").await.unwrap();
    let snapshot = submit(&rig.events, "tried my best").await.unwrap();

    assert_eq!(snapshot.reports["Mitigation"].success, Some(false));
    let report = rig.run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

// ── Telemetry lifecycle ──

#[derive(Default)]
struct FakeTelemetry {
    deploys: std::sync::atomic::AtomicU32,
    teardowns: std::sync::atomic::AtomicU32,
}

#[async_trait::async_trait]
impl faultbench::problem::Telemetry for FakeTelemetry {
    async fn deploy(&self) -> Result<(), faultbench::error::HarnessError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), faultbench::error::HarnessError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_telemetry_deployed_before_grading_and_torn_down_after() {
    let app = Arc::new(FakeApp::default());
    let injector = Arc::new(FakeInjector::default());
    let health = Arc::new(FakeHealth::default());
    health.healthy.store(true, Ordering::SeqCst);
    let telemetry = Arc::new(FakeTelemetry::default());
    let logs = tempfile::tempdir().unwrap();

    let mut conductor = Conductor::new(
        test_config(logs.path()),
        make_problem(app, injector, false),
        Arc::new(FakeProbe { emulated: false }),
        health,
        ShutdownHandle::new(),
    );
    conductor.set_mitigation_timing(Duration::from_millis(50), Duration::from_millis(10));
    conductor.set_telemetry(telemetry.clone());

    let shared = conductor.shared();
    let (events, events_rx) = mpsc::channel(16);
    let run = tokio::spawn(conductor.run(events_rx));
    wait_for_stage(&shared, Stage::Noop).await;
    assert_eq!(telemetry.deploys.load(Ordering::SeqCst), 1);

    submit(&events, "No").await.unwrap();
    submit(&events, "Yes").await.unwrap();
    submit(&events, "geo").await.unwrap();
    submit(&events, "patched").await.unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(telemetry.teardowns.load(Ordering::SeqCst), 1);
}

// ── Workload integration ──

struct TinyTask;

#[async_trait::async_trait]
impl faultbench::workload::WorkloadTask for TinyTask {
    async fn run_once(&self) -> faultbench::workload::WorkloadEntry {
        tokio::time::sleep(Duration::from_millis(2)).await;
        faultbench::workload::WorkloadEntry {
            time: 0.0,
            request_count: 5,
            log: "GET /recommendations 200".to_string(),
            ok: true,
        }
    }
}

#[tokio::test]
async fn test_workload_runs_during_session_and_is_dumped() {
    let app = Arc::new(FakeApp::default());
    let injector = Arc::new(FakeInjector::default());
    let health = Arc::new(FakeHealth::default());
    health.healthy.store(true, Ordering::SeqCst);
    let logs = tempfile::tempdir().unwrap();

    let mut conductor = Conductor::new(
        test_config(logs.path()),
        make_problem(app, injector, false),
        Arc::new(FakeProbe { emulated: false }),
        health,
        ShutdownHandle::new(),
    );
    conductor.set_mitigation_timing(Duration::from_millis(50), Duration::from_millis(10));
    conductor.set_workload(Box::new(faultbench::workload::TaskedWorkload::with_timing(
        Arc::new(TinyTask),
        Duration::from_secs(5),
        Duration::from_millis(10),
    )));

    let shared = conductor.shared();
    let (events, events_rx) = mpsc::channel(16);
    let run = tokio::spawn(conductor.run(events_rx));
    wait_for_stage(&shared, Stage::Noop).await;

    // Let a few workload runs accumulate while grading proceeds.
    tokio::time::sleep(Duration::from_millis(30)).await;
    submit(&events, "No").await.unwrap();
    submit(&events, "Yes").await.unwrap();
    submit(&events, "geo").await.unwrap();
    submit(&events, "restarted").await.unwrap();
    run.await.unwrap().unwrap();

    let agent_dir = logs.path().join("agent").join("misconfig-app-hotel-reservation");
    let session = std::fs::read_dir(&agent_dir).unwrap().next().unwrap().unwrap();
    let dump: Vec<serde_json::Value> = serde_json::from_str(
        &std::fs::read_to_string(session.path().join("workload.json")).unwrap(),
    )
    .unwrap();
    assert!(!dump.is_empty());
    assert_eq!(dump[0]["request_count"], 5);
}

// ── Skip and abort paths ──

#[tokio::test]
async fn test_emulated_cluster_skips_privileged_problem() {
    let rig = start_rig_with(|app, injector| make_problem(app, injector, true), true);

    let report = rig.run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::SkippedPrivilegedRequired);

    // No fault was injected and cleanup was a no-op.
    assert_eq!(rig.injector.injects.load(Ordering::SeqCst), 0);
    assert_eq!(rig.injector.recovers.load(Ordering::SeqCst), 0);
    assert_eq!(rig.app.deploys.load(Ordering::SeqCst), 0);
    assert_eq!(rig.app.cleanups.load(Ordering::SeqCst), 0);
    assert_eq!(stage_of(&rig.shared), Stage::Done);
}

#[tokio::test]
async fn test_shutdown_mid_grading_recovers_exactly_once() {
    let rig = start_rig();
    wait_for_stage(&rig.shared, Stage::Noop).await;

    submit(&rig.events, "No").await.unwrap();
    submit(&rig.events, "Yes").await.unwrap();
    assert!(rig.injector.active.load(Ordering::SeqCst));

    // Interrupt between detection and localization.
    rig.events.send(ConductorEvent::Shutdown).await.unwrap();
    let report = rig.run.await.unwrap().unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert!(!rig.injector.active.load(Ordering::SeqCst));
    // Leftover repair at setup plus exactly one shutdown recovery.
    assert_eq!(rig.injector.recovers.load(Ordering::SeqCst), 2);
    assert_eq!(rig.app.cleanups.load(Ordering::SeqCst), 2);
    assert!(report.results.reports.contains_key("Detection"));
}

#[tokio::test]
async fn test_inject_failure_aborts_with_recovery() {
    let rig = start_rig();
    rig.injector.fail_inject.store(true, Ordering::SeqCst);
    wait_for_stage(&rig.shared, Stage::Noop).await;

    let err = submit(&rig.events, "No").await.unwrap_err();
    assert!(err.to_string().contains("session aborted"));

    let result = rig.run.await.unwrap();
    assert!(result.is_err(), "inject failure is fatal");
    // The guard was armed before inject, so recovery still ran.
    assert_eq!(rig.injector.recovers.load(Ordering::SeqCst), 2);
    assert_eq!(rig.app.cleanups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropped_event_channel_triggers_cleanup() {
    let rig = start_rig();
    wait_for_stage(&rig.shared, Stage::Noop).await;

    submit(&rig.events, "No").await.unwrap();
    drop(rig.events);

    let report = rig.run.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert!(!rig.injector.active.load(Ordering::SeqCst));
}
