use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::HarnessError;
use crate::gateway::ClusterProbe;
use crate::oracle::{HealthCheck, LlmJudge, MitigationOracle, OracleReport};
use crate::parser::{self, Literal};
use crate::problem::{DetectionMode, Problem, Telemetry};
use crate::safety::{RecoveryGuard, ShutdownHandle};
use crate::workload::{Workload, WorkloadEntry};

/* ============================= STAGES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Setup,
    Noop,
    Detection,
    Localization,
    Mitigation,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Setup => "setup",
            Stage::Noop => "noop",
            Stage::Detection => "detection",
            Stage::Localization => "localization",
            Stage::Mitigation => "mitigation",
            Stage::Done => "done",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        match name {
            "noop" => Some(Stage::Noop),
            "detection" => Some(Stage::Detection),
            "localization" => Some(Stage::Localization),
            "mitigation" => Some(Stage::Mitigation),
            "done" => Some(Stage::Done),
            _ => None,
        }
    }

    /// Stages that consume one submission each.
    pub fn is_grading(&self) -> bool {
        matches!(
            self,
            Stage::Noop | Stage::Detection | Stage::Localization | Stage::Mitigation
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn default_tasklist() -> Vec<Stage> {
    vec![
        Stage::Noop,
        Stage::Detection,
        Stage::Localization,
        Stage::Mitigation,
        Stage::Done,
    ]
}

/// Build a tasklist from registry-configured grading stage names. The names
/// must be a subset of detection/localization/mitigation in that order; the
/// noop baseline and terminal stage are always present.
pub fn tasklist_from_names(names: &[String]) -> anyhow::Result<Vec<Stage>> {
    const GRADING_ORDER: [Stage; 3] = [Stage::Detection, Stage::Localization, Stage::Mitigation];

    if names.is_empty() {
        anyhow::bail!("tasklist must name at least one grading stage");
    }

    let mut stages = Vec::new();
    for name in names {
        let stage = Stage::from_name(name)
            .filter(|s| GRADING_ORDER.contains(s) || matches!(s, Stage::Noop | Stage::Done))
            .ok_or_else(|| anyhow::anyhow!("unknown tasklist stage {name:?}"))?;
        if matches!(stage, Stage::Noop | Stage::Done) {
            // Implicit stages may be listed but are de-duplicated below.
            continue;
        }
        stages.push(stage);
    }

    let mut order = GRADING_ORDER.iter();
    for stage in &stages {
        if !order.any(|s| s == stage) {
            anyhow::bail!("tasklist stages are out of order or repeated");
        }
    }

    let mut tasklist = vec![Stage::Noop];
    tasklist.extend(stages);
    tasklist.push(Stage::Done);
    Ok(tasklist)
}

/* ============================= RESULTS ============================= */

/// Per-stage reports plus the stage-completion timings, serialised in the
/// shape the submission API returns.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultsSnapshot {
    #[serde(flatten)]
    pub reports: BTreeMap<String, OracleReport>,
    #[serde(rename = "TTD", skip_serializing_if = "Option::is_none")]
    pub ttd: Option<f64>,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<f64>,
    #[serde(rename = "TTM", skip_serializing_if = "Option::is_none")]
    pub ttm: Option<f64>,
}

impl ResultsSnapshot {
    /// Write-once per stage: a completed grade is never overwritten. Only an
    /// invalid-format placeholder may be replaced by the retried submission.
    fn record(&mut self, key: &str, report: OracleReport) {
        match self.reports.get(key) {
            Some(existing) if !existing.is_invalid_format() => {
                error!(stage = key, "result_overwrite_rejected");
            }
            _ => {
                self.reports.insert(key.to_string(), report);
            }
        }
    }
}

/* ============================= SHARED VIEW ============================= */

/// Read-side snapshot for the HTTP layer; the conductor task is the only
/// writer.
#[derive(Debug, Clone)]
pub struct SharedView {
    pub stage: Stage,
    pub results: ResultsSnapshot,
    pub problem_id: String,
    pub app_name: String,
    pub namespace: String,
    pub description: String,
}

pub type Shared = Arc<RwLock<SharedView>>;

/* ============================= EVENTS ============================= */

/// Inputs consumed by the conductor loop, one at a time.
pub enum ConductorEvent {
    Submit {
        wrapped: String,
        reply: oneshot::Sender<Result<ResultsSnapshot, HarnessError>>,
    },
    Shutdown,
}

/// Forward SIGINT into the conductor's event channel so recovery always runs
/// before the process exits.
pub fn spawn_signal_listener(
    events: mpsc::Sender<ConductorEvent>,
    shutdown: ShutdownHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("sigint_received");
            shutdown.request_shutdown();
            let _ = events.send(ConductorEvent::Shutdown).await;
        }
    })
}

/* ============================= OUTCOME ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Completed,
    SkippedPrivilegedRequired,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub results: ResultsSnapshot,
}

enum StartOutcome {
    Started,
    Skipped,
}

/* ============================= CONDUCTOR ============================= */

/// Orchestrates one problem session: deploy, baseline, inject, grade stage
/// by stage, recover, undeploy. Single-threaded over a typed event channel;
/// every exit path runs the guarded cleanup.
pub struct Conductor {
    config: Config,
    problem: Problem,
    probe: Arc<dyn ClusterProbe>,
    health: Arc<dyn HealthCheck>,
    telemetry: Option<Arc<dyn Telemetry>>,
    workload: Option<Box<dyn Workload>>,
    judge: LlmJudge,
    tasklist: Vec<Stage>,
    mitigation_timing: (Duration, Duration),
    agent_name: String,
    shared: Shared,
    started: Instant,
    stage: Stage,
    results: ResultsSnapshot,
    workload_dump: Vec<WorkloadEntry>,
    guard: Option<RecoveryGuard>,
    shutdown: ShutdownHandle,
}

impl Conductor {
    pub fn new(
        config: Config,
        problem: Problem,
        probe: Arc<dyn ClusterProbe>,
        health: Arc<dyn HealthCheck>,
        shutdown: ShutdownHandle,
    ) -> Self {
        let shared = Arc::new(RwLock::new(SharedView {
            stage: Stage::Idle,
            results: ResultsSnapshot::default(),
            problem_id: problem.problem_id.clone(),
            app_name: problem.app.app_name().to_string(),
            namespace: problem.app.namespace().to_string(),
            description: problem.app.description().to_string(),
        }));
        let judge = LlmJudge::new(config.judge.clone());

        Self {
            config,
            problem,
            probe,
            health,
            telemetry: None,
            workload: None,
            judge,
            tasklist: default_tasklist(),
            mitigation_timing: (Duration::from_secs(120), Duration::from_secs(5)),
            agent_name: "agent".to_string(),
            shared,
            started: Instant::now(),
            stage: Stage::Idle,
            results: ResultsSnapshot::default(),
            workload_dump: Vec::new(),
            guard: None,
            shutdown,
        }
    }

    pub fn set_agent_name(&mut self, name: impl Into<String>) {
        self.agent_name = name.into();
    }

    pub fn set_tasklist(&mut self, tasklist: Vec<Stage>) {
        self.tasklist = tasklist;
    }

    pub fn set_telemetry(&mut self, telemetry: Arc<dyn Telemetry>) {
        self.telemetry = Some(telemetry);
    }

    pub fn set_workload(&mut self, workload: Box<dyn Workload>) {
        self.workload = Some(workload);
    }

    pub fn set_mitigation_timing(&mut self, deadline: Duration, interval: Duration) {
        self.mitigation_timing = (deadline, interval);
    }

    pub fn shared(&self) -> Shared {
        self.shared.clone()
    }

    pub fn fault_active(&self) -> bool {
        self.guard.as_ref().is_some_and(RecoveryGuard::is_armed)
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn set_stage(&mut self, stage: Stage) {
        if self.stage != stage {
            info!(from = %self.stage, to = %stage, "stage_advanced");
        }
        self.stage = stage;
        self.sync_shared();
    }

    fn sync_shared(&self) {
        if let Ok(mut view) = self.shared.write() {
            view.stage = self.stage;
            view.results = self.results.clone();
        }
    }

    fn record(&mut self, key: &str, report: OracleReport) {
        self.results.record(key, report);
        self.sync_shared();
    }

    /* ───────────────────────── lifecycle ───────────────────────── */

    /// Run the full session. Returns the final report; interruption is an
    /// outcome, not an error, so callers can still read partial results.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ConductorEvent>,
    ) -> anyhow::Result<RunReport> {
        self.started = Instant::now();
        info!(problem = %self.problem.problem_id, agent = %self.agent_name, "session_start");

        match self.start_problem().await {
            Ok(StartOutcome::Skipped) => {
                self.set_stage(Stage::Done);
                let report = RunReport {
                    outcome: RunOutcome::SkippedPrivilegedRequired,
                    results: self.results.clone(),
                };
                self.persist_results(&report);
                return Ok(report);
            }
            Ok(StartOutcome::Started) => {}
            Err(e) => {
                error!(error = %e, "session_setup_failed");
                self.finish().await;
                return Err(e.into());
            }
        }

        let loop_result = self.grading_loop(&mut events).await;
        self.finish().await;

        match loop_result {
            Ok(()) => {
                let report = RunReport {
                    outcome: RunOutcome::Completed,
                    results: self.results.clone(),
                };
                self.persist_results(&report);
                info!("session_completed");
                Ok(report)
            }
            Err(HarnessError::ShutdownRequested) => {
                let report = RunReport {
                    outcome: RunOutcome::Interrupted,
                    results: self.results.clone(),
                };
                self.persist_results(&report);
                warn!("session_interrupted");
                Ok(report)
            }
            Err(e) => {
                let report = RunReport {
                    outcome: RunOutcome::Completed,
                    results: self.results.clone(),
                };
                self.persist_results(&report);
                Err(e.into())
            }
        }
    }

    async fn start_problem(&mut self) -> Result<StartOutcome, HarnessError> {
        if self.problem.requires_privileged_runtime && self.probe.is_emulated().await? {
            warn!(
                problem = %self.problem.problem_id,
                reason = "SKIPPED_PRIVILEGED_REQUIRED",
                "problem_skipped_on_emulated_cluster"
            );
            return Ok(StartOutcome::Skipped);
        }

        self.set_stage(Stage::Setup);

        // A crashed prior session may have left the fault injected; the
        // injector contract makes this recover a no-op otherwise.
        if let Err(e) = self.problem.injector.recover().await {
            warn!(error = %e, "leftover_recovery_failed");
        }

        if let Some(telemetry) = &self.telemetry {
            telemetry.deploy().await?;
        }

        if let Err(e) = self.problem.app.cleanup().await {
            warn!(error = %e, "leftover_app_cleanup_failed");
        }
        self.problem.app.deploy().await?;
        self.problem.app.start_workload().await?;
        if let Some(workload) = &mut self.workload {
            workload.start().await;
        }

        let first = self.tasklist.first().copied().unwrap_or(Stage::Done);
        self.set_stage(first);
        info!(stage = %first, "deployment_complete_ready_for_submission");
        Ok(StartOutcome::Started)
    }

    async fn grading_loop(
        &mut self,
        events: &mut mpsc::Receiver<ConductorEvent>,
    ) -> Result<(), HarnessError> {
        while self.stage != Stage::Done {
            if self.shutdown.is_requested() {
                return Err(HarnessError::ShutdownRequested);
            }
            let Some(event) = events.recv().await else {
                return Err(HarnessError::ShutdownRequested);
            };
            match event {
                ConductorEvent::Shutdown => return Err(HarnessError::ShutdownRequested),
                ConductorEvent::Submit { wrapped, reply } => {
                    match self.handle_submission(&wrapped).await {
                        Ok(snapshot) => {
                            let _ = reply.send(Ok(snapshot));
                        }
                        Err(e) if matches!(e, HarnessError::Parse(_) | HarnessError::Format(_)) => {
                            // Stage unchanged; the submitter sees the reason.
                            let _ = reply.send(Err(e));
                        }
                        Err(fatal) => {
                            let _ = reply.send(Err(HarnessError::Oracle(format!(
                                "session aborted: {fatal}"
                            ))));
                            return Err(fatal);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /* ───────────────────────── grading ───────────────────────── */

    async fn handle_submission(
        &mut self,
        wrapped: &str,
    ) -> Result<ResultsSnapshot, HarnessError> {
        let call = parser::parse(wrapped)?;
        if call.api_name != "submit" {
            return Err(HarnessError::Parse("only `submit(...)` is supported".into()));
        }
        let solution = call.args.first();

        let stage = self.stage;
        if !stage.is_grading() {
            return Err(HarnessError::Format(format!("cannot submit at stage {stage}")));
        }
        info!(stage = %stage, "submission_received");

        match stage {
            Stage::Noop => {
                // Baseline false-positive signal: graded before the fault exists.
                let report = self.evaluate_detection(solution).await;
                let invalid = report.is_invalid_format();
                self.record("NOOP Detection", report);
                if invalid {
                    return Ok(self.results.clone());
                }
                self.arm_and_inject().await?;
            }
            Stage::Detection => {
                let report = self.evaluate_detection(solution).await;
                let invalid = report.is_invalid_format();
                self.record("Detection", report);
                if invalid {
                    return Ok(self.results.clone());
                }
                self.results.ttd = Some(self.elapsed());
            }
            Stage::Localization => {
                let report = match &self.problem.oracles.localization {
                    Some(oracle) => oracle.evaluate(solution),
                    None => OracleReport::skipped("no localization oracle attached"),
                };
                let invalid = report.is_invalid_format();
                self.record("Localization", report);
                if invalid {
                    return Ok(self.results.clone());
                }
                self.results.ttl = Some(self.elapsed());
            }
            Stage::Mitigation => {
                // The submission argument is ignored; health is re-queried live.
                let (deadline, interval) = self.mitigation_timing;
                let oracle = MitigationOracle::with_timing(
                    self.health.clone(),
                    self.problem.app.namespace(),
                    deadline,
                    interval,
                );
                let report = oracle.evaluate().await;
                self.record("Mitigation", report);
                self.results.ttm = Some(self.elapsed());
            }
            _ => unreachable!("is_grading() gated above"),
        }

        self.advance_stage();
        Ok(self.results.clone())
    }

    async fn evaluate_detection(&self, solution: Option<&Literal>) -> OracleReport {
        match &self.problem.oracles.detection {
            Some(DetectionMode::YesNo(oracle)) => oracle.evaluate(solution),
            Some(DetectionMode::Judge { rubric }) => {
                let Some(answer) = solution.and_then(Literal::as_str) else {
                    return OracleReport::invalid_format("judge expects a free-text answer");
                };
                let (verdict, reasoning) = self.judge.judge(answer, rubric).await;
                match verdict {
                    Some(success) => {
                        OracleReport::graded(success, if success { 1.0 } else { 0.0 }, reasoning)
                    }
                    None => OracleReport::skipped(reasoning),
                }
            }
            None => OracleReport::skipped("no detection oracle attached"),
        }
    }

    /// The recovery guard is registered before the injector runs, so a crash
    /// mid-inject still owes (idempotent) recovery.
    async fn arm_and_inject(&mut self) -> Result<(), HarnessError> {
        self.guard = Some(RecoveryGuard::arm(self.problem.problem_id.clone()));
        self.problem.injector.inject().await?;
        info!("fault_injected");
        Ok(())
    }

    /// Move to the next tasklist stage, skipping grading stages that have no
    /// attached oracle.
    fn advance_stage(&mut self) {
        let Some(pos) = self.tasklist.iter().position(|s| *s == self.stage) else {
            self.set_stage(Stage::Done);
            return;
        };

        let mut idx = pos + 1;
        while let Some(next) = self.tasklist.get(idx) {
            let has_oracle = match next {
                Stage::Noop | Stage::Detection => self.problem.oracles.detection.is_some(),
                Stage::Localization => self.problem.oracles.localization.is_some(),
                Stage::Mitigation => self.problem.oracles.mitigation_enabled,
                Stage::Idle | Stage::Setup | Stage::Done => true,
            };
            if has_oracle {
                break;
            }
            info!(stage = %next, "stage_skipped_no_oracle");
            idx += 1;
        }
        self.set_stage(self.tasklist.get(idx).copied().unwrap_or(Stage::Done));
    }

    /* ───────────────────────── teardown ───────────────────────── */

    /// Guarded cleanup run on every exit path: stop traffic, recover the
    /// fault, undeploy the app, tear down telemetry. Cleanup failures are
    /// logged rather than raised so the original error survives.
    async fn finish(&mut self) {
        info!("session_teardown");

        if let Some(workload) = &mut self.workload {
            match workload.recent_entries(f64::INFINITY).await {
                Ok(entries) => self.workload_dump = entries,
                Err(e) => warn!(error = %e, "workload_dump_failed"),
            }
            workload.stop().await;
        }

        if self.fault_active() {
            match self.problem.injector.recover().await {
                Ok(()) => {
                    if let Some(guard) = &self.guard {
                        guard.disarm();
                    }
                    info!("fault_recovered");
                }
                Err(e) => error!(error = %e, "fault_recovery_failed"),
            }
        }

        if let Err(e) = self.problem.app.cleanup().await {
            warn!(error = %e, "app_cleanup_failed");
        }
        if let Some(telemetry) = &self.telemetry
            && let Err(e) = telemetry.teardown().await
        {
            warn!(error = %e, "telemetry_teardown_failed");
        }

        self.set_stage(Stage::Done);
    }

    fn persist_results(&self, report: &RunReport) {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let dir = self
            .config
            .logs_dir
            .join(&self.agent_name)
            .join(&self.problem.problem_id)
            .join(stamp);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(error = %e, "cannot_create_session_dir");
            return;
        }

        let payload = serde_json::json!({
            "problem_id": self.problem.problem_id,
            "agent": self.agent_name,
            "outcome": report.outcome,
            "use_wandb": self.config.use_wandb,
            "results": report.results,
        });
        let path = dir.join("results.json");
        match serde_json::to_vec_pretty(&payload) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(error = %e, "cannot_write_results");
                } else {
                    info!(path = %path.display(), "results_persisted");
                }
            }
            Err(e) => warn!(error = %e, "cannot_serialise_results"),
        }

        if !self.workload_dump.is_empty()
            && let Ok(bytes) = serde_json::to_vec_pretty(&self.workload_dump)
            && let Err(e) = std::fs::write(dir.join("workload.json"), bytes)
        {
            warn!(error = %e, "cannot_write_workload_dump");
        }
    }
}

/* ============================= TESTS ============================= */
