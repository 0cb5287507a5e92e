#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use faultbench::error::{ClusterError, HarnessError};
use faultbench::fault::FaultInjector;
use faultbench::gateway::ClusterProbe;
use faultbench::oracle::{DetectionOracle, HealthCheck, LocalizationOracle};
use faultbench::problem::{App, DetectionMode, Problem, ProblemOracles};

/* ============================= FAKE APP ============================= */

#[derive(Default)]
pub struct FakeApp {
    pub deploys: AtomicU32,
    pub cleanups: AtomicU32,
    pub workload_started: AtomicBool,
}

#[async_trait]
impl App for FakeApp {
    fn app_name(&self) -> &str {
        "hotel-reservation"
    }

    fn namespace(&self) -> &str {
        "hotel-reservation"
    }

    fn description(&self) -> &str {
        "Hotel reservation microservice demo"
    }

    async fn deploy(&self) -> Result<(), HarnessError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), HarnessError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_workload(&self) -> Result<(), HarnessError> {
        self.workload_started.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/* ============================= FAKE INJECTOR ============================= */

#[derive(Default)]
pub struct FakeInjector {
    pub injects: AtomicU32,
    pub recovers: AtomicU32,
    pub active: AtomicBool,
    pub fail_inject: AtomicBool,
}

#[async_trait]
impl FaultInjector for FakeInjector {
    async fn inject(&self) -> Result<(), HarnessError> {
        self.injects.fetch_add(1, Ordering::SeqCst);
        if self.fail_inject.load(Ordering::SeqCst) {
            return Err(HarnessError::FaultInjection("scripted inject failure".into()));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self) -> Result<(), HarnessError> {
        self.recovers.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/* ============================= FAKE PROBE & HEALTH ============================= */

pub struct FakeProbe {
    pub emulated: bool,
}

#[async_trait]
impl ClusterProbe for FakeProbe {
    async fn is_emulated(&self) -> Result<bool, ClusterError> {
        Ok(self.emulated)
    }
}

#[derive(Default)]
pub struct FakeHealth {
    pub healthy: AtomicBool,
}

#[async_trait]
impl HealthCheck for FakeHealth {
    async fn healthy(&self, _namespace: &str) -> Result<bool, ClusterError> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

/* ============================= PROBLEM BUILDER ============================= */

pub fn make_problem(
    app: Arc<FakeApp>,
    injector: Arc<FakeInjector>,
    requires_privileged_runtime: bool,
) -> Problem {
    Problem {
        problem_id: "misconfig-app-hotel-reservation".to_string(),
        app,
        injector,
        faulty_targets: vec!["geo".to_string()],
        requires_privileged_runtime,
        oracles: ProblemOracles {
            detection: Some(DetectionMode::YesNo(DetectionOracle::new("Yes"))),
            localization: Some(LocalizationOracle::new(vec!["geo".to_string()])),
            mitigation_enabled: true,
        },
    }
}
