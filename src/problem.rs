use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::HarnessError;
use crate::fault::FaultInjector;
use crate::gateway::ClusterGateway;
use crate::oracle::{DetectionOracle, LocalizationOracle};

/* ============================= APP ============================= */

/// A deployable target application. The conductor only needs deploy,
/// cleanup, workload kickoff, and identity; how the bundle is shipped is the
/// implementation's business.
#[async_trait]
pub trait App: Send + Sync {
    fn app_name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn description(&self) -> &str;
    async fn deploy(&self) -> Result<(), HarnessError>;
    async fn cleanup(&self) -> Result<(), HarnessError>;
    async fn start_workload(&self) -> Result<(), HarnessError>;
}

/// Registry-driven app deployer: applies a list of manifests (files or URLs)
/// through the gateway, waits for the namespace, and tears down by deleting
/// the namespace. The optional workload manifest is a traffic-generator Job
/// applied when grading begins.
pub struct ManifestApp {
    gateway: Arc<ClusterGateway>,
    name: String,
    namespace: String,
    description: String,
    manifests: Vec<String>,
    workload_manifest: Option<String>,
    ready_timeout: Duration,
}

impl ManifestApp {
    pub fn new(
        gateway: Arc<ClusterGateway>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        description: impl Into<String>,
        manifests: Vec<String>,
        workload_manifest: Option<String>,
    ) -> Self {
        Self {
            gateway,
            name: name.into(),
            namespace: namespace.into(),
            description: description.into(),
            manifests,
            workload_manifest,
            ready_timeout: Duration::from_secs(300),
        }
    }

    async fn apply_ref(&self, manifest: &str) -> Result<(), HarnessError> {
        if manifest.starts_with("http://") || manifest.starts_with("https://") {
            self.gateway.apply_url(manifest).await?;
        } else {
            let body = tokio::fs::read_to_string(manifest).await.map_err(|e| {
                HarnessError::Setup(format!("cannot read manifest {manifest}: {e}"))
            })?;
            self.gateway.apply(&body).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl App for ManifestApp {
    fn app_name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn deploy(&self) -> Result<(), HarnessError> {
        for manifest in &self.manifests {
            self.apply_ref(manifest).await?;
        }
        self.gateway
            .wait_for_ready(&self.namespace, self.ready_timeout)
            .await?;
        info!(app = %self.name, namespace = %self.namespace, "app_deployed");
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), HarnessError> {
        self.gateway.delete_namespace(&self.namespace).await?;
        self.gateway
            .wait_for_namespace_deletion(&self.namespace, self.ready_timeout)
            .await?;
        info!(app = %self.name, namespace = %self.namespace, "app_removed");
        Ok(())
    }

    async fn start_workload(&self) -> Result<(), HarnessError> {
        if let Some(manifest) = &self.workload_manifest {
            self.apply_ref(manifest).await?;
            info!(app = %self.name, "workload_started");
        }
        Ok(())
    }
}

/* ============================= TELEMETRY ============================= */

/// Telemetry stack contract: deploy before grading, tear down after.
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn deploy(&self) -> Result<(), HarnessError>;
    async fn teardown(&self) -> Result<(), HarnessError>;
}

/// A cluster-scoped object left behind by the telemetry manifests, e.g. a
/// storage class, that namespace deletion cannot reap.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClusterResourceRef {
    #[serde(default = "core_api_version")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

fn core_api_version() -> String {
    "v1".to_string()
}

/// Applies the observability manifests (metrics endpoint, storage
/// provisioner, telemetry collectors) and deletes their namespaces and
/// residual cluster-scoped objects on teardown.
pub struct ManifestTelemetry {
    gateway: Arc<ClusterGateway>,
    manifests: Vec<String>,
    namespaces: Vec<String>,
    cluster_resources: Vec<ClusterResourceRef>,
}

impl ManifestTelemetry {
    pub fn new(
        gateway: Arc<ClusterGateway>,
        manifests: Vec<String>,
        namespaces: Vec<String>,
        cluster_resources: Vec<ClusterResourceRef>,
    ) -> Self {
        Self {
            gateway,
            manifests,
            namespaces,
            cluster_resources,
        }
    }
}

#[async_trait]
impl Telemetry for ManifestTelemetry {
    async fn deploy(&self) -> Result<(), HarnessError> {
        for manifest in &self.manifests {
            if manifest.starts_with("http://") || manifest.starts_with("https://") {
                self.gateway.apply_url(manifest).await?;
            } else {
                let body = tokio::fs::read_to_string(manifest).await.map_err(|e| {
                    HarnessError::Setup(format!("cannot read manifest {manifest}: {e}"))
                })?;
                self.gateway.apply(&body).await?;
            }
        }
        for namespace in &self.namespaces {
            self.gateway
                .wait_for_ready(namespace, Duration::from_secs(300))
                .await?;
        }
        info!("telemetry_deployed");
        Ok(())
    }

    async fn teardown(&self) -> Result<(), HarnessError> {
        for namespace in &self.namespaces {
            self.gateway.delete_namespace(namespace).await?;
        }
        for resource in &self.cluster_resources {
            self.gateway
                .delete(&resource.api_version, &resource.kind, &resource.name, None)
                .await?;
        }
        info!("telemetry_removed");
        Ok(())
    }
}

/* ============================= DETECTION MODES ============================= */

/// How the detection-family stages grade: a fixed yes/no answer, or a
/// free-text comparison against a root-cause rubric by the LLM judge.
#[derive(Debug, Clone)]
pub enum DetectionMode {
    YesNo(DetectionOracle),
    Judge { rubric: String },
}

/* ============================= PROBLEM ============================= */

/// Per-stage oracle attachments. Stages without an attached oracle are
/// skipped by the conductor without grading.
pub struct ProblemOracles {
    pub detection: Option<DetectionMode>,
    pub localization: Option<LocalizationOracle>,
    pub mitigation_enabled: bool,
}

/// Immutable problem descriptor resolved from the registry. Holds only
/// descriptors and capability handles, never a live conductor reference.
pub struct Problem {
    pub problem_id: String,
    pub app: Arc<dyn App>,
    pub injector: Arc<dyn FaultInjector>,
    pub faulty_targets: Vec<String>,
    pub requires_privileged_runtime: bool,
    pub oracles: ProblemOracles,
}
