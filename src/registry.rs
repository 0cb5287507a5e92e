use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::fault::{PatchFaultInjector, PatchFaultParams};
use crate::gateway::ClusterGateway;
use crate::oracle::{DetectionOracle, LocalizationOracle};
use crate::problem::{ClusterResourceRef, DetectionMode, ManifestApp, Problem, ProblemOracles};

/* ============================= PROBLEM SPECS ============================= */

fn default_expected() -> String {
    "Yes".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub workload_manifest: Option<String>,
}

/// One catalogue entry: the app to break, how to break it, and what the
/// oracles should accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub id: String,
    pub app: AppSpec,
    pub fault: PatchFaultParams,
    #[serde(default)]
    pub faulty_targets: Vec<String>,
    #[serde(default = "default_expected")]
    pub expected_detection: String,
    #[serde(default)]
    pub judge_rubric: Option<String>,
    #[serde(default)]
    pub requires_privileged_runtime: bool,
    #[serde(default)]
    pub tasklist: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub grade_localization: bool,
    #[serde(default = "default_true")]
    pub grade_mitigation: bool,
}

/// Observability prerequisites shared by every problem in the file:
/// manifests to apply before grading, the namespaces they create, and any
/// cluster-scoped leftovers to reap on teardown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySpec {
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub cluster_resources: Vec<ClusterResourceRef>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProblemFile {
    #[serde(default)]
    problems: Vec<ProblemSpec>,
    #[serde(default)]
    telemetry: Option<TelemetrySpec>,
}

/// Named catalogue of problems loaded from a flat YAML file.
pub struct ProblemRegistry {
    specs: BTreeMap<String, ProblemSpec>,
    telemetry: Option<TelemetrySpec>,
}

impl ProblemRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read problem registry {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let file: ProblemFile = serde_yaml::from_str(raw).context("malformed problem registry")?;
        let mut specs = BTreeMap::new();
        for spec in file.problems {
            if specs.insert(spec.id.clone(), spec).is_some() {
                anyhow::bail!("duplicate problem id in registry");
            }
        }
        Ok(Self {
            specs,
            telemetry: file.telemetry,
        })
    }

    pub fn problem_ids(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn telemetry(&self) -> Option<&TelemetrySpec> {
        self.telemetry.as_ref()
    }

    pub fn get(&self, problem_id: &str) -> Option<&ProblemSpec> {
        self.specs.get(problem_id)
    }

    /// Build the live problem for a catalogue entry: a manifest-driven app,
    /// a patch injector, and the configured oracle attachments.
    pub fn instantiate(
        &self,
        problem_id: &str,
        gateway: Arc<ClusterGateway>,
    ) -> anyhow::Result<Problem> {
        let spec = self
            .get(problem_id)
            .with_context(|| format!("unknown problem id {problem_id:?}"))?;

        let app = Arc::new(ManifestApp::new(
            gateway.clone(),
            spec.app.name.clone(),
            spec.app.namespace.clone(),
            spec.app.description.clone(),
            spec.app.manifests.clone(),
            spec.app.workload_manifest.clone(),
        ));
        let injector = Arc::new(PatchFaultInjector::new(gateway, spec.fault.clone()));

        let detection = match &spec.judge_rubric {
            Some(rubric) => Some(DetectionMode::Judge {
                rubric: rubric.clone(),
            }),
            None => Some(DetectionMode::YesNo(DetectionOracle::new(
                spec.expected_detection.clone(),
            ))),
        };
        let localization = (spec.grade_localization && !spec.faulty_targets.is_empty())
            .then(|| LocalizationOracle::new(spec.faulty_targets.clone()));

        Ok(Problem {
            problem_id: spec.id.clone(),
            app,
            injector,
            faulty_targets: spec.faulty_targets.clone(),
            requires_privileged_runtime: spec.requires_privileged_runtime,
            oracles: ProblemOracles {
                detection,
                localization,
                mitigation_enabled: spec.grade_mitigation,
            },
        })
    }
}

/* ============================= AGENT SPECS ============================= */

/// One registered agent: how to kick it off and what it needs installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    pub kickoff_command: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub install_script: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentFile {
    #[serde(default)]
    agents: Vec<AgentRegistration>,
}

/// Named catalogue of runnable agents loaded from a flat YAML file.
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentRegistration>,
}

impl AgentRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read agent registry {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let file: AgentFile = serde_yaml::from_str(raw).context("malformed agent registry")?;
        let mut agents = BTreeMap::new();
        for reg in file.agents {
            agents.insert(reg.name.clone(), reg);
        }
        Ok(Self { agents })
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&AgentRegistration> {
        self.agents.get(name)
    }
}

/* ============================= TESTS ============================= */
