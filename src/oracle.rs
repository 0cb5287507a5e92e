use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::config::JudgeConfig;
use crate::error::ClusterError;
use crate::parser::Literal;

/* ============================= REPORT ============================= */

/// Grading score: a fraction in [0, 1], or the sentinel recorded when the
/// submission shape was wrong for the stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Score {
    Value(f64),
    InvalidFormat,
}

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Score::Value(v) => serializer.serialize_f64(*v),
            Score::InvalidFormat => serializer.serialize_str("Invalid Format"),
        }
    }
}

/// Outcome of one oracle evaluation. `success = None` means the oracle could
/// not evaluate and the stage is recorded as skipped.
#[derive(Debug, Clone, Serialize)]
pub struct OracleReport {
    pub success: Option<bool>,
    pub score: Score,
    pub is_subset: bool,
    pub reason: String,
}

impl OracleReport {
    pub fn graded(success: bool, score: f64, reason: impl Into<String>) -> Self {
        Self {
            success: Some(success),
            score: Score::Value(score),
            is_subset: false,
            reason: reason.into(),
        }
    }

    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            score: Score::InvalidFormat,
            is_subset: false,
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: None,
            score: Score::Value(0.0),
            is_subset: false,
            reason: reason.into(),
        }
    }

    pub fn is_invalid_format(&self) -> bool {
        self.score == Score::InvalidFormat
    }
}

/* ============================= DETECTION ============================= */

/// Grades a yes/no answer against the problem's expected detection verdict.
#[derive(Debug, Clone)]
pub struct DetectionOracle {
    pub expected: String,
}

fn normalize(answer: &str) -> String {
    answer.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

impl DetectionOracle {
    pub fn new(expected: impl Into<String>) -> Self {
        Self { expected: expected.into() }
    }

    pub fn evaluate(&self, solution: Option<&Literal>) -> OracleReport {
        let Some(answer) = solution.and_then(Literal::as_str) else {
            return OracleReport::invalid_format("detection expects a yes/no string");
        };

        let norm = normalize(answer);
        if norm != "yes" && norm != "no" {
            return OracleReport::invalid_format(format!(
                "detection expects \"Yes\" or \"No\", got {answer:?}"
            ));
        }

        if norm == normalize(&self.expected) {
            OracleReport::graded(true, 1.0, "detection answer matches")
        } else {
            OracleReport::graded(
                false,
                0.0,
                format!("expected {:?}, got {answer:?}", self.expected),
            )
        }
    }
}

/* ============================= LOCALIZATION ============================= */

/// Grades a submitted service identifier (or ordered sequence of them)
/// against the problem's faulty targets.
#[derive(Debug, Clone)]
pub struct LocalizationOracle {
    pub targets: Vec<String>,
}

/// True iff `needle` occurs in `haystack` as an ordered subsequence, e.g.
/// `[a, b]` inside `[x, a, y, b, z]`.
pub fn is_ordered_subset(needle: &[String], haystack: &[String]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}

fn parse_target_string(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    // Agents frequently submit a rendered list such as `["geo", "rate"]`.
    if trimmed.starts_with('[')
        && let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed)
    {
        return items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                other => Some(other.to_string()),
            })
            .collect();
    }

    let inner = trimmed.trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|part| part.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

impl LocalizationOracle {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }

    fn submitted(solution: Option<&Literal>) -> Option<Vec<String>> {
        match solution {
            Some(Literal::Str(s)) => Some(parse_target_string(s)),
            Some(Literal::List(items)) => items
                .iter()
                .map(|l| l.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    pub fn evaluate(&self, solution: Option<&Literal>) -> OracleReport {
        let Some(submitted) = Self::submitted(solution) else {
            return OracleReport::invalid_format(
                "localization expects a service name or a list of service names",
            );
        };

        let subset = !submitted.is_empty() && is_ordered_subset(&submitted, &self.targets);
        if !subset {
            let mut report = OracleReport::graded(
                false,
                0.0,
                format!("{submitted:?} is not contained in the faulty targets"),
            );
            report.is_subset = false;
            return report;
        }

        let score = if submitted.len() == self.targets.len() {
            1.0
        } else {
            submitted.len() as f64 / self.targets.len() as f64
        };
        let mut report = OracleReport::graded(
            true,
            score,
            format!("matched {} of {} faulty targets", submitted.len(), self.targets.len()),
        );
        report.is_subset = true;
        report
    }
}

/* ============================= MITIGATION ============================= */

/// Live-cluster health probe the mitigation oracle polls. The gateway
/// provides the production implementation; tests substitute fakes.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn healthy(&self, namespace: &str) -> Result<bool, ClusterError>;
}

/// Ignores the submission and polls the app namespace for recovered health.
pub struct MitigationOracle {
    check: Arc<dyn HealthCheck>,
    namespace: String,
    deadline: Duration,
    interval: Duration,
}

impl MitigationOracle {
    pub fn new(check: Arc<dyn HealthCheck>, namespace: impl Into<String>) -> Self {
        Self::with_timing(check, namespace, Duration::from_secs(120), Duration::from_secs(5))
    }

    pub fn with_timing(
        check: Arc<dyn HealthCheck>,
        namespace: impl Into<String>,
        deadline: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            check,
            namespace: namespace.into(),
            deadline,
            interval,
        }
    }

    pub async fn evaluate(&self) -> OracleReport {
        let start = Instant::now();
        let mut observed = false;
        let mut last_error = None;

        loop {
            match self.check.healthy(&self.namespace).await {
                Ok(true) => {
                    return OracleReport::graded(
                        true,
                        1.0,
                        format!("namespace {} is healthy", self.namespace),
                    );
                }
                Ok(false) => observed = true,
                Err(e) => last_error = Some(e.to_string()),
            }

            if start.elapsed() >= self.deadline {
                break;
            }
            tokio::time::sleep(self.interval).await;
        }

        if !observed && let Some(err) = last_error {
            return OracleReport::skipped(format!("health check unavailable: {err}"));
        }
        OracleReport::graded(
            false,
            0.0,
            format!("namespace {} did not become healthy in time", self.namespace),
        )
    }
}

/* ============================= LLM JUDGE ============================= */

const JUDGE_SYSTEM_PROMPT: &str = "You are an expert judge evaluating whether an agent's \
diagnosis of a system issue matches the expected root cause. Compare the agent's answer \
with the expected root cause and decide if they are semantically equivalent. Respond with \
JSON: {\"judgment\": \"True|False\", \"reasoning\": \"brief explanation\"}";

/// Optional free-text grader backed by an OpenAI-style chat endpoint. The
/// backend is initialised lazily; when unconfigured or unreachable the
/// judgment is `None` and the stage is recorded as skipped.
pub struct LlmJudge {
    cfg: JudgeConfig,
    client: std::sync::OnceLock<Option<reqwest::Client>>,
}

impl LlmJudge {
    pub fn new(cfg: JudgeConfig) -> Self {
        Self {
            cfg,
            client: std::sync::OnceLock::new(),
        }
    }

    fn backend(&self) -> Option<&reqwest::Client> {
        self.client
            .get_or_init(|| {
                if !self.cfg.is_configured() {
                    return None;
                }
                reqwest::Client::builder()
                    .timeout(Duration::from_secs(60))
                    .build()
                    .ok()
            })
            .as_ref()
    }

    pub async fn judge(&self, solution: &str, expectation: &str) -> (Option<bool>, String) {
        let Some(client) = self.backend() else {
            return (None, "LLM judge backend is not configured".to_string());
        };
        let url = self.cfg.api_url.as_deref().expect("configured backend has a url");

        let expectation = if expectation.is_empty() {
            "(No fault - system is operating normally)"
        } else {
            expectation
        };
        let user_prompt = format!(
            "Expected Root Cause:\n{expectation}\n\nAgent's Answer:\n{solution}\n\n\
             Evaluate whether the agent's answer correctly identifies the root cause."
        );
        let payload = serde_json::json!({
            "model": self.cfg.model,
            "temperature": 0.0,
            "messages": [
                {"role": "system", "content": JUDGE_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
        });

        let mut request = client.post(url).json(&payload);
        if let Some(key) = &self.cfg.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return (None, format!("LLM judge request failed: {e}")),
        };
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return (None, format!("LLM judge returned malformed JSON: {e}")),
        };
        let Some(content) = body["choices"][0]["message"]["content"].as_str() else {
            return (None, "LLM judge response had no message content".to_string());
        };

        parse_judgment(content)
    }
}

/// Parse a judge response into a verdict and reasoning, tolerating fenced
/// JSON and bare `True`/`False` answers.
pub fn parse_judgment(content: &str) -> (Option<bool>, String) {
    let cleaned = content
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cleaned) {
        let judgment = value["judgment"].as_str().unwrap_or_default().trim().to_lowercase();
        let reasoning = value["reasoning"].as_str().unwrap_or_default().to_string();
        return match judgment.as_str() {
            "true" => (Some(true), reasoning),
            "false" => (Some(false), reasoning),
            _ => (None, format!("could not parse judgment from {cleaned:?}")),
        };
    }

    match cleaned.to_lowercase().as_str() {
        "true" => (Some(true), "unstructured judge response".to_string()),
        "false" => (Some(false), "unstructured judge response".to_string()),
        _ => (None, format!("could not parse judgment from {cleaned:?}")),
    }
}

/* ============================= TESTS ============================= */
