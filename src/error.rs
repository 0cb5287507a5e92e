use std::time::Duration;

use thiserror::Error;

/* ============================= CLUSTER ERRORS ============================= */

/// Typed failures surfaced by the cluster gateway.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cluster operation timed out: {0}")]
    Timeout(String),

    #[error("cluster unreachable: {0}")]
    Unreachable(String),
}

impl ClusterError {
    /// Map a kube client error onto the gateway's error kinds.
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message),
            other => ClusterError::Unreachable(other.to_string()),
        }
    }

    /// Timeouts are retriable for reads; everything else depends on the caller.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout(_))
    }
}

/* ============================= HARNESS ERRORS ============================= */

/// Error kinds crossing component boundaries inside the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Malformed submission; surfaced as HTTP 400, stage unchanged.
    #[error("parse error: {0}")]
    Parse(String),

    /// Parseable but wrong shape for the stage; stage unchanged.
    #[error("invalid submission format: {0}")]
    Format(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Environment provisioning failed outside the cluster API itself.
    #[error("setup error: {0}")]
    Setup(String),

    /// Fault injection failed; the session is aborted and cleaned up.
    #[error("fault injection failed: {0}")]
    FaultInjection(String),

    /// An oracle could not evaluate; the stage is recorded as skipped.
    #[error("oracle could not evaluate: {0}")]
    Oracle(String),

    #[error("workload error: {0}")]
    Workload(String),

    #[error("workload collection timed out after {0:?}")]
    CollectTimeout(Duration),

    #[error("shutdown requested")]
    ShutdownRequested,
}

/* ============================= TESTS ============================= */
