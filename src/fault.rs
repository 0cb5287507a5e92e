use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ClusterError, HarnessError};
use crate::gateway::ClusterGateway;

/* ============================= TRAIT ============================= */

/// A scripted deviation from healthy cluster state. Both operations are
/// idempotent: recovering without a prior inject succeeds, and repeating
/// either call leaves the cluster unchanged. Each call is internally bounded
/// by the gateway's request timeout.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn inject(&self) -> Result<(), HarnessError>;
    async fn recover(&self) -> Result<(), HarnessError>;
}

/* ============================= PATCH INJECTOR ============================= */

/// Registry-supplied parameters for a deployment-patch fault: the inject
/// patch breaks the target, the recover patch restores the original values.
/// JSON merge patches make both directions idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchFaultParams {
    pub namespace: String,
    pub deployment: String,
    pub inject_patch: serde_json::Value,
    pub recover_patch: serde_json::Value,
}

/// Application-level injector that misconfigures one deployment.
pub struct PatchFaultInjector {
    gateway: Arc<ClusterGateway>,
    params: PatchFaultParams,
}

impl PatchFaultInjector {
    pub fn new(gateway: Arc<ClusterGateway>, params: PatchFaultParams) -> Self {
        Self { gateway, params }
    }

    async fn apply(&self, patch: &serde_json::Value, action: &str) -> Result<(), HarnessError> {
        match self
            .gateway
            .patch_deployment(&self.params.namespace, &self.params.deployment, patch)
            .await
        {
            Ok(()) => {
                info!(
                    deployment = %self.params.deployment,
                    namespace = %self.params.namespace,
                    action,
                    "fault_patch_applied"
                );
                Ok(())
            }
            // The target not existing means there is nothing to recover.
            Err(ClusterError::NotFound(_)) if action == "recover" => Ok(()),
            Err(e) => Err(HarnessError::FaultInjection(format!(
                "{action} {}/{} failed: {e}",
                self.params.namespace, self.params.deployment
            ))),
        }
    }
}

#[async_trait]
impl FaultInjector for PatchFaultInjector {
    async fn inject(&self) -> Result<(), HarnessError> {
        self.apply(&self.params.inject_patch, "inject").await
    }

    async fn recover(&self) -> Result<(), HarnessError> {
        self.apply(&self.params.recover_patch, "recover").await
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_round_trip_yaml() {
        let yaml = r#"
namespace: hotel-reservation
deployment: geo
inject_patch:
  spec:
    template:
      spec:
        containers:
          - name: geo
            env:
              - name: MONGO_ADDR
                value: "mongodb-geo:27018"
recover_patch:
  spec:
    template:
      spec:
        containers:
          - name: geo
            env:
              - name: MONGO_ADDR
                value: "mongodb-geo:27017"
"#;
        let params: PatchFaultParams = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(params.deployment, "geo");
        assert_eq!(
            params.inject_patch["spec"]["template"]["spec"]["containers"][0]["name"],
            "geo"
        );
        // Inject and recover are distinct patches over the same target.
        assert_ne!(params.inject_patch, params.recover_patch);
    }
}
