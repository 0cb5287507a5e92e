use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, TypeMeta};
use kube::Client;
use kube::discovery::{Discovery, Scope};
use kube_runtime::wait::{await_condition, conditions};
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ClusterError;
use crate::oracle::HealthCheck;

/* ============================= CONFIG ============================= */

const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "faultbench";

/* ============================= PROBE TRAIT ============================= */

/// Narrow view of the gateway used for the privileged-runtime gate, so the
/// conductor can be exercised without a live cluster.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn is_emulated(&self) -> Result<bool, ClusterError>;
}

/* ============================= GATEWAY ============================= */

/// One serialised channel to the cluster control plane. Reads are retried
/// with backoff; mutations take the write token and surface failures to the
/// caller untouched.
pub struct ClusterGateway {
    client: Client,
    write_lock: tokio::sync::Mutex<()>,
    request_timeout: Duration,
    retry_total: u32,
    retry_backoff_factor: f64,
}

impl ClusterGateway {
    pub async fn connect(config: &Config) -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Unreachable(format!("cannot load kubeconfig: {e}")))?;
        Ok(Self::from_client(client, config))
    }

    pub fn from_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            write_lock: tokio::sync::Mutex::new(()),
            request_timeout: config.request_timeout,
            retry_total: config.retry_total,
            retry_backoff_factor: config.retry_backoff_factor,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let secs = self.retry_backoff_factor * f64::from(1u32 << attempt.min(16));
        Duration::from_secs_f64(secs)
    }

    /// Run an idempotent read with timeout and backoff retries.
    fn read<T: Send, F>(
        &self,
        what: &str,
        mut op: F,
    ) -> impl Future<Output = Result<T, ClusterError>> + Send + '_
    where
        F: AsyncFnMut() -> Result<T, kube::Error> + Send,
        for<'a> F::CallRefFuture<'a>: Send,
    {
        async move {
            let mut attempt = 0;
            loop {
                match timeout(self.request_timeout, op()).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(e)) => {
                        let mapped = ClusterError::from_kube(e);
                        let retriable = !matches!(
                            mapped,
                            ClusterError::NotFound(_) | ClusterError::Conflict(_)
                        );
                        if !retriable || attempt >= self.retry_total {
                            return Err(mapped);
                        }
                        warn!(op = what, attempt, error = %mapped, "cluster_read_retry");
                    }
                    Err(_) => {
                        if attempt >= self.retry_total {
                            return Err(ClusterError::Timeout(what.to_string()));
                        }
                        warn!(op = what, attempt, "cluster_read_timeout_retry");
                    }
                }
                sleep(self.retry_delay(attempt)).await;
                attempt += 1;
            }
        }
    }

    /// Run a mutation under the write token. Never retried.
    async fn mutate<T>(
        &self,
        what: &str,
        op: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, ClusterError> {
        let _token = self.write_lock.lock().await;
        match timeout(self.request_timeout, op).await {
            Ok(result) => result.map_err(ClusterError::from_kube),
            Err(_) => Err(ClusterError::Timeout(what.to_string())),
        }
    }

    /* ───────────────────────── apply / delete / patch ───────────────────────── */

    /// Server-side apply every document in a multi-doc manifest.
    pub async fn apply(&self, manifest_yaml: &str) -> Result<(), ClusterError> {
        let objects = parse_manifest_docs(manifest_yaml)?;
        if objects.is_empty() {
            return Ok(());
        }

        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(ClusterError::from_kube)?;

        for object in objects {
            let types = object.types.clone().ok_or_else(|| {
                ClusterError::Unreachable("manifest document is missing apiVersion/kind".into())
            })?;
            let gvk = gvk_of(&types);
            let (resource, caps) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
                ClusterError::NotFound(format!("no API resource for {}/{}", types.api_version, types.kind))
            })?;

            let name = object.metadata.name.clone().ok_or_else(|| {
                ClusterError::Unreachable("manifest document is missing metadata.name".into())
            })?;
            let api: Api<DynamicObject> = match caps.scope {
                Scope::Namespaced => {
                    let ns = object.metadata.namespace.as_deref().unwrap_or("default");
                    Api::namespaced_with(self.client.clone(), ns, &resource)
                }
                Scope::Cluster => Api::all_with(self.client.clone(), &resource),
            };

            let params = PatchParams::apply(FIELD_MANAGER).force();
            self.mutate(
                "apply",
                async { api.patch(&name, &params, &Patch::Apply(&object)).await },
            )
            .await?;
            info!(kind = %types.kind, name = %name, "manifest_applied");
        }
        Ok(())
    }

    /// Fetch a manifest over HTTP and apply it.
    pub async fn apply_url(&self, url: &str) -> Result<(), ClusterError> {
        let body = reqwest::get(url)
            .await
            .map_err(|e| ClusterError::Unreachable(format!("fetch {url}: {e}")))?
            .text()
            .await
            .map_err(|e| ClusterError::Unreachable(format!("fetch {url}: {e}")))?;
        self.apply(&body).await
    }

    /// Delete one object of an arbitrary kind. Deleting something already
    /// gone succeeds.
    pub async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), ClusterError> {
        let types = TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        };
        let gvk = gvk_of(&types);
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(ClusterError::from_kube)?;
        let (resource, caps) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
            ClusterError::NotFound(format!("no API resource for {api_version}/{kind}"))
        })?;

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or("default"),
                &resource,
            ),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };
        let result = self
            .mutate("delete", async {
                api.delete(name, &DeleteParams::default()).await
            })
            .await;
        match result {
            Ok(_) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let result = self
            .mutate(
                "delete_namespace",
                async { api.delete(namespace, &DeleteParams::default()).await },
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Already gone counts as deleted.
            Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.mutate(
            "patch_deployment",
            async {
                api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
            },
        )
        .await?;
        Ok(())
    }

    /* ───────────────────────── reads & waits ───────────────────────── */

    pub async fn get_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = match selector {
            Some(labels) => ListParams::default().labels(labels),
            None => ListParams::default(),
        };
        let list = self.read("get_pods", async || api.list(&params).await).await?;
        Ok(list.items)
    }

    /// Poll until every pod in the namespace is settled and ready.
    pub async fn wait_for_ready(&self, namespace: &str, wait: Duration) -> Result<(), ClusterError> {
        let deadline = Instant::now() + wait;
        loop {
            let pods = self.get_pods(namespace, None).await?;
            if !pods.is_empty() && all_pods_ready(&pods) {
                info!(namespace, "namespace_ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout(format!(
                    "namespace {namespace} not ready within {wait:?}"
                )));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Wait until the namespace object is gone.
    pub async fn wait_for_namespace_deletion(
        &self,
        namespace: &str,
        wait: Duration,
    ) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let uid = match api.get(namespace).await {
            Ok(ns) => ns.metadata.uid,
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(()),
            Err(e) => return Err(ClusterError::from_kube(e)),
        };
        let Some(uid) = uid else {
            return Ok(());
        };

        let deleted = await_condition(api, namespace, conditions::is_deleted(&uid));
        match timeout(wait, deleted).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ClusterError::Unreachable(e.to_string())),
            Err(_) => Err(ClusterError::Timeout(format!(
                "namespace {namespace} not deleted within {wait:?}"
            ))),
        }
    }

    /// True when the control plane looks like a local single-host cluster
    /// (kind, minikube, k3d) where privileged daemon-set injectors cannot run.
    pub fn is_emulated_cluster(&self) -> impl Future<Output = Result<bool, ClusterError>> + Send + '_ {
        async move {
            let api: Api<Node> = Api::all(self.client.clone());
            let nodes = self
                .read("list_nodes", async || {
                    api.list(&ListParams::default()).await
                })
                .await?;
            Ok(looks_emulated(&nodes.items))
        }
    }
}

#[async_trait]
impl ClusterProbe for ClusterGateway {
    async fn is_emulated(&self) -> Result<bool, ClusterError> {
        self.is_emulated_cluster().await
    }
}

#[async_trait]
impl HealthCheck for ClusterGateway {
    async fn healthy(&self, namespace: &str) -> Result<bool, ClusterError> {
        let pods = self.get_pods(namespace, None).await?;
        Ok(!pods.is_empty() && all_pods_ready(&pods))
    }
}

/* ============================= PURE HELPERS ============================= */

fn gvk_of(types: &TypeMeta) -> GroupVersionKind {
    match types.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &types.kind),
        None => GroupVersionKind::gvk("", &types.api_version, &types.kind),
    }
}

/// Split a multi-document YAML manifest into dynamic objects, skipping
/// empty documents.
pub fn parse_manifest_docs(manifest_yaml: &str) -> Result<Vec<DynamicObject>, ClusterError> {
    use serde::Deserialize;

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest_yaml) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| ClusterError::Unreachable(format!("invalid manifest document: {e}")))?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| ClusterError::Unreachable(format!("invalid manifest document: {e}")))?;
        objects.push(object);
    }
    Ok(objects)
}

/// A pod counts as settled when it has finished or is running with every
/// container ready.
pub fn pod_is_settled(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    match status.phase.as_deref() {
        Some("Succeeded") => true,
        Some("Running") => status
            .container_statuses
            .as_ref()
            .is_some_and(|statuses| statuses.iter().all(|cs| cs.ready)),
        _ => false,
    }
}

pub fn all_pods_ready(pods: &[Pod]) -> bool {
    pods.iter().all(pod_is_settled)
}

/// Node-level signatures of emulated local clusters.
pub fn looks_emulated(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        if name.contains("kind") || name.contains("minikube") || name.contains("k3d") {
            return true;
        }
        if let Some(labels) = &node.metadata.labels
            && labels.keys().any(|k| k.starts_with("minikube.k8s.io/"))
        {
            return true;
        }
        node.spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .is_some_and(|p| p.starts_with("kind://") || p.starts_with("k3s://"))
    })
}

/* ============================= TESTS ============================= */
