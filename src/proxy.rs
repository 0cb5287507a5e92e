use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kubeconfig::UpstreamConfig;

/* ============================= CONFIG ============================= */

/// Namespaces whose existence is concealed from agents. Seeing them would
/// leak that faults are scripted by chaos tooling.
pub const DEFAULT_HIDDEN_NAMESPACES: &[&str] = &["chaos-mesh", "chaos-testing"];

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Cluster-wide list endpoints of namespaced kinds that must be filtered.
const FILTERED_LIST_PATHS: &[&str] = &[
    "/api/v1/pods",
    "/api/v1/services",
    "/api/v1/events",
    "/api/v1/configmaps",
    "/api/v1/secrets",
    "/api/v1/endpoints",
    "/api/v1/persistentvolumeclaims",
    "/apis/apps/v1/deployments",
    "/apis/apps/v1/replicasets",
    "/apis/apps/v1/statefulsets",
    "/apis/apps/v1/daemonsets",
    "/apis/batch/v1/jobs",
    "/apis/batch/v1/cronjobs",
];

pub fn default_hidden_namespaces() -> HashSet<String> {
    DEFAULT_HIDDEN_NAMESPACES.iter().map(|s| s.to_string()).collect()
}

/* ============================= FILTER RULES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    /// The namespace list itself: drop hidden names.
    Namespaces,
    /// A cluster-wide list of a namespaced kind: drop items in hidden namespaces.
    Resources,
}

/// True when the path addresses a hidden namespace directly, e.g.
/// `/api/v1/namespaces/chaos-mesh/pods`.
pub fn is_hidden_namespace_path(path: &str, hidden: &HashSet<String>) -> bool {
    let mut parts = path.split('/');
    while let Some(part) = parts.next() {
        if part == "namespaces"
            && let Some(next) = parts.next()
        {
            let ns = next.split('?').next().unwrap_or(next);
            if hidden.contains(ns) {
                return true;
            }
        }
    }
    false
}

/// Which filter, if any, applies to a response for this path.
pub fn filter_kind_for_path(path: &str) -> Option<ListFilter> {
    if path.trim_end_matches('/') == "/api/v1/namespaces" {
        return Some(ListFilter::Namespaces);
    }
    // Namespaced list endpoints are already scoped; only cluster-wide lists
    // can leak hidden-namespace items.
    if path.contains("/namespaces/") {
        return None;
    }
    FILTERED_LIST_PATHS
        .iter()
        .any(|prefix| path.starts_with(prefix))
        .then_some(ListFilter::Resources)
}

fn retain_items(data: &mut serde_json::Value, keep: impl Fn(&serde_json::Value) -> bool) {
    if let Some(items) = data.get_mut("items").and_then(|v| v.as_array_mut()) {
        items.retain(|item| keep(item));
    }
    // kubectl asks for the server-side Table rendering.
    if let Some(rows) = data.get_mut("rows").and_then(|v| v.as_array_mut()) {
        rows.retain(|row| keep(&row["object"]));
    }
}

pub fn filter_namespace_list(data: &mut serde_json::Value, hidden: &HashSet<String>) {
    retain_items(data, |item| {
        item["metadata"]["name"]
            .as_str()
            .is_none_or(|name| !hidden.contains(name))
    });
}

pub fn filter_resource_list(data: &mut serde_json::Value, hidden: &HashSet<String>) {
    retain_items(data, |item| {
        item["metadata"]["namespace"]
            .as_str()
            .is_none_or(|ns| !hidden.contains(ns))
    });
}

/* ============================= UPSTREAM CLIENT ============================= */

pub fn build_upstream_client(upstream: &UpstreamConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .timeout(UPSTREAM_TIMEOUT);

    if let Some(ca) = &upstream.ca_pem {
        let cert = reqwest::Certificate::from_pem(ca).context("invalid CA certificate")?;
        builder = builder.add_root_certificate(cert);
    } else if upstream.server.starts_with("https://") {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let (Some(cert), Some(key)) = (&upstream.client_cert_pem, &upstream.client_key_pem) {
        let identity = reqwest::Identity::from_pkcs8_pem(cert, key)
            .context("invalid client certificate/key")?;
        builder = builder.identity(identity);
    }

    builder.build().context("cannot build upstream HTTP client")
}

/* ============================= PROXY ============================= */

pub struct ProxyState {
    hidden: HashSet<String>,
    client: reqwest::Client,
    base: String,
    bearer: Option<String>,
}

/// Loopback reverse proxy to the cluster API that rewrites list responses
/// and rejects hidden namespaces before any upstream I/O.
pub struct FilteringProxy {
    state: Arc<ProxyState>,
    listen_port: u16,
}

impl FilteringProxy {
    pub fn new(
        upstream: &UpstreamConfig,
        hidden: HashSet<String>,
        listen_port: u16,
    ) -> anyhow::Result<Self> {
        let client = build_upstream_client(upstream)?;
        Ok(Self {
            state: Arc::new(ProxyState {
                hidden,
                client,
                base: upstream.server.clone(),
                bearer: upstream.bearer_token.clone(),
            }),
            listen_port,
        })
    }

    /// Bind on loopback and serve until the shutdown channel fires. Returns
    /// the bound address (the port may be ephemeral) and the server task.
    pub async fn serve(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.listen_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind proxy on {addr}"))?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, hidden = ?self.state.hidden, "api_proxy_started");

        let app = build_router(self.state);
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "api_proxy_stopped_with_error");
            } else {
                info!("api_proxy_stopped");
            }
        });

        Ok((local_addr, handle))
    }
}

pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    req: axum::extract::Request,
) -> Response {
    let path = req.uri().path().to_string();

    if is_hidden_namespace_path(&path, &state.hidden) {
        debug!(path = %path, "hidden_namespace_rejected");
        return (
            StatusCode::FORBIDDEN,
            "Forbidden: Access to this namespace is not allowed",
        )
            .into_response();
    }

    match forward(&state, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(path = %path, error = %e, "upstream_request_failed");
            (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {e}")).into_response()
        }
    }
}

async fn forward(state: &ProxyState, req: axum::extract::Request) -> anyhow::Result<Response> {
    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let method = req.method().clone();
    let headers = req.headers().clone();
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .context("cannot read request body")?;

    let upstream_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .context("unsupported request method")?;
    let mut upstream_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        // Host must match upstream and the proxy negotiates its own
        // encoding, so both are dropped.
        if matches!(name.as_str(), "host" | "accept-encoding" | "content-length") {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            upstream_headers.insert(n, v);
        }
    }

    let mut request = state
        .client
        .request(upstream_method, format!("{}{}", state.base, path_and_query))
        .headers(upstream_headers);
    if let Some(token) = &state.bearer {
        request = request.bearer_auth(token);
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let upstream = request.send().await.context("upstream request failed")?;
    let status = upstream.status().as_u16();
    let response_headers = upstream.headers().clone();
    let content_type = response_headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    // Gzip responses are decoded transparently by the client.
    let mut payload = upstream
        .bytes()
        .await
        .context("cannot read upstream body")?
        .to_vec();

    if status == 200
        && content_type.contains("application/json")
        && let Some(filter) = filter_kind_for_path(&path)
        && let Ok(mut data) = serde_json::from_slice::<serde_json::Value>(&payload)
    {
        match filter {
            ListFilter::Namespaces => filter_namespace_list(&mut data, &state.hidden),
            ListFilter::Resources => filter_resource_list(&mut data, &state.hidden),
        }
        if let Ok(rewritten) = serde_json::to_vec(&data) {
            payload = rewritten;
        }
    }

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in response_headers.iter() {
        if matches!(
            name.as_str(),
            "transfer-encoding" | "content-length" | "content-encoding"
        ) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(n, v);
        }
    }
    builder = builder.header(header::CONTENT_LENGTH, payload.len());

    builder
        .body(Body::from(payload))
        .context("cannot build response")
}

/* ============================= TESTS ============================= */
