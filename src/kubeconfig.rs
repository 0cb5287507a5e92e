use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kube::config::{AuthInfo, Kubeconfig};
use secrecy::ExposeSecret;
use tracing::info;

/* ============================= UPSTREAM CONFIG ============================= */

/// Connection details for the real cluster API, extracted once at proxy
/// startup from the operator's kubeconfig.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
    pub bearer_token: Option<String>,
}

/* ============================= LOADING ============================= */

/// The operator's kubeconfig at its default location. `$KUBECONFIG` is
/// deliberately ignored: agents receive a kubeconfig pointing at the proxy,
/// and honouring the override here would loop the proxy onto itself.
pub fn default_kubeconfig_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".kube").join("config"))
}

pub fn load_default_upstream() -> anyhow::Result<UpstreamConfig> {
    let path = default_kubeconfig_path()?;
    let config = Kubeconfig::read_from(&path)
        .with_context(|| format!("cannot read kubeconfig {}", path.display()))?;
    upstream_from_kubeconfig(&config)
}

pub fn upstream_from_yaml(raw: &str) -> anyhow::Result<UpstreamConfig> {
    let config: Kubeconfig = serde_yaml::from_str(raw).context("malformed kubeconfig")?;
    upstream_from_kubeconfig(&config)
}

fn material(
    inline: &Option<String>,
    file: &Option<String>,
    what: &str,
) -> anyhow::Result<Option<Vec<u8>>> {
    if let Some(data) = inline {
        let decoded = BASE64
            .decode(data.trim())
            .with_context(|| format!("{what} data is not valid base64"))?;
        return Ok(Some(decoded));
    }
    if let Some(path) = file {
        let bytes =
            std::fs::read(path).with_context(|| format!("cannot read {what} file {path}"))?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

fn client_key_material(auth: &AuthInfo) -> anyhow::Result<Option<Vec<u8>>> {
    if let Some(data) = &auth.client_key_data {
        let decoded = BASE64
            .decode(data.expose_secret().trim())
            .context("client key data is not valid base64")?;
        return Ok(Some(decoded));
    }
    if let Some(path) = &auth.client_key {
        let bytes =
            std::fs::read(path).with_context(|| format!("cannot read client key file {path}"))?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

fn bearer_token(auth: &AuthInfo) -> anyhow::Result<Option<String>> {
    if let Some(token) = &auth.token {
        return Ok(Some(token.expose_secret().to_string()));
    }
    if let Some(path) = &auth.token_file {
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read token file {path}"))?;
        return Ok(Some(token.trim().to_string()));
    }
    Ok(None)
}

/// Extract the active context's server address and credentials from a parsed
/// kubeconfig.
pub fn upstream_from_kubeconfig(config: &Kubeconfig) -> anyhow::Result<UpstreamConfig> {
    let named_context = match &config.current_context {
        Some(name) => config
            .contexts
            .iter()
            .find(|c| &c.name == name)
            .with_context(|| format!("current-context {name:?} not found"))?,
        None => config.contexts.first().context("kubeconfig has no contexts")?,
    };
    let context = named_context
        .context
        .as_ref()
        .with_context(|| format!("context {:?} has no body", named_context.name))?;

    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)
        .and_then(|c| c.cluster.as_ref())
        .with_context(|| format!("cluster {:?} not found", context.cluster))?;
    let server = cluster
        .server
        .as_deref()
        .with_context(|| format!("cluster {:?} has no server address", context.cluster))?;

    let auth = match context.user.as_str() {
        "" => None,
        user_name => config
            .auth_infos
            .iter()
            .find(|a| a.name == user_name)
            .and_then(|a| a.auth_info.as_ref()),
    };

    let ca_pem = material(
        &cluster.certificate_authority_data,
        &cluster.certificate_authority,
        "certificate authority",
    )?;
    let (client_cert_pem, client_key_pem, bearer_token) = match auth {
        Some(auth) => (
            material(
                &auth.client_certificate_data,
                &auth.client_certificate,
                "client certificate",
            )?,
            client_key_material(auth)?,
            bearer_token(auth)?,
        ),
        None => (None, None, None),
    };

    Ok(UpstreamConfig {
        server: server.trim_end_matches('/').to_string(),
        ca_pem,
        client_cert_pem,
        client_key_pem,
        bearer_token,
    })
}

/* ============================= AGENT KUBECONFIG ============================= */

/// Credential handed to agents: plain HTTP to the loopback proxy, no bearer
/// token. The proxy authenticates upstream on the agent's behalf.
pub fn agent_kubeconfig_yaml(proxy_port: u16) -> String {
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": "faultbench-agent",
        "clusters": [{
            "name": "faultbench-proxy",
            "cluster": {
                "server": format!("http://127.0.0.1:{proxy_port}"),
                "insecure-skip-tls-verify": true,
            },
        }],
        "contexts": [{
            "name": "faultbench-agent",
            "context": {"cluster": "faultbench-proxy", "user": "faultbench-agent"},
        }],
        "users": [{"name": "faultbench-agent", "user": {}}],
    });
    serde_yaml::to_string(&doc).expect("static kubeconfig serialises")
}

pub fn write_agent_kubeconfig(dir: &Path, proxy_port: u16) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create {}", dir.display()))?;
    let path = dir.join("agent-kubeconfig.yaml");
    std::fs::write(&path, agent_kubeconfig_yaml(proxy_port))
        .with_context(|| format!("cannot write {}", path.display()))?;
    info!(path = %path.display(), "agent_kubeconfig_written");
    Ok(path)
}

/* ============================= VALIDATION ============================= */

pub fn validate(config: &UpstreamConfig) -> anyhow::Result<()> {
    if !config.server.starts_with("https://") && !config.server.starts_with("http://") {
        bail!("kubeconfig server {:?} is not an HTTP(S) URL", config.server);
    }
    if config.client_cert_pem.is_some() != config.client_key_pem.is_some() {
        bail!("kubeconfig has a client certificate without a key (or vice versa)");
    }
    Ok(())
}

/* ============================= TESTS ============================= */
