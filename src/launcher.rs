use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::AgentRegistration;

/* ============================= CONFIG ============================= */

/// Provider credentials and harness coordinates forwarded from the host
/// environment into agent containers.
pub const FORWARDED_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_API_KEY",
    "GEMINI_API_KEY",
    "AZURE_API_KEY",
    "AZURE_API_BASE",
    "AWS_PROFILE",
    "AWS_DEFAULT_REGION",
    "MODEL_ID",
    "API_HOSTNAME",
    "API_PORT",
];

const INSTALL_SCRIPTS_DIR: &str = "/opt/faultbench/install-scripts";

/// Isolation image settings for container mode.
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub image: String,
    pub network_mode: String,
    pub cpus: f64,
    pub memory: String,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            image: "faultbench-agent-base:latest".to_string(),
            network_mode: "host".to_string(),
            cpus: 4.0,
            memory: "8g".to_string(),
        }
    }
}

/* ============================= COMMAND BUILDERS ============================= */

/// Compose the in-container command: run the install script (persisting its
/// exit code and aborting on failure), then the driver, teeing both logs.
pub fn build_composite_command(
    install_script: Option<&str>,
    version: Option<&str>,
    driver_command: &str,
) -> String {
    let mut parts = Vec::new();

    if let Some(script) = install_script {
        let version_env = version
            .map(|v| format!("AGENT_VERSION=\"{v}\" "))
            .unwrap_or_default();
        parts.push(format!(
            "{version_env}{INSTALL_SCRIPTS_DIR}/{script} 2>&1 \
             | tee /logs/install.log; INSTALL_RC=${{PIPESTATUS[0]}}; \
             echo \"$INSTALL_RC\" > /logs/install.rc; \
             [ \"$INSTALL_RC\" -eq 0 ] || exit \"$INSTALL_RC\""
        ));
    }

    parts.push(format!(
        "{driver_command} 2>&1 \
         | tee /logs/driver.log; DRIVER_RC=${{PIPESTATUS[0]}}; \
         echo \"$DRIVER_RC\" > /logs/driver.rc; \
         exit \"$DRIVER_RC\""
    ));

    parts.join(" && ")
}

/// Assemble `docker run` arguments for an agent container. `macos` selects
/// the Docker Desktop workaround: host networking is silently ignored there,
/// so the harness address is re-routed through the host gateway alias.
pub fn build_docker_args(
    opts: &ContainerOptions,
    reg: &AgentRegistration,
    container_name: &str,
    kubeconfig: Option<&Path>,
    logs_dir: &Path,
    host_env: &BTreeMap<String, String>,
    macos: bool,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        format!("--cpus={}", opts.cpus),
        format!("--memory={}", opts.memory),
    ];

    if opts.network_mode == "host" && macos {
        args.push("--add-host=host.docker.internal:host-gateway".to_string());
    } else {
        args.push(format!("--network={}", opts.network_mode));
    }

    args.push("--name".to_string());
    args.push(container_name.to_string());

    if let Some(kubeconfig) = kubeconfig {
        args.push("-v".to_string());
        args.push(format!("{}:/root/.kube/config:ro", kubeconfig.display()));
        args.push("-e".to_string());
        args.push("KUBECONFIG=/root/.kube/config".to_string());
    }

    args.push("-v".to_string());
    args.push(format!("{}:/logs", logs_dir.display()));

    let mut env: BTreeMap<String, String> = host_env
        .iter()
        .filter(|(k, _)| FORWARDED_ENV_VARS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.extend(reg.env.clone());
    env.entry("AGENT_LOGS_DIR".to_string())
        .or_insert_with(|| "/logs".to_string());
    if opts.network_mode == "host" && macos {
        env.entry("API_HOSTNAME".to_string())
            .or_insert_with(|| "host.docker.internal".to_string());
    }
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push(opts.image.clone());
    args.push("bash".to_string());
    args.push("-lc".to_string());
    args.push(build_composite_command(
        reg.install_script.as_deref(),
        reg.version.as_deref(),
        &reg.kickoff_command,
    ));

    args
}

fn forwarded_host_env() -> BTreeMap<String, String> {
    FORWARDED_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
        .collect()
}

/* ============================= LAUNCHER ============================= */

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// A launched agent: the process handle plus, in container mode, the
/// container name used for runtime-level cleanup.
pub struct AgentHandle {
    pub name: String,
    child: Child,
    pub container_name: Option<String>,
    log_tasks: Vec<JoinHandle<()>>,
}

/// Starts external agents as subprocesses or containers, streams their logs,
/// and guarantees teardown.
pub struct AgentLauncher {
    logs_dir: PathBuf,
    kubeconfig_path: Option<PathBuf>,
    container: Option<ContainerOptions>,
    procs: BTreeMap<String, AgentHandle>,
}

impl AgentLauncher {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            kubeconfig_path: None,
            container: None,
            procs: BTreeMap::new(),
        }
    }

    /// Point agents at the filtering proxy's credential instead of the
    /// operator's kubeconfig.
    pub fn set_agent_kubeconfig(&mut self, path: impl Into<PathBuf>) {
        self.kubeconfig_path = Some(path.into());
    }

    pub fn enable_container_isolation(&mut self, opts: ContainerOptions) {
        self.container = Some(opts);
    }

    pub fn is_running(&mut self, name: &str) -> bool {
        match self.procs.get_mut(name) {
            Some(handle) => matches!(handle.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Launch the agent unless it is already running.
    pub async fn ensure_started(&mut self, reg: &AgentRegistration) -> anyhow::Result<()> {
        if self.is_running(&reg.name) {
            return Ok(());
        }
        self.procs.remove(&reg.name);

        let agent_dir = self.logs_dir.join(&reg.name);
        tokio::fs::create_dir_all(&agent_dir)
            .await
            .with_context(|| format!("cannot create {}", agent_dir.display()))?;

        let handle = match &self.container {
            Some(opts) => self.start_containerized(reg, opts.clone(), &agent_dir).await?,
            None => self.start_subprocess(reg, &agent_dir).await?,
        };
        self.procs.insert(reg.name.clone(), handle);
        Ok(())
    }

    async fn start_subprocess(
        &self,
        reg: &AgentRegistration,
        agent_dir: &Path,
    ) -> anyhow::Result<AgentHandle> {
        let mut cmd = Command::new("sh");
        cmd.arg("-lc")
            .arg(&reg.kickoff_command)
            .envs(&reg.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &reg.workdir {
            cmd.current_dir(workdir);
        }
        if let Some(kubeconfig) = &self.kubeconfig_path {
            cmd.env("KUBECONFIG", kubeconfig);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("cannot start agent {:?}", reg.name))?;
        info!(agent = %reg.name, "agent_subprocess_started");

        let log_path = agent_dir.join("driver.log");
        let log_file = Arc::new(Mutex::new(
            tokio::fs::File::create(&log_path)
                .await
                .with_context(|| format!("cannot create {}", log_path.display()))?,
        ));

        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(pipe_stream(reg.name.clone(), stdout, Some(log_file.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(pipe_stream(reg.name.clone(), stderr, Some(log_file)));
        }

        Ok(AgentHandle {
            name: reg.name.clone(),
            child,
            container_name: None,
            log_tasks,
        })
    }

    async fn start_containerized(
        &self,
        reg: &AgentRegistration,
        opts: ContainerOptions,
        agent_dir: &Path,
    ) -> anyhow::Result<AgentHandle> {
        let container_name = format!(
            "faultbench-{}-{}-{}",
            reg.name,
            std::process::id(),
            CONTAINER_SEQ.fetch_add(1, Ordering::SeqCst),
        );
        let args = build_docker_args(
            &opts,
            reg,
            &container_name,
            self.kubeconfig_path.as_deref(),
            agent_dir,
            &forwarded_host_env(),
            cfg!(target_os = "macos"),
        );

        let mut child = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot start container for agent {:?}", reg.name))?;
        info!(agent = %reg.name, container = %container_name, "agent_container_started");

        // The container tees install/driver logs onto the /logs volume; the
        // docker process output is only mirrored into the harness log.
        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(pipe_stream(reg.name.clone(), stdout, None));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(pipe_stream(reg.name.clone(), stderr, None));
        }

        Ok(AgentHandle {
            name: reg.name.clone(),
            child,
            container_name: Some(container_name),
            log_tasks,
        })
    }

    /// Terminate an agent: graceful stop first, force kill after the
    /// timeout. Safe to call for unknown or already-finished agents.
    pub async fn cleanup(&mut self, name: &str, wait: Duration) -> anyhow::Result<()> {
        let Some(mut handle) = self.procs.remove(name) else {
            return Ok(());
        };

        if let Ok(Some(status)) = handle.child.try_wait() {
            self.write_exit_code(name, &handle, status.code()).await;
            finish_logs(&mut handle).await;
            return Ok(());
        }

        if let Some(container) = &handle.container_name {
            stop_container(container, wait).await;
        } else if let Some(pid) = handle.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let code = match tokio::time::timeout(wait, handle.child.wait()).await {
            Ok(status) => {
                info!(agent = name, "agent_stopped");
                status.ok().and_then(|s| s.code())
            }
            Err(_) => {
                warn!(agent = name, "agent_force_killed");
                let _ = handle.child.start_kill();
                let _ = handle.child.wait().await;
                None
            }
        };
        self.write_exit_code(name, &handle, code).await;
        finish_logs(&mut handle).await;
        Ok(())
    }

    /// Subprocess agents get their exit code persisted next to driver.log;
    /// container agents write it from inside via the composite command.
    async fn write_exit_code(&self, name: &str, handle: &AgentHandle, code: Option<i32>) {
        if handle.container_name.is_some() {
            return;
        }
        let rc = code.map(|c| c.to_string()).unwrap_or_else(|| "killed".to_string());
        let path = self.logs_dir.join(name).join("driver.rc");
        if let Err(e) = tokio::fs::write(&path, format!("{rc}\n")).await {
            warn!(agent = name, error = %e, "cannot_write_driver_rc");
        }
    }

    /// Tear down every launched agent.
    pub async fn cleanup_all(&mut self, wait: Duration) {
        let names: Vec<String> = self.procs.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.cleanup(&name, wait).await {
                warn!(agent = %name, error = %e, "agent_cleanup_failed");
            }
        }
    }
}

async fn finish_logs(handle: &mut AgentHandle) {
    let _ = futures::future::join_all(handle.log_tasks.drain(..)).await;
}

/// docker stop, falling back to a forced remove.
async fn stop_container(container: &str, wait: Duration) {
    let mut stop = Command::new("docker");
    stop.args(["stop", "-t", &wait.as_secs().to_string(), container]);
    let stopped = matches!(
        tokio::time::timeout(wait + Duration::from_secs(5), stop.output()).await,
        Ok(Ok(output)) if output.status.success()
    );
    if !stopped {
        let mut remove = Command::new("docker");
        remove.args(["rm", "-f", container]);
        let _ = tokio::time::timeout(Duration::from_secs(5), remove.output()).await;
    }
}

fn pipe_stream(
    name: String,
    reader: impl AsyncRead + Unpin + Send + 'static,
    file: Option<Arc<Mutex<tokio::fs::File>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(agent = %name, "{line}");
            if let Some(file) = &file {
                let mut file = file.lock().await;
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
        }
    })
}

/* ============================= TESTS ============================= */
