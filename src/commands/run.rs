use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use faultbench::conductor::{
    Conductor, RunOutcome, spawn_signal_listener, tasklist_from_names,
};
use faultbench::config::Config;
use faultbench::gateway::ClusterGateway;
use faultbench::kubeconfig;
use faultbench::launcher::{AgentLauncher, ContainerOptions};
use faultbench::problem::ManifestTelemetry;
use faultbench::proxy::{self, FilteringProxy};
use faultbench::registry::{AgentRegistry, ProblemRegistry};
use faultbench::safety::ShutdownHandle;
use faultbench::submission::{self, ApiState};

const AGENT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RunArgs {
    pub problem_id: String,
    pub agent: Option<String>,
    pub problems: PathBuf,
    pub agents: PathBuf,
    pub no_container: bool,
    pub hidden_namespaces: Vec<String>,
}

/// Drive one full problem session: proxy + submission API + agent around the
/// conductor loop. Returns the process exit code (0 graded, 1 setup error,
/// 130 interrupted).
pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    println!("Starting problem session...\n");

    let config = Config::from_env();
    let registry = ProblemRegistry::load(&args.problems)?;
    let spec = registry
        .get(&args.problem_id)
        .with_context(|| format!("unknown problem id {:?}", args.problem_id))?
        .clone();

    print!("  Cluster connection .......... ");
    let gateway = match ClusterGateway::connect(&config).await {
        Ok(gw) => {
            println!("OK");
            Arc::new(gw)
        }
        Err(e) => {
            println!("FAIL");
            eprintln!("Cannot reach cluster: {e}. Is the cluster running?");
            return Ok(1);
        }
    };

    let problem = registry.instantiate(&args.problem_id, gateway.clone())?;
    let shutdown = ShutdownHandle::new();

    // Filtering proxy: loaded from the default kubeconfig, never $KUBECONFIG.
    print!("  API filtering proxy ......... ");
    let upstream = kubeconfig::load_default_upstream()?;
    kubeconfig::validate(&upstream)?;
    let mut hidden = proxy::default_hidden_namespaces();
    hidden.extend(args.hidden_namespaces.iter().cloned());
    let filtering_proxy = FilteringProxy::new(&upstream, hidden, config.proxy_port)?;
    let (proxy_addr, proxy_task) = filtering_proxy.serve(shutdown.subscribe()).await?;
    println!("http://{proxy_addr}");

    let agent_kubeconfig =
        kubeconfig::write_agent_kubeconfig(&config.logs_dir, proxy_addr.port())?;

    // Conductor and its event channel; SIGINT feeds the same channel.
    let mut conductor = Conductor::new(
        config.clone(),
        problem,
        gateway.clone(),
        gateway.clone(),
        shutdown.clone(),
    );
    if let Some(names) = &spec.tasklist {
        conductor.set_tasklist(tasklist_from_names(names)?);
    }
    if let Some(agent_name) = &args.agent {
        conductor.set_agent_name(agent_name.clone());
    }
    if let Some(telemetry) = registry.telemetry() {
        conductor.set_telemetry(Arc::new(ManifestTelemetry::new(
            gateway.clone(),
            telemetry.manifests.clone(),
            telemetry.namespaces.clone(),
            telemetry.cluster_resources.clone(),
        )));
    }
    let shared = conductor.shared();
    let (events_tx, events_rx) = mpsc::channel(16);
    let signal_task = spawn_signal_listener(events_tx.clone(), shutdown.clone());

    // Submission API.
    let api_addr: SocketAddr = format!("{}:{}", config.api_hostname, config.api_port)
        .parse()
        .with_context(|| "invalid API_HOSTNAME/API_PORT")?;
    let api_state = ApiState {
        events: events_tx.clone(),
        shared,
        shutdown: shutdown.clone(),
    };
    let api_task = tokio::spawn(submission::serve(api_state, api_addr));

    println!("  Submission API .............. http://{api_addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /submit .............. Grade the current stage");
    println!("    GET  /status .............. Current grading stage");
    println!("    GET  /get_app ............. Target application metadata");
    println!("    GET  /get_problem ......... Problem id");
    println!();

    // External agent.
    let mut agent_launcher = AgentLauncher::new(config.logs_dir.clone());
    agent_launcher.set_agent_kubeconfig(&agent_kubeconfig);
    if let Some(agent_name) = &args.agent {
        let agents = AgentRegistry::load(&args.agents)?;
        let registration = agents
            .get(agent_name)
            .with_context(|| format!("unknown agent {agent_name:?}"))?;
        if !args.no_container {
            agent_launcher.enable_container_isolation(ContainerOptions::default());
        }
        agent_launcher.ensure_started(registration).await?;
        println!("  Agent ....................... {agent_name} started");
    } else {
        println!("  Agent ....................... none (manual submissions)");
    }
    println!();
    println!("Session running. Press Ctrl+C to abort with recovery.\n");
    println!("{}", "=".repeat(70));

    let outcome = conductor.run(events_rx).await;

    // Teardown runs on every path: agent first, then both servers.
    agent_launcher.cleanup_all(AGENT_STOP_TIMEOUT).await;
    shutdown.request_shutdown();
    if let Err(e) = api_task.await.unwrap_or(Ok(())) {
        warn!(error = %e, "submission_api_task_failed");
    }
    let _ = proxy_task.await;
    signal_task.abort();

    println!("{}", "=".repeat(70));
    match outcome {
        Ok(report) => {
            match serde_json::to_string_pretty(&report.results) {
                Ok(rendered) => println!("Results:\n{rendered}"),
                Err(_) => println!("Results: (unserialisable)"),
            }
            match report.outcome {
                RunOutcome::Interrupted => {
                    println!("Session interrupted; fault recovery completed.");
                    Ok(130)
                }
                RunOutcome::SkippedPrivilegedRequired => {
                    println!("Problem skipped: requires a privileged runtime.");
                    Ok(0)
                }
                RunOutcome::Completed => {
                    info!("session_finished");
                    println!("Session completed.");
                    Ok(0)
                }
            }
        }
        Err(e) => {
            eprintln!("Session failed: {e:#}");
            Ok(1)
        }
    }
}
