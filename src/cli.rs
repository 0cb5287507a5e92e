use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "faultbench")]
#[command(about = "SRE-agent evaluation harness for Kubernetes microservice applications")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check cluster connectivity and permissions
    Check,

    /// List registered problems or agents
    List {
        #[command(subcommand)]
        target: ListTarget,
    },

    /// Run one problem session end to end
    Run {
        /// Problem id from the problem registry
        problem_id: String,

        /// Agent to launch from the agent registry; omit to grade manual
        /// submissions over HTTP only
        #[arg(long)]
        agent: Option<String>,

        /// Problem registry file
        #[arg(long, default_value = "problems.yaml")]
        problems: PathBuf,

        /// Agent registry file
        #[arg(long, default_value = "agents.yaml")]
        agents: PathBuf,

        /// Launch the agent as a plain subprocess instead of a container
        #[arg(long)]
        no_container: bool,

        /// Additional namespaces to hide from the agent (repeatable)
        #[arg(long = "hidden-namespace")]
        hidden_namespaces: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum ListTarget {
    /// List problem ids with their target applications
    Problems {
        #[arg(long, default_value = "problems.yaml")]
        registry: PathBuf,
    },

    /// List registered agent names
    Agents {
        #[arg(long, default_value = "agents.yaml")]
        registry: PathBuf,
    },
}
