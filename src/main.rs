mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => commands::check::run().await?,
        Commands::List { target } => commands::list::run(target)?,
        Commands::Run {
            problem_id,
            agent,
            problems,
            agents,
            no_container,
            hidden_namespaces,
        } => {
            let code = commands::run::run(commands::run::RunArgs {
                problem_id,
                agent,
                problems,
                agents,
                no_container,
                hidden_namespaces,
            })
            .await?;
            std::process::exit(code);
        }
    }

    Ok(())
}
