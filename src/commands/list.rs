use faultbench::registry::{AgentRegistry, ProblemRegistry};

use crate::cli::ListTarget;

pub fn run(target: ListTarget) -> anyhow::Result<()> {
    match target {
        ListTarget::Problems { registry } => {
            let problems = ProblemRegistry::load(&registry)?;
            let ids = problems.problem_ids();

            println!("{:<45} {:<25} {:<12}", "PROBLEM", "APP", "PRIVILEGED");
            println!("{}", "-".repeat(82));
            for id in &ids {
                if let Some(spec) = problems.get(id) {
                    println!(
                        "{:<45} {:<25} {:<12}",
                        id,
                        spec.app.name,
                        if spec.requires_privileged_runtime { "yes" } else { "no" }
                    );
                }
            }
            println!("\nTotal: {} problems", ids.len());
        }
        ListTarget::Agents { registry } => {
            let agents = AgentRegistry::load(&registry)?;
            let names = agents.agent_names();

            println!("{:<25} {:<50}", "AGENT", "KICKOFF COMMAND");
            println!("{}", "-".repeat(76));
            for name in &names {
                if let Some(reg) = agents.get(name) {
                    println!("{:<25} {:<50}", name, reg.kickoff_command);
                }
            }
            println!("\nTotal: {} agents", names.len());
        }
    }
    Ok(())
}
