mod config;
mod dry_run;

use crate::config::CohortConfig;
use crate::dry_run::EchoExecutor;
use clap::{Parser, Subcommand, ValueEnum};
use cohort_core::Priority;
use cohort_orchestrator::{
    DelegationRequest, DelegationStrategy, HierarchyManager, Scheduler, Task, TaskSpec,
};
use cohort_workflow::WorkflowEngine;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cohort", about = "Cohort: multi-agent coordination kernel", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cohort.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate the config file
    Validate,
    /// List configured agents
    Agents,
    /// Inspect and dry-run workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Dry-run one task through the scheduler
    Dispatch {
        /// Task description
        description: String,
        /// Capability the agent must declare
        #[arg(long)]
        capability: Option<String>,
        /// Tag the agent must carry
        #[arg(long)]
        tag: Option<String>,
        /// low, normal, high or critical
        #[arg(long, value_parser = parse_priority)]
        priority: Option<Priority>,
    },
    /// Dry-run delegation of one task inside a hierarchy
    Delegate {
        /// Hierarchy id
        hierarchy: String,
        /// Task description
        description: String,
        /// Required capability (repeatable)
        #[arg(long = "require")]
        required: Vec<String>,
        /// Agent to delegate to directly
        #[arg(long)]
        to: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List configured workflows
    List,
    /// Run a workflow against the echo executor
    Run {
        /// Workflow id
        id: String,
        /// Initial variable as key=value; values parse as JSON, else as a string
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    serde_json::from_value(Value::String(raw.to_lowercase()))
        .map_err(|_| format!("unknown priority '{raw}'"))
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn print_task(task: &Task) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(task)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = CohortConfig::load(&cli.config).map_err(|e| {
        anyhow::anyhow!("Failed to load config '{}': {}", cli.config.display(), e)
    })?;
    config.validate()?;

    match cli.command {
        Commands::Validate => {
            let delegation = HierarchyManager::new(config.ledger()?);
            for hierarchy in &config.hierarchies {
                delegation.register_hierarchy(hierarchy.clone())?;
            }
            let engine = WorkflowEngine::new(Arc::new(EchoExecutor));
            for workflow in &config.workflows {
                engine.register_workflow(workflow.clone())?;
            }
            println!(
                "Configuration OK: {} agent(s), {} hierarchy(ies), {} workflow(s)",
                config.agents.len(),
                config.hierarchies.len(),
                config.workflows.len()
            );
        }
        Commands::Agents => {
            if config.agents.is_empty() {
                println!("No agents configured.");
                println!("Configure agents in cohort.toml under [[agents]]");
            } else {
                println!("Configured agents:");
                for entry in &config.agents {
                    let agent = &entry.descriptor;
                    println!("  {} (priority {})", agent.id, agent.priority);
                    if !agent.capabilities.is_empty() {
                        println!("    Capabilities: {}", agent.capabilities.join(", "));
                    }
                    if !agent.tags.is_empty() {
                        println!("    Tags: {}", agent.tags.join(", "));
                    }
                    let mut scores: Vec<_> = entry.scores.iter().collect();
                    scores.sort_by(|a, b| a.0.cmp(b.0));
                    for (name, score) in scores {
                        println!("    Score {name}: {score:.2}");
                    }
                }
                println!("\nTotal: {} agent(s)", config.agents.len());
            }
        }
        Commands::Workflow { action } => match action {
            WorkflowAction::List => {
                if config.workflows.is_empty() {
                    println!("No workflows configured.");
                } else {
                    for workflow in &config.workflows {
                        println!(
                            "  {}: {} ({} steps, starts at '{}')",
                            workflow.id,
                            workflow.name,
                            workflow.steps.len(),
                            workflow.start_step_id
                        );
                    }
                }
            }
            WorkflowAction::Run { id, vars } => {
                let engine =
                    WorkflowEngine::with_settings(Arc::new(EchoExecutor), config.engine.clone());
                for workflow in &config.workflows {
                    engine.register_workflow(workflow.clone())?;
                }
                let variables: HashMap<String, Value> = vars.into_iter().collect();
                info!(workflow_id = %id, variables = variables.len(), "Dry-running workflow");
                let result = engine.execute_workflow(&id, variables).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
                if !result.success {
                    anyhow::bail!("Workflow '{id}' ended {}", result.state);
                }
            }
        },
        Commands::Dispatch {
            description,
            capability,
            tag,
            priority,
        } => {
            let scheduler = Scheduler::new(
                config.scheduler.clone(),
                config.directory(),
                Arc::new(EchoExecutor),
                config.ledger()?,
            );
            let mut spec = TaskSpec::new(description);
            if let Some(capability) = capability {
                spec = spec.with_capability(capability);
            }
            if let Some(tag) = tag {
                spec = spec.with_tag(tag);
            }
            let task_id = scheduler.submit(spec, priority)?;

            let timeout = Duration::from_millis(config.scheduler.task_timeout_ms);
            match tokio::time::timeout(timeout, scheduler.wait_for(task_id)).await {
                Ok(Some(task)) => print_task(&task)?,
                _ => {
                    if let Some(task) = scheduler.task(task_id) {
                        print_task(&task)?;
                    }
                    anyhow::bail!("Task {task_id} did not finish; no eligible agent?");
                }
            }
        }
        Commands::Delegate {
            hierarchy,
            description,
            required,
            to,
        } => {
            let delegation = HierarchyManager::new(config.ledger()?);
            for h in &config.hierarchies {
                delegation.register_hierarchy(h.clone())?;
            }
            let mut request = DelegationRequest::new(Task::new(description, Priority::Normal));
            if !required.is_empty() {
                request = request.with_strategy(DelegationStrategy::CapabilityBased);
                request.required_capabilities = required;
            }
            if let Some(agent) = to {
                request = request.to_agent(agent);
            }
            let task = delegation.delegate_task(&hierarchy, request)?;
            print_task(&task)?;
        }
    }

    Ok(())
}
