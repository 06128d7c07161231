use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentmesh_capabilities::CapabilityRegistry;
use agentmesh_core::config::AppConfig;
use agentmesh_core::event::EventBus;
use agentmesh_core::types::{Plan, WorkflowEvent, WorkflowStatus};
use agentmesh_engine::{GateSet, PlanExecutor};
use agentmesh_router::{AgentWorker, RouterServer, RouterService};

#[derive(Parser)]
#[command(name = "agentmesh", version, about = "Dependency-aware workflow execution across capability agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentmesh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router service
    Serve {
        /// Override the bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run as an agent connected to a router
    Agent {
        /// Override the agent id
        #[arg(long)]
        id: Option<String>,
        /// Override the router WebSocket URL
        #[arg(long)]
        router: Option<String>,
        /// Capabilities to serve (comma-separated built-in names)
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
    /// Execute a plan file locally and print the result
    Run {
        /// Plan JSON file
        plan: PathBuf,
        /// Print the full run state instead of the final result only
        #[arg(long)]
        full: bool,
    },
    /// Check a plan file without running it
    Validate {
        /// Plan JSON file
        plan: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentmesh=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "agentmesh", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Some(Commands::Serve { bind }) => {
            let mut router_config = config.router.clone();
            if let Some(bind) = bind {
                router_config.bind = bind;
            }
            let local = CapabilityRegistry::with_builtins(&config.capabilities.enabled);
            info!(
                bind = %router_config.bind,
                capabilities = ?local.list(),
                gates = config.gates.len(),
                "Starting router"
            );
            let event_bus = Arc::new(EventBus::default());
            log_workflow_events(&event_bus);
            let service = Arc::new(
                RouterService::new(&router_config, local)
                    .with_gates(GateSet::from_config(&config.gates))
                    .with_event_bus(event_bus),
            );
            let server = RouterServer::new(router_config, service);
            server.run(shutdown_on_ctrl_c("router")).await?;
        }
        Some(Commands::Agent {
            id,
            router,
            capabilities,
        }) => {
            let mut agent_config = config.agent.clone();
            if let Some(id) = id {
                agent_config.agent_id = id;
            }
            if let Some(router) = router {
                agent_config.router_url = router;
            }
            if !capabilities.is_empty() {
                agent_config.capabilities = capabilities;
            }
            if agent_config.capabilities.is_empty() {
                warn!("Agent serves no capabilities; set [agent] capabilities or pass --capabilities");
            }
            let worker = AgentWorker::from_config(agent_config);
            info!(agent_id = %worker.agent_id(), url = %worker.connect_url(), "Starting agent");
            worker.run(shutdown_on_ctrl_c("agent")).await?;
        }
        Some(Commands::Run { plan, full }) => {
            let plan = load_plan(&plan)?;
            run_plan(&config, plan, full).await?;
        }
        Some(Commands::Validate { plan }) => {
            let plan = load_plan(&plan)?;
            plan.validate()?;
            let local = CapabilityRegistry::with_builtins(&config.capabilities.enabled);
            for step in &plan.steps {
                if !local.contains(&step.agent_capability_required) {
                    println!(
                        "note: step '{}' needs '{}', which only a connected agent can serve",
                        step.step_id, step.agent_capability_required
                    );
                }
            }
            println!("Plan '{}' is valid ({} steps)", plan.plan_id, plan.steps.len());
        }
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Completions { .. }) => {}
        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}

fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan {}", path.display()))?;
    let plan: Plan = serde_json::from_str(&text)
        .with_context(|| format!("parsing plan {}", path.display()))?;
    Ok(plan)
}

/// Token cancelled on Ctrl-C.
fn shutdown_on_ctrl_c(what: &'static str) -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down {}...", what);
        cancel_clone.cancel();
    });
    cancel
}

/// Log run outcomes and gate rejections of plans submitted to the router.
fn log_workflow_events(event_bus: &EventBus) {
    let mut event_rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(WorkflowEvent::RunStarted { workflow_id, plan_id }) => {
                    info!(workflow_id = %workflow_id, plan_id = %plan_id, "Workflow started")
                }
                Ok(WorkflowEvent::GateRejected {
                    workflow_id,
                    step_id,
                    reason,
                }) => warn!(workflow_id = %workflow_id, step_id = %step_id, reason = %reason, "Gate rejected step"),
                Ok(WorkflowEvent::RunFinished { workflow_id, status }) => {
                    info!(workflow_id = %workflow_id, status = %status, "Workflow finished")
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Workflow event log lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_plan(config: &AppConfig, plan: Plan, full: bool) -> anyhow::Result<()> {
    let registry = CapabilityRegistry::with_builtins(&config.capabilities.enabled);
    let event_bus = Arc::new(EventBus::default());

    // Progress on stderr
    let mut event_rx = event_bus.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                WorkflowEvent::StepStarted {
                    step_id, capability, ..
                } => eprintln!("  → {} ({})", step_id, capability),
                WorkflowEvent::StepCompleted { step_id, .. } => eprintln!("  ✓ {}", step_id),
                WorkflowEvent::StepFailed { step_id, error, .. } => {
                    eprintln!("  ✗ {}: {}", step_id, error)
                }
                WorkflowEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let executor = PlanExecutor::new(Arc::new(registry))
        .with_gates(GateSet::from_config(&config.gates))
        .with_event_bus(event_bus);
    let result = executor.execute_plan(plan).await;
    let _ = progress.await;

    if full {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(final_result) = &result.final_result {
        println!("{}", serde_json::to_string_pretty(final_result)?);
    }

    match result.status {
        WorkflowStatus::Completed => Ok(()),
        status => anyhow::bail!(
            "workflow {}: {}",
            status,
            result.error.as_deref().unwrap_or("no diagnostic")
        ),
    }
}
