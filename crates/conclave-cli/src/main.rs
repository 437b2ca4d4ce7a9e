//! `conclave` command line: serve agents, run orchestrations, inspect workflows.

mod config;
mod runtime;

use clap::{Parser, Subcommand};
use conclave_orchestrator::TaskPlan;
use conclave_service::bind_and_serve;
use config::ConclaveConfig;
use runtime::{inbound_router, Runtime};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave", about = "Conclave: agent teams coordinated over a message bus")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conclave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one configured agent
    Agent {
        /// Agent name as configured under [[agents]]
        #[arg(long)]
        name: String,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the orchestrator once against the agents already registered
    Orchestrate {
        #[arg(long)]
        task: String,
        /// Overrides orchestrator.max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Run every configured agent and the orchestrator in this process
    Team {
        #[arg(long)]
        task: String,
        /// Overrides orchestrator.max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Work with task plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Check a plan JSON file against the plan rules
    Validate { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error starting service: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Plan {
            action: PlanAction::Validate { file },
        } => validate_plan(&file).await,
        Commands::Agent { name, port } => {
            let config = load_config(&cli.config).await?;
            serve_agent(&config, &name, port).await
        }
        Commands::Orchestrate {
            task,
            max_iterations,
        } => {
            let config = load_config(&cli.config).await?;
            orchestrate(&config, &task, max_iterations).await
        }
        Commands::Team {
            task,
            max_iterations,
        } => {
            let config = load_config(&cli.config).await?;
            run_team(&config, &task, max_iterations).await
        }
    }
}

async fn load_config(path: &Path) -> anyhow::Result<ConclaveConfig> {
    // Provider keys usually live in .env
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!(error = %e, "Failed to load .env file");
        }
    }
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
    })?;
    ConclaveConfig::parse(&text)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn serve_agent(config: &ConclaveConfig, name: &str, port: Option<u16>) -> anyhow::Result<()> {
    let runtime = Runtime::connect(config).await?;
    let service = runtime.agent_service(config.agent(name)?, config, port)?;
    let handle = service.start().await?;
    info!(agent = %name, port = service.config().port, "Agent serving");

    let served = bind_and_serve(service, shutdown_signal()).await;
    handle.stop().await?;
    served?;
    Ok(())
}

async fn orchestrate(
    config: &ConclaveConfig,
    task: &str,
    max_iterations: Option<u32>,
) -> anyhow::Result<()> {
    let runtime = Runtime::connect(config).await?;
    let orchestrator = runtime.orchestrator(config, max_iterations)?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let inbound = if runtime.is_distributed() {
        let addr = format!("{}:{}", config.orchestrator.host, config.orchestrator.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
        info!(addr = %addr, "Receiving task results over HTTP");
        let app = inbound_router(runtime.bus.clone());
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        }))
    } else {
        None
    };

    orchestrator.register().await?;
    let outcome = orchestrator.run(task).await;
    orchestrator.deregister().await?;

    let _ = stop_tx.send(());
    if let Some(server) = inbound {
        server.await??;
    }

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}

async fn run_team(
    config: &ConclaveConfig,
    task: &str,
    max_iterations: Option<u32>,
) -> anyhow::Result<()> {
    anyhow::ensure!(!config.agents.is_empty(), "no [[agents]] configured");
    let runtime = Runtime::in_process(config);

    let mut handles = Vec::with_capacity(config.agents.len());
    for entry in &config.agents {
        let service = runtime.agent_service(entry, config, None)?;
        handles.push(service.start().await?);
    }
    let orchestrator = runtime.orchestrator(config, max_iterations)?;
    orchestrator.register().await?;
    info!(agents = handles.len(), strategy = ?config.orchestrator.kind, "Team assembled");

    let outcome = orchestrator.run(task).await;

    for handle in handles {
        handle.stop().await?;
    }
    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    info!(metrics = %orchestrator.monitor().to_json().await, "Agent metrics");
    Ok(())
}

async fn validate_plan(file: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(file).await.map_err(|e| {
        anyhow::anyhow!("Failed to read plan file '{}': {}", file.display(), e)
    })?;
    let plan = parse_plan(&text)?;
    plan.validate()?;
    println!("Plan is valid: {} step(s)", plan.plan.len());
    print!("{}", plan.render());
    Ok(())
}

/// Accepts either `{"plan": [...]}` or a bare step array.
fn parse_plan(text: &str) -> anyhow::Result<TaskPlan> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    Ok(if value.is_array() {
        TaskPlan::new(serde_json::from_value(value)?)
    } else {
        serde_json::from_value(value)?
    })
}
