use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loom_broker::{open_broker, RunScheduler, ScheduleOutcome, WorkerDispatchLoop};
use loom_core::config::expand_home;
use loom_core::{AppConfig, EventBus, IdGenerator, WorkflowStatus};
use loom_engine::{DagWorkflowEngine, ExecutorRegistry, FnExecutor, Orchestrator, RunLogger};
use loom_store::{FileDefinitionStore, SqliteRunStore};

#[derive(Parser)]
#[command(name = "loom", version, about = "Workflow and state-machine orchestration engine")]
struct Cli {
    /// Path to config file (defaults to ./loom.toml, then ~/.loom/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition file in-process
    Run {
        /// Definition file (.json or .toml)
        file: PathBuf,
        /// Workflow input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Validate a definition file and print its execution batches
    Validate {
        file: PathBuf,
    },
    /// Consume run requests from the configured broker until Ctrl-C
    Worker,
    /// Publish a run request, running it inline if the broker is unavailable
    Schedule {
        #[command(subcommand)]
        target: ScheduleTarget,
    },
    /// List stored run results, newest first
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only show runs with this status (e.g. completed, failed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ScheduleTarget {
    /// Run a stored workflow definition
    Workflow {
        workflow_id: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Run a single registered agent
    Agent {
        agent_id: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loom=info,warn")),
        )
        .with_target(false)
        .init();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "loom", &mut std::io::stdout());
        return Ok(());
    }

    let (config, source) = AppConfig::discover(cli.config.as_deref())?;
    match &source {
        Some(path) => info!(path = %path.display(), "Loaded config"),
        None => info!("No config file found, using defaults"),
    }

    match cli.command {
        Commands::Run { file, input } => run_file(&config, &file, &input).await,
        Commands::Validate { file } => validate_file(&file),
        Commands::Worker => run_worker(&config).await,
        Commands::Schedule { target } => schedule(&config, target).await,
        Commands::Runs { limit, status } => list_runs(&config, limit, status.as_deref()),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

// ── Commands ────────────────────────────────────────────────────

async fn run_file(config: &AppConfig, file: &Path, input: &str) -> anyhow::Result<()> {
    let definition = FileDefinitionStore::parse_file(file)?;
    let input = parse_json("--input", input)?;

    let engine = DagWorkflowEngine::new(definition, agent_registry(), tool_registry())?
        .with_config(config.engine.clone());
    let result = engine.execute(input, None).await;

    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    if !result.is_success() {
        anyhow::bail!(
            "workflow {}: {}",
            result.status,
            result.error.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}

fn validate_file(file: &Path) -> anyhow::Result<()> {
    let definition = FileDefinitionStore::parse_file(file)?;
    let id = definition.id.clone();
    let plan = loom_engine::ExecutionPlan::build(&definition)?;
    println!("{} is valid ({} batches)", id, plan.batches().len());
    for (i, batch) in plan.batches().iter().enumerate() {
        println!("  {}: {}", i, batch.join(", "));
    }
    Ok(())
}

async fn run_worker(config: &AppConfig) -> anyhow::Result<()> {
    let broker = open_broker(&config.broker)?;
    let event_bus = Arc::new(EventBus::default());
    let orchestrator = Arc::new(build_orchestrator(config, event_bus.clone())?);
    let cancel = CancellationToken::new();

    if config.log.enabled {
        let logger = RunLogger::new(config.log_dir(), config.log.level);
        tokio::spawn(logger.run(event_bus.clone(), cancel.clone()));
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    info!(broker = %broker.name(), "Worker starting");
    WorkerDispatchLoop::new(broker, orchestrator, &config.topics)
        .run(cancel)
        .await?;
    Ok(())
}

async fn schedule(config: &AppConfig, target: ScheduleTarget) -> anyhow::Result<()> {
    let broker = open_broker(&config.broker)?;
    let orchestrator = Arc::new(build_orchestrator(config, Arc::new(EventBus::default()))?);
    let scheduler = RunScheduler::new(broker, orchestrator, config.topics.clone());
    let ids = IdGenerator::new("RUN");

    let (run_id, outcome) = match target {
        ScheduleTarget::Workflow {
            workflow_id,
            payload,
            run_id,
        } => {
            let run_id = run_id.unwrap_or_else(|| ids.generate());
            let payload = parse_json("--payload", &payload)?;
            let outcome = scheduler.schedule_workflow(&run_id, &workflow_id, payload).await;
            (run_id, outcome)
        }
        ScheduleTarget::Agent {
            agent_id,
            payload,
            run_id,
        } => {
            let run_id = run_id.unwrap_or_else(|| ids.generate());
            let payload = parse_json("--payload", &payload)?;
            let outcome = scheduler.schedule_agent(&run_id, &agent_id, payload).await;
            (run_id, outcome)
        }
    };

    match outcome {
        ScheduleOutcome::Queued => println!("{} queued", run_id),
        ScheduleOutcome::ExecutedInline { error: None } => println!("{} executed inline", run_id),
        ScheduleOutcome::ExecutedInline { error: Some(e) } => {
            anyhow::bail!("{} executed inline and failed: {}", run_id, e)
        }
    }
    Ok(())
}

fn list_runs(config: &AppConfig, limit: usize, status: Option<&str>) -> anyhow::Result<()> {
    let status = status.map(str::parse::<WorkflowStatus>).transpose()?;
    let store = SqliteRunStore::open(&expand_home(&config.store.runs_db))?;
    let runs = store.list_runs(status, limit)?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<10} {:<24} {}{}",
            run.updated_at.format("%Y-%m-%d %H:%M:%S"),
            run.status,
            run.workflow_id,
            run.run_id,
            run.error.map(|e| format!("  ({})", e)).unwrap_or_default()
        );
    }
    Ok(())
}

// ── Wiring ──────────────────────────────────────────────────────

fn build_orchestrator(config: &AppConfig, event_bus: Arc<EventBus>) -> anyhow::Result<Orchestrator> {
    let definitions_dir = expand_home(&config.store.definitions_dir);
    if !definitions_dir.exists() {
        warn!(dir = %definitions_dir.display(), "Definitions directory does not exist");
    }
    let runs_db = expand_home(&config.store.runs_db);
    if let Some(parent) = runs_db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let sink = Arc::new(SqliteRunStore::open(&runs_db)?);

    Ok(Orchestrator::new(
        Arc::new(FileDefinitionStore::new(definitions_dir)),
        agent_registry(),
        tool_registry(),
        Arc::new(IdGenerator::new("EXEC")),
    )
    .with_sink(sink)
    .with_event_bus(event_bus)
    .with_config(config.engine.clone()))
}

/// The CLI ships one agent, `echo`, which answers with its input.
/// Embedders register real agents through the library API.
fn agent_registry() -> Arc<ExecutorRegistry> {
    let mut agents = ExecutorRegistry::agents();
    agents.register(
        FnExecutor::new("echo", |_, input, _| Ok(json!({ "response": input })))
            .with_description("Answers with its input"),
    );
    Arc::new(agents)
}

fn tool_registry() -> Arc<ExecutorRegistry> {
    Arc::new(ExecutorRegistry::with_builtin_tools())
}

fn parse_json(flag: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", flag))
}
