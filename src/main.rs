use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sleuth_core::config::AppConfig;
use sleuth_core::event::EventBus;
use sleuth_core::flow::{FlowEdge, FlowNode};
use sleuth_core::types::{OwnerId, RunId, SketchId};
use sleuth_engine::{
    compile, RunOrchestrator, RunPayload, RunStore, SketchActivityHook, TaskQueue,
};
use sleuth_graph::HttpGraphClient;
use sleuth_transforms::TransformRegistry;
use sleuth_vault::SecretVault;

#[derive(Parser)]
#[command(name = "sleuth", version, about = "Graph-native OSINT enrichment engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sleuth.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a flow file into executable branches (pure preview)
    Compile {
        /// JSON file with {"nodes": [...], "edges": [...]}
        flow: PathBuf,
        /// Seed value used for sample outputs
        #[arg(long, default_value = "preview")]
        seed: String,
    },
    /// Run a single named transform against seed values
    Run {
        /// Registered transform name
        transform: String,
        /// Seed values to enrich
        #[arg(required = true)]
        values: Vec<String>,
        /// Sketch receiving discovered entities
        #[arg(long, default_value = "scratch")]
        sketch: String,
        /// Owner account whose vault resolves secret parameters
        #[arg(long)]
        owner: Option<String>,
    },
    /// Compile a flow file and run every branch against seed values
    Flow {
        flow: PathBuf,
        #[arg(required = true)]
        values: Vec<String>,
        #[arg(long, default_value = "scratch")]
        sketch: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// List registered transforms
    Transforms,
    /// Manage vaulted secrets for an owner account
    Secret {
        #[command(subcommand)]
        command: SecretCommands,
    },
}

#[derive(Subcommand)]
enum SecretCommands {
    /// Store a secret (overwrites an existing one with the same name)
    Set {
        name: String,
        value: String,
        #[arg(long)]
        owner: String,
    },
    /// List secret metadata
    List {
        #[arg(long)]
        owner: String,
    },
    /// Delete a secret
    Rm {
        name: String,
        #[arg(long)]
        owner: String,
    },
}

/// On-disk flow file shape, matching the compile wire contract.
#[derive(Deserialize)]
struct FlowFile {
    nodes: Vec<FlowNode>,
    #[serde(default)]
    edges: Vec<FlowEdge>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(sleuth_core::SleuthError::ConfigNotFound(_)) => {
            warn!(path = %cli.config.display(), "No config file found, using defaults");
            AppConfig::default()
        }
        Err(e) => return Err(e).context("loading config"),
    };

    match cli.command {
        Commands::Compile { flow, seed } => {
            let file = read_flow(&flow)?;
            let branches = compile(&file.nodes, &file.edges, &seed);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "branches": branches }))?
            );
        }

        Commands::Run {
            transform,
            values,
            sketch,
            owner,
        } => {
            let payload = RunPayload::Transform { name: transform };
            run_and_report(&config, payload, values, sketch, owner).await?;
        }

        Commands::Flow {
            flow,
            values,
            sketch,
            owner,
        } => {
            let file = read_flow(&flow)?;
            let seed = values.first().cloned().unwrap_or_default();
            let branches = compile(&file.nodes, &file.edges, &seed);
            info!(branches = branches.len(), "Flow compiled");
            run_and_report(&config, RunPayload::Branches(branches), values, sketch, owner)
                .await?;
        }

        Commands::Transforms => {
            let registry = TransformRegistry::with_builtins();
            for descriptor in registry.descriptors() {
                println!(
                    "{:<18} {:<14} {}",
                    descriptor.name, descriptor.category, descriptor.description
                );
                if !descriptor.required_params.is_empty() {
                    println!("{:<18} requires: {}", "", descriptor.required_params.join(", "));
                }
            }
        }

        Commands::Secret { command } => {
            let vault = SecretVault::open(&config.vault, &config.db_path())
                .context("opening the secret vault")?;
            match command {
                SecretCommands::Set { name, value, owner } => {
                    let meta = vault.set_secret(&OwnerId::from_string(&owner), &name, &value)?;
                    println!("stored secret '{}' (id {})", meta.name, meta.id);
                }
                SecretCommands::List { owner } => {
                    for meta in vault.list_secrets(&OwnerId::from_string(&owner))? {
                        println!("{:<24} {:<38} {}", meta.name, meta.id, meta.created_at);
                    }
                }
                SecretCommands::Rm { name, owner } => {
                    if vault.delete_secret(&OwnerId::from_string(&owner), &name)? {
                        println!("deleted secret '{}'", name);
                    } else {
                        println!("no secret named '{}'", name);
                    }
                }
            }
        }
    }

    Ok(())
}

fn read_flow(path: &PathBuf) -> anyhow::Result<FlowFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading flow file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing flow file {}", path.display()))
}

/// Wire up the engine, submit one run, wait for a terminal state, and
/// print the outcome.
async fn run_and_report(
    config: &AppConfig,
    payload: RunPayload,
    values: Vec<String>,
    sketch: String,
    owner: Option<String>,
) -> anyhow::Result<()> {
    let graph = Arc::new(HttpGraphClient::new(&config.graph)?);
    let runs = Arc::new(RunStore::open(&config.db_path())?);
    let events = Arc::new(EventBus::default());
    let registry = Arc::new(TransformRegistry::with_builtins());

    let orchestrator = Arc::new(
        RunOrchestrator::new(
            registry,
            graph.clone(),
            runs.clone(),
            events,
            config.vault.clone(),
            config.db_path(),
            config.pipeline.flush_threshold,
        )
        .with_hooks(Arc::new(SketchActivityHook::new(graph))),
    );

    let cancel = CancellationToken::new();
    let queue = TaskQueue::start(orchestrator, config.queue.workers, cancel.clone());

    let run_id = queue
        .submit(
            SketchId::from_string(&sketch),
            owner.map(|o| OwnerId::from_string(&o)),
            payload,
            values,
            serde_json::Map::new(),
            BTreeMap::new(),
        )
        .await?;
    info!(run_id = %run_id, "Run submitted");

    wait_for_run(&queue, &run_id).await;

    let record = runs
        .get(&run_id)?
        .context("run record disappeared after execution")?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    cancel.cancel();
    queue.shutdown().await;
    Ok(())
}

async fn wait_for_run(queue: &TaskQueue, run_id: &RunId) {
    loop {
        if let Some(status) = queue.status(run_id).await {
            if status.is_terminal() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
