use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use trellis_config::WorkflowDef;
use trellis_engine::{Engine, EngineConfig, InMemoryWorkflows};
use trellis_store::{ExecutionStatus, SqliteStore};
use trellis_workflow::Workflow;

mod nodes;

/// Trellis - a DAG workflow execution engine
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.trellis)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Engine config file (default: <data-dir>/config.json when present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// SQLite database URL for execution state (default: in-memory)
  #[arg(long, global = true)]
  database: Option<String>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow
  Run {
    #[command(subcommand)]
    target: RunTarget,
  },

  /// Check a workflow file without running it
  Validate {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },
}

#[derive(Subcommand)]
enum RunTarget {
  /// Run an entire workflow, reading the trigger payload from stdin
  Workflow {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_writer(io::stderr)
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".trellis")
  });

  match cli.command {
    Some(Commands::Run { target }) => match target {
      RunTarget::Workflow { workflow_file } => {
        let config = load_config(cli.config.as_deref(), &data_dir)?;
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(run_workflow(workflow_file, config, cli.database))?;
      }
    },
    Some(Commands::Validate { workflow_file }) => {
      validate(&workflow_file)?;
    }
    None => {
      println!("trellis - use --help to see available commands");
    }
  }

  Ok(())
}

fn load_config(path: Option<&Path>, data_dir: &Path) -> Result<EngineConfig> {
  let path = match path {
    Some(path) => path.to_path_buf(),
    None => {
      let default = data_dir.join("config.json");
      if !default.exists() {
        return Ok(EngineConfig::default());
      }
      default
    }
  };

  let content = std::fs::read_to_string(&path)
    .with_context(|| format!("failed to read config file: {}", path.display()))?;
  EngineConfig::from_json(&content)
    .with_context(|| format!("failed to parse config file: {}", path.display()))
}

fn load_workflow(workflow_file: &Path) -> Result<Workflow> {
  let content = std::fs::read_to_string(workflow_file)
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;

  let def: WorkflowDef = serde_json::from_str(&content)
    .with_context(|| format!("failed to parse workflow file: {}", workflow_file.display()))?;

  Workflow::from_def(def)
    .with_context(|| format!("invalid workflow: {}", workflow_file.display()))
}

fn validate(workflow_file: &Path) -> Result<()> {
  let workflow = load_workflow(workflow_file)?;
  let order = workflow.graph().topological_order().unwrap_or_default();

  let summary = serde_json::json!({
    "workflow_id": workflow.workflow_id,
    "version": workflow.version,
    "name": workflow.name,
    "nodes": workflow.nodes.len(),
    "entry_points": workflow.graph().entry_points(),
    "order": order,
  });
  println!("{}", serde_json::to_string_pretty(&summary)?);
  Ok(())
}

async fn run_workflow(workflow_file: PathBuf, config: EngineConfig, database: Option<String>) -> Result<()> {
  let workflow = load_workflow(&workflow_file)?;
  let workflow_id = workflow.workflow_id.clone();
  let version = workflow.version;
  info!(workflow_id = %workflow_id, version, nodes = workflow.nodes.len(), "loaded workflow");

  let payload = read_payload_from_stdin()?;

  let workflows = InMemoryWorkflows::new();
  workflows.insert(workflow);

  let mut builder = Engine::builder(Arc::new(nodes::registry()))
    .config(config)
    .workflows(Arc::new(workflows));
  if let Some(url) = database {
    let store = SqliteStore::connect(&url)
      .await
      .with_context(|| format!("failed to open database: {}", url))?;
    builder = builder.store(Arc::new(store));
  }
  let engine = builder.build();

  let execution_id = engine
    .start_execution(&workflow_id, Some(version), payload)
    .await
    .context("failed to start execution")?;

  let execution = tokio::select! {
    result = engine.wait_for_completion(&execution_id) => result?,
    _ = tokio::signal::ctrl_c() => {
      warn!(execution_id = %execution_id, "interrupted, cancelling execution");
      engine.cancel_execution(&execution_id).await?;
      engine.wait_for_completion(&execution_id).await?
    }
  };

  let node_states = engine.get_node_states(&execution_id).await?;
  let logs = engine.get_execution_logs(&execution_id, None).await?;

  let report = serde_json::json!({
    "execution": execution,
    "nodes": node_states,
    "logs": logs,
  });
  println!("{}", serde_json::to_string_pretty(&report)?);

  if execution.status != ExecutionStatus::Success {
    bail!(
      "execution {} finished as {:?}: {}",
      execution_id,
      execution.status,
      execution.error.as_deref().unwrap_or("no error recorded")
    );
  }
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read payload from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
    }
  }
}
