//! `dcp-node`: run one node of a decentralized pipeline.
//!
//! ```bash
//! # Check a spec before handing it to the nodes
//! dcp-node validate --spec pipeline.yaml
//!
//! # Central node, with two peers taking part
//! RUST_LOG=info dcp-node run --config central.toml --spec pipeline.yaml \
//!     --run-id run-1 --client site-a="Site A" --client site-b="Site B"
//!
//! # Each peer
//! dcp-node run --config site-a.toml --spec pipeline.yaml --run-id run-1
//! ```

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use colored::Colorize;
use dcp_core::computation::ComputationRegistry;
use dcp_core::config::loader::{load_config, load_pipeline_spec};
use dcp_core::state::manager::{PipelineManager, StartPipelineOptions, StartedPipeline};
use dcp_protocol::controller_models::StopKind;
use dcp_protocol::ipc::Event;
use dcp_protocol::pipeline_models::{InputSource, PipelineSpec};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dcp-node",
    version = env!("CARGO_PKG_VERSION"),
    about = "Run one node of a decentralized computation pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run and follow it to the end.
    Run {
        /// Node configuration (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Pipeline spec (JSON or YAML).
        #[arg(long)]
        spec: PathBuf,

        /// Identifier shared by every node taking part in the run.
        #[arg(long)]
        run_id: String,

        /// Participating peer as `id=name`. Central node only.
        #[arg(long = "client", value_parser = parse_client)]
        clients: Vec<(String, String)>,
    },

    /// Parse a pipeline spec and print its steps.
    Validate {
        #[arg(long)]
        spec: PathBuf,
    },
}

fn parse_client(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((id, name)) if !id.is_empty() => Ok((id.to_string(), name.to_string())),
        _ => Err(format!("expected id=name, got '{value}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run {
            config,
            spec,
            run_id,
            clients,
        } => run(config, spec, run_id, clients).await,
        Command::Validate { spec } => validate(spec),
    }
}

async fn run(
    config_path: PathBuf,
    spec_path: PathBuf,
    run_id: String,
    clients: Vec<(String, String)>,
) -> Result<()> {
    let config = load_config(&config_path).await?;
    let spec = load_pipeline_spec(&spec_path)?;

    let manager = PipelineManager::create(config, ComputationRegistry::new())
        .await
        .wrap_err("Failed to start the pipeline manager")?;
    info!(participant = manager.participant_id(), role = ?manager.role(), "Node ready");

    let mut options = StartPipelineOptions::new(spec, run_id.clone());
    for (id, name) in clients {
        options = options.with_client(id, name);
    }

    let StartedPipeline {
        mut events, task, ..
    } = manager.start_pipeline(options).await?;

    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let last = matches!(event, Event::RunCompleted { .. } | Event::RunFailed { .. });
                    print_event(&event);
                    if last {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped progress events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!(%run_id, "Ctrl-C, stopping the run");
                stopping = true;
                request_stop(&manager, &run_id);
            }
        }
    }

    let output = task.await.map_err(|e| eyre!("Run task failed: {e}"))??;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Ask the run to stop in the background. The controller only answers at
/// its next safe point, and events keep flowing until then.
fn request_stop(manager: &PipelineManager, run_id: &str) -> JoinHandle<()> {
    let manager = manager.clone();
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = manager.stop_pipeline(&run_id, StopKind::User).await {
            warn!(%run_id, "Failed to stop the run: {e}");
        }
    })
}

fn print_event(event: &Event) {
    match event {
        Event::RunStarted {
            run_id,
            total_steps,
        } => println!("{} {run_id} ({total_steps} steps)", "started".green().bold()),
        Event::StateUpdate { snapshot, .. } => {
            let phase = serde_json::to_value(&snapshot.controller_state.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let mut line = format!(
                "{} step {}/{} iteration {} {}",
                "state".cyan(),
                snapshot.pipeline_step + 1,
                snapshot.total_steps,
                snapshot.current_iteration,
                phase
            );
            if let Some(status) = &snapshot.run.state_status {
                line.push_str(&format!(" ({status})"));
            }
            if !snapshot.run.waiting_on.is_empty() {
                line.push_str(&format!(" waiting on {}", snapshot.run.waiting_on.join(", ")));
            }
            println!("{line}");
        }
        Event::RunCompleted { run_id, .. } => {
            println!("{} {run_id}", "completed".green().bold())
        }
        Event::RunFailed { run_id, error } => {
            println!("{} {run_id}: {}", "failed".red().bold(), error.message)
        }
    }
}

fn validate(spec_path: PathBuf) -> Result<()> {
    let spec = load_pipeline_spec(&spec_path)?;
    print_summary(&spec);
    Ok(())
}

fn print_summary(spec: &PipelineSpec) {
    println!(
        "{} {} steps{}",
        "valid".green().bold(),
        spec.steps.len(),
        if spec.is_decentralized() {
            " (decentralized)"
        } else {
            ""
        }
    );
    for (index, step) in spec.steps.iter().enumerate() {
        let computation = step
            .computations
            .first()
            .map(|c| c.meta.id.as_str())
            .unwrap_or("-");
        let controller = serde_json::to_value(step.controller.controller_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!("  {index}: {computation} [{controller}]");
        for (name, source) in &step.input_map {
            match source {
                InputSource::Value { value } => println!("       {name} = {value}"),
                InputSource::FromCache { from_cache } => println!(
                    "       {name} <- step {} {}",
                    from_cache.step, from_cache.variable
                ),
            }
        }
    }
    if let Some(owner) = &spec.owner {
        let scope = if spec.limit_output_to_owner {
            " (output limited to owner)"
        } else {
            ""
        };
        println!("  owner: {owner}{scope}");
    }
}
