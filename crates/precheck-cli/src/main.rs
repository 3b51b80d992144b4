//! Precheck CLI: drive the evidence pipeline end to end from a terminal.
//!
//! `precheck run` stands up an in-process pipeline (in-memory stores, real
//! model providers), creates an appraisal, uploads photos, triggers a run,
//! waits for the terminal status, and prints the outputs and the ledger.
//! `precheck score` evaluates a saved evidence file with the deterministic
//! scorer alone; no network, no API key.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use precheck_core::{
    compute_score, decide, DecisionThresholds, RiskFlag, ScoreInputs, ScoringWeights,
    VehicleMetadata, VisionEnvelope,
};
use precheck_runtime::{OpenAiProvider, Pipeline, RuntimeConfig};

#[derive(Parser)]
#[command(name = "precheck", version, about = "Appraisal evidence pre-check pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline over local photos.
    Run {
        /// Path to a JSON file with vehicle metadata.
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// Free-text notes, inline or @path to read a file.
        #[arg(long)]
        notes: Option<String>,

        /// Photo files to upload as evidence.
        #[arg(long = "photo", required = true)]
        photos: Vec<PathBuf>,

        /// Optional YAML config file overriding the defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Let the text model pick the tool order.
        #[arg(long)]
        model_planner: bool,

        /// Seconds to wait for the run to finish.
        #[arg(long, default_value_t = 360)]
        wait: u64,
    },

    /// Score a saved evidence file deterministically (offline).
    Score {
        /// Path to a JSON evidence file.
        evidence: PathBuf,
    },
}

/// Shape of the offline evidence file for `precheck score`.
#[derive(serde::Deserialize)]
struct EvidenceFile {
    #[serde(default)]
    envelopes: Vec<VisionEnvelope>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    risk_flags: Vec<RiskFlag>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            metadata,
            notes,
            photos,
            config,
            model_planner,
            wait,
        } => run_pipeline(metadata, notes, photos, config, model_planner, wait).await,
        Command::Score { evidence } => score_offline(evidence),
    }
}

async fn run_pipeline(
    metadata: Option<PathBuf>,
    notes: Option<String>,
    photos: Vec<PathBuf>,
    config: Option<PathBuf>,
    model_planner: bool,
    wait: u64,
) -> Result<()> {
    let metadata: VehicleMetadata = match metadata {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading metadata file {}", path.display()))?;
            serde_json::from_str(&raw).context("parsing metadata JSON")?
        }
        None => VehicleMetadata::default(),
    };

    let notes = match notes {
        Some(n) if n.starts_with('@') => Some(
            std::fs::read_to_string(&n[1..]).with_context(|| format!("reading notes {n}"))?,
        ),
        other => other,
    };

    let config = match config {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            RuntimeConfig::from_yaml(&raw).context("parsing config YAML")?
        }
        None => RuntimeConfig::default(),
    }
    .with_env_overrides();

    let provider = Arc::new(OpenAiProvider::from_env().context("OPENAI_API_KEY must be set")?);

    let mut builder = Pipeline::builder(config)
        .vision(provider.clone())
        .text(provider.clone())
        .embedder(provider);
    if model_planner {
        builder = builder.with_model_planner();
    }
    let pipeline = builder.build().context("assembling pipeline")?;

    let appraisal = pipeline
        .service
        .create_appraisal(metadata, notes)
        .await
        .context("creating appraisal")?;
    println!("appraisal {} ({})", appraisal.short_code, appraisal.id);

    for path in &photos {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading photo {}", path.display()))?;
        let content_type = guess_content_type(path)?;
        let artifact = pipeline
            .service
            .upload_artifact(&appraisal.id.to_string(), bytes, content_type)
            .await
            .with_context(|| format!("uploading {}", path.display()))?;
        println!("uploaded {} as artifact {}", path.display(), artifact.id);
    }

    let key = uuid::Uuid::new_v4().to_string();
    let outcome = pipeline
        .service
        .trigger_run(&appraisal.id.to_string(), &key)
        .await
        .context("triggering run")?;
    println!("run {} triggered", outcome.run.id);

    let run = pipeline
        .runner
        .wait_for_terminal(outcome.run.id, Duration::from_secs(wait))
        .await?;

    println!("status: {:?}", run.status);
    if let Some(outputs) = &run.outputs {
        println!("{}", serde_json::to_string_pretty(outputs)?);
    }

    let (events, summaries) = pipeline
        .service
        .ledger_events(&appraisal.id.to_string())
        .await?;
    println!("\nledger ({} events):", events.len());
    for summary in summaries {
        println!(
            "  {:<28} ok={} fail={}",
            summary.node_name, summary.ok, summary.failed
        );
    }

    pipeline.shutdown();
    Ok(())
}

fn score_offline(evidence: PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(&evidence)
        .with_context(|| format!("reading evidence {}", evidence.display()))?;
    let file: EvidenceFile = serde_json::from_str(&raw).context("parsing evidence JSON")?;

    let card = compute_score(
        ScoreInputs {
            envelopes: &file.envelopes,
            notes: file.notes.as_deref(),
            risk_flags: &file.risk_flags,
        },
        &ScoringWeights::default(),
    );
    let decision = decide(&card, &DecisionThresholds::default());

    println!("{}", serde_json::to_string_pretty(&card)?);
    println!("decision: {}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn guess_content_type(path: &PathBuf) -> Result<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => Ok("image/jpeg"),
        Some("png") => Ok("image/png"),
        Some("webp") => Ok("image/webp"),
        other => bail!("unsupported photo extension: {other:?}"),
    }
}
