//! Thin CLI entry point: owns argument parsing, config
//! construction, subscriber setup, and reporting the final summary/exit
//! code. No pipeline logic lives here.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use trial_interpreter::config::PipelineConfig;
use trial_interpreter::orchestrator::{CancellationToken, PipelineOrchestrator, TracingProgressSink};

#[derive(Parser, Debug)]
#[command(name = "interpret")]
#[command(about = "Interprets eligibility criteria into a queryable feasibility model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full 12-stage pipeline for one protocol.
    Run {
        /// Path to eligibility_criteria.json.
        #[arg(long)]
        criteria: PathBuf,

        /// Optional path to a pre-extracted omop_mappings.json companion input.
        #[arg(long)]
        omop_mappings: Option<PathBuf>,

        /// Directory to write per-stage artifacts and final outputs into.
        #[arg(long, default_value = "./out")]
        out_dir: PathBuf,

        /// Protocol identifier used to name final output files.
        #[arg(long)]
        protocol_id: String,

        /// Catchment population the feasibility funnel estimates against.
        #[arg(long, default_value_t = 1_000_000)]
        base_population: u64,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(success) => {
            if success {
                std::process::ExitCode::SUCCESS
            } else {
                std::process::ExitCode::FAILURE
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "pipeline run failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> trial_interpreter::error::Result<bool> {
    let Command::Run {
        criteria,
        omop_mappings,
        out_dir,
        protocol_id,
        base_population,
    } = cli.command;

    let mut config = PipelineConfig::from_env()?;
    config.artifact_dir = out_dir;

    let orchestrator = PipelineOrchestrator::new(config, Arc::new(TracingProgressSink), CancellationToken::new())?;
    let result = orchestrator.run(&criteria, omop_mappings.as_deref(), &protocol_id, base_population).await?;

    tracing::info!(
        success = result.success,
        artifacts = result.artifact_paths.len(),
        warnings = result.warning_counts_by_category.values().sum::<u64>(),
        "pipeline run complete"
    );

    Ok(result.success)
}
