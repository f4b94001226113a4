/*
 * Transcript Fusion Pipeline
 * Copyright (c) 2024 Meeting Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use transcript_fusion_pipeline::config::Config;
use transcript_fusion_pipeline::scheduler::{PipelineOutcome, PipelineScheduler, RunOptions};
use transcript_fusion_pipeline::types::ModelTier;

#[derive(Parser)]
#[command(name = "pipeline", about = "Speaker-attributed transcription pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline against a media file, resuming from any valid checkpoint.
    Run {
        input: PathBuf,
        #[arg(long)]
        force_restart: bool,
        #[arg(long)]
        webhook_url: Option<String>,
        #[arg(long, value_enum, default_value = "cheap")]
        tier: CliModelTier,
        #[arg(long)]
        language: Option<String>,
    },
    /// Explicitly resume a pipeline, bypassing the auto-resume age window.
    Resume { input: PathBuf },
}

#[derive(Clone, clap::ValueEnum)]
enum CliModelTier {
    Cheap,
    Mid,
    High,
}

impl From<CliModelTier> for ModelTier {
    fn from(value: CliModelTier) -> Self {
        match value {
            CliModelTier::Cheap => ModelTier::Cheap,
            CliModelTier::Mid => ModelTier::Mid,
            CliModelTier::High => ModelTier::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let scheduler = PipelineScheduler::new(config);

    let (input, options) = match cli.command {
        Command::Run { input, force_restart, webhook_url, tier, language } => (
            input,
            RunOptions {
                force_restart,
                explicit_resume: false,
                webhook_url,
                model_tier: tier.into(),
                language,
                prompt: None,
            },
        ),
        Command::Resume { input } => (input, RunOptions { explicit_resume: true, ..RunOptions::default() }),
    };

    match scheduler.run(&input, options).await? {
        PipelineOutcome::Complete(segments) => {
            println!("{}", serde_json::to_string_pretty(&segments)?);
        }
        PipelineOutcome::AwaitingWebhook(job) => {
            tracing::info!("pipeline is awaiting webhook delivery for job {}", job.job_id);
            println!("awaiting webhook callback for job {}", job.job_id);
        }
    }

    Ok(())
}
