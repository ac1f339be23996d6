use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info, warn};

use paperflow::anthropic::AnthropicClient;
use paperflow::checkpoint::CheckpointStore;
use paperflow::cli::{Cli, Command};
use paperflow::config::PipelineConfig;
use paperflow::items::load_items;
use paperflow::llm_stage::LlmStage;
use paperflow::orchestrator::PipelineOrchestrator;
use paperflow::stage::NamedStage;
use paperflow::{logging, ui};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let items_path = match &cli.command {
        Command::Status => {
            let checkpoint = CheckpointStore::read(&config.checkpoint_path)?;
            println!("{}", ui::render_status(&checkpoint));
            return Ok(());
        }
        Command::Run { items, .. } | Command::Resume { items, .. } => items.clone(),
    };

    let items = load_items(&items_path)
        .with_context(|| format!("loading items from {}", items_path.display()))?;
    if config.stages.is_empty() {
        bail!("no stages configured in {}", cli.config.display());
    }
    if config.llm.api_key.is_empty() && !config.dry_run {
        bail!("ANTHROPIC_API_KEY is not set");
    }

    let client = Arc::new(match &config.llm.base_url {
        Some(url) => AnthropicClient::with_base_url(config.llm.api_key.clone(), url.clone())?,
        None => AnthropicClient::new(config.llm.api_key.clone())?,
    });
    let stages: Vec<NamedStage> = config
        .stages
        .iter()
        .map(|s| {
            let handler = LlmStage::new(s, &config.llm, client.clone());
            NamedStage::new(s.name.clone(), Arc::new(handler))
        })
        .collect();

    let store = Arc::new(CheckpointStore::open(config.checkpoint_path.clone())?);
    let orchestrator = PipelineOrchestrator::from_config(&config, stages, store)?;

    let cancel = orchestrator.cancel_flag().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight items");
            cancel.cancel();
        }
    });

    info!(
        items = items.len(),
        stages = ?orchestrator.stage_names(),
        dry_run = config.dry_run,
        "starting pipeline"
    );
    let progress = ui::RunProgress::start(&format!("{} items", items.len()));
    let report = match (&config.resume_from_stage, config.resume) {
        (Some(stage), _) => orchestrator.resume_from_stage(stage, &items).await,
        (None, true) => orchestrator.resume(&items).await,
        (None, false) => orchestrator.run(&items).await,
    };
    progress.finish();
    let report = report?;

    println!("{}", ui::render_report(&report));
    Ok(())
}
