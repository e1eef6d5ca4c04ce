use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use citemetrics_cli::output::{self, ColorMode};
use citemetrics_core::config_file;
use citemetrics_core::http::ReqwestTransport;
use citemetrics_core::{Config, Engine, RunOutcome, SystemClock};

/// Enrich an author's publications with verified DOIs and citation metrics
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Profile identifier of the author
    author_id: String,

    /// Re-run even if the stored record is fresh
    #[arg(long)]
    force: bool,

    /// Config file to use instead of the platform and working-directory ones
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for author records (overrides SCHOLAR_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Cache directory (overrides CACHE_DIR)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory of profile exports (overrides PROFILES_DIR)
    #[arg(long)]
    profiles_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    output::init_tracing();
    let cli = Cli::parse();

    // Resolve configuration: CLI flags > env vars > config files > defaults
    let file = config_file::load(cli.config.as_deref())?;
    let mut config = Config::resolve(&file, |name| std::env::var(name).ok());
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(dir) = cli.profiles_dir {
        config.profiles_dir = dir;
    }

    let color = ColorMode(!cli.no_color);
    let engine = Engine::build(config, Arc::new(ReqwestTransport::new()), Arc::new(SystemClock));
    let orchestrator = engine.orchestrator(cli.force);

    let outcome = orchestrator
        .run(&cli.author_id, |event| {
            let mut out = std::io::stdout().lock();
            let _ = output::print_progress(&mut out, &event, color);
        })
        .await
        .with_context(|| format!("Could not process author {}", cli.author_id))?;

    if let RunOutcome::Completed(summary) = outcome {
        let mut out = std::io::stdout().lock();
        output::print_summary(&mut out, &summary, color)?;
        if let Ok(path) = orchestrator.store().path_for(&cli.author_id) {
            tracing::info!(path = %path.display(), "author record written");
        }
    }
    Ok(())
}
