use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use citemetrics_cli::output::{self, ColorMode};
use citemetrics_core::config_file;
use citemetrics_core::http::ReqwestTransport;
use citemetrics_core::metrics::revalidate;
use citemetrics_core::{Config, Engine, SystemClock};

/// Refresh stale, missing and blocked entries of the metrics cache
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Also revalidate the DOIs in this author's record (repeatable)
    #[arg(long = "author", value_name = "ID")]
    authors: Vec<String>,

    /// Config file to use instead of the platform and working-directory ones
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for author records (overrides SCHOLAR_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Cache directory (overrides CACHE_DIR)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    output::init_tracing();
    let cli = Cli::parse();

    let file = config_file::load(cli.config.as_deref())?;
    let mut config = Config::resolve(&file, |name| std::env::var(name).ok());
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    let policy = config.revalidation_policy();

    let engine = Engine::build(config, Arc::new(ReqwestTransport::new()), Arc::new(SystemClock));
    let store = engine.store();

    let mut dois = engine.metrics.cached_dois();
    for author_id in &cli.authors {
        match store.load(author_id) {
            Some(record) => dois.extend(
                record
                    .publications
                    .iter()
                    .filter(|p| p.has_doi())
                    .map(|p| p.doi.to_lowercase()),
            ),
            None => tracing::warn!(author_id = %author_id, "no stored record for author"),
        }
    }
    dois.sort();
    dois.dedup();

    let report = revalidate::sweep(&engine.metrics, &dois, &policy).await;

    let mut out = std::io::stdout().lock();
    output::print_sweep_report(&mut out, &report, ColorMode(!cli.no_color))?;
    Ok(())
}
