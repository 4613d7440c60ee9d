use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ijf_core::{IngestError, RunResult, Source};
use ijf_pipeline::{
    BackendChoice, DiscoverOptions, ImportOptions, Pipeline, PipelineConfig, ProviderKind,
    RunOptions,
};
use ijf_store::MemoryJobStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ijf")]
#[command(about = "Impact job ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    GoogleCse,
    Serper,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendChoice::Auto,
            BackendArg::GoogleCse => BackendChoice::GoogleCse,
            BackendArg::Serper => BackendChoice::Serper,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Deepseek,
    Groq,
    Mistral,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Deepseek => ProviderKind::DeepSeek,
            ProviderArg::Groq => ProviderKind::Groq,
            ProviderArg::Mistral => ProviderKind::Mistral,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import jobs from the aggregator sources.
    Import {
        /// Restrict to one source (80000hours, reliefweb).
        #[arg(long)]
        source: Option<String>,
        /// Cap on records fetched per source.
        #[arg(long)]
        limit: Option<usize>,
        /// Skip records already stored with successful enrichment.
        #[arg(long)]
        new_only: bool,
        /// Fetch and count, but write nothing.
        #[arg(long)]
        dry_run: bool,
        /// Run AI enrichment over imported records.
        #[arg(long)]
        use_ai: bool,
        /// Pin enrichment to one provider instead of the fallback chain.
        #[arg(long, value_enum)]
        provider: Option<ProviderArg>,
        /// Concurrent enrichment calls per batch.
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Discover board posting URLs via web search.
    Discover {
        /// Restrict to one board (greenhouse, lever, ashby).
        #[arg(long)]
        board: Option<String>,
        /// Results requested per board query.
        #[arg(long, default_value_t = 100)]
        num_results: usize,
        #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
        backend: BackendArg,
        #[arg(long)]
        dry_run: bool,
    },
    /// Crawl discovered posting stubs through the board APIs.
    Crawl {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        use_ai: bool,
        /// Pin enrichment to one provider instead of the fallback chain.
        #[arg(long, value_enum)]
        provider: Option<ProviderArg>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Deactivate expired and stale records.
    Cleanup {
        /// Staleness threshold in days.
        #[arg(long, default_value_t = 45)]
        days: i64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Full pipeline: import, discover, crawl, cleanup.
    Run {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 50)]
        crawl_limit: usize,
        #[arg(long)]
        new_only: bool,
        #[arg(long)]
        use_ai: bool,
        #[arg(long, value_enum)]
        provider: Option<ProviderArg>,
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_source(value: &str) -> Result<Source> {
    match Source::parse(value) {
        Some(source) => Ok(source),
        None => bail!("unknown source {value:?}"),
    }
}

fn print_summary(result: &RunResult) {
    let mode = if result.dry_run { " (dry run)" } else { "" };
    println!("run {} finished{mode}", result.run_id);
    println!(
        "  fetched={} created={} updated={} skipped={}",
        result.fetched, result.created, result.updated, result.skipped_duplicate
    );
    println!(
        "  enrichment_failed={} crawl_failed={} deactivated={}",
        result.enrichment_failed, result.crawl_failed, result.deactivated
    );
    for error in &result.errors {
        let source = error.source.as_deref().unwrap_or("-");
        eprintln!("  error [{}/{}] {}", error.stage, source, error.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = Pipeline::new(config, store)?;

    let result: Result<RunResult, IngestError> = match cli.command {
        Commands::Import {
            source,
            limit,
            new_only,
            dry_run,
            use_ai,
            provider,
            batch_size,
        } => {
            let source = source.as_deref().map(parse_source).transpose()?;
            let opts = ImportOptions {
                source,
                limit,
                new_only,
                dry_run,
                use_ai,
                provider: provider.map(Into::into),
                batch_size,
            };
            pipeline.import_aggregators(&opts).await
        }
        Commands::Discover {
            board,
            num_results,
            backend,
            dry_run,
        } => {
            let board = board.as_deref().map(parse_source).transpose()?;
            let opts = DiscoverOptions {
                board,
                num_results,
                backend: backend.into(),
                dry_run,
            };
            pipeline.import_discovery(&opts).await
        }
        Commands::Crawl {
            limit,
            use_ai,
            provider,
            dry_run,
        } => {
            pipeline
                .crawl(limit, use_ai, provider.map(Into::into), dry_run)
                .await
        }
        Commands::Cleanup { days, dry_run } => pipeline.cleanup(days, dry_run).await,
        Commands::Run {
            limit,
            crawl_limit,
            new_only,
            use_ai,
            provider,
            dry_run,
        } => {
            let opts = RunOptions {
                limit,
                crawl_limit,
                new_only,
                use_ai,
                provider: provider.map(Into::into),
                dry_run,
                ..RunOptions::default()
            };
            let result = pipeline.run_all(&opts).await;
            print_summary(&result);
            return Ok(());
        }
    };

    match result {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(err) => bail!("{err}"),
    }
}
