//! papersync: keeps a Zotero library and a folder of literature notes in sync.
//!
//! `run` is the long-running daemon; every other subcommand is a one-shot
//! maintenance task over the same library and notes folder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sync_core::repair::enrich::EnrichOptions;
use sync_core::repair::import::ImportOptions;
use sync_core::repair::{ExcerptOptions, ReprocessOptions};
use sync_core::{
    repair, Analyzer, ExtractionCache, Library, LibraryError, Orchestrator, OrchestratorConfig,
    TopicHubs,
};
use sync_daemon::{Config, CrossrefClient, GeminiClient, LopdfExtractor, ZoteroClient};

/// Pause between import batches.
const IMPORT_BATCH_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "papersync")]
#[command(about = "Zotero to Obsidian literature note sync")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the library, write notes for new items and push note edits back
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Write notes for PDFs in PDF_DIR, without the library
    Ingest {
        /// Analyze every cached PDF again, not just new ones
        #[arg(long)]
        all: bool,
    },
    /// Create library items for notes that have no zotero_key
    Import {
        #[arg(long)]
        dry_run: bool,
        /// Import at most this many notes
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Fill blank bibliographic fields from CrossRef
    Enrich {
        #[arg(long)]
        dry_run: bool,
        /// Look up at most this many items
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Add missing citation lines and the doi header to existing notes
    MigrateFields {
        #[arg(long)]
        dry_run: bool,
    },
    /// Find library items duplicating a note-backed item
    Dedupe {
        /// Delete the duplicates instead of only listing them
        #[arg(long)]
        apply: bool,
    },
    /// Analyze notes that still hold placeholder sections again
    Reprocess {
        #[arg(long)]
        dry_run: bool,
        /// Reprocess at most this many notes
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rewrite unstructured or fallback excerpts with the model
    RegenerateExcerpts {
        #[arg(long)]
        dry_run: bool,
        /// Rewrite at most this many notes
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rearrange unstructured excerpts from the note's own sections, offline
    RestructureExcerpts {
        #[arg(long)]
        dry_run: bool,
    },
}

fn zotero_client(config: &Config) -> Result<ZoteroClient> {
    let zotero = config.require_zotero()?;
    ZoteroClient::new(zotero).context("Failed to create Zotero client")
}

fn analyzer(config: &Config) -> Result<Analyzer<GeminiClient>> {
    let gemini = config.require_gemini()?;
    let client = GeminiClient::new(gemini).context("Failed to create Gemini client")?;
    Ok(Analyzer::new(client, &gemini.model, &gemini.lite_model).with_request_delay(gemini.request_delay))
}

async fn run(config: &Config, once: bool) -> Result<()> {
    let zotero = config.require_zotero()?;
    let library = zotero_client(config)?;

    // Bad credentials will not fix themselves; anything else is retried by the loop.
    match library.library_version().await {
        Ok(version) => info!("Connected to Zotero library (version {})", version),
        Err(e @ LibraryError::Auth(_)) => return Err(e).context("Zotero rejected the API key"),
        Err(e) => warn!("Zotero not reachable yet: {}", e),
    }

    let mut orchestrator_config = OrchestratorConfig::new(&config.notes_dir, config.state_path());
    orchestrator_config.topics_dir = config.topics_dir.clone();
    orchestrator_config.storage_dir = zotero.storage_dir.clone();
    orchestrator_config.annotate = zotero.note_sync;

    let cache = ExtractionCache::open(config.cache_path()).await?;
    let mut orchestrator = Orchestrator::open(
        library,
        analyzer(config)?,
        Arc::new(LopdfExtractor::new()),
        orchestrator_config,
    )
    .await
    .with_cache(cache);

    if once {
        orchestrator.run_cycle().await;
        orchestrator.save_state().await?;
        return Ok(());
    }

    info!(
        "Daemon running, polling every {}s. Press Ctrl+C to stop.",
        zotero.poll_interval.as_secs_f64()
    );
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    orchestrator.run(zotero.poll_interval, shutdown).await?;
    Ok(())
}

async fn ingest(config: &Config, all: bool) -> Result<()> {
    let pdf_dir = config.require_pdf_dir()?;
    let mut cache = ExtractionCache::open(config.cache_path()).await?;
    let hubs = TopicHubs::new(&config.topics_dir);
    repair::ingest(
        pdf_dir,
        &LopdfExtractor::new(),
        &mut cache,
        &analyzer(config)?,
        &hubs,
        &config.notes_dir,
        all,
    )
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info,reqwest=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    info!("Notes folder: {}", config.notes_dir.display());

    match args.command {
        Command::Run { once } => run(&config, once).await?,
        Command::Ingest { all } => ingest(&config, all).await?,
        Command::Import { dry_run, limit } => {
            let options = ImportOptions {
                dry_run,
                limit,
                batch_delay: IMPORT_BATCH_DELAY,
            };
            repair::import_notes(&zotero_client(&config)?, &config.notes_dir, &options).await?;
        }
        Command::Enrich { dry_run, limit } => {
            let source = CrossrefClient::new(&config.crossref).context("Failed to create CrossRef client")?;
            let options = EnrichOptions {
                dry_run,
                limit,
                delay: config.crossref.delay,
            };
            repair::enrich(&zotero_client(&config)?, &source, &config.notes_dir, &options).await?;
        }
        Command::MigrateFields { dry_run } => {
            repair::migrate_fields(&config.notes_dir, dry_run).await?;
        }
        Command::Dedupe { apply } => {
            repair::dedupe(&zotero_client(&config)?, &config.notes_dir, apply, Duration::ZERO).await?;
        }
        Command::Reprocess { dry_run, limit } => {
            let cache = ExtractionCache::open(config.cache_path()).await?;
            let hubs = TopicHubs::new(&config.topics_dir);
            let options = ReprocessOptions { dry_run, limit };
            repair::reprocess(&config.notes_dir, &cache, &analyzer(&config)?, &hubs, options).await?;
        }
        Command::RegenerateExcerpts { dry_run, limit } => {
            let cache = ExtractionCache::open(config.cache_path()).await?;
            let options = ExcerptOptions { dry_run, limit };
            repair::regenerate_excerpts(&config.notes_dir, Some(&cache), &analyzer(&config)?, options).await?;
        }
        Command::RestructureExcerpts { dry_run } => {
            repair::restructure_excerpts(&config.notes_dir, dry_run).await?;
        }
    }

    Ok(())
}
