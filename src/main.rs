//! # kb-sync CLI (`kbs`)
//!
//! The `kbs` binary is the operator interface for the knowledge-base
//! ingestion pipeline: database initialization, full-site ingest,
//! incremental sync, manual text, corpus stats, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! kbs --config ./config/kbs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbs init` | Create the SQLite database and run schema migrations |
//! | `kbs ingest <tenant> <seed-url>` | First-time full-site ingest |
//! | `kbs sync <tenant> <url>...` | Incremental re-sync of specific URLs |
//! | `kbs add <tenant>` | Ingest manually entered text (stdin or `--text`) |
//! | `kbs stats <tenant>` | Per-tenant corpus breakdown |
//! | `kbs serve` | Start the HTTP server |

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use kb_sync::config::Config;
use kb_sync::progress::ProgressMode;
use kb_sync::sync::{SyncOptions, SyncRunner};
use kb_sync::{bulk, config, db, embedding, fetch, migrate, server, stats, store};

/// kb-sync CLI — multi-tenant knowledge-base ingestion and sync for
/// retrieval-augmented chat.
#[derive(Parser)]
#[command(
    name = "kbs",
    about = "kb-sync — multi-tenant knowledge-base ingestion and sync",
    version,
    long_about = "kb-sync fetches a tenant's source pages through a crawl service, detects \
    which sources changed, splits changed content into bounded chunks, embeds them, and \
    atomically replaces the tenant's stored chunks — streaming live progress to the operator."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the chunks table. Idempotent —
    /// running it multiple times is safe.
    Init,

    /// First-time full-site ingest for a tenant.
    ///
    /// Crawls the site from the seed URL, embeds every page, and replaces
    /// the tenant's whole corpus. Nothing is deleted unless the crawl and
    /// all embeddings succeed.
    Ingest {
        /// Tenant identifier.
        tenant: String,
        /// Seed URL to crawl from.
        seed_url: String,
    },

    /// Incrementally re-sync specific URLs for a tenant.
    ///
    /// Unchanged pages (same content fingerprint) are skipped without
    /// re-embedding. One URL's failure never aborts the others.
    Sync {
        /// Tenant identifier.
        tenant: String,
        /// URLs to sync.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Progress output on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Ingest manually entered text for a tenant.
    ///
    /// Stored under the reserved "manual" source. Reads stdin when
    /// `--text` is not given.
    Add {
        /// Tenant identifier.
        tenant: String,
        /// The text to ingest; stdin is read when omitted.
        #[arg(long)]
        text: Option<String>,
    },

    /// Show per-tenant corpus statistics.
    Stats {
        /// Tenant identifier.
        tenant: String,
    },

    /// Start the HTTP server.
    ///
    /// Exposes bulk ingest and SSE-streamed incremental sync at the
    /// address configured in `[server].bind`.
    Serve,
}

/// Wire up the pipeline from config: database, crawl client, embedder.
async fn build_runner(config: &Config) -> anyhow::Result<SyncRunner> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let fetcher = Arc::new(fetch::CrawlClient::new(&config.crawler)?);
    let embedder = embedding::create_embedder(&config.embedding)?;
    let store = store::ChunkStore::new(pool, config.sync.insert_batch_size);

    Ok(SyncRunner::new(
        fetcher,
        embedder,
        store,
        SyncOptions::from_config(config),
    ))
}

fn parse_progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some("off") => Ok(ProgressMode::Off),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some(other) => anyhow::bail!("Unknown progress mode: '{}'. Use off, human, or json.", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { tenant, seed_url } => {
            let runner = build_runner(&cfg).await?;
            let options = SyncOptions::from_config(&cfg);
            let summary = bulk::run_bulk_ingest(
                runner.fetcher(),
                runner.embedder(),
                runner.store(),
                &options,
                &tenant,
                &seed_url,
            )
            .await?;

            println!("ingest {}", tenant);
            println!("  pages ingested: {}", summary.pages_count);
            println!("  chunks written: {}", summary.chunks_count);
            println!("  empty pages:    {}", summary.empty_pages);
            println!("ok");
        }
        Commands::Sync {
            tenant,
            urls,
            progress,
        } => {
            let mode = parse_progress_mode(progress.as_deref())?;
            let runner = build_runner(&cfg).await?;

            let (tx, mut rx) = mpsc::channel(64);
            let reporter = mode.reporter();
            let consumer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    reporter.report(&event);
                }
            });

            let stats = runner.run(&tenant, urls, tx).await?;
            consumer.await?;

            println!("sync {}", tenant);
            println!("  new pages:     {}", stats.new_pages);
            println!("  updated pages: {}", stats.updated_pages);
            println!("  skipped pages: {}", stats.skipped_pages);
            println!("  empty pages:   {}", stats.empty_pages);
            println!("  errors:        {}", stats.errors);
            println!("ok");
        }
        Commands::Add { tenant, text } => {
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };

            let runner = build_runner(&cfg).await?;
            let (status, chunks) = runner.ingest_text(&tenant, &text).await?;

            println!("add {}", tenant);
            println!("  status: {}", status.as_str());
            println!("  chunks: {}", chunks);
            println!("ok");
        }
        Commands::Stats { tenant } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let store = store::ChunkStore::new(pool, cfg.sync.insert_batch_size);
            stats::run_stats(&store, &tenant).await?;
        }
        Commands::Serve => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .init();
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
