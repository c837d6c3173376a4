use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pubmed_ingest::config::Settings;
use pubmed_ingest::db::{self, SqliteStore};
use pubmed_ingest::fetcher::HttpFetcher;
use pubmed_ingest::pipeline::{self, RunOptions};
use pubmed_ingest::record::or_sentinel;
use pubmed_ingest::source;

#[derive(Parser)]
#[command(name = "pubmed_ingest", about = "PubMed article metadata ingestion")]
struct Cli {
    /// Settings file (TOML). Defaults to ./pubmed_ingest.toml if present
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the articles table
    Init,
    /// Fetch, extract and store articles listed in the input CSV
    Run {
        /// Max input rows to process
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Simultaneous page fetches
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Records per storage flush
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Input CSV (pmid, lev1_cluster_id .. lev4_cluster_id)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Show one stored article
    Show {
        pmid: i64,
    },
    /// List (pmid, title) for every stored article
    Titles {
        /// Emit JSON lines instead of tab-separated text
        #[arg(long)]
        json: bool,
    },
    /// Show storage statistics
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match dispatch(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(db) = cli.db {
        settings.database_path = db;
    }

    match cli.command {
        Commands::Init => {
            let store = open_store(&settings)?;
            let s = db::get_stats(store.conn())?;
            println!(
                "Schema ready at {} ({} articles)",
                settings.database_path.display(),
                s.total
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            limit,
            concurrency,
            batch_size,
            input,
        } => {
            if let Some(n) = limit {
                settings.limit = n;
            }
            if let Some(c) = concurrency {
                settings.concurrency = c;
            }
            if let Some(b) = batch_size {
                settings.batch_size = b;
            }
            if let Some(path) = input {
                settings.input_path = path;
            }
            settings.validate()?;
            run(settings).await
        }
        Commands::Show { pmid } => {
            let store = open_store(&settings)?;
            match db::get_by_key(store.conn(), pmid)? {
                Some(r) => {
                    let tags: Vec<String> = r
                        .tags
                        .as_array()
                        .iter()
                        .map(|t| t.map(|v| v.to_string()).unwrap_or_else(|| "-".into()))
                        .collect();
                    println!("PMID:             {}", r.pmid);
                    println!("Clusters:         {}", tags.join(" / "));
                    println!("Title:            {}", or_sentinel(&r.title));
                    println!("Abstract:         {}", or_sentinel(&r.abstract_text));
                    println!("Authors:          {}", or_sentinel(&r.authors));
                    println!("Journal:          {}", or_sentinel(&r.journal));
                    println!("Publication date: {}", or_sentinel(&r.publication_date));
                    println!("DOI:              {}", or_sentinel(&r.doi));
                    println!("Keywords:         {}", or_sentinel(&r.keywords));
                    println!("Link:             {}", r.url());
                }
                None => println!("No data found for PMID {}", pmid),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Titles { json } => {
            let store = open_store(&settings)?;
            for row in db::get_all(store.conn())? {
                if json {
                    println!("{}", serde_json::to_string(&row)?);
                } else {
                    println!("{}\t{}", row.pmid, row.title);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            let store = open_store(&settings)?;
            let s = db::get_stats(store.conn())?;
            println!("Articles:      {}", s.total);
            println!("With DOI:      {}", s.with_doi);
            println!("With keywords: {}", s.with_keywords);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(settings: &Settings) -> Result<SqliteStore> {
    SqliteStore::open(&settings.database_path).with_context(|| {
        format!(
            "Cannot open database {}",
            settings.database_path.display()
        )
    })
}

async fn run(settings: Settings) -> Result<ExitCode> {
    let t0 = Instant::now();
    let store = open_store(&settings)?;
    let keys = source::read_keys(&settings.input_path, settings.limit)?;
    if keys.is_empty() {
        println!("No keys to process in {}.", settings.input_path.display());
        return Ok(ExitCode::SUCCESS);
    }
    let fetcher = Arc::new(HttpFetcher::new(&settings)?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight pages");
            on_signal.cancel();
        }
    });

    println!("Ingesting {} articles from {}...", keys.len(), settings.input_path.display());
    let opts = RunOptions {
        concurrency: settings.concurrency,
        batch_size: settings.batch_size,
    };
    let summary = pipeline::run(keys, fetcher, store, opts, cancel).await;
    summary.print();
    info!("Done in {}", pipeline::format_duration(t0.elapsed()));

    if summary.is_fatal() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
