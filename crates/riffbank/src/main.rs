use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use riffbank::{discover_midi_files, mine_corpus, run_batch, PipelineError};
use riffstore::{ClipQuery, MetaCache, RateGate, Store};

/// Exit codes: 0 success, 2 usage (clap), 3 input error, 4 internal
/// invariant violation.
const EXIT_INPUT: i32 = 3;
const EXIT_INVARIANT: i32 = 4;

/// MIDI pattern corpus analyzer
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file overriding the discovered ones
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the MIDI files a directory would contribute
    Scan { dir: PathBuf },

    /// Analyze a directory (or individual files) into the corpus
    Analyze {
        /// Directories or .mid files
        inputs: Vec<PathBuf>,
    },

    /// Cross-corpus pattern mining over everything analyzed so far
    Mine,

    /// Search the mined clip corpus
    Query {
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        genre: Option<String>,
        #[arg(long)]
        artist: Option<String>,
        /// e.g. 4/4
        #[arg(long)]
        meter: Option<String>,
        #[arg(long)]
        min_bars: Option<u8>,
        #[arg(long)]
        max_bars: Option<u8>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::Invariant(_)) => EXIT_INVARIANT,
                Some(PipelineError::Input(_)) => EXIT_INPUT,
                _ => EXIT_INPUT,
            };
            std::process::exit(code);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = riffbank::config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.paths.db_path = db;
    }

    match cli.command {
        Commands::Scan { dir } => {
            let files = discover_midi_files(&dir);
            for file in &files {
                println!("{}", file.display());
            }
            info!(count = files.len(), "scan complete");
            Ok(())
        }

        Commands::Analyze { inputs } => {
            if inputs.is_empty() {
                anyhow::bail!("no inputs given");
            }

            let mut paths = Vec::new();
            for input in inputs {
                if input.is_dir() {
                    paths.extend(discover_midi_files(&input));
                } else {
                    paths.push(input);
                }
            }
            paths.sort();
            paths.dedup();

            let store = Arc::new(open_store(&config)?);
            let cache = Arc::new(MetaCache::open(&config.paths.db_path)?);
            let gate = Arc::new(RateGate::new());
            let cancel = CancellationToken::new();

            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            let ctrl_c_cancel = cancel.clone();
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing in-flight songs");
                    ctrl_c_cancel.cancel();
                }
            });

            let report = runtime.block_on(run_batch(
                paths,
                store,
                cache,
                None,
                gate,
                Arc::new(config),
                cancel,
            ))?;

            println!(
                "ok: {}  partial: {}  failed: {}  skipped: {}{}",
                report.ok,
                report.partial,
                report.failed,
                report.skipped,
                if report.cancelled { "  (cancelled)" } else { "" },
            );
            Ok(())
        }

        Commands::Mine => {
            let store = open_store(&config)?;
            let (before, after) = mine_corpus(&store)?;
            println!("patterns: {before} -> {after}");
            Ok(())
        }

        Commands::Query {
            role,
            genre,
            artist,
            meter,
            min_bars,
            max_bars,
            limit,
            offset,
        } => {
            let store = open_store(&config)?;
            let role = match role {
                Some(r) => Some(
                    music_analysis::Role::from_str_loose(&r)
                        .with_context(|| format!("unknown role: {r}"))?,
                ),
                None => None,
            };
            let meter = match meter {
                Some(m) => {
                    let (num, den) = m
                        .split_once('/')
                        .with_context(|| format!("meter must look like 4/4, got {m}"))?;
                    Some((num.parse()?, den.parse()?))
                }
                None => None,
            };

            let hits = store.query_clips(&ClipQuery {
                role,
                genre,
                artist,
                meter,
                min_length_bars: min_bars,
                max_length_bars: max_bars,
                limit,
                offset,
            })?;

            for hit in &hits {
                println!(
                    "{}  {}  {} bars  {}  x{}",
                    hit.pattern_id, hit.role, hit.length_bars, hit.meter, hit.popularity
                );
            }
            info!(count = hits.len(), "query complete");
            Ok(())
        }
    }
}

fn open_store(config: &riffbank::RiffbankConfig) -> Result<Store> {
    if let Some(parent) = config.paths.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Store::open(&config.paths.db_path)
}
