//! mediadex: index media directories into a catalog.
//!
//! ## Usage
//!
//! ```bash
//! mediadex ~/Pictures ~/Videos       # full scan of each root
//! mediadex --fast ~/Pictures         # index now, extract metadata in the background
//! mediadex --hash --duplicates       # hash pending assets and list duplicate groups
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use mediadex::notify::{ChannelNotifier, IndexEvent};
use mediadex::{logging, CancelToken, Config, Database, Indexer, ScanOptions};

/// Command line options
struct Args {
    config_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    roots: Vec<PathBuf>,
    fast: Option<bool>,
    recursive: bool,
    hash: bool,
    duplicates: bool,
    stats: bool,
    prune: bool,
    foreground: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config_path: None,
            db_path: None,
            roots: Vec::new(),
            fast: None,
            recursive: true,
            hash: false,
            duplicates: false,
            stats: false,
            prune: false,
            foreground: false,
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("mediadex {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" | "--db" => {
                if i + 1 < args.len() {
                    let value = PathBuf::from(&args[i + 1]);
                    if args[i] == "--db" {
                        parsed.db_path = Some(value);
                    } else {
                        parsed.config_path = Some(value);
                    }
                    i += 1;
                } else {
                    eprintln!("Error: {} requires a path argument", args[i]);
                    std::process::exit(1);
                }
            }
            "--fast" => parsed.fast = Some(true),
            "--full" => parsed.fast = Some(false),
            "--no-recursive" => parsed.recursive = false,
            "--hash" => parsed.hash = true,
            "--duplicates" | "-d" => parsed.duplicates = true,
            "--stats" => parsed.stats = true,
            "--prune" => parsed.prune = true,
            "--foreground" | "-f" => parsed.foreground = true,
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            root => parsed.roots.push(PathBuf::from(root)),
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"mediadex - incremental media catalog indexer

USAGE:
    mediadex [OPTIONS] [ROOT...]

OPTIONS:
    --config, -c PATH   Path to config file
    --db PATH           Catalog database (overrides db_path)
    --fast              Defer metadata extraction to the background worker
    --full              Extract metadata inline (default unless fast_scan is set)
    --no-recursive      Only index the top level of each root
    --prune             Remove catalogued files under each root that no longer exist
    --hash              Compute content and perceptual hashes for new assets
    --duplicates, -d    List exact and near duplicate groups
    --stats             Print catalog counts by kind and quality
    --foreground, -f    Log to stderr instead of journald/log files
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    MEDIADEX_CONFIG     Path to config file (overrides default location)
    MEDIADEX_LOG        Log filter (trace, debug, info, warn, error)
"#
    );
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if args.foreground {
        logging::init_stderr()?;
    } else {
        logging::init(None)?;
    }

    let config = load_config(&args)?;
    let db = Database::open(&config.db_path).context("Failed to open catalog database")?;
    db.set_busy_timeout(config.db_busy_timeout())
        .context("Failed to configure catalog database")?;
    db.initialize().context("Failed to initialize catalog schema")?;
    info!(db = %config.db_path.display(), "Catalog opened");

    let (tx, rx) = std::sync::mpsc::channel();
    let fast = args.fast.unwrap_or(config.scanner.fast_scan);
    let indexer = Arc::new(
        Indexer::new(db, config).context("Failed to start indexer")?
            .with_notifier(Arc::new(ChannelNotifier::new(tx))),
    );

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted; finishing the current batch");
                cancel.cancel();
            }
        });
    }

    // Drained after every root so a long run never holds every event.
    let mut scan_events = 0;
    let mut drain_events = || {
        scan_events += rx
            .try_iter()
            .filter(|event| matches!(event, IndexEvent::ScanComplete { .. }))
            .count();
    };

    for root in &args.roots {
        let options = ScanOptions {
            recursive: args.recursive,
            fast,
            cancel: cancel.clone(),
            ..ScanOptions::default()
        };
        match indexer.scan_directory(root, options).await {
            Ok(stats) => println!(
                "{}: scanned {}, added {}, updated {}, skipped {}, errors {}{}",
                root.display(),
                stats.scanned,
                stats.added,
                stats.updated,
                stats.skipped,
                stats.errors,
                if stats.cancelled { " (cancelled)" } else { "" }
            ),
            Err(e) => {
                error!(root = %root.display(), error = %e, "Scan failed");
                eprintln!("{}: {}", root.display(), e);
                if e.is_fatal() {
                    break;
                }
            }
        }
        drain_events();
        if cancel.is_cancelled() {
            break;
        }

        if args.prune {
            let missing = indexer.find_missing(root).await?;
            if !missing.is_empty() {
                let removed = indexer.remove_paths(&missing).await?;
                println!("{}: removed {} missing files", root.display(), removed);
            }
        }
    }

    drain_events();
    info!(scans = scan_events, "Scans complete");

    if args.hash {
        let report = indexer.compute_hashes().await?;
        println!(
            "hashed {}, failed {}, changed on disk {}",
            report.hashed, report.failed, report.stale
        );
    }

    if args.duplicates {
        for group in indexer.exact_duplicates().await? {
            println!("exact {} ({} files)", group.content_hash, group.total);
            for member in &group.members {
                println!("  {}", member.filepath);
            }
        }
        for pair in indexer.near_duplicates().await? {
            println!("near  {} ~ {} (distance {})", pair.a.filepath, pair.b.filepath, pair.distance);
        }
    }

    if args.stats {
        let stats = indexer.catalog_stats().await?;
        println!("{} assets, {} hashed", stats.total, stats.hashed);
        for (kind, count) in &stats.by_kind {
            println!("  {:<8} {}", kind, count);
        }
        for (quality, count) in &stats.by_quality {
            println!("  {:<8} {}", quality, count);
        }
    }

    // Deferred extraction finishes before exit unless interrupted.
    indexer.shutdown(!cancel.is_cancelled()).await;
    info!("mediadex stopped");
    Ok(())
}
