//! `ocr-cache`: inspect and maintain the OCR result cache.
//!
//! Exit codes: `0` success, `1` usage or lookup failure, `2` cache unavailable.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use ocr_cache::{CacheConfig, CacheHealth, CacheState, OCR_CACHE_ABI_VERSION, SafeCache};
use tracing_subscriber::EnvFilter;

const EXIT_UNAVAILABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ocr-cache", version, about = "Inspect and maintain the OCR result cache")]
struct Cli {
    /// Config file (TOML or JSON). Defaults to ocr-cache.toml discovered upwards.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding config and OCR_CACHE_DB.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Logging preset; RUST_LOG takes precedence.
    #[arg(long, global = true, value_enum, default_value_t = LogPreset::Default)]
    log: LogPreset,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the cache health snapshot
    Health {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Print store counters as JSON
    Stats,
    /// Print every cached result as JSON
    List,
    /// Print one session as JSON
    Session { id: String },
    /// Delete every cached result and session
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Fold the write-ahead log into the database file
    Checkpoint,
    /// Full operator report: files, engine, health, suggestions
    Diagnose {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogPreset {
    /// Info and above
    Default,
    /// Debug with module targets
    Debug,
    /// Warnings only
    Production,
}

fn init_logging(preset: LogPreset) {
    let level = match preset {
        LogPreset::Default => "info",
        LogPreset::Debug => "debug",
        LogPreset::Production => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(preset == LogPreset::Debug)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<CacheConfig> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::discover()?.unwrap_or_default(),
    };
    config.apply_env_overrides();
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }
    tracing::debug!(
        db_path = %config.resolved_db_path().display(),
        enabled = config.enabled,
        "Loaded cache configuration"
    );
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log);
    let config = load_config(&cli)?;

    match cli.command {
        Command::Health { format } => {
            let cache = SafeCache::new(config);
            cache.initialize();
            let health = cache.health();
            health.log();
            print_health(&health, format)?;
            Ok(exit_for(&health))
        }
        Command::Stats => with_ready_cache(config, |cache| {
            let stats = cache.stats().context("reading cache stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }),
        Command::List => with_ready_cache(config, |cache| {
            println!("{}", serde_json::to_string_pretty(&cache.load_all())?);
            Ok(ExitCode::SUCCESS)
        }),
        Command::Session { id } => with_ready_cache(config, |cache| match cache.load_session(&id) {
            Some(session) => {
                println!("{}", serde_json::to_string_pretty(&session)?);
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("Session '{}' not found", id);
                Ok(ExitCode::FAILURE)
            }
        }),
        Command::Clear { yes } => {
            if !yes {
                bail!("refusing to clear the cache without --yes");
            }
            with_ready_cache(config, |cache| {
                if !cache.clear_cache() {
                    bail!("clearing the cache failed: {}", failure_of(cache));
                }
                tracing::info!("Cleared OCR cache at {}", cache.config().resolved_db_path().display());
                println!("Cache cleared");
                Ok(ExitCode::SUCCESS)
            })
        }
        Command::Checkpoint => with_ready_cache(config, |cache| {
            if !cache.checkpoint() {
                bail!("checkpoint failed: {}", failure_of(cache));
            }
            tracing::info!("Checkpointed OCR cache at {}", cache.config().resolved_db_path().display());
            println!("Checkpoint complete");
            Ok(ExitCode::SUCCESS)
        }),
        Command::Diagnose { format } => diagnose(config, format),
    }
}

/// Opens the cache and runs `f`, or reports why it is unavailable.
fn with_ready_cache(config: CacheConfig, f: impl FnOnce(&SafeCache) -> Result<ExitCode>) -> Result<ExitCode> {
    let cache = SafeCache::new(config);
    if cache.initialize() != CacheState::Ready {
        let health = cache.health();
        tracing::warn!("OCR cache unavailable: {}", health.message);
        eprintln!("{}", health);
        return Ok(ExitCode::from(EXIT_UNAVAILABLE));
    }
    f(&cache)
}

fn failure_of(cache: &SafeCache) -> String {
    cache
        .health()
        .last_error
        .unwrap_or_else(|| "unknown error".to_string())
}

fn exit_for(health: &CacheHealth) -> ExitCode {
    if health.ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_UNAVAILABLE)
    }
}

fn print_health(health: &CacheHealth, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", health),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(health)?),
    }
    Ok(())
}

struct FileFacts {
    directory: PathBuf,
    directory_exists: bool,
    directory_writable: bool,
    database_bytes: Option<u64>,
    wal_bytes: Option<u64>,
}

impl FileFacts {
    /// Gathered before the cache opens, so recovery cannot change what is reported.
    fn inspect(db_path: &Path) -> Self {
        let directory = db_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let directory_exists = directory.is_dir();
        let mut wal = db_path.as_os_str().to_owned();
        wal.push("-wal");

        Self {
            directory_writable: directory_exists && probe_writable(&directory),
            directory,
            directory_exists,
            database_bytes: fs::metadata(db_path).ok().map(|m| m.len()),
            wal_bytes: fs::metadata(PathBuf::from(wal)).ok().map(|m| m.len()),
        }
    }
}

fn probe_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".ocr-cache-probe-{}", std::process::id()));
    match fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn diagnose(config: CacheConfig, format: OutputFormat) -> Result<ExitCode> {
    let db_path = config.resolved_db_path();
    let facts = FileFacts::inspect(&db_path);

    let cache = SafeCache::new(config);
    cache.initialize();
    let health = cache.health();

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "expected_abi": OCR_CACHE_ABI_VERSION,
                "db_path": db_path,
                "directory": facts.directory,
                "directory_exists": facts.directory_exists,
                "directory_writable": facts.directory_writable,
                "database_bytes": facts.database_bytes,
                "wal_bytes": facts.wal_bytes,
                "health": health,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("OCR cache diagnostics");
            println!("=====================");
            println!("Expected ABI:  v{}", OCR_CACHE_ABI_VERSION);
            println!("Database:      {}", db_path.display());
            println!(
                "Directory:     {} ({}, {})",
                facts.directory.display(),
                if facts.directory_exists { "exists" } else { "missing" },
                if facts.directory_writable { "writable" } else { "not writable" }
            );
            match facts.database_bytes {
                Some(bytes) => println!("Database file: {} bytes", bytes),
                None => println!("Database file: absent"),
            }
            if let Some(bytes) = facts.wal_bytes {
                println!("WAL file:      {} bytes (left over from an unclean shutdown)", bytes);
            }
            println!();
            println!("{}", health);
        }
    }
    Ok(exit_for(&health))
}
