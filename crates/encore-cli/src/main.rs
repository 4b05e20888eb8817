//! CLI entry point for Encore.
//!
//! The `encore` binary administers the cached document collections in a
//! local SQLite file. Every command goes through the same
//! `DocumentService` the bot uses, so templates, operator checks and
//! batched appends behave exactly as they do at runtime.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use encore_store::{
    CollectionSchema, Database, DocumentKey, DocumentService, SETTINGS, SqliteStore, StoreConfig,
    TrimPolicy, USERS, UpdateOperation,
};
use serde_json::{Number, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Encore document store administration.
#[derive(Parser)]
#[command(
    name = "encore",
    version,
    about = "Inspect and edit Encore's cached document collections",
    long_about = "Reads and updates the `users` and `settings` collections through the \
                  document cache and batched append writer."
)]
struct Cli {
    /// SQLite database file (falls back to ENCORE_DB_PATH, then data/encore.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML file with cache and batching settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a document, creating it from the template if missing.
    Get {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
        /// Print only this top-level field.
        #[arg(long)]
        field: Option<String>,
    },

    /// Set a field. VALUE is parsed as JSON, or taken as a plain string.
    Set {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
        path: String,
        value: String,
    },

    /// Remove a field.
    Unset {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
        path: String,
    },

    /// Add a number to a numeric field.
    Inc {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
        path: String,
        #[arg(allow_hyphen_values = true)]
        delta: Number,
    },

    /// Append values to a list field.
    Push {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
        path: String,
        #[arg(required = true)]
        values: Vec<String>,
        /// Keep only the last N elements after appending.
        #[arg(long, conflicts_with = "keep_first")]
        keep_last: Option<usize>,
        /// Keep only the first N elements after appending.
        #[arg(long)]
        keep_first: Option<usize>,
    },

    /// Remove every element equal to one of the values from a list field.
    Pull {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
        path: String,
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Delete a document.
    Delete {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
    },

    /// Queue values through the batched append writer, then flush.
    Append {
        collection: String,
        #[arg(value_parser = parse_key)]
        key: DocumentKey,
        path: String,
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Show registered collections, cache sizes and effective settings.
    Stats,

    /// Run a TTL and capacity sweep over every cache.
    Sweep,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = dotenv
        && !e.not_found()
    {
        warn!(error = %e, "failed to read .env file");
    }

    let config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => StoreConfig::default(),
    };

    let db_path = resolve_db_path(cli.db)?;
    let service = open_service(db_path, config).await?;

    let outcome = run(&service, cli.command).await;

    let flushed = service
        .stop_batch_processor()
        .await
        .context("failed to flush pending appends")?;
    if flushed > 0 {
        info!(flushed, "pending appends written");
    }

    outcome
}

async fn run(service: &DocumentService, command: Commands) -> Result<()> {
    match command {
        Commands::Get {
            collection,
            key,
            field,
        } => {
            let value = match field {
                Some(field) => service.get_field(&collection, &key, &field).await?,
                None => Value::Object(service.get(&collection, &key, false).await?),
            };
            print_json(&value)
        }
        Commands::Set {
            collection,
            key,
            path,
            value,
        } => {
            let op = UpdateOperation::set(&path, parse_value(&value))?;
            mutate(service, &collection, &key, op).await
        }
        Commands::Unset {
            collection,
            key,
            path,
        } => {
            let op = UpdateOperation::unset(&path)?;
            mutate(service, &collection, &key, op).await
        }
        Commands::Inc {
            collection,
            key,
            path,
            delta,
        } => {
            let op = UpdateOperation::increment(&path, delta)?;
            mutate(service, &collection, &key, op).await
        }
        Commands::Push {
            collection,
            key,
            path,
            values,
            keep_last,
            keep_first,
        } => {
            let trim = match (keep_first, keep_last) {
                (Some(n), _) => Some(TrimPolicy::KeepFirst(n)),
                (None, Some(n)) => Some(TrimPolicy::KeepLast(n)),
                (None, None) => None,
            };
            let op = UpdateOperation::push(&path, parse_values(&values), trim)?;
            mutate(service, &collection, &key, op).await
        }
        Commands::Pull {
            collection,
            key,
            path,
            values,
        } => {
            let op = UpdateOperation::pull(&path, parse_values(&values))?;
            mutate(service, &collection, &key, op).await
        }
        Commands::Delete { collection, key } => {
            if service.delete(&collection, &key).await? {
                println!("deleted {collection}/{key}");
            } else {
                println!("{collection}/{key} did not exist");
            }
            Ok(())
        }
        Commands::Append {
            collection,
            key,
            path,
            values,
        } => {
            let count = values.len();
            for value in parse_values(&values) {
                service
                    .enqueue_append(&collection, key.clone(), &path, value)
                    .await?;
            }
            println!("queued {count} value(s) for {collection}/{key}.{path}");
            Ok(())
        }
        Commands::Stats => {
            let config = service.config();
            println!("  Encore v{}", env!("CARGO_PKG_VERSION"));
            println!();
            for name in service.collections() {
                let cache = service.cache(name)?;
                println!("  {name:<10} entries={} {}", cache.len().await, cache.stats());
            }
            println!();
            println!("  cache ttl:        {}s", config.cache_ttl_secs);
            println!("  max entries:      {}", config.max_cache_entries);
            println!("  sweep interval:   {}s", config.sweep_interval_secs);
            println!("  batch size limit: {}", config.batch_size_limit);
            println!("  flush interval:   {}s", config.batch_flush_interval_secs);
            println!("  history keeps:    {}", config.history_keep_last);
            Ok(())
        }
        Commands::Sweep => {
            let evicted = service.sweep().await;
            println!("evicted {evicted} entries");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_service(db_path: PathBuf, config: StoreConfig) -> Result<DocumentService> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let db = Database::open_and_migrate(db_path.clone())
        .await
        .context("failed to open database")?;
    info!(path = %db_path.display(), "store initialized");

    let service = DocumentService::builder()
        .config(config)
        .collection(
            CollectionSchema::users(),
            Arc::new(SqliteStore::new(db.clone(), USERS)),
        )
        .collection(
            CollectionSchema::settings(),
            Arc::new(SqliteStore::new(db, SETTINGS)),
        )
        .build()
        .context("failed to build document service")?;
    Ok(service)
}

fn resolve_db_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    match std::env::var("ENCORE_DB_PATH") {
        Ok(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        Ok(_) => bail!("ENCORE_DB_PATH is set but empty"),
        Err(_) => Ok(PathBuf::from("data").join("encore.db")),
    }
}

async fn mutate(
    service: &DocumentService,
    collection: &str,
    key: &DocumentKey,
    op: UpdateOperation,
) -> Result<()> {
    let changed = service.mutate(collection, key, &[op]).await?;
    if changed {
        print_json(&Value::Object(service.get(collection, key, false).await?))
    } else {
        println!("{collection}/{key} unchanged");
        Ok(())
    }
}

/// Numeric ids address integer keys; anything else is a string key.
fn parse_key(raw: &str) -> Result<DocumentKey, Infallible> {
    raw.parse()
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_values(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|v| parse_value(v)).collect()
}

fn print_json(value: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render document")?;
    println!("{rendered}");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
