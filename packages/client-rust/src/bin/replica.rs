//! Offline inspection of a replica database file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use replica_client::{LocalStore, SearchIndex};
use replica_core::Key;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "replica")]
#[command(about = "Inspect a local replica database", long_about = None)]
struct Cli {
    /// Path to the replica database file.
    #[arg(long, env = "REPLICA_DB")]
    db: PathBuf,

    /// Emit JSON instead of text, for both output and logs.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print schema version, watermark and per-table counts.
    Inspect,
    /// Query the persisted search index of a table.
    Search {
        table: String,
        query: String,
        #[arg(long, value_enum, default_value_t = Mode::Prefix)]
        mode: Mode,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Prefix,
    Contains,
    Closest,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Inspect => inspect(&cli.db, cli.json),
        Command::Search {
            table,
            query,
            mode,
            limit,
        } => search(&cli.db, &table, &query, mode, limit, cli.json),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn inspect(db: &Path, json: bool) -> Result<()> {
    let summary = LocalStore::inspect(db).with_context(|| format!("reading {}", db.display()))?;
    info!(tables = summary.tables.len(), "store inspected");

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("schema version: {}", summary.schema_version);
    println!("watermark:      {}", summary.watermark);
    for table in &summary.tables {
        let search = table
            .search_nodes
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        println!(
            "{:<24} rows={:<8} pending={:<6} search_nodes={search}",
            table.name, table.rows, table.pending
        );
    }
    Ok(())
}

fn search(db: &Path, table: &str, query: &str, mode: Mode, limit: usize, json: bool) -> Result<()> {
    let trie = SearchIndex::inspect(db, table).with_context(|| format!("reading {}", db.display()))?;
    let keys: Vec<Key> = match mode {
        Mode::Prefix => trie.starts_with(query).into_iter().take(limit).collect(),
        Mode::Contains => trie.contains_text(query).into_iter().take(limit).collect(),
        Mode::Closest => trie.closest(query, limit),
    };
    info!(table, nodes = trie.node_count(), matches = keys.len(), "search index queried");

    if json {
        println!("{}", serde_json::to_string(&keys)?);
    } else {
        for key in &keys {
            println!("{key}");
        }
    }
    Ok(())
}
