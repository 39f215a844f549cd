use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// StockPulse: durable tick ingestion and 1-minute bar aggregation.
#[derive(Debug, Parser)]
#[command(name = "stockpulse", version, about)]
pub struct Cli {
    /// Path to the DuckDB database file. Defaults to
    /// $STOCKPULSE_HOME/cache/stockpulse.duckdb.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the database and apply schema migrations.
    Init,

    /// Drain newline-delimited JSON ticks into the store.
    Ingest(IngestArgs),

    /// Run the bar aggregation engine.
    Aggregate(AggregateArgs),

    /// Report store counts, the watermark, and dead letters.
    Status(StatusArgs),
}

#[derive(Debug, clap::Args)]
pub struct IngestArgs {
    /// Input file of one JSON tick per line; stdin when omitted.
    pub input: Option<PathBuf>,

    /// Topic name attributed to ingested messages.
    #[arg(long, default_value = "stock.ticks.v1")]
    pub topic: String,

    /// Ledger and dead-letter source label.
    #[arg(long, default_value = "consumer")]
    pub source: String,
}

#[derive(Debug, clap::Args)]
pub struct AggregateArgs {
    /// Seconds between aggregation cycles.
    #[arg(long, default_value_t = 30)]
    pub interval_secs: u64,

    /// Stop after this many cycles; run until interrupted when omitted.
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Ledger source label for this engine.
    #[arg(long, default_value = "aggregator")]
    pub source: String,
}

#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    /// Emit machine-readable JSON instead of text.
    #[arg(long)]
    pub json: bool,

    /// Ledger source whose watermark is reported.
    #[arg(long, default_value = "aggregator")]
    pub source: String,
}
