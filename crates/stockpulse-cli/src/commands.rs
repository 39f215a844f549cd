use std::fs::File;
use std::io::{stdin, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use stockpulse_aggregate::{AggregationEngine, CycleOutcome, EngineConfig, EngineError};
use stockpulse_core::{NdjsonStream, RetryConfig};
use stockpulse_ingest::{IngestionSink, SinkConfig};
use stockpulse_store::{StoreConfig, TickWarehouse};

use crate::cli::{AggregateArgs, Cli, Command, IngestArgs, StatusArgs};
use crate::error::CliError;

pub fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Init => init(&cli.db),
        Command::Ingest(args) => ingest(&cli.db, args),
        Command::Aggregate(args) => aggregate(&cli.db, args),
        Command::Status(args) => status(&cli.db, args),
    }
}

/// Open the store with startup retries, matching other processes that may
/// hold the database file briefly at boot.
fn open_store(db: &Option<PathBuf>) -> Result<TickWarehouse, CliError> {
    let config = match db {
        Some(path) => StoreConfig::at(path.clone()),
        None => StoreConfig::default(),
    };
    let retry = RetryConfig::fixed(Duration::from_secs(3), 9);
    Ok(TickWarehouse::open_with_retry(config, &retry)?)
}

fn init(db: &Option<PathBuf>) -> Result<(), CliError> {
    let store = open_store(db)?;
    println!("initialized {}", store.db_path().display());
    Ok(())
}

fn ingest(db: &Option<PathBuf>, args: &IngestArgs) -> Result<(), CliError> {
    let store = open_store(db)?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(stdin().lock()),
    };
    let mut stream = NdjsonStream::new(args.topic.clone(), reader);

    let mut sink = IngestionSink::new(
        store,
        SinkConfig {
            source: args.source.clone(),
            ..SinkConfig::default()
        },
    );

    let shutdown = AtomicBool::new(false);
    let report = sink.run(&mut stream, &shutdown)?;

    println!("accepted     {}", report.accepted);
    println!("rejected     {}", report.rejected);
    println!("quarantined  {}", report.quarantined);
    Ok(())
}

fn aggregate(db: &Option<PathBuf>, args: &AggregateArgs) -> Result<(), CliError> {
    let store = open_store(db)?;
    let engine = AggregationEngine::new(
        store,
        EngineConfig {
            source: args.source.clone(),
            interval: Duration::from_secs(args.interval_secs),
        },
    );

    match args.cycles {
        Some(cycles) => run_cycles(
            || engine.run_cycle(),
            cycles,
            Duration::from_secs(args.interval_secs),
        ),
        None => {
            let shutdown = AtomicBool::new(false);
            engine.run(&shutdown);
        }
    }
    Ok(())
}

/// Bounded cycle loop. A failed cycle is logged and the next one still
/// runs, matching the daemon loop; the watermark did not move, so the next
/// cycle retries the same window.
fn run_cycles<F>(mut cycle: F, cycles: u64, interval: Duration)
where
    F: FnMut() -> Result<CycleOutcome, EngineError>,
{
    for remaining in (0..cycles).rev() {
        match cycle() {
            Ok(outcome) => info!(?outcome, "cycle finished"),
            Err(err) => error!(error = %err, "cycle failed, will retry next cycle"),
        }
        if remaining > 0 {
            thread::sleep(interval);
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    db_path: String,
    ticks: i64,
    bars: i64,
    dead_letters: i64,
    watermark: Option<String>,
    earliest_tick: Option<String>,
}

fn status(db: &Option<PathBuf>, args: &StatusArgs) -> Result<(), CliError> {
    let store = open_store(db)?;

    let report = StatusReport {
        db_path: store.db_path().display().to_string(),
        ticks: store.tick_count()?,
        bars: store.bar_count()?,
        dead_letters: store.dead_letter_count()?,
        watermark: store.watermark(&args.source)?.map(|t| t.format_rfc3339()),
        earliest_tick: store.earliest_tick_time()?.map(|t| t.format_rfc3339()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("database      {}", report.db_path);
        println!("ticks         {}", report.ticks);
        println!("bars          {}", report.bars);
        println!("dead letters  {}", report.dead_letters);
        println!(
            "watermark     {}",
            report.watermark.as_deref().unwrap_or("(none)")
        );
        println!(
            "earliest tick {}",
            report.earliest_tick.as_deref().unwrap_or("(none)")
        );
    }
    Ok(())
}
