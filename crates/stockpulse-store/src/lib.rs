//! # StockPulse Store
//!
//! DuckDB-backed durable store for the tick pipeline.
//!
//! Holds four tables: raw ticks (`stock_ticks`), derived 1-minute bars
//! (`stock_bars_1m`), the append-only watermark ledger (`etl_runs`), and the
//! dead-letter table (`failed_events`). The ingestion sink writes ticks and
//! dead letters; the aggregation engine reads ticks and writes bars and
//! ledger rows inside one transaction per cycle. All user-provided values
//! cross the SQL boundary as query parameters.
//!
//! Timestamps are written as RFC3339 strings (`TRY_CAST(? AS TIMESTAMP)`)
//! and read back as `epoch_us(...)` microseconds, so round-trips do not
//! depend on DuckDB's textual timestamp rendering.

mod duckdb;
pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use ::duckdb::{Connection, ToSql};
use thiserror::Error;
use tracing::{info, warn};

use stockpulse_core::{Bar, DeadLetter, PersistedTick, RetryConfig, RunStatus, TickEvent, UtcDateTime};

use crate::duckdb::ConnectionPool;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The store could not be reached or the database file is in use.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row failed to map back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether a retry with backoff is worthwhile.
    ///
    /// Lock contention and I/O flavored failures are transient; constraint
    /// violations and corrupt rows are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::DuckDb(err) => {
                let message = err.to_string().to_ascii_lowercase();
                message.contains("lock")
                    || message.contains("io error")
                    || message.contains("i/o")
                    || message.contains("conflict")
            }
            Self::Corrupt(_) => false,
        }
    }
}

/// Configuration for the store database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept pooled.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: resolve_stockpulse_home()
                .join("cache")
                .join("stockpulse.duckdb"),
            max_pool_size: 4,
        }
    }
}

impl StoreConfig {
    /// Configuration pointing at an explicit database file.
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            max_pool_size: 4,
        }
    }
}

/// The durable store handle shared by the sink and the engine.
#[derive(Clone)]
pub struct TickWarehouse {
    pool: ConnectionPool,
}

impl TickWarehouse {
    /// Open a store with default configuration.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    /// Open a store, creating parent directories and applying migrations.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::new(config.db_path.clone(), config.max_pool_size);
        let warehouse = Self { pool };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Open with bounded startup retries.
    ///
    /// Used at process start where the database file may be briefly locked
    /// by another process; exhaustion is fatal to the caller.
    pub fn open_with_retry(config: StoreConfig, retry: &RetryConfig) -> Result<Self, StoreError> {
        let attempts = retry.total_attempts();
        let mut attempt = 0;
        loop {
            match Self::open(config.clone()) {
                Ok(warehouse) => {
                    info!(attempt = attempt + 1, db = %config.db_path.display(), "store opened");
                    return Ok(warehouse);
                }
                Err(err) if attempt + 1 < attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "store open failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Apply schema migrations.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Path to the database file.
    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    /// Insert one tick, committed immediately.
    ///
    /// One statement, one commit: a crash can never lose a tick that was
    /// reported persisted, and a failed statement leaves nothing behind to
    /// roll back before a retry.
    pub fn insert_tick(&self, tick: &TickEvent) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        let event_time = tick.event_time.format_rfc3339();
        let params: [&dyn ToSql; 4] = [
            &tick.symbol.as_str(),
            &tick.price,
            &tick.volume,
            &event_time,
        ];
        connection.execute(
            "INSERT INTO stock_ticks (symbol, price, volume, event_time) \
             VALUES (?, ?, ?, TRY_CAST(? AS TIMESTAMP))",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Append a rejected message to the dead-letter table.
    pub fn record_dead_letter(&self, dead: &DeadLetter) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 6] = [
            &dead.source,
            &dead.topic,
            &dead.partition,
            &dead.offset,
            &dead.payload,
            &dead.error,
        ];
        connection.execute(
            "INSERT INTO failed_events \
             (source, topic, partition_id, offset_id, raw_value, error_message) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Append a run to the `etl_runs` ledger outside any open transaction.
    ///
    /// The engine uses this to leave a `failed` row after a rolled-back
    /// cycle; watermark recovery filters on `complete`, so these rows are
    /// observability only.
    pub fn record_run(
        &self,
        source: &str,
        records_processed: i64,
        status: RunStatus,
        started_at: UtcDateTime,
        completed_at: UtcDateTime,
    ) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        record_run_on(&connection, source, records_processed, status, started_at, completed_at)
    }

    /// The authoritative watermark: `completed_at` of the latest `complete`
    /// ledger row for `source`.
    pub fn watermark(&self, source: &str) -> Result<Option<UtcDateTime>, StoreError> {
        let connection = self.pool.acquire()?;
        watermark_on(&connection, source)
    }

    /// Earliest stored tick time; the bootstrap watermark when the ledger
    /// is empty.
    pub fn earliest_tick_time(&self) -> Result<Option<UtcDateTime>, StoreError> {
        let connection = self.pool.acquire()?;
        earliest_tick_on(&connection)
    }

    /// Run `f` inside one `BEGIN`/`COMMIT` transaction.
    ///
    /// Any error rolls the whole transaction back: no partial bars, no
    /// watermark movement.
    pub fn aggregate<T>(
        &self,
        f: impl FnOnce(&AggregateTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let connection = self.pool.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = f(&AggregateTxn::new(&connection));
        finalize_transaction(&connection, result)
    }

    /// Total persisted ticks.
    pub fn tick_count(&self) -> Result<i64, StoreError> {
        let connection = self.pool.acquire()?;
        let count = connection.query_row("SELECT COUNT(*) FROM stock_ticks", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Total stored bars.
    pub fn bar_count(&self) -> Result<i64, StoreError> {
        let connection = self.pool.acquire()?;
        let count =
            connection.query_row("SELECT COUNT(*) FROM stock_bars_1m", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Total dead-lettered messages.
    pub fn dead_letter_count(&self) -> Result<i64, StoreError> {
        let connection = self.pool.acquire()?;
        let count =
            connection.query_row("SELECT COUNT(*) FROM failed_events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Fetch one bar by its key.
    pub fn bar(&self, symbol: &str, bucket_start: UtcDateTime) -> Result<Option<Bar>, StoreError> {
        let connection = self.pool.acquire()?;
        let bucket = bucket_start.format_rfc3339();
        let params: [&dyn ToSql; 2] = [&symbol, &bucket];
        let mut statement = connection.prepare(
            "SELECT symbol, epoch_us(bucket_start), open, high, low, close, volume_sum, tick_count \
             FROM stock_bars_1m WHERE symbol = ? AND bucket_start = TRY_CAST(? AS TIMESTAMP)",
        )?;
        let mut rows = statement.query(params.as_slice())?;
        match rows.next()? {
            Some(row) => Ok(Some(bar_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All bars for a symbol, ordered by bucket.
    pub fn bars(&self, symbol: &str) -> Result<Vec<Bar>, StoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 1] = [&symbol];
        let mut statement = connection.prepare(
            "SELECT symbol, epoch_us(bucket_start), open, high, low, close, volume_sum, tick_count \
             FROM stock_bars_1m WHERE symbol = ? ORDER BY bucket_start",
        )?;
        let mut rows = statement.query(params.as_slice())?;
        let mut bars = Vec::new();
        while let Some(row) = rows.next()? {
            bars.push(bar_from_row(row)?);
        }
        Ok(bars)
    }

    /// All dead letters, ordered by offset.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let connection = self.pool.acquire()?;
        let mut statement = connection.prepare(
            "SELECT source, topic, partition_id, offset_id, raw_value, error_message \
             FROM failed_events ORDER BY topic, partition_id, offset_id",
        )?;
        let mut rows = statement.query([])?;
        let mut letters = Vec::new();
        while let Some(row) = rows.next()? {
            letters.push(DeadLetter {
                source: row.get(0)?,
                topic: row.get(1)?,
                partition: row.get(2)?,
                offset: row.get(3)?,
                payload: row.get(4)?,
                error: row.get(5)?,
            });
        }
        Ok(letters)
    }
}

/// Handle to one in-flight aggregation transaction.
pub struct AggregateTxn<'conn> {
    conn: &'conn Connection,
}

impl<'conn> AggregateTxn<'conn> {
    fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Watermark read, consistent with the transaction snapshot.
    pub fn watermark(&self, source: &str) -> Result<Option<UtcDateTime>, StoreError> {
        watermark_on(self.conn, source)
    }

    /// Earliest tick time, consistent with the transaction snapshot.
    pub fn earliest_tick_time(&self) -> Result<Option<UtcDateTime>, StoreError> {
        earliest_tick_on(self.conn)
    }

    /// All ticks with `event_time` in `[from, to)`, ordered by
    /// `(event_time, seq)` — the deterministic open/close ordering.
    pub fn ticks_in_window(
        &self,
        from: UtcDateTime,
        to: UtcDateTime,
    ) -> Result<Vec<PersistedTick>, StoreError> {
        let from = from.format_rfc3339();
        let to = to.format_rfc3339();
        let params: [&dyn ToSql; 2] = [&from, &to];
        let mut statement = self.conn.prepare(
            "SELECT seq, symbol, price, volume, epoch_us(event_time) \
             FROM stock_ticks \
             WHERE event_time >= TRY_CAST(? AS TIMESTAMP) \
               AND event_time < TRY_CAST(? AS TIMESTAMP) \
             ORDER BY event_time, seq",
        )?;
        let mut rows = statement.query(params.as_slice())?;
        let mut ticks = Vec::new();
        while let Some(row) = rows.next()? {
            let micros: i64 = row.get(4)?;
            ticks.push(PersistedTick {
                seq: row.get(0)?,
                symbol: row.get(1)?,
                price: row.get(2)?,
                volume: row.get(3)?,
                event_time: micros_to_time(micros)?,
            });
        }
        Ok(ticks)
    }

    /// Full-replace upsert keyed by `(symbol, bucket_start)`.
    ///
    /// Recomputing a window from identical ticks rewrites an identical row,
    /// which is what makes re-running a cycle idempotent.
    pub fn upsert_bar(&self, bar: &Bar) -> Result<(), StoreError> {
        let bucket = bar.bucket_start.format_rfc3339();
        let params: [&dyn ToSql; 8] = [
            &bar.symbol,
            &bucket,
            &bar.open,
            &bar.high,
            &bar.low,
            &bar.close,
            &bar.volume_sum,
            &bar.tick_count,
        ];
        self.conn.execute(
            "INSERT OR REPLACE INTO stock_bars_1m \
             (symbol, bucket_start, open, high, low, close, volume_sum, tick_count, updated_at) \
             VALUES (?, TRY_CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Append a ledger row inside the transaction.
    pub fn record_run(
        &self,
        source: &str,
        records_processed: i64,
        status: RunStatus,
        started_at: UtcDateTime,
        completed_at: UtcDateTime,
    ) -> Result<(), StoreError> {
        record_run_on(self.conn, source, records_processed, status, started_at, completed_at)
    }
}

/// Finalize a transaction, committing on success or rolling back on failure.
fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn record_run_on(
    connection: &Connection,
    source: &str,
    records_processed: i64,
    status: RunStatus,
    started_at: UtcDateTime,
    completed_at: UtcDateTime,
) -> Result<(), StoreError> {
    let started = started_at.format_rfc3339();
    let completed = completed_at.format_rfc3339();
    let params: [&dyn ToSql; 5] = [
        &source,
        &records_processed,
        &status.as_str(),
        &started,
        &completed,
    ];
    connection.execute(
        "INSERT INTO etl_runs (source, records_processed, status, started_at, completed_at) \
         VALUES (?, ?, ?, TRY_CAST(? AS TIMESTAMP), TRY_CAST(? AS TIMESTAMP))",
        params.as_slice(),
    )?;
    Ok(())
}

fn watermark_on(connection: &Connection, source: &str) -> Result<Option<UtcDateTime>, StoreError> {
    let params: [&dyn ToSql; 1] = [&source];
    let mut statement = connection.prepare(
        "SELECT epoch_us(completed_at) FROM etl_runs \
         WHERE source = ? AND status = 'complete' \
         ORDER BY completed_at DESC LIMIT 1",
    )?;
    let mut rows = statement.query(params.as_slice())?;
    match rows.next()? {
        Some(row) => {
            let micros: i64 = row.get(0)?;
            Ok(Some(micros_to_time(micros)?))
        }
        None => Ok(None),
    }
}

fn earliest_tick_on(connection: &Connection) -> Result<Option<UtcDateTime>, StoreError> {
    let micros: Option<i64> = connection.query_row(
        "SELECT epoch_us(MIN(event_time)) FROM stock_ticks",
        [],
        |row| row.get(0),
    )?;
    micros.map(micros_to_time).transpose()
}

fn bar_from_row(row: &::duckdb::Row<'_>) -> Result<Bar, StoreError> {
    let micros: i64 = row.get(1)?;
    Ok(Bar {
        symbol: row.get(0)?,
        bucket_start: micros_to_time(micros)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume_sum: row.get(6)?,
        tick_count: row.get(7)?,
    })
}

fn micros_to_time(micros: i64) -> Result<UtcDateTime, StoreError> {
    UtcDateTime::from_unix_micros(micros).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn resolve_stockpulse_home() -> PathBuf {
    if let Some(path) = env::var_os("STOCKPULSE_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".stockpulse");
    }

    PathBuf::from(".stockpulse")
}
