//! # StockPulse Aggregate
//!
//! Watermark-driven aggregation of raw ticks into 1-minute OHLCV bars.
//!
//! Each cycle runs as one store transaction: read the watermark, select the
//! closed window `[watermark, now truncated to minute)`, fold ticks into
//! bars, full-replace upsert each bar, and append a `complete` ledger row
//! whose `completed_at` becomes the next watermark. Any failure rolls the
//! whole cycle back, so the watermark only ever observes fully-applied
//! windows and re-running a window rewrites identical bars.
//!
//! The current (still-open) minute is never aggregated; it is picked up by
//! a later cycle once the minute closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use stockpulse_core::{Bar, PersistedTick, RunStatus, UtcDateTime};
use stockpulse_store::{StoreError, TickWarehouse};

/// Errors from an aggregation cycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration for the aggregation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ledger attribution for this engine's runs.
    pub source: String,
    /// Pause between cycles in daemon mode.
    pub interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source: String::from("aggregator"),
            interval: Duration::from_secs(30),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No ticks stored yet; there is nothing to bootstrap a watermark from.
    Idle,
    /// The watermark already covers every closed minute.
    UpToDate,
    /// A window was aggregated and the watermark advanced to `to`.
    Aggregated {
        bars: usize,
        from: UtcDateTime,
        to: UtcDateTime,
    },
}

/// The aggregation engine. One instance per store; concurrent engines over
/// the same ledger source are not supported.
pub struct AggregationEngine {
    store: TickWarehouse,
    config: EngineConfig,
}

impl AggregationEngine {
    pub fn new(store: TickWarehouse, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Run one cycle against the current wall clock.
    pub fn run_cycle(&self) -> Result<CycleOutcome, EngineError> {
        self.run_cycle_at(UtcDateTime::now())
    }

    /// Run one cycle with an explicit `now`, for deterministic scheduling.
    pub fn run_cycle_at(&self, now: UtcDateTime) -> Result<CycleOutcome, EngineError> {
        let cycle = Uuid::new_v4();
        let source = self.config.source.as_str();

        let result = self.store.aggregate(|txn| {
            let from = match txn.watermark(source)? {
                Some(watermark) => watermark,
                None => match txn.earliest_tick_time()? {
                    Some(earliest) => earliest,
                    None => return Ok(CycleOutcome::Idle),
                },
            };

            let to = now.truncate_to_minute();
            if from >= to {
                return Ok(CycleOutcome::UpToDate);
            }

            let ticks = txn.ticks_in_window(from, to)?;
            let bars = compute_bars(&ticks);
            for bar in &bars {
                txn.upsert_bar(bar)?;
            }
            txn.record_run(source, bars.len() as i64, RunStatus::Complete, now, to)?;

            Ok(CycleOutcome::Aggregated {
                bars: bars.len(),
                from,
                to,
            })
        });

        match &result {
            Ok(CycleOutcome::Idle) => debug!(%cycle, "no ticks yet, nothing to aggregate"),
            Ok(CycleOutcome::UpToDate) => debug!(%cycle, "watermark up to date"),
            Ok(CycleOutcome::Aggregated { bars, from, to }) => info!(
                %cycle,
                bars,
                from = %from,
                to = %to,
                "aggregation cycle complete"
            ),
            Err(err) => {
                error!(%cycle, error = %err, "aggregation cycle failed, rolled back");
                // Ledger row for observability; the watermark ignores it.
                if let Err(ledger_err) =
                    self.store
                        .record_run(source, 0, RunStatus::Failed, now, now)
                {
                    error!(%cycle, error = %ledger_err, "failed to record failed run");
                }
            }
        }

        result.map_err(EngineError::from)
    }

    /// Run cycles on the configured interval until `shutdown` is raised.
    ///
    /// A failed cycle is logged and the loop continues; the next cycle
    /// retries the same window because the watermark did not move.
    pub fn run(&self, shutdown: &AtomicBool) {
        info!(source = %self.config.source, interval_secs = self.config.interval.as_secs(), "aggregation engine started");
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.run_cycle() {
                error!(error = %err, "cycle failed, will retry next interval");
            }
            sleep_interruptible(self.config.interval, shutdown);
        }
        info!(source = %self.config.source, "aggregation engine stopped");
    }
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
}

struct BarAcc {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume_sum: i64,
    tick_count: i64,
}

/// Fold ticks into 1-minute bars.
///
/// Ticks are ordered by `(event_time, seq)` before folding, so open and
/// close are deterministic even when ticks share a timestamp. Buckets with
/// no ticks produce no bar.
pub fn compute_bars(ticks: &[PersistedTick]) -> Vec<Bar> {
    let mut ordered: Vec<&PersistedTick> = ticks.iter().collect();
    ordered.sort_by_key(|tick| (tick.event_time, tick.seq));

    let mut buckets: BTreeMap<(String, UtcDateTime), BarAcc> = BTreeMap::new();
    for tick in ordered {
        let bucket = tick.event_time.truncate_to_minute();
        buckets
            .entry((tick.symbol.clone(), bucket))
            .and_modify(|acc| {
                acc.high = acc.high.max(tick.price);
                acc.low = acc.low.min(tick.price);
                acc.close = tick.price;
                acc.volume_sum += tick.volume;
                acc.tick_count += 1;
            })
            .or_insert(BarAcc {
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume_sum: tick.volume,
                tick_count: 1,
            });
    }

    buckets
        .into_iter()
        .map(|((symbol, bucket_start), acc)| Bar {
            symbol,
            bucket_start,
            open: acc.open,
            high: acc.high,
            low: acc.low,
            close: acc.close,
            volume_sum: acc.volume_sum,
            tick_count: acc.tick_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockpulse_core::{Symbol, TickEvent};
    use stockpulse_store::StoreConfig;
    use tempfile::tempdir;

    fn at(value: &str) -> UtcDateTime {
        UtcDateTime::parse(value).expect("timestamp")
    }

    fn persisted(seq: i64, symbol: &str, price: f64, volume: i64, event_time: &str) -> PersistedTick {
        PersistedTick {
            seq,
            symbol: symbol.to_owned(),
            price,
            volume,
            event_time: at(event_time),
        }
    }

    fn open_temp(dir: &tempfile::TempDir) -> TickWarehouse {
        TickWarehouse::open(StoreConfig::at(dir.path().join("stockpulse.duckdb")))
            .expect("store open")
    }

    fn insert(store: &TickWarehouse, symbol: &str, price: f64, volume: i64, event_time: &str) {
        let tick = TickEvent::new(
            Symbol::new(symbol).expect("symbol"),
            price,
            Some(volume),
            at(event_time),
        )
        .expect("tick");
        store.insert_tick(&tick).expect("insert");
    }

    #[test]
    fn compute_bars_folds_ohlcv_for_one_minute() {
        let ticks = vec![
            persisted(1, "AAPL", 190.50, 10, "2026-03-01T10:00:00Z"),
            persisted(2, "AAPL", 190.75, 5, "2026-03-01T10:00:15Z"),
            persisted(3, "AAPL", 190.25, 20, "2026-03-01T10:00:59Z"),
        ];

        let bars = compute_bars(&ticks);
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.symbol, "AAPL");
        assert_eq!(bar.bucket_start, at("2026-03-01T10:00:00Z"));
        assert_eq!(bar.open, 190.50);
        assert_eq!(bar.high, 190.75);
        assert_eq!(bar.low, 190.25);
        assert_eq!(bar.close, 190.25);
        assert_eq!(bar.volume_sum, 35);
        assert_eq!(bar.tick_count, 3);
    }

    #[test]
    fn compute_bars_single_tick_has_equal_ohlc() {
        let bars = compute_bars(&[persisted(1, "MSFT", 300.0, 7, "2026-03-01T10:02:30Z")]);
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.open, 300.0);
        assert_eq!(bar.high, 300.0);
        assert_eq!(bar.low, 300.0);
        assert_eq!(bar.close, 300.0);
        assert_eq!(bar.tick_count, 1);
    }

    #[test]
    fn compute_bars_breaks_timestamp_ties_by_seq() {
        // Deliberately unsorted input; seq 1 is the open, seq 3 the close.
        let ticks = vec![
            persisted(3, "AAPL", 3.0, 0, "2026-03-01T10:00:30Z"),
            persisted(1, "AAPL", 1.0, 0, "2026-03-01T10:00:30Z"),
            persisted(2, "AAPL", 2.0, 0, "2026-03-01T10:00:30Z"),
        ];

        let bars = compute_bars(&ticks);
        assert_eq!(bars[0].open, 1.0);
        assert_eq!(bars[0].close, 3.0);
    }

    #[test]
    fn compute_bars_separates_symbols_and_buckets() {
        let ticks = vec![
            persisted(1, "AAPL", 190.0, 1, "2026-03-01T10:00:10Z"),
            persisted(2, "MSFT", 300.0, 1, "2026-03-01T10:00:20Z"),
            persisted(3, "AAPL", 191.0, 1, "2026-03-01T10:01:10Z"),
        ];

        let bars = compute_bars(&ticks);
        assert_eq!(bars.len(), 3);
        // BTreeMap order: symbol then bucket.
        assert_eq!(bars[0].symbol, "AAPL");
        assert_eq!(bars[0].bucket_start, at("2026-03-01T10:00:00Z"));
        assert_eq!(bars[1].symbol, "AAPL");
        assert_eq!(bars[1].bucket_start, at("2026-03-01T10:01:00Z"));
        assert_eq!(bars[2].symbol, "MSFT");
    }

    #[test]
    fn compute_bars_of_nothing_is_empty() {
        assert!(compute_bars(&[]).is_empty());
    }

    #[test]
    fn cycle_is_idle_on_empty_store() {
        let temp = tempdir().expect("tempdir");
        let engine = AggregationEngine::new(open_temp(&temp), EngineConfig::default());

        let outcome = engine.run_cycle_at(at("2026-03-01T10:05:00Z")).expect("cycle");
        assert_eq!(outcome, CycleOutcome::Idle);
        assert!(engine.store.watermark("aggregator").expect("watermark").is_none());
    }

    #[test]
    fn bootstrap_aggregates_from_earliest_tick() {
        let temp = tempdir().expect("tempdir");
        let store = open_temp(&temp);
        insert(&store, "AAPL", 190.50, 10, "2026-03-01T10:00:00Z");
        insert(&store, "AAPL", 190.75, 5, "2026-03-01T10:00:15Z");
        insert(&store, "AAPL", 190.25, 20, "2026-03-01T10:00:59Z");

        let engine = AggregationEngine::new(store.clone(), EngineConfig::default());
        let now = at("2026-03-01T10:02:10Z");
        let outcome = engine.run_cycle_at(now).expect("cycle");

        assert_eq!(
            outcome,
            CycleOutcome::Aggregated {
                bars: 1,
                from: at("2026-03-01T10:00:00Z"),
                to: at("2026-03-01T10:02:00Z"),
            }
        );

        let bar = store
            .bar("AAPL", at("2026-03-01T10:00:00Z"))
            .expect("bar")
            .expect("present");
        assert_eq!(bar.open, 190.50);
        assert_eq!(bar.high, 190.75);
        assert_eq!(bar.low, 190.25);
        assert_eq!(bar.close, 190.25);
        assert_eq!(bar.volume_sum, 35);
        assert_eq!(bar.tick_count, 3);

        let watermark = store.watermark("aggregator").expect("watermark").expect("set");
        assert_eq!(watermark, at("2026-03-01T10:02:00Z"));
    }

    #[test]
    fn second_cycle_at_same_clock_is_up_to_date() {
        let temp = tempdir().expect("tempdir");
        let store = open_temp(&temp);
        insert(&store, "AAPL", 190.5, 10, "2026-03-01T10:00:00Z");

        let engine = AggregationEngine::new(store.clone(), EngineConfig::default());
        let now = at("2026-03-01T10:02:00Z");
        engine.run_cycle_at(now).expect("first cycle");
        let outcome = engine.run_cycle_at(now).expect("second cycle");

        assert_eq!(outcome, CycleOutcome::UpToDate);
        assert_eq!(store.bar_count().expect("count"), 1);
        assert_eq!(
            store.watermark("aggregator").expect("watermark"),
            Some(at("2026-03-01T10:02:00Z"))
        );
    }

    #[test]
    fn empty_window_still_advances_watermark() {
        let temp = tempdir().expect("tempdir");
        let store = open_temp(&temp);
        insert(&store, "AAPL", 190.5, 10, "2026-03-01T10:00:30Z");

        let engine = AggregationEngine::new(store.clone(), EngineConfig::default());
        engine.run_cycle_at(at("2026-03-01T10:01:00Z")).expect("first");

        // No new ticks; a later cycle aggregates an empty window.
        let outcome = engine.run_cycle_at(at("2026-03-01T10:05:00Z")).expect("second");
        assert_eq!(
            outcome,
            CycleOutcome::Aggregated {
                bars: 0,
                from: at("2026-03-01T10:01:00Z"),
                to: at("2026-03-01T10:05:00Z"),
            }
        );
        assert_eq!(
            store.watermark("aggregator").expect("watermark"),
            Some(at("2026-03-01T10:05:00Z"))
        );
    }

    #[test]
    fn open_minute_is_never_aggregated() {
        let temp = tempdir().expect("tempdir");
        let store = open_temp(&temp);
        insert(&store, "AAPL", 190.5, 10, "2026-03-01T10:05:30Z");

        let engine = AggregationEngine::new(store.clone(), EngineConfig::default());
        // The only tick sits in the minute that is still open at `now`.
        let outcome = engine.run_cycle_at(at("2026-03-01T10:05:45Z")).expect("cycle");

        assert_eq!(outcome, CycleOutcome::UpToDate);
        assert_eq!(store.bar_count().expect("count"), 0);

        // Once the minute closes it gets aggregated.
        let outcome = engine.run_cycle_at(at("2026-03-01T10:06:05Z")).expect("cycle");
        assert_eq!(
            outcome,
            CycleOutcome::Aggregated {
                bars: 1,
                from: at("2026-03-01T10:05:30Z"),
                to: at("2026-03-01T10:06:00Z"),
            }
        );
    }

    #[test]
    fn late_tick_behind_watermark_is_not_reaggregated() {
        // Watermark moved past 10:00; a tick landing before it stays out of
        // future windows. Monotonic watermark, documented trade-off.
        let temp = tempdir().expect("tempdir");
        let store = open_temp(&temp);
        insert(&store, "AAPL", 190.5, 10, "2026-03-01T10:00:30Z");

        let engine = AggregationEngine::new(store.clone(), EngineConfig::default());
        engine.run_cycle_at(at("2026-03-01T10:02:00Z")).expect("first");

        insert(&store, "AAPL", 999.0, 1, "2026-03-01T10:00:45Z");
        engine.run_cycle_at(at("2026-03-01T10:03:00Z")).expect("second");

        let bar = store
            .bar("AAPL", at("2026-03-01T10:00:00Z"))
            .expect("bar")
            .expect("present");
        assert_eq!(bar.tick_count, 1);
        assert_eq!(bar.close, 190.5);
    }

    #[test]
    fn watermark_only_moves_forward() {
        let temp = tempdir().expect("tempdir");
        let store = open_temp(&temp);
        insert(&store, "AAPL", 190.5, 10, "2026-03-01T10:00:00Z");

        let engine = AggregationEngine::new(store.clone(), EngineConfig::default());
        engine.run_cycle_at(at("2026-03-01T10:05:00Z")).expect("first");

        // A cycle against an earlier clock must not regress the watermark.
        let outcome = engine.run_cycle_at(at("2026-03-01T10:03:00Z")).expect("stale");
        assert_eq!(outcome, CycleOutcome::UpToDate);
        assert_eq!(
            store.watermark("aggregator").expect("watermark"),
            Some(at("2026-03-01T10:05:00Z"))
        );
    }
}
