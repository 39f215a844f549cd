//! # StockPulse Ingest
//!
//! The ingestion sink: drains a [`TickStream`] into the durable store.
//!
//! Per message, exactly one of three outcomes:
//! - **Accepted**: decoded, validated, and committed to `stock_ticks`.
//! - **Rejected**: malformed or invalid payload, quarantined to
//!   `failed_events` with the validation error.
//! - **Quarantined**: valid payload the store refused after bounded
//!   retries, quarantined with the storage error.
//!
//! A message is never silently dropped. The only way the sink halts with an
//! error is when the dead-letter write itself fails, because at that point
//! continuing would drop data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stockpulse_core::{
    decode_tick, DeadLetter, RetryConfig, StreamError, StreamMessage, TickStream,
};
use stockpulse_store::{StoreError, TickWarehouse};

/// Persistence operations the sink needs from a store.
///
/// [`TickWarehouse`] is the production implementation; tests substitute
/// failure-injecting fakes.
pub trait SinkStore {
    fn insert_tick(&self, tick: &stockpulse_core::TickEvent) -> Result<(), StoreError>;
    fn record_dead_letter(&self, dead: &DeadLetter) -> Result<(), StoreError>;
}

impl SinkStore for TickWarehouse {
    fn insert_tick(&self, tick: &stockpulse_core::TickEvent) -> Result<(), StoreError> {
        TickWarehouse::insert_tick(self, tick)
    }

    fn record_dead_letter(&self, dead: &DeadLetter) -> Result<(), StoreError> {
        TickWarehouse::record_dead_letter(self, dead)
    }
}

/// Configuration for the ingestion sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Ledger and dead-letter attribution for this sink.
    pub source: String,
    /// How long one poll waits for a message before returning empty.
    pub poll_wait: Duration,
    /// Retry policy for transient store failures on insert.
    pub insert_retry: RetryConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            source: String::from("consumer"),
            poll_wait: Duration::from_secs(1),
            insert_retry: RetryConfig::default(),
        }
    }
}

/// Errors that halt the sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The dead-letter write failed; the message could not be preserved
    /// anywhere, so the sink must stop rather than drop it.
    #[error("dead-letter write failed, halting to avoid data loss")]
    DeadLetter(#[source] StoreError),
}

/// How the sink disposed of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Persisted to `stock_ticks`.
    Accepted,
    /// Invalid payload, preserved in `failed_events`.
    Rejected,
    /// Valid payload the store refused, preserved in `failed_events`.
    Quarantined,
}

/// Counters for one sink session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub accepted: u64,
    pub rejected: u64,
    pub quarantined: u64,
    /// Transient insert failures that were retried, successfully or not.
    pub retried: u64,
}

impl SinkReport {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected + self.quarantined
    }
}

/// Stream-to-store ingestion sink.
pub struct IngestionSink<S: SinkStore> {
    store: S,
    config: SinkConfig,
    report: SinkReport,
}

impl<S: SinkStore> IngestionSink<S> {
    pub fn new(store: S, config: SinkConfig) -> Self {
        Self {
            store,
            config,
            report: SinkReport::default(),
        }
    }

    /// Counters accumulated so far.
    pub fn report(&self) -> SinkReport {
        self.report
    }

    /// Drain the stream until it disconnects or `shutdown` is raised.
    ///
    /// Transport errors are logged and polling continues; disconnection ends
    /// the session cleanly.
    pub fn run<T: TickStream>(
        &mut self,
        stream: &mut T,
        shutdown: &AtomicBool,
    ) -> Result<SinkReport, SinkError> {
        let session = Uuid::new_v4();
        info!(%session, source = %self.config.source, "ingestion sink started");

        while !shutdown.load(Ordering::Relaxed) {
            match stream.poll(self.config.poll_wait) {
                Ok(Some(message)) => {
                    self.process_message(&message)?;
                }
                Ok(None) => {}
                Err(StreamError::Disconnected) => {
                    info!(%session, "stream disconnected, ending session");
                    break;
                }
                Err(StreamError::Transport(detail)) => {
                    warn!(%session, error = %detail, "transport error, continuing to poll");
                }
            }
        }

        info!(
            %session,
            accepted = self.report.accepted,
            rejected = self.report.rejected,
            quarantined = self.report.quarantined,
            retried = self.report.retried,
            "ingestion sink stopped"
        );
        Ok(self.report)
    }

    /// Dispose of one message: persist it, or preserve it in the
    /// dead-letter table with the reason.
    pub fn process_message(&mut self, message: &StreamMessage) -> Result<MessageOutcome, SinkError> {
        let tick = match decode_tick(&message.payload) {
            Ok(tick) => tick,
            Err(err) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "rejecting invalid message"
                );
                self.quarantine(message, &err.to_string())?;
                self.report.rejected += 1;
                return Ok(MessageOutcome::Rejected);
            }
        };

        match self.insert_with_retry(&tick, message) {
            Ok(()) => {
                debug!(
                    symbol = %tick.symbol,
                    offset = message.offset,
                    "tick persisted"
                );
                self.report.accepted += 1;
                Ok(MessageOutcome::Accepted)
            }
            Err(err) => {
                let attempts = self.config.insert_retry.total_attempts();
                error!(
                    symbol = %tick.symbol,
                    offset = message.offset,
                    attempts,
                    error = %err,
                    "quarantining tick after storage failure"
                );
                let reason = format!("storage failure after {attempts} attempt(s): {err}");
                self.quarantine(message, &reason)?;
                self.report.quarantined += 1;
                Ok(MessageOutcome::Quarantined)
            }
        }
    }

    /// Insert with bounded backoff on transient store errors. Permanent
    /// errors fail immediately.
    fn insert_with_retry(
        &mut self,
        tick: &stockpulse_core::TickEvent,
        message: &StreamMessage,
    ) -> Result<(), StoreError> {
        let attempts = self.config.insert_retry.total_attempts();
        let mut attempt = 0;
        loop {
            match self.store.insert_tick(tick) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.config.insert_retry.delay_for_attempt(attempt);
                    warn!(
                        offset = message.offset,
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient insert failure, backing off"
                    );
                    self.report.retried += 1;
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn quarantine(&self, message: &StreamMessage, reason: &str) -> Result<(), SinkError> {
        let dead = DeadLetter {
            source: self.config.source.clone(),
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            error: reason.to_owned(),
        };
        self.store
            .record_dead_letter(&dead)
            .map_err(SinkError::DeadLetter)
    }
}
