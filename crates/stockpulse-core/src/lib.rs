//! Core contracts for stockpulse.
//!
//! This crate contains:
//! - Canonical domain models and validation
//! - Tick payload decoding
//! - Retry/backoff policy
//! - The stream abstraction consumed by the ingestion sink

pub mod decode;
pub mod domain;
pub mod error;
pub mod retry;
pub mod stream;

pub use decode::decode_tick;
pub use domain::{
    Bar, DeadLetter, PersistedTick, RunStatus, Symbol, TickEvent, UtcDateTime,
};
pub use error::ValidationError;
pub use retry::{Backoff, RetryConfig};
pub use stream::{
    in_memory_stream, InMemoryTickStream, NdjsonStream, StreamError, StreamMessage, StreamSender,
    TickStream,
};
