//! Stream abstraction at the ingestion boundary.
//!
//! The sink consumes any [`TickStream`]: a bounded-wait poll that yields the
//! next raw message, `None` when nothing has arrived yet, or `Disconnected`
//! when the stream has ended. Two implementations ship with the crate: an
//! mpsc-backed in-memory stream for tests and demos, and an NDJSON reader
//! over a file or stdin. A broker-backed consumer plugs in behind the same
//! trait.

use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use thiserror::Error;

/// A raw message as delivered by the stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Transport-level stream errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The stream has ended; no further messages will arrive.
    #[error("stream disconnected")]
    Disconnected,

    /// A transient transport failure; polling may be retried.
    #[error("stream transport error: {0}")]
    Transport(String),
}

/// Source of raw tick messages.
pub trait TickStream {
    /// Wait up to `wait` for the next message.
    ///
    /// `Ok(None)` means no message arrived within the wait and is not an
    /// error; the caller simply polls again.
    fn poll(&mut self, wait: Duration) -> Result<Option<StreamMessage>, StreamError>;
}

/// Producer handle for an in-memory stream. Assigns sequential offsets.
pub struct StreamSender {
    topic: String,
    partition: i32,
    next_offset: i64,
    tx: Sender<StreamMessage>,
}

impl StreamSender {
    /// Publish a payload, returning the offset it was assigned.
    pub fn send(&mut self, payload: impl Into<Vec<u8>>) -> Result<i64, StreamError> {
        let offset = self.next_offset;
        let message = StreamMessage {
            topic: self.topic.clone(),
            partition: self.partition,
            offset,
            payload: payload.into(),
        };
        self.tx
            .send(message)
            .map_err(|_| StreamError::Disconnected)?;
        self.next_offset += 1;
        Ok(offset)
    }
}

/// In-memory single-partition stream backed by an mpsc channel.
pub struct InMemoryTickStream {
    rx: Receiver<StreamMessage>,
}

/// Create a connected in-memory stream pair for the given topic.
pub fn in_memory_stream(topic: &str) -> (StreamSender, InMemoryTickStream) {
    let (tx, rx) = mpsc::channel();
    (
        StreamSender {
            topic: topic.to_owned(),
            partition: 0,
            next_offset: 0,
            tx,
        },
        InMemoryTickStream { rx },
    )
}

impl TickStream for InMemoryTickStream {
    fn poll(&mut self, wait: Duration) -> Result<Option<StreamMessage>, StreamError> {
        match self.rx.recv_timeout(wait) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::Disconnected),
        }
    }
}

/// Newline-delimited JSON stream over any buffered reader.
///
/// Each non-empty line is one message; the offset is the 0-based line
/// number, so redelivery positions are reproducible from the input file.
pub struct NdjsonStream<R: BufRead> {
    topic: String,
    reader: R,
    next_offset: i64,
}

impl<R: BufRead> NdjsonStream<R> {
    pub fn new(topic: impl Into<String>, reader: R) -> Self {
        Self {
            topic: topic.into(),
            reader,
            next_offset: 0,
        }
    }
}

impl<R: BufRead> TickStream for NdjsonStream<R> {
    fn poll(&mut self, _wait: Duration) -> Result<Option<StreamMessage>, StreamError> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|err| StreamError::Transport(err.to_string()))?;
            if read == 0 {
                return Err(StreamError::Disconnected);
            }

            let offset = self.next_offset;
            self.next_offset += 1;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }

            return Ok(Some(StreamMessage {
                topic: self.topic.clone(),
                partition: 0,
                offset,
                payload: trimmed.as_bytes().to_vec(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn in_memory_stream_delivers_in_order_with_offsets() {
        let (mut sender, mut stream) = in_memory_stream("stock.ticks.v1");
        sender.send(b"first".to_vec()).expect("send");
        sender.send(b"second".to_vec()).expect("send");

        let first = stream
            .poll(Duration::from_millis(10))
            .expect("poll")
            .expect("message");
        assert_eq!(first.offset, 0);
        assert_eq!(first.payload, b"first");
        assert_eq!(first.topic, "stock.ticks.v1");

        let second = stream
            .poll(Duration::from_millis(10))
            .expect("poll")
            .expect("message");
        assert_eq!(second.offset, 1);
    }

    #[test]
    fn in_memory_stream_times_out_without_error() {
        let (_sender, mut stream) = in_memory_stream("stock.ticks.v1");
        let polled = stream.poll(Duration::from_millis(5)).expect("poll");
        assert!(polled.is_none());
    }

    #[test]
    fn in_memory_stream_reports_disconnect_when_sender_drops() {
        let (sender, mut stream) = in_memory_stream("stock.ticks.v1");
        drop(sender);
        let err = stream.poll(Duration::from_millis(5)).expect_err("closed");
        assert_eq!(err, StreamError::Disconnected);
    }

    #[test]
    fn ndjson_stream_yields_lines_as_messages() {
        let input = Cursor::new("{\"a\":1}\n\n{\"b\":2}\n");
        let mut stream = NdjsonStream::new("stock.ticks.v1", input);

        let first = stream
            .poll(Duration::ZERO)
            .expect("poll")
            .expect("message");
        assert_eq!(first.offset, 0);
        assert_eq!(first.payload, b"{\"a\":1}");

        // Blank line is skipped but still consumes an offset.
        let second = stream
            .poll(Duration::ZERO)
            .expect("poll")
            .expect("message");
        assert_eq!(second.offset, 2);
        assert_eq!(second.payload, b"{\"b\":2}");

        let err = stream.poll(Duration::ZERO).expect_err("eof");
        assert_eq!(err, StreamError::Disconnected);
    }
}
