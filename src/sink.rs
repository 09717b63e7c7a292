//! External sinks that receive dispatched payloads
//!
//! A sink is non-reentrant: the queue drain is its only writer. `send` may
//! report `Blocked` when the sink is at capacity; the caller retries the same
//! payload later rather than dropping it.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SinkFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Accepted,
    Blocked,
}

pub trait Sink: Send {
    fn send(&mut self, payload: &[u8]) -> Result<SinkStatus, SinkFailure>;

    fn close(&mut self) -> Result<(), SinkFailure> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn send(&mut self, payload: &[u8]) -> Result<SinkStatus, SinkFailure> {
        (**self).send(payload)
    }

    fn close(&mut self) -> Result<(), SinkFailure> {
        (**self).close()
    }
}

/// In-memory sink, mostly for tests and dry runs.
///
/// Deliveries are visible through a [`MemorySinkHandle`] after the sink
/// itself has been handed to a drain.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    fail_after: Option<usize>,
    block_first: usize,
    attempts: usize,
}

#[derive(Debug, Clone)]
pub struct MemorySinkHandle {
    delivered: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every payload after the first `accepted` ones.
    pub fn fail_after(mut self, accepted: usize) -> Self {
        self.fail_after = Some(accepted);
        self
    }

    /// Report `Blocked` for the first `attempts` sends.
    pub fn block_first(mut self, attempts: usize) -> Self {
        self.block_first = attempts;
        self
    }

    pub fn handle(&self) -> MemorySinkHandle {
        MemorySinkHandle {
            delivered: Arc::clone(&self.delivered),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl Sink for MemorySink {
    fn send(&mut self, payload: &[u8]) -> Result<SinkStatus, SinkFailure> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkFailure::new("sink already closed"));
        }

        self.attempts += 1;
        if self.attempts <= self.block_first {
            return Ok(SinkStatus::Blocked);
        }

        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(limit) = self.fail_after {
            if delivered.len() >= limit {
                return Err(SinkFailure::new(format!(
                    "sink refused payload after {limit} deliveries"
                )));
            }
        }
        delivered.push(payload.to_vec());
        Ok(SinkStatus::Accepted)
    }

    fn close(&mut self) -> Result<(), SinkFailure> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl MemorySinkHandle {
    pub fn len(&self) -> usize {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads decoded as UTF-8; invalid bytes are replaced.
    pub fn lines(&self) -> Vec<String> {
        self.payloads()
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }
}

/// Newline-delimited payloads written to any `Write` (stdout, a file, ...).
pub struct WriterSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn send(&mut self, payload: &[u8]) -> Result<SinkStatus, SinkFailure> {
        self.writer.write_all(payload)?;
        self.writer.write_all(b"\n")?;
        Ok(SinkStatus::Accepted)
    }

    fn close(&mut self) -> Result<(), SinkFailure> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_payloads() {
        let mut sink = MemorySink::new();
        let handle = sink.handle();

        assert_eq!(sink.send(b"one").unwrap(), SinkStatus::Accepted);
        assert_eq!(sink.send(b"two").unwrap(), SinkStatus::Accepted);
        sink.close().unwrap();

        assert_eq!(handle.lines(), vec!["one", "two"]);
        assert!(handle.is_closed());
        assert!(sink.send(b"three").is_err());
    }

    #[test]
    fn test_memory_sink_fail_after() {
        let mut sink = MemorySink::new().fail_after(1);
        assert!(sink.send(b"a").is_ok());
        let err = sink.send(b"b").unwrap_err();
        assert!(err.reason.contains("after 1"));
        assert_eq!(sink.handle().len(), 1);
    }

    #[test]
    fn test_memory_sink_block_first() {
        let mut sink = MemorySink::new().block_first(2);
        assert_eq!(sink.send(b"a").unwrap(), SinkStatus::Blocked);
        assert_eq!(sink.send(b"a").unwrap(), SinkStatus::Blocked);
        assert_eq!(sink.send(b"a").unwrap(), SinkStatus::Accepted);
        assert_eq!(sink.handle().len(), 1);
    }

    #[test]
    fn test_writer_sink_newline_delimited() {
        let mut sink = WriterSink::new(Vec::new());
        sink.send(br#"{"a":1}"#).unwrap();
        sink.send(b"2").unwrap();
        sink.close().unwrap();

        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(written, "{\"a\":1}\n2\n");
    }
}
