//! Bounded dispatch queue between workers and the external sink
//!
//! Workers push serialized records into a bounded channel; a single drain
//! pulls them out and writes them to the sink. The channel is the only
//! synchronisation point: each `send` is one critical section, and a full
//! channel blocks the sender until the drain frees a slot.
//!
//! When the sink fails fatally the drain publishes the failure, closes the
//! sink and keeps emptying the channel without delivering, so every later
//! send returns a `SinkError` and a blocked one never hangs. Every record the
//! channel accepted ends up either delivered or listed in
//! `DrainReport::undelivered`.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendError, Sender};
use crossbeam::utils::Backoff;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result, SinkError, SinkFailure};
use crate::sink::{Sink, SinkStatus};

/// Where a dispatched record came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// Partition (worker) index
    pub partition: usize,

    /// Ordinal of the source element in the input collection
    pub element: usize,

    /// Flattened path of the leaf
    pub path: String,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(partition {}, element {}, path '{}')",
            self.partition, self.element, self.path
        )
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    element: usize,
    path: &'a str,
    value: &'a Value,
}

/// One flattened leaf in its canonical wire form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub id: RecordId,
    pub payload: Vec<u8>,
}

impl DispatchRecord {
    /// Encode a leaf as compact JSON: `{"element":n,"path":"a.b","value":v}`.
    pub fn encode(id: RecordId, value: &Value) -> serde_json::Result<Self> {
        let payload = serde_json::to_vec(&Envelope {
            element: id.element,
            path: &id.path,
            value,
        })?;
        Ok(Self { id, payload })
    }
}

/// Counters shared by the queue and its drain
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Records accepted into the channel
    pub sent: AtomicU64,

    /// Records handed to the sink (or taken by a manual consumer)
    pub delivered: AtomicU64,

    /// Sends that found the channel full and had to wait
    pub backpressure_events: AtomicU64,

    /// `Blocked` answers from the sink that were retried
    pub sink_retries: AtomicU64,
}

impl QueueStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn backpressure_count(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }

    pub fn sink_retries(&self) -> u64 {
        self.sink_retries.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    capacity: usize,
    active: AtomicUsize,
    failure: Mutex<Option<SinkError>>,
    stats: QueueStats,
}

impl Shared {
    fn failure(&self) -> Option<SinkError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, err: SinkError) {
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn rejection(&self, record: RecordId) -> SinkError {
        let reason = match self.failure() {
            Some(failed) => format!("sink failed on {}: {}", failed.record, failed.reason),
            None => format!("queue '{}' has no consumer", self.name),
        };
        SinkError { record, reason }
    }
}

/// Producer side of the dispatch queue
pub struct DispatchQueue {
    sender: Sender<DispatchRecord>,
    shared: Arc<Shared>,
}

/// Consumer side of the dispatch queue
pub struct QueueDrain {
    receiver: Receiver<DispatchRecord>,
    shared: Arc<Shared>,
}

/// Marks a worker as actively sending; the queue cannot be closed while any exist.
#[derive(Debug)]
pub struct SenderGuard {
    shared: Arc<Shared>,
}

impl Drop for SenderGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of draining a queue into a sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: u64,
    pub sink_retries: u64,

    /// Fatal sink failure, tagged with the record the sink rejected
    pub failure: Option<SinkError>,

    /// Accepted by the queue but never delivered: the rejected record first,
    /// then everything that was queued or arrived until the queue closed.
    pub undelivered: Vec<RecordId>,

    /// Error from closing the sink after a failure
    pub close_error: Option<SinkFailure>,
}

impl DispatchQueue {
    /// Open a queue holding at most `capacity` undelivered records.
    pub fn open(name: impl Into<String>, capacity: usize) -> Result<(Self, QueueDrain)> {
        let name = name.into();
        if capacity == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "queue '{name}' capacity must be at least 1"
            )));
        }

        let (sender, receiver) = bounded(capacity);
        let shared = Arc::new(Shared {
            name,
            capacity,
            active: AtomicUsize::new(0),
            failure: Mutex::new(None),
            stats: QueueStats::default(),
        });

        debug!(queue = %shared.name, capacity, "Dispatch queue opened");

        Ok((
            Self {
                sender,
                shared: Arc::clone(&shared),
            },
            QueueDrain { receiver, shared },
        ))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Records currently waiting for the sink
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.shared.stats
    }

    /// Number of live sender registrations
    pub fn active_senders(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Fatal sink failure published by the drain, if any
    pub fn sink_failure(&self) -> Option<SinkError> {
        self.shared.failure()
    }

    pub fn register(&self) -> SenderGuard {
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        SenderGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Enqueue one record, blocking while the queue is full.
    pub fn send(&self, record: DispatchRecord) -> Result<(), SinkError> {
        if self.shared.failure().is_some() {
            return Err(self.shared.rejection(record.id));
        }

        if self.sender.is_full() {
            self.shared
                .stats
                .backpressure_events
                .fetch_add(1, Ordering::Relaxed);
        }

        match self.sender.send(record) {
            Ok(()) => {
                self.shared.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendError(record)) => Err(self.shared.rejection(record.id)),
        }
    }

    /// Close the producer side. Only valid once every worker has finished.
    pub fn close(self) -> Result<u64> {
        let active = self.active_senders();
        if active > 0 {
            return Err(PipelineError::PrematureClose {
                queue: self.shared.name.clone(),
                active,
            });
        }

        let sent = self.shared.stats.sent();
        debug!(queue = %self.shared.name, sent, "Dispatch queue closed");
        Ok(sent)
    }
}

impl QueueDrain {
    /// Pull every record into `sink` until the queue is closed.
    ///
    /// `Blocked` answers are retried with backoff; the record is never
    /// skipped. A fatal failure stops delivery and closes the sink; the rest
    /// of the stream is then taken off the queue and reported as undelivered.
    pub fn run<S: Sink>(self, mut sink: S) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        for record in self.receiver.iter() {
            if let Err(failure) = self.deliver(&mut sink, &record, &mut report) {
                return Ok(self.abandon(sink, record.id, failure, report));
            }
        }

        sink.close().map_err(PipelineError::SinkClose)?;
        info!(
            queue = %self.shared.name,
            delivered = report.delivered,
            retries = report.sink_retries,
            "Queue drained"
        );
        Ok(report)
    }

    fn deliver<S: Sink>(
        &self,
        sink: &mut S,
        record: &DispatchRecord,
        report: &mut DrainReport,
    ) -> std::result::Result<(), SinkFailure> {
        let backoff = Backoff::new();
        loop {
            match sink.send(&record.payload)? {
                SinkStatus::Accepted => {
                    report.delivered += 1;
                    self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                SinkStatus::Blocked => {
                    report.sink_retries += 1;
                    self.shared.stats.sink_retries.fetch_add(1, Ordering::Relaxed);
                    if backoff.is_completed() {
                        thread::sleep(Duration::from_micros(100));
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    // Sends fail fast once the failure is published. The receiver stays open
    // until every producer is gone, so a sender blocked on a full channel
    // still completes and its record is listed.
    fn abandon<S: Sink>(
        &self,
        mut sink: S,
        rejected: RecordId,
        failure: SinkFailure,
        mut report: DrainReport,
    ) -> DrainReport {
        let err = SinkError {
            record: rejected.clone(),
            reason: failure.reason,
        };
        self.shared.publish(err.clone());

        if let Err(close) = sink.close() {
            warn!(queue = %self.shared.name, error = %close, "Sink close after failure");
            report.close_error = Some(close);
        }

        report.undelivered.push(rejected);
        report
            .undelivered
            .extend(self.receiver.iter().map(|record| record.id));

        warn!(
            queue = %self.shared.name,
            error = %err,
            undelivered = report.undelivered.len(),
            "Sink failed, draining stopped"
        );
        report.failure = Some(err);
        report
    }

    /// Take the next record, blocking until one arrives or the queue closes.
    pub fn recv(&self) -> Option<DispatchRecord> {
        let record = self.receiver.recv().ok()?;
        self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DispatchRecord> {
        match self.receiver.recv_timeout(timeout) {
            Ok(record) => {
                self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
                Some(record)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<DispatchRecord> {
        let record = self.receiver.try_recv().ok()?;
        self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn record(element: usize, path: &str, value: Value) -> DispatchRecord {
        let id = RecordId {
            partition: 0,
            element,
            path: path.to_string(),
        };
        DispatchRecord::encode(id, &value).unwrap()
    }

    #[test]
    fn test_canonical_payload() {
        let rec = record(3, "a.b", json!("x"));
        assert_eq!(
            String::from_utf8(rec.payload).unwrap(),
            r#"{"element":3,"path":"a.b","value":"x"}"#
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            DispatchQueue::open("q", 0),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_send_blocks_when_full() {
        const K: usize = 3;
        let (queue, drain) = DispatchQueue::open("bp", K).unwrap();

        for i in 0..K {
            queue.send(record(i, "v", json!(i))).unwrap();
        }
        assert_eq!(queue.len(), K);

        let finished = AtomicBool::new(false);
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                queue.send(record(K, "v", json!(K))).unwrap();
                finished.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(100));
            assert!(!finished.load(Ordering::SeqCst), "send should be blocked");
            assert_eq!(queue.len(), K);

            let first = drain.recv().unwrap();
            assert_eq!(first.id.element, 0);

            blocked.join().unwrap();
            assert!(finished.load(Ordering::SeqCst));
        });

        assert_eq!(queue.len(), K);
        assert!(queue.stats().backpressure_count() >= 1);
    }

    #[test]
    fn test_fifo_order_through_drain() {
        let (queue, drain) = DispatchQueue::open("fifo", 4).unwrap();
        let sink = MemorySink::new().block_first(5);
        let handle = sink.handle();

        thread::scope(|s| {
            let drainer = s.spawn(move || drain.run(sink));
            for i in 0..20 {
                queue.send(record(i, "n", json!(i))).unwrap();
            }
            queue.close().unwrap();

            let report = drainer.join().unwrap().unwrap();
            assert_eq!(report.delivered, 20);
            assert_eq!(report.sink_retries, 5);
            assert!(report.failure.is_none());
        });

        let elements: Vec<u64> = handle
            .payloads()
            .iter()
            .map(|p| serde_json::from_slice::<Value>(p).unwrap()["element"].as_u64().unwrap())
            .collect();
        assert_eq!(elements, (0..20).collect::<Vec<u64>>());
        assert!(handle.is_closed());
    }

    #[test]
    fn test_premature_close() {
        let (queue, _drain) = DispatchQueue::open("early", 2).unwrap();
        let guard = queue.register();
        assert_eq!(queue.active_senders(), 1);

        let err = queue.close().unwrap_err();
        assert!(matches!(err, PipelineError::PrematureClose { active: 1, .. }));
        drop(guard);
    }

    #[test]
    fn test_close_after_guards_dropped() {
        let (queue, _drain) = DispatchQueue::open("done", 2).unwrap();
        {
            let _guard = queue.register();
            queue.send(record(0, "a", json!(1))).unwrap();
        }
        assert_eq!(queue.close().unwrap(), 1);
    }

    #[test]
    fn test_sink_failure_reaches_senders() {
        let (queue, drain) = DispatchQueue::open("failing", 1).unwrap();
        let sink = MemorySink::new().fail_after(2);
        let handle = sink.handle();

        let (report, accepted, published) = thread::scope(|s| {
            let drainer = s.spawn(move || drain.run(sink));

            let mut accepted = 0u64;
            let mut first_err = None;
            for i in 0..50 {
                match queue.send(record(i, "p", json!(i))) {
                    Ok(()) => accepted += 1,
                    Err(e) => {
                        first_err = Some(e);
                        break;
                    }
                }
            }
            let err = first_err.expect("sender should observe the sink failure");
            assert!(err.reason.contains("sink failed"));

            let published = queue.sink_failure();
            queue.close().unwrap();
            (drainer.join().unwrap().unwrap(), accepted, published)
        });

        let failure = report.failure.clone().expect("drain should report the failure");
        assert_eq!(failure.record.element, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(published, Some(failure));
        assert!(handle.is_closed());

        // nothing the queue accepted is unaccounted for
        assert_eq!(report.undelivered[0].element, 2);
        assert_eq!(report.delivered + report.undelivered.len() as u64, accepted);
    }

    #[test]
    fn test_sink_is_closed_after_failure() {
        let (queue, drain) = DispatchQueue::open("close-on-fail", 8).unwrap();
        let sink = MemorySink::new().fail_after(1);
        let handle = sink.handle();

        for i in 0..5 {
            queue.send(record(i, "v", json!(i))).unwrap();
        }
        queue.close().unwrap();

        let report = drain.run(sink).unwrap();
        assert!(handle.is_closed());
        assert!(report.close_error.is_none());
        assert_eq!(report.delivered, 1);

        let lost: Vec<usize> = report.undelivered.iter().map(|id| id.element).collect();
        assert_eq!(lost, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_send_without_consumer_fails_fast() {
        let (queue, drain) = DispatchQueue::open("orphan", 2).unwrap();
        drop(drain);
        let err = queue.send(record(0, "a", json!(1))).unwrap_err();
        assert!(err.reason.contains("no consumer"));
        assert_eq!(err.record.path, "a");
    }
}
