//! Fork-join worker pool
//!
//! One worker per partition, all started together on a dedicated rayon pool
//! and all joined before `run` returns. Workers share nothing but the
//! dispatch queue. Each element is flattened on its own and every leaf is
//! dispatched tagged with the element's ordinal, so two elements with the
//! same paths never overwrite one another.

use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchQueue, DispatchRecord, DrainReport, RecordId};
use crate::error::{ElementError, PipelineError, Result, SinkError, StructuralError};
use crate::flattener::{leaf_count, Flattener, DEFAULT_MAX_DEPTH};
use crate::partitioner::{partition, Partition};
use crate::sink::Sink;

/// What one worker did with its partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub index: usize,

    /// Ordinal of the partition's first element
    pub offset: usize,

    pub len: usize,

    /// Records from this partition that reached the sink. Counted on queue
    /// acceptance, then reduced by whatever the drain could not deliver.
    pub records_sent: u64,

    /// Elements whose records were all delivered
    pub elements_completed: usize,

    /// Elements skipped because their tree was malformed
    pub element_errors: Vec<ElementError>,

    /// Send failure that stopped this worker
    pub sink_error: Option<SinkError>,

    /// Element the worker was on when its send failed
    pub stopped_at: Option<usize>,

    /// Elements with at least one queued record the sink never took, ascending
    pub undelivered: Vec<usize>,
}

impl PartitionReport {
    fn new<T>(part: &Partition<'_, T>) -> Self {
        Self {
            index: part.index,
            offset: part.offset,
            len: part.len(),
            records_sent: 0,
            elements_completed: 0,
            element_errors: Vec::new(),
            sink_error: None,
            stopped_at: None,
            undelivered: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.element_errors.is_empty() && self.sink_error.is_none() && self.undelivered.is_empty()
    }

    /// Ordinals that did not reach the sink in full and need a re-run, ascending.
    pub fn unfinished_elements(&self) -> Vec<usize> {
        let mut ordinals: Vec<usize> = self.element_errors.iter().map(|e| e.element).collect();
        ordinals.extend(&self.undelivered);
        if let Some(stopped) = self.stopped_at {
            ordinals.extend(stopped..self.offset + self.len);
        }
        ordinals.sort_unstable();
        ordinals.dedup();
        ordinals
    }

    /// Leaves of malformed elements that were never emitted
    pub fn leaves_dropped(&self) -> usize {
        self.element_errors.iter().map(|e| e.leaves).sum()
    }

    fn record_undelivered(&mut self, id: &RecordId) {
        self.records_sent = self.records_sent.saturating_sub(1);
        if self.undelivered.contains(&id.element) {
            return;
        }
        self.undelivered.push(id.element);
        self.undelivered.sort_unstable();

        // The element the worker stopped on was never counted as completed.
        if self.stopped_at.map_or(true, |stopped| id.element < stopped) {
            self.elements_completed = self.elements_completed.saturating_sub(1);
        }
    }
}

/// Aggregate result of one pool run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub records_sent: u64,
    pub partitions: Vec<PartitionReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.partitions.iter().all(PartitionReport::is_success)
    }

    pub fn failed_partitions(&self) -> impl Iterator<Item = &PartitionReport> {
        self.partitions.iter().filter(|p| !p.is_success())
    }

    pub fn element_errors(&self) -> impl Iterator<Item = &ElementError> {
        self.partitions.iter().flat_map(|p| p.element_errors.iter())
    }

    pub fn sink_errors(&self) -> impl Iterator<Item = &SinkError> {
        self.partitions.iter().filter_map(|p| p.sink_error.as_ref())
    }

    /// Elements that did not make it to the sink in full
    pub fn elements_failed(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.unfinished_elements().len())
            .sum()
    }

    pub fn leaves_dropped(&self) -> usize {
        self.partitions.iter().map(PartitionReport::leaves_dropped).sum()
    }

    /// Charge records the drain gave up on back to their partitions.
    pub fn apply_undelivered(&mut self, undelivered: &[RecordId]) {
        for id in undelivered {
            if let Some(report) = self.partitions.get_mut(id.partition) {
                report.record_undelivered(id);
            }
        }
        self.records_sent = self.partitions.iter().map(|p| p.records_sent).sum();
    }

    pub fn records_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.records_sent as f64 / secs
        } else {
            0.0
        }
    }
}

/// Pool run plus what the drain delivered
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub summary: RunSummary,
    pub drain: DrainReport,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.summary.is_success() && self.drain.failure.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    flattener: Flattener,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            workers,
            flattener: Flattener::new(DEFAULT_MAX_DEPTH),
        })
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.flattener = Flattener::new(max_depth);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Flatten `collection` across the workers and push every leaf into `queue`.
    ///
    /// Something must be draining `queue` concurrently, otherwise workers
    /// block once it fills up.
    pub fn run(&self, collection: &[Value], queue: &DispatchQueue) -> Result<RunSummary> {
        let start = Instant::now();
        let partitions = partition(collection, self.workers)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("fanout-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot build worker pool: {e}")))?;

        info!(
            workers = self.workers,
            elements = collection.len(),
            queue = queue.name(),
            "Starting worker pool"
        );

        let partitions: Vec<PartitionReport> = pool.install(|| {
            partitions
                .par_iter()
                .map(|part| self.run_partition(part, queue))
                .collect()
        });

        let summary = RunSummary {
            records_sent: partitions.iter().map(|p| p.records_sent).sum(),
            partitions,
            elapsed: start.elapsed(),
        };

        if summary.is_success() {
            info!(
                records = summary.records_sent,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Worker pool finished"
            );
        } else {
            warn!(
                records = summary.records_sent,
                failed_partitions = summary.failed_partitions().count(),
                failed_elements = summary.elements_failed(),
                "Worker pool finished with errors"
            );
        }

        Ok(summary)
    }

    fn run_partition(&self, part: &Partition<'_, Value>, queue: &DispatchQueue) -> PartitionReport {
        let _guard = queue.register();
        let mut report = PartitionReport::new(part);

        debug!(partition = part.index, offset = part.offset, len = part.len(), "Worker started");

        for (ordinal, element) in part.iter() {
            let records = match self.flatten_element(part.index, ordinal, element) {
                Ok(records) => records,
                Err(error) => {
                    let leaves = leaf_count(element);
                    warn!(
                        partition = part.index,
                        element = ordinal,
                        leaves,
                        %error,
                        "Skipping malformed element"
                    );
                    report.element_errors.push(ElementError {
                        element: ordinal,
                        leaves,
                        error,
                    });
                    continue;
                }
            };

            for record in records {
                if let Err(err) = queue.send(record) {
                    warn!(partition = part.index, error = %err, "Worker stopped on sink error");
                    report.sink_error = Some(err);
                    report.stopped_at = Some(ordinal);
                    return report;
                }
                report.records_sent += 1;
            }
            report.elements_completed += 1;
        }

        debug!(partition = part.index, records = report.records_sent, "Worker finished");
        report
    }

    // Whole element is encoded before its first send so a bad leaf never
    // leaves half an element in the queue.
    fn flatten_element(
        &self,
        partition: usize,
        element: usize,
        node: &Value,
    ) -> Result<Vec<DispatchRecord>, StructuralError> {
        let flat = self.flattener.flatten(node)?;
        let mut records = Vec::with_capacity(flat.len());

        for (path, value) in flat {
            let id = RecordId {
                partition,
                element,
                path,
            };
            let path_for_error = id.path.clone();
            let record = DispatchRecord::encode(id, &value).map_err(|e| {
                StructuralError::Unencodable {
                    path: path_for_error,
                    reason: e.to_string(),
                }
            })?;
            records.push(record);
        }

        Ok(records)
    }

    /// Open a queue, drain it into `sink` on its own thread, run the pool,
    /// then close the queue and join the drain.
    pub fn dispatch<S: Sink>(
        &self,
        collection: &[Value],
        queue_name: &str,
        capacity: usize,
        sink: S,
    ) -> Result<DispatchOutcome> {
        let (queue, drain) = DispatchQueue::open(queue_name, capacity)?;

        thread::scope(|scope| {
            let drainer = thread::Builder::new()
                .name("fanout-drain".to_string())
                .spawn_scoped(scope, move || drain.run(sink))?;

            let summary = self.run(collection, &queue);
            // Always close so the drain sees the end of the stream.
            let closed = queue.close();
            let drained = drainer.join().map_err(|_| PipelineError::DrainPanicked)?;

            let mut summary = summary?;
            closed?;
            let drain = drained?;

            if let Some(failure) = &drain.failure {
                summary.apply_undelivered(&drain.undelivered);
                warn!(
                    error = %failure,
                    undelivered = drain.undelivered.len(),
                    failed_elements = summary.elements_failed(),
                    "Sink rejected a record"
                );
            }

            Ok(DispatchOutcome { summary, drain })
        })
    }
}
