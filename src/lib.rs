//! json_fanout: flatten JSON document collections into `path -> value`
//! records, fan them out across a fork-join worker pool into a bounded
//! dispatch queue, or count leaf values by their canonical form.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flattener;
pub mod log;
pub mod partitioner;
pub mod pool;
pub mod sample;
pub mod sink;

pub use crate::aggregate::{fingerprint, Aggregation, Aggregator};
pub use crate::config::{Mode, PipelineConfig};
pub use crate::dispatch::{DispatchQueue, DispatchRecord, DrainReport, QueueDrain, RecordId};
pub use crate::error::{ElementError, PipelineError, Result, SinkError, SinkFailure, StructuralError};
pub use crate::flattener::{flatten, into_collection, leaf_count, Flattener, RecordSet};
pub use crate::partitioner::{partition, Partition};
pub use crate::pool::{DispatchOutcome, PartitionReport, RunSummary, WorkerPool};
pub use crate::sink::{MemorySink, Sink, SinkStatus, WriterSink};
