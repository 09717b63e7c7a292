//! Error types for json_fanout
//!
//! Configuration and queue-contract violations are fatal to a run. Structural
//! errors stay local to one element and sink errors stay local to one worker;
//! both are reported back through the run summary instead of aborting.

use crate::dispatch::RecordId;
use thiserror::Error;

/// Top-level error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Worker count, queue capacity or depth limit rejected before any work starts
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed document tree
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    /// The sink rejected a record
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// The sink failed while being closed
    #[error("Sink close failed: {0}")]
    SinkClose(SinkFailure),

    /// Queue closed while workers still held sender registrations
    #[error("Queue '{queue}' closed while {active} worker(s) were still sending")]
    PrematureClose { queue: String, active: usize },

    /// Drain thread panicked before reporting
    #[error("Queue drain thread panicked")]
    DrainPanicked,

    /// Configuration source could not be read or deserialized
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Problems with the shape of a single document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// Nesting went past the configured limit
    #[error("nesting exceeds {limit} levels at '{path}'")]
    DepthExceeded { limit: usize, path: String },

    /// Two distinct leaves flattened to the same dotted path
    #[error("more than one leaf flattens to path '{path}'")]
    PathCollision { path: String },

    /// A leaf could not be turned into its canonical string
    #[error("leaf at '{path}' could not be encoded: {reason}")]
    Unencodable { path: String, reason: String },
}

/// Failure reported by a sink implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct SinkFailure {
    pub reason: String,
}

impl SinkFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for SinkFailure {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A send that did not reach the sink, tagged with the record it carried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("record {record} not delivered: {reason}")]
pub struct SinkError {
    pub record: RecordId,
    pub reason: String,
}

/// Structural error pinned to the element it came from
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("element {element} ({leaves} leaves dropped): {error}")]
pub struct ElementError {
    /// Position of the element in the input collection
    pub element: usize,

    /// Leaves the element held; none of them were emitted
    pub leaves: usize,

    pub error: StructuralError,
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
