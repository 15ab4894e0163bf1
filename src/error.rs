//! Error types for shotsense

use thiserror::Error;

/// Errors surfaced by the pipeline to its immediate owner.
///
/// Line-level problems (malformed records, sequence gaps, unmatched button
/// presses, short segments) never show up here; they only feed counters.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to open link {port}: {message}")]
    Transport { port: String, message: String },

    #[error("Link failed while streaming: {0}")]
    Stream(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ingest is already running")]
    AlreadyRunning,

    #[error("Ingest is not running")]
    NotRunning,

    #[error("Invalid calibration request: {0}")]
    InvalidCalibration(String),

    #[error("Unknown segment: {0}")]
    UnknownSegment(String),

    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("Reader thread did not answer within {0} ms")]
    ControlTimeout(u64),

    #[error("Pipeline channel closed")]
    ChannelClosed,

    #[error("JSON encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reasons a single input line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("empty line")]
    Empty,

    #[error("comment line")]
    Comment,

    #[error("expected 15 fields, got {0}")]
    FieldCount(usize),

    #[error("field {index} is not a valid integer: {value:?}")]
    InvalidField { index: usize, value: String },
}
