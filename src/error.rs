//! Error taxonomy for the acquisition and display pipeline

use std::time::Duration;

use thiserror::Error;

/// A requested dB range was not strictly increasing
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum RangeError {
    #[error("invalid dB range: max ({max}) must be greater than min ({min})")]
    NotIncreasing { min: f32, max: f32 },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Nothing arrived within the stall timeout, the producer is presumed dead
    #[error("sample stream stalled: no data for {waited:?}")]
    Stalled { waited: Duration },
    /// The producer hung up and every pending block has been consumed
    #[error("sample stream closed by producer")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source {0} requires an input file")]
    MissingInput(&'static str),
    #[error("input holds {got} bytes, fewer than one {want}-byte block")]
    Truncated { got: usize, want: usize },
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(String),
}

#[derive(Error, Debug)]
pub enum RigError {
    #[error("rig I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rig reported error code {0}")]
    Report(i32),
    #[error("unexpected rig reply: {0:?}")]
    Protocol(String),
    #[error("rig link closed")]
    Disconnected,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("{name}: {source}")]
    Range {
        name: &'static str,
        #[source]
        source: RangeError,
    },
    #[error("invalid rig address {0:?}")]
    RigAddress(String),
}

/// Conditions that end the consumer loop and must reach the process boundary
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("acquisition thread panicked")]
    ProducerPanicked,
}
