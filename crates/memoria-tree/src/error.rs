use thiserror::Error;

/// Errors from persistent-tree operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// The node ID counter has no values left.
    #[error("node ID space exhausted")]
    NodeIdsExhausted,

    /// A fan-out below the supported minimum was requested.
    #[error("invalid fan-out {fanout}: must be at least {min}")]
    InvalidFanout { fanout: usize, min: usize },
}

pub type TreeResult<T> = Result<T, TreeError>;
