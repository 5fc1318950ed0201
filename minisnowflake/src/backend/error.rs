//! Execution errors.

use thiserror::Error;

use crate::sharding;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no healthy workers available")]
    NoWorkers,

    #[error("task failed after {attempts} attempts: {message}")]
    TaskFailed { attempts: usize, message: String },

    #[error("partial schema mismatch: expected {expected:?}, got {got:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("query deadline exceeded")]
    QueryTimeout,

    #[error("query cancelled")]
    Cancelled,

    #[error("{0}")]
    Sharding(#[from] sharding::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
