//! Frontend errors.
//!
//! Everything a query can fail with, mapped to the error kind on the
//! wire and an HTTP status: 4xx for client mistakes (syntax, catalog
//! misses), 5xx for execution failures.

use thiserror::Error;

use crate::{backend, catalog, sharding};

use super::router;

/// Frontend error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] router::ParseError),

    #[error("{0}")]
    Router(#[from] router::Error),

    #[error("{0}")]
    Catalog(#[from] catalog::Error),

    #[error("{0}")]
    Backend(#[from] backend::Error),

    #[error("{0}")]
    Sharding(#[from] sharding::Error),

    #[error("malformed request body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("{0}")]
    BadRequest(String),
}

impl Error {
    /// Wire error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse(_) | Error::Router(_) | Error::Body(_) | Error::BadRequest(_) => {
                "parse_error"
            }

            Error::Catalog(catalog::Error::NotFound(_)) => "not_found",
            Error::Catalog(catalog::Error::AlreadyExists(_)) => "already_exists",
            Error::Catalog(_) => "internal",

            Error::Backend(backend::Error::NoWorkers) => "no_workers",
            Error::Backend(backend::Error::TaskFailed { .. }) => "task_failed",
            Error::Backend(backend::Error::SchemaMismatch { .. }) => "schema_mismatch",
            Error::Backend(backend::Error::QueryTimeout) => "timeout",
            Error::Backend(backend::Error::Cancelled) => "cancelled",
            Error::Backend(_) => "internal",

            // Bad ingest data is the client's problem; I/O is ours.
            Error::Sharding(sharding::Error::Io(_)) => "internal",
            Error::Sharding(_) => "parse_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self.kind() {
            "parse_error" => 400,
            "not_found" => 404,
            "already_exists" => 409,
            "no_workers" => 503,
            "timeout" => 504,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = Error::Catalog(catalog::Error::NotFound("t".into()));
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.status(), 404);

        let err = Error::Backend(backend::Error::NoWorkers);
        assert_eq!(err.kind(), "no_workers");
        assert_eq!(err.status(), 503);

        let err = Error::Backend(backend::Error::QueryTimeout);
        assert_eq!(err.status(), 504);

        let err = Error::BadRequest("nope".into());
        assert_eq!(err.status(), 400);
    }
}
