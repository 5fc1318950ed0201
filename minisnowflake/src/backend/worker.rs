//! Worker contract and the HTTP client implementation.
//!
//! The engine talks to workers through [`WorkerApi`]; production uses
//! [`HttpWorker`] (`POST /exec`), tests run an in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::net::{ErrorResponse, ExecRequest, ExecResponse, WORKER_NOT_READY};
use crate::sharding::Batch;

/// A single task execution failure, classified for the retry loop.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Transient: network trouble, worker not ready. Retry on another
    /// worker.
    #[error("{0}")]
    Retryable(String),

    /// The task can't succeed anywhere: malformed SQL, executor bug.
    #[error("{0}")]
    Fatal(String),
}

impl ExecError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Retryable(_))
    }
}

#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Run one map or reduce task on the worker at `address`.
    async fn exec(&self, address: &str, request: &ExecRequest) -> Result<Batch, ExecError>;
}

/// HTTP worker client.
pub struct HttpWorker {
    client: reqwest::Client,
}

impl HttpWorker {
    pub fn new(task_timeout: Duration) -> Self {
        // Engine timeouts are the real deadline; this is a backstop for
        // connections that never progress.
        let client = reqwest::Client::builder()
            .timeout(task_timeout * 2)
            .build()
            .expect("default TLS backend");

        Self { client }
    }
}

#[async_trait]
impl WorkerApi for HttpWorker {
    async fn exec(&self, address: &str, request: &ExecRequest) -> Result<Batch, ExecError> {
        let url = format!("http://{}/exec", address);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| ExecError::Retryable(format!("{}: {}", address, err)))?;

        let status = response.status();
        if status.is_success() {
            let body: ExecResponse = response
                .json()
                .await
                .map_err(|err| ExecError::Retryable(format!("{}: {}", address, err)))?;
            return Ok(body.table);
        }

        let error: ErrorResponse = response.json().await.unwrap_or_else(|_| ErrorResponse {
            error: "internal".into(),
            message: format!("worker returned {}", status),
        });

        if error.error == WORKER_NOT_READY {
            Err(ExecError::Retryable(error.message))
        } else {
            Err(ExecError::Fatal(format!(
                "worker error ({}): {}",
                error.error, error.message
            )))
        }
    }
}
