//! Worker runtime.
//!
//! Serves `POST /exec`, executing map and reduce SQL over shard files
//! and inline partials with the embedded executor, and heartbeats the
//! coordinator at a third of the worker TTL. Workers are stateless
//! across requests; any worker can run any task.

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::net::http::{error_response, json_response};
use crate::net::{ExecInput, ExecRequest, ExecResponse, HeartbeatRequest, WORKER_NOT_READY};
use crate::sharding;

pub mod executor;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    /// Address to listen on.
    pub listen: String,
    /// Address advertised to the coordinator.
    pub advertise: String,
    /// Coordinator host:port for heartbeats.
    pub coordinator: String,
}

/// Serve the worker until shutdown.
pub async fn launch(
    config: Config,
    options: WorkerOptions,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&options.listen).await?;
    info!(
        "worker \"{}\" listening on http://{}",
        options.worker_id, options.listen
    );

    spawn_heartbeat(&config, &options, shutdown.clone());

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, _) = accepted?;
        let io = TokioIo::new(stream);

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(route))
                .await
            {
                error!("connection error: {:?}", err);
            }
        });
    }
}

fn spawn_heartbeat(config: &Config, options: &WorkerOptions, shutdown: CancellationToken) {
    let period = config.heartbeat_interval();
    let url = format!("http://{}/workers/heartbeat", options.coordinator);
    let body = HeartbeatRequest {
        worker_id: options.worker_id.clone(),
        address: options.advertise.clone(),
    };

    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut tick = interval(period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            if let Err(err) = client.post(&url).json(&body).send().await {
                debug!("heartbeat to {} failed: {}", url, err);
            }
        }
    });
}

async fn route(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Ok(error_response(
                400,
                "parse_error",
                &format!("can't read request body: {}", err),
            ))
        }
    };

    let response = match (method, path.as_str()) {
        (Method::POST, "/exec") => exec(&body),
        _ => error_response(404, "not_found", "no such endpoint"),
    };

    Ok(response)
}

fn exec(body: &[u8]) -> Response<Full<Bytes>> {
    let request: ExecRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => return error_response(400, "parse_error", &err.to_string()),
    };

    let mut inputs = Vec::with_capacity(request.inputs.len());
    for input in request.inputs {
        match input {
            ExecInput::Partial(batch) => inputs.push(batch),
            ExecInput::Shard(path) => match sharding::read_shard(&path) {
                Ok(batch) => inputs.push(batch),
                // The shard may not be visible on this host yet; let the
                // coordinator try another worker.
                Err(err) => {
                    return error_response(
                        503,
                        WORKER_NOT_READY,
                        &format!("shard {}: {}", path.display(), err),
                    )
                }
            },
        }
    }

    match executor::execute(&request.sql, inputs) {
        Ok(table) => json_response(StatusCode::OK, &ExecResponse { table }),
        Err(err @ executor::Error::Input(_)) => error_response(500, "internal", &err.to_string()),
        Err(err) => error_response(400, "parse_error", &err.to_string()),
    }
}

/// In-process implementation of the worker contract: the engine calls it
/// directly instead of going over HTTP. Used by tests and useful for a
/// single-process setup.
pub struct LocalWorker;

#[async_trait::async_trait]
impl crate::backend::WorkerApi for LocalWorker {
    async fn exec(
        &self,
        _address: &str,
        request: &ExecRequest,
    ) -> Result<sharding::Batch, crate::backend::ExecError> {
        use crate::backend::ExecError;

        let mut inputs = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            match input {
                ExecInput::Partial(batch) => inputs.push(batch.clone()),
                ExecInput::Shard(path) => match sharding::read_shard(path) {
                    Ok(batch) => inputs.push(batch),
                    Err(err) => return Err(ExecError::Retryable(err.to_string())),
                },
            }
        }

        executor::execute(&request.sql, inputs).map_err(|err| ExecError::Fatal(err.to_string()))
    }
}
