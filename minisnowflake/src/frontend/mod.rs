//! Coordinator frontend: the client HTTP surface, the statement parser
//! and the query planner.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::{Engine, HttpWorker, Registry};
use crate::catalog::Catalog;
use crate::config::Config;

pub mod error;
pub mod http;
pub mod router;

pub use error::Error;

/// Assemble the coordinator and serve until shutdown.
pub async fn launch(config: Config, shutdown: CancellationToken) -> std::io::Result<()> {
    let catalog = Arc::new(Catalog::new());
    let registry = Arc::new(Registry::new(config.registry_config()));
    registry.launch_sweeper(shutdown.clone());

    let worker = Arc::new(HttpWorker::new(Duration::from_millis(config.task_timeout)));
    let engine = Arc::new(Engine::new(
        registry.clone(),
        worker,
        config.engine_config(),
    ));

    let app = Arc::new(http::App {
        config,
        catalog,
        registry,
        engine,
        shutdown,
    });

    http::serve(app).await
}
