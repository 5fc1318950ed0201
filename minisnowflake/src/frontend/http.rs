//! Coordinator HTTP surface: `POST /query` and `POST /workers/heartbeat`.

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{Engine, QueryContext, Registry};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::net::http::{error_response, json_response};
use crate::net::{HeartbeatRequest, QueryRequest, QueryResponse};
use crate::sharding::{csv, Batch, Column, DataType, Schema, Value};

use super::router::{self, parser, parser::Statement};
use super::Error;

pub struct App {
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<Registry>,
    pub engine: Arc<Engine>,
    pub shutdown: CancellationToken,
}

/// Accept loop; returns when the shutdown token fires.
pub async fn serve(app: Arc<App>) -> std::io::Result<()> {
    let addr = app.config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("coordinator listening on http://{}", addr);

    loop {
        let accepted = tokio::select! {
            _ = app.shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, _) = accepted?;
        let io = TokioIo::new(stream);
        let app = app.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |request| {
                let app = app.clone();
                async move { route(app, request).await }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("connection error: {:?}", err);
            }
        });
    }
}

async fn route(
    app: Arc<App>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
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
        (Method::POST, "/query") => query(&app, &body).await,
        (Method::POST, "/workers/heartbeat") => heartbeat(&app, &body),
        _ => error_response(404, "not_found", "no such endpoint"),
    };

    Ok(response)
}

async fn query(app: &App, body: &[u8]) -> Response<Full<Bytes>> {
    let request: QueryRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            let err = Error::from(err);
            return error_response(err.status(), err.kind(), &err.to_string());
        }
    };

    match handle_query(app, request).await {
        Ok(table) => json_response(StatusCode::OK, &QueryResponse::from(table)),
        Err(err) => {
            debug!("query failed: {}", err);
            error_response(err.status(), err.kind(), &err.to_string())
        }
    }
}

fn heartbeat(app: &App, body: &[u8]) -> Response<Full<Bytes>> {
    match serde_json::from_slice::<HeartbeatRequest>(body) {
        Ok(request) => {
            // Known workers get a refresh, which keeps their failure
            // count intact; unknown ones register with their address.
            if !app.registry.heartbeat(&request.worker_id) {
                app.registry.register(&request.worker_id, &request.address);
            }
            json_response(StatusCode::OK, &serde_json::json!({}))
        }
        Err(err) => error_response(400, "parse_error", &err.to_string()),
    }
}

/// Run one statement to completion.
pub async fn handle_query(app: &App, request: QueryRequest) -> Result<Batch, Error> {
    let statement = parser::parse(&request.query)?;

    match statement {
        Statement::CreateTable(create) => {
            let mut seen = HashSet::new();
            for column in &create.columns {
                if !seen.insert(column.name.as_str()) {
                    return Err(Error::BadRequest(format!(
                        "duplicate column \"{}\"",
                        column.name
                    )));
                }
            }

            let schema = Schema::new(
                create
                    .columns
                    .iter()
                    .map(|column| Column {
                        name: column.name.clone(),
                        data_type: column.data_type,
                        not_null: column.not_null,
                    })
                    .collect(),
            );
            app.catalog
                .create_table(&request.path, &create.name, schema, create.if_not_exists)?;
            info!("created table \"{}\"", create.name);

            Ok(Batch::new(vec![], vec![]))
        }

        Statement::DropTable(drop) => {
            app.catalog
                .drop_table(&request.path, &drop.name, drop.if_exists)?;
            info!("dropped table \"{}\"", drop.name);

            Ok(Batch::new(vec![], vec![]))
        }

        Statement::InsertFrom(insert) => {
            let manifest = app.catalog.open_manifest(&request.path, &insert.table)?;
            let rows = csv::read_csv_file(Path::new(&insert.path), &manifest.schema)?;
            let loaded = rows.len();
            let per_shard = insert
                .rows_per_shard
                .unwrap_or(app.config.default_rows_per_shard);

            let columns = manifest.schema.names();
            let types = manifest.schema.types();
            let batches: Vec<Batch> = rows
                .chunks(per_shard)
                .map(|chunk| {
                    let mut batch = Batch::new(columns.clone(), types.clone());
                    batch.rows = chunk.to_vec();
                    batch
                })
                .collect();

            if !batches.is_empty() {
                let shards = app
                    .catalog
                    .append_shards(&request.path, &insert.table, batches)?;
                info!(
                    "loaded {} rows into \"{}\" across {} new shards",
                    loaded,
                    insert.table,
                    shards.len()
                );
            }

            let mut result = Batch::new(vec!["rows_loaded".into()], vec![DataType::BigInt]);
            result.rows.push(vec![Value::Bigint(loaded as i64)]);
            Ok(result)
        }

        Statement::Select(select) => {
            let manifest = app.catalog.open_manifest(&request.path, &select.table)?;
            let plan = router::plan(&select, &manifest.schema)?;
            let ctx = QueryContext::with_cancel(app.shutdown.child_token());
            debug!("query {}: {}", ctx.query_id, request.query);

            Ok(app.engine.execute(&plan, &manifest.shards, &ctx).await?)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{EngineConfig, RegistryConfig};
    use crate::catalog;
    use crate::worker::LocalWorker;
    use std::io::Write as _;
    use std::path::PathBuf;
    use std::time::Duration;

    fn app() -> App {
        let registry = Arc::new(Registry::new(RegistryConfig {
            acquire_timeout: Duration::from_millis(500),
            worker_ttl: Duration::from_secs(60),
            failure_threshold: 3,
        }));
        registry.register("w1", "local");

        let engine = Arc::new(Engine::new(
            registry.clone(),
            Arc::new(LocalWorker),
            EngineConfig {
                max_in_flight: None,
                tasks_per_worker: 2,
                reduce_fanin: 2,
                task_timeout: Duration::from_secs(5),
                query_timeout: Duration::from_secs(10),
                max_retries: 1,
                cancel_grace: Duration::from_millis(200),
            },
        ));

        App {
            config: Config::default(),
            catalog: Arc::new(Catalog::new()),
            registry,
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    async fn query(app: &App, db: &PathBuf, sql: &str) -> Result<Batch, Error> {
        handle_query(
            app,
            QueryRequest {
                path: db.clone(),
                query: sql.into(),
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_statement_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        let app = app();

        query(
            &app,
            &db,
            "CREATE TABLE events (event_id INT IS NOT NULL, event_type TEXT, value DOUBLE)",
        )
        .await
        .unwrap();

        let err = query(&app, &db, "CREATE TABLE events (event_id INT)")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_exists");
        query(&app, &db, "CREATE TABLE events (event_id INT) IF NOT EXISTS")
            .await
            .unwrap();

        let csv_path = dir.path().join("events.csv");
        let mut file = std::fs::File::create(&csv_path).unwrap();
        write!(
            file,
            "event_id,event_type,value\n\
             1,click,1.5\n2,click,2.0\n3,view,0.0\n4,click,3.5\n5,view,\n"
        )
        .unwrap();

        let result = query(
            &app,
            &db,
            &format!(
                "INSERT INTO events FROM '{}' ROWS PER SHARD 2",
                csv_path.display()
            ),
        )
        .await
        .unwrap();
        assert_eq!(result.rows, vec![vec![Value::Bigint(5)]]);

        let manifest = app.catalog.open_manifest(&db, "events").unwrap();
        assert_eq!(manifest.shards.len(), 3);
        assert_eq!(manifest.row_count(), 5);

        let result = query(&app, &db, "SELECT COUNT(*) AS n, SUM(value) AS s FROM events")
            .await
            .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Bigint(5), Value::Double(7.0)]]
        );

        let result = query(
            &app,
            &db,
            "SELECT event_id FROM events WHERE value IS NULL",
        )
        .await
        .unwrap();
        assert_eq!(result.rows, vec![vec![Value::Bigint(5)]]);

        query(&app, &db, "DROP TABLE events").await.unwrap();
        let err = query(&app, &db, "SELECT * FROM events").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_duplicate_columns_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        let app = app();

        let err = query(&app, &db, "CREATE TABLE t (x INT, x INT)")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "parse_error");
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_unknown_table_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        let app = app();

        let err = query(&app, &db, "SELECT * FROM missing").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Catalog(catalog::Error::NotFound(_))
        ));
    }
}
