//! Wire messages shared by the coordinator and workers.
//!
//! All bodies are JSON. Row cells are plain JSON scalars; the `types`
//! array alongside them drives typed decoding (see [`Batch`]).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::sharding::Batch;

pub mod http;

/// `POST /query` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Database path holding the manifests.
    pub path: PathBuf,
    /// A single SQL statement.
    pub query: String,
}

/// `POST /query` success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(flatten)]
    pub table: Batch,
    pub row_count: usize,
}

impl From<Batch> for QueryResponse {
    fn from(table: Batch) -> Self {
        let row_count = table.row_count();
        Self { table, row_count }
    }
}

/// Error body for every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// `POST /workers/heartbeat` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub address: String,
}

/// One input to a worker execution: a shard file resolvable by any
/// worker, or a partial result carried inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum ExecInput {
    Shard(PathBuf),
    Partial(Batch),
}

/// `POST /exec` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub sql: String,
    pub inputs: Vec<ExecInput>,
    pub deadline_ms: u64,
}

/// `POST /exec` success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    #[serde(flatten)]
    pub table: Batch,
}

/// Worker error kind a coordinator may retry on another worker.
pub const WORKER_NOT_READY: &str = "not_ready";

#[cfg(test)]
mod test {
    use super::*;
    use crate::sharding::{DataType, Value};

    #[test]
    fn test_exec_input_wire_shape() {
        let input = ExecInput::Shard("/data/t/shard_0.json".into());
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["kind"], "shard");
        assert_eq!(json["ref"], "/data/t/shard_0.json");
    }

    #[test]
    fn test_query_response_flattens_table() {
        let mut table = Batch::new(vec!["n".into()], vec![DataType::BigInt]);
        table.rows.push(vec![Value::Bigint(10)]);

        let response: QueryResponse = table.into();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["columns"][0], "n");
        assert_eq!(json["types"][0], "BIGINT");
        assert_eq!(json["rows"][0][0], 10);
        assert_eq!(json["row_count"], 1);

        let decoded: QueryResponse = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.table.rows[0][0], Value::Bigint(10));
    }
}
