//! Per-table manifest: schema and the ordered shard list.

use std::fs::{rename, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sharding::Schema;

use super::Error;

/// Descriptor of one shard file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRef {
    pub id: u64,
    pub path: PathBuf,
    pub row_count: u64,
}

/// Persistent record for a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema: Schema,
    pub shards: Vec<ShardRef>,
}

impl Manifest {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            shards: vec![],
        }
    }

    /// Next shard id to assign. Ids are monotonic and never reused
    /// within a manifest.
    pub fn next_shard_id(&self) -> u64 {
        self.shards.last().map(|shard| shard.id + 1).unwrap_or(0)
    }

    pub fn row_count(&self) -> u64 {
        self.shards.iter().map(|shard| shard.row_count).sum()
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Atomic replace: write a temp file, then rename over the target.
    /// Readers observe the old or the new manifest, never a prefix.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        let tmp = path.with_extension("manifest.tmp");
        let file = File::create(&tmp)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        rename(&tmp, path)?;

        Ok(())
    }
}
