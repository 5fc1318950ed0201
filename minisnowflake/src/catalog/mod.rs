//! Table catalog.
//!
//! Any directory holding manifests is a valid database. The catalog is an
//! explicit collaborator injected into the frontend; it owns the per-table
//! locks: manifest mutations take the table's exclusive lock, reads take
//! the shared lock.

use std::collections::HashMap;
use std::fs::{create_dir_all, remove_dir_all, remove_file};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sharding::{self, Batch, Schema};

pub mod manifest;

pub use manifest::{Manifest, ShardRef};

#[derive(Debug, Error)]
pub enum Error {
    #[error("table \"{0}\" does not exist")]
    NotFound(String),

    #[error("table \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Sharding(#[from] sharding::Error),
}

#[derive(Default)]
pub struct Catalog {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn manifest_path(database: &Path, table: &str) -> PathBuf {
        database.join(format!("{}.manifest", table))
    }

    fn shard_dir(database: &Path, table: &str) -> PathBuf {
        database.join(table)
    }

    fn table_lock(&self, database: &Path, table: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(Self::manifest_path(database, table))
            .or_default()
            .clone()
    }

    /// Create an empty manifest for a new table.
    pub fn create_table(
        &self,
        database: &Path,
        table: &str,
        schema: Schema,
        if_not_exists: bool,
    ) -> Result<(), Error> {
        let lock = self.table_lock(database, table);
        let _guard = lock.write();

        let path = Self::manifest_path(database, table);
        if path.exists() {
            if if_not_exists {
                return Ok(());
            }
            return Err(Error::AlreadyExists(table.to_string()));
        }

        create_dir_all(database)?;
        Manifest::new(schema).store(&path)?;
        debug!("created table \"{}\" in {}", table, database.display());

        Ok(())
    }

    /// Remove the manifest and schedule deletion of the shard files.
    pub fn drop_table(&self, database: &Path, table: &str, if_exists: bool) -> Result<(), Error> {
        let lock = self.table_lock(database, table);
        let _guard = lock.write();

        let path = Self::manifest_path(database, table);
        if !path.exists() {
            if if_exists {
                return Ok(());
            }
            return Err(Error::NotFound(table.to_string()));
        }

        remove_file(&path)?;

        let shards = Self::shard_dir(database, table);
        let table = table.to_string();
        let delete = move || {
            if let Err(err) = remove_dir_all(&shards) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("shard cleanup for dropped table \"{}\": {}", table, err);
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(delete);
            }
            Err(_) => delete(),
        }

        Ok(())
    }

    /// Current schema and shard list.
    pub fn open_manifest(&self, database: &Path, table: &str) -> Result<Manifest, Error> {
        let lock = self.table_lock(database, table);
        let _guard = lock.read();

        let path = Self::manifest_path(database, table);
        if !path.exists() {
            return Err(Error::NotFound(table.to_string()));
        }

        Manifest::load(&path)
    }

    /// Write the batches as new shard files and append them to the
    /// manifest, assigning monotonically increasing shard ids. The
    /// files exist before the manifest mentions them.
    pub fn append_shards(
        &self,
        database: &Path,
        table: &str,
        batches: Vec<Batch>,
    ) -> Result<Vec<ShardRef>, Error> {
        let lock = self.table_lock(database, table);
        let _guard = lock.write();

        let path = Self::manifest_path(database, table);
        if !path.exists() {
            return Err(Error::NotFound(table.to_string()));
        }

        let mut manifest = Manifest::load(&path)?;
        let mut id = manifest.next_shard_id();
        let mut appended = vec![];

        for batch in batches {
            let shard_path = Self::shard_dir(database, table).join(format!("shard_{}.json", id));
            sharding::write_shard(&shard_path, &batch)?;
            appended.push(ShardRef {
                id,
                path: shard_path,
                row_count: batch.row_count() as u64,
            });
            id += 1;
        }

        manifest.shards.extend(appended.clone());
        manifest.store(&path)?;

        Ok(appended)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sharding::{Column, DataType, Value};

    fn schema() -> Schema {
        Schema::new(vec![Column {
            name: "x".into(),
            data_type: DataType::Integer,
            not_null: false,
        }])
    }

    fn batch(values: &[i64]) -> Batch {
        let mut batch = Batch::new(vec!["x".into()], vec![DataType::Integer]);
        batch.rows = values.iter().map(|v| vec![Value::Bigint(*v)]).collect();
        batch
    }

    #[test]
    fn test_create_table_twice() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new();

        catalog
            .create_table(dir.path(), "t", schema(), false)
            .unwrap();
        let err = catalog
            .create_table(dir.path(), "t", schema(), false)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        // IF NOT EXISTS suppresses the error.
        catalog
            .create_table(dir.path(), "t", schema(), true)
            .unwrap();
    }

    #[test]
    fn test_drop_table() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new();

        assert!(matches!(
            catalog.drop_table(dir.path(), "t", false),
            Err(Error::NotFound(_))
        ));
        catalog.drop_table(dir.path(), "t", true).unwrap();

        catalog
            .create_table(dir.path(), "t", schema(), false)
            .unwrap();
        catalog
            .append_shards(dir.path(), "t", vec![batch(&[1, 2])])
            .unwrap();
        catalog.drop_table(dir.path(), "t", false).unwrap();

        assert!(matches!(
            catalog.open_manifest(dir.path(), "t"),
            Err(Error::NotFound(_))
        ));
        // No runtime in this test, so deletion ran inline.
        assert!(!dir.path().join("t").exists());
    }

    #[test]
    fn test_append_shards_assigns_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new();

        catalog
            .create_table(dir.path(), "t", schema(), false)
            .unwrap();
        let first = catalog
            .append_shards(dir.path(), "t", vec![batch(&[1, 2]), batch(&[3])])
            .unwrap();
        let second = catalog
            .append_shards(dir.path(), "t", vec![batch(&[4])])
            .unwrap();

        assert_eq!(
            first.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(second[0].id, 2);

        let manifest = catalog.open_manifest(dir.path(), "t").unwrap();
        assert_eq!(manifest.shards.len(), 3);
        assert_eq!(manifest.row_count(), 4);

        for shard in &manifest.shards {
            assert!(shard.path.exists());
        }

        // Writes go through temp-then-rename; nothing half-written stays.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_append_to_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new();
        assert!(matches!(
            catalog.append_shards(dir.path(), "t", vec![batch(&[1])]),
            Err(Error::NotFound(_))
        ));
    }
}
