//! Uniform typed key-value stores for tasks and events.
//!
//! Two backends share one contract: an in-memory map for throwaway setups
//! and a redb-backed single-file store with a named table per bucket,
//! values JSON-encoded. Keys are the entity's id string.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("cannot open store file {file}: {message}")]
    Open { file: String, message: String },

    #[error("store transaction failed: {0}")]
    Transaction(String),

    #[error("store table failed: {0}")]
    Table(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(String),

    #[error("serializing value failed: {0}")]
    Serialize(String),

    #[error("deserializing value failed: {0}")]
    Deserialize(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Convert any `Display` error into a `StoreError` variant.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// The four-operation store contract shared by every backend.
pub trait Store<T>: Send {
    /// Insert or overwrite the value under `key`.
    fn put(&mut self, key: &str, value: T) -> StoreResult<()>;
    /// Fetch the value under `key`, or `StoreError::NotFound`.
    fn get(&self, key: &str) -> StoreResult<T>;
    /// Every stored value, in unspecified order.
    fn list(&self) -> StoreResult<Vec<T>>;
    fn count(&self) -> StoreResult<usize>;
}

/// Map-backed store. State dies with the process.
pub struct MemoryStore<T> {
    db: HashMap<String, T>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        MemoryStore { db: HashMap::new() }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> Store<T> for MemoryStore<T> {
    fn put(&mut self, key: &str, value: T) -> StoreResult<()> {
        self.db.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<T> {
        self.db
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn list(&self) -> StoreResult<Vec<T>> {
        Ok(self.db.values().cloned().collect())
    }

    fn count(&self) -> StoreResult<usize> {
        Ok(self.db.len())
    }
}

/// Single-file durable store: one named table (the bucket) inside a redb
/// database, values JSON-encoded.
pub struct PersistentStore<T> {
    db: Arc<Database>,
    bucket: String,
    _marker: PhantomData<T>,
}

impl<T> PersistentStore<T> {
    /// Open or create the database file and make sure the bucket exists.
    /// The file is chmodded to owner read/write only.
    pub fn open(file: impl AsRef<Path>, bucket: &str) -> StoreResult<Self> {
        let file = file.as_ref();
        let db = Database::create(file).map_err(|e| StoreError::Open {
            file: file.display().to_string(),
            message: e.to_string(),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(file, std::fs::Permissions::from_mode(0o600))
            {
                warn!(file = %file.display(), error = %e, "cannot restrict store file mode");
            }
        }

        let store = PersistentStore {
            db: Arc::new(db),
            bucket: bucket.to_string(),
            _marker: PhantomData,
        };
        store.ensure_bucket()?;
        debug!(file = %file.display(), bucket, "store opened");
        Ok(store)
    }

    fn table(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.bucket)
    }

    /// Opening a table in a write transaction creates it if absent.
    fn ensure_bucket(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(self.table()).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl<T> Store<T> for PersistentStore<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn put(&mut self, key: &str, value: T) -> StoreResult<()> {
        let buf = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(self.table()).map_err(map_err!(Table))?;
            table
                .insert(key, buf.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<T> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(self.table()).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    fn list(&self) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(self.table()).map_err(map_err!(Table))?;
        let mut values = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            values.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(values)
    }

    fn count(&self) -> StoreResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(self.table()).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }
}
