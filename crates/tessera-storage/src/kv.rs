use std::path::Path;
use std::sync::Arc;

use tessera_types::Error;

fn fjall_err(e: fjall::Error) -> Error {
    Error::Storage(e.to_string())
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes committed together by [`KvStore::write`].
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered, durable key-value adapter over a single fjall keyspace.
///
/// Every write is an atomic batch followed by a synced journal flush, so a
/// call returns only once its data survives a crash. All methods block;
/// async callers go through [`crate::blocking`].
pub struct KvStore {
    db: fjall::Database,
    keyspace: fjall::Keyspace,
}

impl KvStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, Error> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let keyspace =
            db.keyspace("tessera", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(KvStore { db, keyspace }))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.keyspace.get(key).map_err(fjall_err)?.map(|v| v.to_vec()))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    pub fn write(&self, batch: WriteBatch) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.batch();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => tx.insert(&self.keyspace, k, v),
                BatchOp::Delete(k) => tx.remove(&self.keyspace, k),
            }
        }
        tx.commit().map_err(fjall_err)?;
        self.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
    }

    /// All pairs whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        self.keyspace
            .prefix(prefix)
            .map(|g| g.into_inner().map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(fjall_err))
            .collect()
    }

    /// All pairs in `[start, end]`, in key order.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        self.keyspace
            .range(start.to_vec()..=end.to_vec())
            .map(|g| g.into_inner().map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(fjall_err))
            .collect()
    }

    /// Smallest key under `prefix`. Reads only that one entry.
    pub fn first_key(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match self.keyspace.prefix(prefix).next() {
            Some(g) => Ok(Some(g.into_inner().map_err(fjall_err)?.0.to_vec())),
            None => Ok(None),
        }
    }

    /// Largest key under `prefix`. Reads only that one entry.
    pub fn last_key(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match self.keyspace.prefix(prefix).next_back() {
            Some(g) => Ok(Some(g.into_inner().map_err(fjall_err)?.0.to_vec())),
            None => Ok(None),
        }
    }

    /// Collect every key in `[start, end]` and remove them in one batch.
    /// Returns how many keys were removed.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize, Error> {
        let keys: Vec<Vec<u8>> = self
            .keyspace
            .range(start.to_vec()..=end.to_vec())
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect::<Result<_, _>>()?;
        let removed = keys.len();
        let mut batch = WriteBatch::new();
        for k in keys {
            batch.delete(k);
        }
        self.write(batch)?;
        Ok(removed)
    }
}
