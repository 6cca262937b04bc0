use std::sync::Arc;

use tessera_types::codec::{decode, encode};
use tessera_types::Error;

use crate::blocking;
use crate::keys::{log_index, log_key, stable_key, LOG_PREFIX};
use crate::kv::{KvStore, WriteBatch};
use crate::types::LogRecord;

// ---------------------------------------------------------------------------
// LogStore
// ---------------------------------------------------------------------------

/// Raft log persisted under the log prefix.
#[derive(Clone)]
pub struct LogStore {
    kv: Arc<KvStore>,
}

impl LogStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        LogStore { kv }
    }

    pub async fn first_index(&self) -> Result<Option<u64>, Error> {
        let kv = self.kv.clone();
        blocking(move || kv.first_key(LOG_PREFIX)?.map(|k| log_index(&k)).transpose()).await
    }

    pub async fn last_index(&self) -> Result<Option<u64>, Error> {
        let kv = self.kv.clone();
        blocking(move || kv.last_key(LOG_PREFIX)?.map(|k| log_index(&k)).transpose()).await
    }

    pub async fn last_record(&self) -> Result<Option<LogRecord>, Error> {
        let kv = self.kv.clone();
        blocking(move || match kv.last_key(LOG_PREFIX)? {
            Some(k) => kv.get(&k)?.map(|v| decode::<LogRecord>(&v)).transpose(),
            None => Ok(None),
        })
        .await
    }

    pub async fn get_log(&self, index: u64) -> Result<Option<LogRecord>, Error> {
        let kv = self.kv.clone();
        blocking(move || kv.get(&log_key(index))?.map(|v| decode::<LogRecord>(&v)).transpose())
            .await
    }

    /// Records with `from <= index <= to`, in index order.
    pub async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<LogRecord>, Error> {
        if from > to {
            return Ok(Vec::new());
        }
        let kv = self.kv.clone();
        blocking(move || {
            kv.range(&log_key(from), &log_key(to))?
                .into_iter()
                .map(|(_, v)| decode::<LogRecord>(&v))
                .collect()
        })
        .await
    }

    /// One atomic transaction per batch; existing indexes are overwritten.
    pub async fn store_logs(&self, records: Vec<LogRecord>) -> Result<(), Error> {
        let kv = self.kv.clone();
        blocking(move || {
            let mut batch = WriteBatch::new();
            for record in &records {
                batch.put(log_key(record.index), encode(record)?);
            }
            kv.write(batch)
        })
        .await
    }

    /// Remove every record with `min <= index <= max` in one transaction.
    pub async fn delete_range(&self, min: u64, max: u64) -> Result<usize, Error> {
        if min > max {
            return Ok(0);
        }
        let kv = self.kv.clone();
        blocking(move || kv.delete_range(&log_key(min), &log_key(max))).await
    }
}

// ---------------------------------------------------------------------------
// StableStore
// ---------------------------------------------------------------------------

/// Node-local metadata: vote, commit and purge markers, node identity.
/// Never replicated and never part of a snapshot.
#[derive(Clone)]
pub struct StableStore {
    kv: Arc<KvStore>,
}

pub const NODE_ID_KEY: &str = "node_id";

impl StableStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        StableStore { kv }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let kv = self.kv.clone();
        let key = stable_key(key);
        blocking(move || kv.get(&key)).await
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let kv = self.kv.clone();
        let key = stable_key(key);
        blocking(move || kv.set(&key, &value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        let kv = self.kv.clone();
        let key = stable_key(key);
        blocking(move || kv.delete(&key)).await
    }

    pub async fn get_u64(&self, key: &str) -> Result<Option<u64>, Error> {
        match self.get(key).await? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage(format!("stable key {key} is not a u64")))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub async fn set_u64(&self, key: &str, value: u64) -> Result<(), Error> {
        self.set(key, value.to_be_bytes().to_vec()).await
    }

    /// Write several u64 values in one transaction.
    pub async fn set_u64_many(&self, values: &[(&str, u64)]) -> Result<(), Error> {
        let mut batch = WriteBatch::new();
        for (key, value) in values {
            batch.put(stable_key(key), value.to_be_bytes().to_vec());
        }
        let kv = self.kv.clone();
        blocking(move || kv.write(batch)).await
    }

    /// This node's persisted identity, if it has one.
    pub async fn node_id(&self) -> Result<Option<u64>, Error> {
        self.get_u64(NODE_ID_KEY).await
    }

    pub async fn set_node_id(&self, id: u64) -> Result<(), Error> {
        self.set_u64(NODE_ID_KEY, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogType;

    fn record(index: u64) -> LogRecord {
        LogRecord { index, term: 1, leader: 1, log_type: LogType::Blank, data: Vec::new() }
    }

    #[tokio::test]
    async fn log_ordering_and_delete_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::new(KvStore::open(dir.path()).unwrap());

        assert!(log.first_index().await.unwrap().is_none());
        assert!(log.last_index().await.unwrap().is_none());

        log.store_logs(vec![record(5), record(1), record(9), record(3)]).await.unwrap();
        assert_eq!(log.first_index().await.unwrap(), Some(1));
        assert_eq!(log.last_index().await.unwrap(), Some(9));
        assert_eq!(log.get_log(3).await.unwrap().unwrap().index, 3);
        assert!(log.get_log(4).await.unwrap().is_none());

        assert_eq!(log.delete_range(1, 5).await.unwrap(), 3);
        for gone in [1, 3, 5] {
            assert!(log.get_log(gone).await.unwrap().is_none());
        }
        assert_eq!(log.get_log(9).await.unwrap().unwrap().index, 9);
        assert_eq!(log.first_index().await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn get_logs_is_inclusive_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::new(KvStore::open(dir.path()).unwrap());
        log.store_logs((1..=6).map(record).collect()).await.unwrap();

        let indexes: Vec<u64> = log.get_logs(2, 4).await.unwrap().iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![2, 3, 4]);
        assert!(log.get_logs(5, 4).await.unwrap().is_empty());
        assert_eq!(log.last_record().await.unwrap().unwrap().index, 6);
    }

    #[tokio::test]
    async fn store_logs_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::new(KvStore::open(dir.path()).unwrap());
        log.store_logs(vec![record(1)]).await.unwrap();

        let replacement = LogRecord { term: 2, ..record(1) };
        log.store_logs(vec![replacement.clone()]).await.unwrap();
        assert_eq!(log.get_log(1).await.unwrap().unwrap(), replacement);
    }

    #[tokio::test]
    async fn stable_store_values() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();
        let stable = StableStore::new(kv.clone());

        assert!(stable.get_u64("current_term").await.unwrap().is_none());
        stable.set_u64_many(&[("current_term", 7), ("voted_for", 2)]).await.unwrap();
        assert_eq!(stable.get_u64("current_term").await.unwrap(), Some(7));
        assert_eq!(stable.get_u64("voted_for").await.unwrap(), Some(2));

        stable.set("blob", b"abc".to_vec()).await.unwrap();
        assert!(stable.get_u64("blob").await.is_err());

        stable.set_node_id(11).await.unwrap();
        drop(stable);
        drop(kv);

        let stable = StableStore::new(KvStore::open(dir.path()).unwrap());
        assert_eq!(stable.node_id().await.unwrap(), Some(11));
    }
}
