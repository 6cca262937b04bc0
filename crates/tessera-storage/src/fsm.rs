use std::sync::Arc;

use parking_lot::RwLock;

use tessera_types::codec::{decode, encode};
use tessera_types::{Command, CommandResponse, Error, Operation, OperationType};

use crate::blocking;
use crate::keys::{is_replicated_key, log_key, stable_key, DATA_PREFIX, LOG_PREFIX, SEQUENCE_PREFIX};
use crate::kv::{KvStore, WriteBatch};
use crate::sql::{QueryResult, SqlReplica};
use crate::types::{LogRecord, LogType};

const LAST_APPLIED_KEY: &str = "fsm_last_applied";
const APPLIED_STATE_KEY: &str = "fsm_applied_state";

/// Serialized form of a snapshot: raw key/value pairs of every replicated
/// partition plus the log records retained up to the last applied index.
#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotContents {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

struct FsmInner {
    kv: Arc<KvStore>,
    sql: SqlReplica,
    /// Apply and restore take it exclusively so snapshots see a consistent cut.
    cut: RwLock<()>,
}

/// Replicated state machine over the data and sequence partitions and the
/// SQLite replica.
///
/// Besides the index, every apply persists an opaque `applied_state` blob in
/// the same batch; the consensus adapter stores its log id and membership
/// there, keeping this crate free of openraft types.
#[derive(Clone)]
pub struct Fsm {
    inner: Arc<FsmInner>,
}

impl Fsm {
    /// Open the state machine and rebuild the SQLite replica from the log.
    pub async fn open(kv: Arc<KvStore>) -> Result<Self, Error> {
        let fsm = Fsm {
            inner: Arc::new(FsmInner { kv, sql: SqlReplica::open()?, cut: RwLock::new(()) }),
        };
        let inner = fsm.inner.clone();
        let replayed = blocking(move || {
            let _cut = inner.cut.write();
            inner.rebuild_relational()
        })
        .await?;
        tracing::info!(replayed, "relational replica rebuilt from log");
        Ok(fsm)
    }

    pub async fn last_applied(&self) -> Result<Option<u64>, Error> {
        let inner = self.inner.clone();
        blocking(move || inner.last_applied()).await
    }

    pub async fn applied_state(&self) -> Result<Option<Vec<u8>>, Error> {
        let inner = self.inner.clone();
        blocking(move || inner.kv.get(&stable_key(APPLIED_STATE_KEY))).await
    }

    /// Apply a committed command at `index`.
    ///
    /// SQL failures and writes outside the replicated partitions come back as
    /// unsuccessful responses; only storage failures are errors.
    pub async fn apply(
        &self,
        index: u64,
        cmd: Command,
        applied_state: Vec<u8>,
    ) -> Result<CommandResponse, Error> {
        let inner = self.inner.clone();
        blocking(move || inner.apply(index, &cmd, applied_state)).await
    }

    /// Record a blank or membership entry as applied.
    pub async fn mark_applied(&self, index: u64, applied_state: Vec<u8>) -> Result<(), Error> {
        let inner = self.inner.clone();
        blocking(move || {
            let _cut = inner.cut.write();
            let mut batch = WriteBatch::new();
            applied_markers(&mut batch, index, applied_state);
            inner.kv.write(batch)
        })
        .await
    }

    /// Serialize the replicated state. Also returns the `applied_state` blob
    /// read under the same cut, so callers can describe what the bytes hold.
    pub async fn snapshot(&self) -> Result<(Vec<u8>, Option<Vec<u8>>), Error> {
        let inner = self.inner.clone();
        blocking(move || inner.snapshot()).await
    }

    /// Replace replicated state with a snapshot taken at `last_index`, then
    /// replay the retained log into a fresh SQLite replica.
    pub async fn restore(
        &self,
        data: Vec<u8>,
        last_index: Option<u64>,
        applied_state: Vec<u8>,
    ) -> Result<(), Error> {
        let inner = self.inner.clone();
        blocking(move || inner.restore(&data, last_index, applied_state)).await
    }

    pub async fn get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
        let inner = self.inner.clone();
        blocking(move || inner.kv.get(&key)).await
    }

    pub async fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let inner = self.inner.clone();
        blocking(move || inner.kv.scan_prefix(&prefix)).await
    }

    pub async fn query(&self, sql: String) -> Result<QueryResult, Error> {
        let inner = self.inner.clone();
        blocking(move || inner.sql.query(&sql)).await
    }
}

fn applied_markers(batch: &mut WriteBatch, index: u64, applied_state: Vec<u8>) {
    batch.put(stable_key(LAST_APPLIED_KEY), index.to_be_bytes().to_vec());
    batch.put(stable_key(APPLIED_STATE_KEY), applied_state);
}

impl FsmInner {
    fn last_applied(&self) -> Result<Option<u64>, Error> {
        match self.kv.get(&stable_key(LAST_APPLIED_KEY))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt last applied index".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn apply(&self, index: u64, cmd: &Command, applied_state: Vec<u8>) -> Result<CommandResponse, Error> {
        let _cut = self.cut.write();
        let mut batch = WriteBatch::new();

        let response = match cmd.operation_type {
            OperationType::Sql => match std::str::from_utf8(&cmd.query) {
                Ok(query) => match self.sql.execute(query) {
                    Ok(()) => CommandResponse::ok(cmd, Vec::new()),
                    Err(e) => {
                        tracing::debug!(index, error = %e, "sql command failed");
                        CommandResponse::failed(cmd, e)
                    }
                },
                Err(_) => CommandResponse::failed(cmd, "query is not valid UTF-8"),
            },
            OperationType::Kv if !is_replicated_key(&cmd.key) => {
                CommandResponse::failed(cmd, "key outside the replicated keyspace")
            }
            OperationType::Kv => match cmd.operation {
                Operation::Set => {
                    batch.put(cmd.key.clone(), cmd.value.clone());
                    CommandResponse::ok(cmd, Vec::new())
                }
                Operation::Delete => {
                    batch.delete(cmd.key.clone());
                    CommandResponse::ok(cmd, Vec::new())
                }
                Operation::Get => match self.kv.get(&cmd.key)? {
                    Some(value) => CommandResponse::ok(cmd, value),
                    None => CommandResponse::failed(cmd, "key not found"),
                },
            },
        };

        applied_markers(&mut batch, index, applied_state);
        self.kv.write(batch)?;
        Ok(response)
    }

    fn snapshot(&self) -> Result<(Vec<u8>, Option<Vec<u8>>), Error> {
        let _cut = self.cut.read();
        let applied_state = self.kv.get(&stable_key(APPLIED_STATE_KEY))?;
        let mut pairs = self.kv.scan_prefix(DATA_PREFIX)?;
        pairs.extend(self.kv.scan_prefix(SEQUENCE_PREFIX)?);
        if let Some(last) = self.last_applied()? {
            pairs.extend(self.kv.range(&log_key(0), &log_key(last))?);
        }
        Ok((encode(&SnapshotContents { pairs })?, applied_state))
    }

    fn restore(&self, data: &[u8], last_index: Option<u64>, applied_state: Vec<u8>) -> Result<(), Error> {
        let contents: SnapshotContents = decode(data)?;
        let _cut = self.cut.write();

        let mut batch = WriteBatch::new();
        for (k, _) in self.kv.scan_prefix(DATA_PREFIX)? {
            batch.delete(k);
        }
        for (k, _) in self.kv.scan_prefix(SEQUENCE_PREFIX)? {
            batch.delete(k);
        }
        if let Some(last) = last_index {
            for (k, _) in self.kv.range(&log_key(0), &log_key(last))? {
                batch.delete(k);
            }
        }
        for (k, v) in contents.pairs {
            if !is_replicated_key(&k) && !k.starts_with(LOG_PREFIX) {
                return Err(Error::Storage("snapshot contains a key outside the replicated keyspace".into()));
            }
            batch.put(k, v);
        }
        match last_index {
            Some(index) => applied_markers(&mut batch, index, applied_state),
            None => {
                batch.delete(stable_key(LAST_APPLIED_KEY));
                batch.put(stable_key(APPLIED_STATE_KEY), applied_state);
            }
        }
        self.kv.write(batch)?;

        let replayed = self.rebuild_relational()?;
        tracing::info!(?last_index, replayed, "snapshot restored");
        Ok(())
    }

    /// Re-run every SQL command in the retained log, up to the last applied
    /// index, against an empty replica. Caller holds `cut` exclusively.
    fn rebuild_relational(&self) -> Result<usize, Error> {
        self.sql.reset()?;
        let Some(last) = self.last_applied()? else {
            return Ok(0);
        };

        let mut replayed = 0;
        for (_, raw) in self.kv.range(&log_key(0), &log_key(last))? {
            let record: LogRecord = decode(&raw).inspect_err(|e| {
                tracing::error!(error = %e, "undecodable log record during replay");
            })?;
            if record.log_type != LogType::Command {
                continue;
            }
            let cmd: Command = decode(&record.data).inspect_err(|e| {
                tracing::error!(index = record.index, error = %e, "undecodable command during replay");
            })?;
            if cmd.operation_type != OperationType::Sql {
                continue;
            }
            if let Ok(query) = std::str::from_utf8(&cmd.query) {
                if let Err(e) = self.sql.execute(query) {
                    tracing::debug!(index = record.index, error = %e, "replayed sql command failed");
                }
            }
            replayed += 1;
        }
        Ok(replayed)
    }
}
