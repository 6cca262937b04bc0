//! openraft storage over the fjall-backed log, stable store and FSM.
//!
//! Implements openraft 0.9 `RaftLogStorage`, `RaftLogReader`,
//! `RaftStateMachine` and `RaftSnapshotBuilder`.

use std::io::Cursor;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, CommittedLeaderId, Entry, EntryPayload, LeaderId, LogId, RaftSnapshotBuilder,
    SnapshotMeta, StorageError, StoredMembership, Vote,
};
use parking_lot::Mutex;

use tessera_storage::{Fsm, LogStore, StableStore};
use tessera_types::codec::{decode, encode};
use tessera_types::{CommandResponse, Error, NodeId};

use crate::types::{
    entry_from_record, read_logs_err, read_sm_err, read_vote_err, record_from_entry,
    write_logs_err, write_sm_err, write_vote_err, AppliedState, TypeConfig,
};

const VOTE_TERM_KEY: &str = "vote_term";
const VOTE_NODE_KEY: &str = "vote_node";
const VOTE_COMMITTED_KEY: &str = "vote_committed";
const LAST_PURGED_KEY: &str = "last_purged";
const COMMITTED_KEY: &str = "committed";

// ---------------------------------------------------------------------------
// Log Store
// ---------------------------------------------------------------------------

/// Raft log and vote persistence.
///
/// Clones share the same fjall keyspace, so the reader handed out by
/// `get_log_reader` sees every later append.
#[derive(Clone)]
pub struct LogStoreAdapter {
    log: LogStore,
    stable: StableStore,
}

impl LogStoreAdapter {
    pub fn new(log: LogStore, stable: StableStore) -> Self {
        LogStoreAdapter { log, stable }
    }

    async fn read_log_id(&self, key: &str) -> Result<Option<LogId<NodeId>>, Error> {
        self.stable.get(key).await?.map(|raw| decode::<LogId<NodeId>>(&raw)).transpose()
    }

    async fn write_log_id(&self, key: &str, log_id: Option<LogId<NodeId>>) -> Result<(), Error> {
        match log_id {
            Some(id) => self.stable.set(key, encode(&id)?).await,
            None => self.stable.delete(key).await,
        }
    }

    pub(crate) async fn store_entries<I>(&self, entries: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        let records = entries
            .into_iter()
            .map(|e| record_from_entry(&e))
            .collect::<Result<Vec<_>, _>>()?;
        if records.is_empty() {
            return Ok(());
        }
        self.log.store_logs(records).await
    }
}

/// Inclusive `[from, to]` for a range over log indexes, or `None` if empty.
fn inclusive_bounds<RB: RangeBounds<u64>>(range: &RB) -> Option<(u64, u64)> {
    let from = match range.start_bound() {
        Bound::Included(&n) => n,
        Bound::Excluded(&n) => n.checked_add(1)?,
        Bound::Unbounded => 0,
    };
    let to = match range.end_bound() {
        Bound::Included(&n) => n,
        Bound::Excluded(&n) => n.checked_sub(1)?,
        Bound::Unbounded => u64::MAX,
    };
    (from <= to).then_some((from, to))
}

impl RaftLogReader<TypeConfig> for LogStoreAdapter {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let Some((from, to)) = inclusive_bounds(&range) else {
            return Ok(Vec::new());
        };
        self.log
            .get_logs(from, to)
            .await
            .map_err(read_logs_err)?
            .into_iter()
            .map(entry_from_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_logs_err)
    }
}

impl RaftLogStorage<TypeConfig> for LogStoreAdapter {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id = self.read_log_id(LAST_PURGED_KEY).await.map_err(read_logs_err)?;
        let last = self.log.last_record().await.map_err(read_logs_err)?.map(|r| {
            LogId::new(CommittedLeaderId::new(r.term, r.leader), r.index)
        });
        Ok(LogState { last_purged_log_id, last_log_id: last.or(last_purged_log_id) })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.stable
            .set_u64_many(&[
                (VOTE_TERM_KEY, vote.leader_id.term),
                (VOTE_NODE_KEY, vote.leader_id.node_id),
                (VOTE_COMMITTED_KEY, u64::from(vote.committed)),
            ])
            .await
            .map_err(write_vote_err)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        let Some(term) = self.stable.get_u64(VOTE_TERM_KEY).await.map_err(read_vote_err)? else {
            return Ok(None);
        };
        let node_id = self.stable.get_u64(VOTE_NODE_KEY).await.map_err(read_vote_err)?.unwrap_or(0);
        let committed =
            self.stable.get_u64(VOTE_COMMITTED_KEY).await.map_err(read_vote_err)?.unwrap_or(0) != 0;
        Ok(Some(Vote { leader_id: LeaderId::new(term, node_id), committed }))
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.write_log_id(COMMITTED_KEY, committed).await.map_err(write_logs_err)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.read_log_id(COMMITTED_KEY).await.map_err(read_logs_err)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        // store_logs returns after the durable commit.
        self.store_entries(entries).await.map_err(write_logs_err)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(index = log_id.index, "truncating log");
        self.log.delete_range(log_id.index, u64::MAX).await.map_err(write_logs_err)?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        // Marker first: a crash between the two writes leaves stale records
        // below it, which are never read.
        self.write_log_id(LAST_PURGED_KEY, Some(log_id)).await.map_err(write_logs_err)?;
        let removed = self.log.delete_range(0, log_id.index).await.map_err(write_logs_err)?;
        tracing::debug!(index = log_id.index, removed, "purged log");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State Machine
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

/// Feeds committed entries to the [`Fsm`] and builds/installs snapshots.
#[derive(Clone)]
pub struct StateMachineAdapter {
    fsm: Fsm,
    applied: Arc<Mutex<AppliedState>>,
    current_snapshot: Arc<Mutex<Option<StoredSnapshot>>>,
}

impl StateMachineAdapter {
    /// Resume from whatever the FSM last persisted.
    pub async fn open(fsm: Fsm) -> Result<Self, Error> {
        let applied = match fsm.applied_state().await? {
            Some(raw) if !raw.is_empty() => decode::<AppliedState>(&raw)?,
            _ => AppliedState::default(),
        };
        Ok(StateMachineAdapter {
            fsm,
            applied: Arc::new(Mutex::new(applied)),
            current_snapshot: Arc::new(Mutex::new(None)),
        })
    }

    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    async fn apply_entry(&self, entry: Entry<TypeConfig>) -> Result<CommandResponse, Error> {
        let log_id = entry.log_id;
        let mut next = self.applied.lock().clone();
        next.last_applied = Some(log_id);

        let response = match entry.payload {
            EntryPayload::Blank => {
                self.fsm.mark_applied(log_id.index, encode(&next)?).await?;
                CommandResponse::default()
            }
            EntryPayload::Normal(cmd) => self.fsm.apply(log_id.index, cmd, encode(&next)?).await?,
            EntryPayload::Membership(membership) => {
                next.membership = StoredMembership::new(Some(log_id), membership);
                self.fsm.mark_applied(log_id.index, encode(&next)?).await?;
                CommandResponse::default()
            }
        };

        *self.applied.lock() = next;
        Ok(response)
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineAdapter {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let applied = self.applied.lock().clone();
        Ok((applied.last_applied, applied.membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();
        for entry in entries {
            let index = entry.log_id.index;
            let response = self.apply_entry(entry).await.map_err(|e| {
                tracing::error!(index, error = %e, "failed to apply committed entry");
                write_sm_err(e)
            })?;
            responses.push(response);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let applied = AppliedState {
            last_applied: meta.last_log_id,
            membership: meta.last_membership.clone(),
        };
        let data = snapshot.into_inner();
        let blob = encode(&applied).map_err(write_sm_err)?;
        self.fsm
            .restore(data.clone(), meta.last_log_id.map(|id| id.index), blob)
            .await
            .map_err(write_sm_err)?;

        tracing::info!(snapshot_id = %meta.snapshot_id, last_log_id = ?meta.last_log_id, "installed snapshot");
        *self.applied.lock() = applied;
        *self.current_snapshot.lock() = Some(StoredSnapshot { meta: meta.clone(), data });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.current_snapshot.lock().clone().map(|snap| Snapshot {
            meta: snap.meta,
            snapshot: Box::new(Cursor::new(snap.data)),
        }))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineAdapter {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let (data, blob) = self.fsm.snapshot().await.map_err(read_sm_err)?;
        let applied = match blob {
            Some(raw) if !raw.is_empty() => decode::<AppliedState>(&raw).map_err(read_sm_err)?,
            _ => AppliedState::default(),
        };

        let snapshot_id = format!(
            "{}-{}",
            applied.last_applied.map_or(0, |id| id.index),
            uuid::Uuid::new_v4()
        );
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership,
            snapshot_id,
        };
        tracing::info!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "built snapshot");

        *self.current_snapshot.lock() =
            Some(StoredSnapshot { meta: meta.clone(), data: data.clone() });
        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(data)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tessera_storage::keys::data_key;
    use tessera_storage::KvStore;
    use tessera_types::Command;

    fn log_id(term: u64, index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(term, 1), index)
    }

    fn blank(term: u64, index: u64) -> Entry<TypeConfig> {
        Entry { log_id: log_id(term, index), payload: EntryPayload::Blank }
    }

    fn normal(index: u64, cmd: Command) -> Entry<TypeConfig> {
        Entry { log_id: log_id(1, index), payload: EntryPayload::Normal(cmd) }
    }

    fn log_store(kv: &Arc<KvStore>) -> LogStoreAdapter {
        LogStoreAdapter::new(LogStore::new(kv.clone()), StableStore::new(kv.clone()))
    }

    #[tokio::test]
    async fn vote_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = log_store(&KvStore::open(dir.path()).unwrap());
            assert!(store.read_vote().await.unwrap().is_none());
            let mut vote = Vote::new(4, 2);
            vote.commit();
            store.save_vote(&vote).await.unwrap();
        }
        let mut store = log_store(&KvStore::open(dir.path()).unwrap());
        let vote = store.read_vote().await.unwrap().unwrap();
        assert_eq!(vote.leader_id, LeaderId::new(4, 2));
        assert!(vote.committed);
    }

    #[tokio::test]
    async fn entries_truncate_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = log_store(&KvStore::open(dir.path()).unwrap());

        store.store_entries((1..=6).map(|i| blank(1, i))).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 6)));
        assert!(state.last_purged_log_id.is_none());

        let got = store.try_get_log_entries(2..4).await.unwrap();
        assert_eq!(got.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(store.try_get_log_entries(5..).await.unwrap().len(), 2);

        store.truncate(log_id(1, 5)).await.unwrap();
        assert_eq!(store.get_log_state().await.unwrap().last_log_id, Some(log_id(1, 4)));

        store.purge(log_id(1, 4)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(1, 4)));
        assert_eq!(state.last_log_id, Some(log_id(1, 4)));
        assert!(store.try_get_log_entries(..).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_marker_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = log_store(&KvStore::open(dir.path()).unwrap());
        assert!(store.read_committed().await.unwrap().is_none());
        store.save_committed(Some(log_id(2, 9))).await.unwrap();
        assert_eq!(store.read_committed().await.unwrap(), Some(log_id(2, 9)));
    }

    #[tokio::test]
    async fn apply_then_snapshot_into_fresh_node() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_kv = KvStore::open(src_dir.path()).unwrap();
        let src_log = log_store(&src_kv);
        let mut src = StateMachineAdapter::open(Fsm::open(src_kv.clone()).await.unwrap()).await.unwrap();

        let membership = openraft::Membership::new(vec![BTreeSet::from([1])], None);
        let entries = vec![
            blank(1, 1),
            Entry { log_id: log_id(1, 2), payload: EntryPayload::Membership(membership) },
            normal(3, Command::sql("CREATE TABLE t (id INTEGER)")),
            normal(4, Command::sql("INSERT INTO t VALUES (7)")),
            normal(5, Command::set(data_key(b"k"), "v")),
        ];
        src_log.store_entries(entries.clone()).await.unwrap();
        let responses = src.apply(entries).await.unwrap();
        assert_eq!(responses.len(), 5);
        assert!(responses[4].is_success);

        let (last, membership) = src.applied_state().await.unwrap();
        assert_eq!(last, Some(log_id(1, 5)));
        assert_eq!(membership.log_id(), &Some(log_id(1, 2)));

        let snapshot = src.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, Some(log_id(1, 5)));
        assert!(src.get_current_snapshot().await.unwrap().is_some());

        let dst_dir = tempfile::tempdir().unwrap();
        let dst_kv = KvStore::open(dst_dir.path()).unwrap();
        let mut dst = StateMachineAdapter::open(Fsm::open(dst_kv.clone()).await.unwrap()).await.unwrap();
        dst.install_snapshot(&snapshot.meta, snapshot.snapshot).await.unwrap();

        let (last, membership) = dst.applied_state().await.unwrap();
        assert_eq!(last, Some(log_id(1, 5)));
        assert_eq!(membership.log_id(), &Some(log_id(1, 2)));
        assert_eq!(dst.fsm().get(data_key(b"k")).await.unwrap().unwrap(), b"v");
        let rows = dst.fsm().query("SELECT id FROM t".into()).await.unwrap().rows;
        assert_eq!(rows.len(), 1);

        // A restarted node resumes from the persisted applied state.
        drop(dst);
        let mut reopened = StateMachineAdapter::open(Fsm::open(dst_kv).await.unwrap()).await.unwrap();
        assert_eq!(reopened.applied_state().await.unwrap().0, Some(log_id(1, 5)));
    }
}
