use std::io::Cursor;

use openraft::{
    AnyError, BasicNode, CommittedLeaderId, Entry, EntryPayload, LogId, StorageError,
    StorageIOError, StoredMembership,
};

use tessera_storage::{LogRecord, LogType};
use tessera_types::codec::{decode, encode};
use tessera_types::{Command, CommandResponse, Error, NodeId};

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Command,
        R            = CommandResponse,
        NodeId       = NodeId,
        Node         = BasicNode,
        Entry        = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

pub type Raft = openraft::Raft<TypeConfig>;

/// What the state machine persists next to every apply.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AppliedState {
    pub last_applied: Option<LogId<NodeId>>,
    pub membership: StoredMembership<NodeId, BasicNode>,
}

pub fn record_from_entry(entry: &Entry<TypeConfig>) -> Result<LogRecord, Error> {
    let (log_type, data) = match &entry.payload {
        EntryPayload::Blank => (LogType::Blank, Vec::new()),
        EntryPayload::Normal(cmd) => (LogType::Command, encode(cmd)?),
        EntryPayload::Membership(m) => (LogType::Membership, encode(m)?),
    };
    Ok(LogRecord {
        index: entry.log_id.index,
        term: entry.log_id.leader_id.term,
        leader: entry.log_id.leader_id.node_id,
        log_type,
        data,
    })
}

pub fn entry_from_record(record: LogRecord) -> Result<Entry<TypeConfig>, Error> {
    let log_id = LogId::new(CommittedLeaderId::new(record.term, record.leader), record.index);
    let payload = match record.log_type {
        LogType::Blank => EntryPayload::Blank,
        LogType::Command => EntryPayload::Normal(decode(&record.data)?),
        LogType::Membership => EntryPayload::Membership(decode(&record.data)?),
    };
    Ok(Entry { log_id, payload })
}

pub(crate) fn read_logs_err(e: Error) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::read_logs(AnyError::error(e)) }
}

pub(crate) fn write_logs_err(e: Error) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::write_logs(AnyError::error(e)) }
}

pub(crate) fn read_vote_err(e: Error) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::read_vote(AnyError::error(e)) }
}

pub(crate) fn write_vote_err(e: Error) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::write_vote(AnyError::error(e)) }
}

pub(crate) fn read_sm_err(e: Error) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::read_state_machine(AnyError::error(e)) }
}

pub(crate) fn write_sm_err(e: Error) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::write_state_machine(AnyError::error(e)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn entries_survive_record_conversion() {
        let log_id = LogId::new(CommittedLeaderId::new(3, 2), 17);
        let entries = vec![
            Entry::<TypeConfig> { log_id, payload: EntryPayload::Blank },
            Entry { log_id, payload: EntryPayload::Normal(Command::set("k", "v")) },
            Entry {
                log_id,
                payload: EntryPayload::Membership(openraft::Membership::new(
                    vec![BTreeSet::from([1, 2, 3])],
                    None,
                )),
            },
        ];
        for entry in entries {
            let record = record_from_entry(&entry).unwrap();
            assert_eq!(record.index, 17);
            assert_eq!(record.term, 3);
            assert_eq!(record.leader, 2);
            let back = entry_from_record(record).unwrap();
            assert_eq!(format!("{back:?}"), format!("{entry:?}"));
        }
    }
}
