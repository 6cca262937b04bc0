use tessera_types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogType {
    /// No-op entry appended by a new leader.
    Blank,
    /// bincode(`Command`).
    Command,
    /// bincode of the consensus library's membership config.
    Membership,
}

/// One persisted Raft log record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogRecord {
    pub index: u64,
    pub term: u64,
    /// Leader that proposed the record; log ids are (term, leader, index).
    pub leader: NodeId,
    pub log_type: LogType,
    pub data: Vec<u8>,
}
