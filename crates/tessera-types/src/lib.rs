use std::time::{SystemTime, UNIX_EPOCH};

pub mod codec;
pub mod sequence;

pub use sequence::{Sequence, SequenceChunkResponse, SEQUENCE_RANGE_SIZE};

pub type NodeId = u64;

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OperationType {
    Sql,
    Kv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Operation {
    Set,
    Delete,
    Get,
}

/// The unit replicated through Raft (implements openraft::AppData in tessera-consensus).
///
/// A command is immutable once proposed; every replica applies the exact same
/// bytes, so nothing in here may depend on the applying node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Command {
    pub operation_type: OperationType,
    pub operation: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub query: Vec<u8>,
    /// Proposer clock reading, nanoseconds.
    pub timestamp: i64,
}

impl Command {
    fn kv(operation: Operation, key: Vec<u8>, value: Vec<u8>) -> Self {
        Command {
            operation_type: OperationType::Kv,
            operation,
            key,
            value,
            query: Vec::new(),
            timestamp: now_ns(),
        }
    }

    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::kv(Operation::Set, key.into(), value.into())
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::kv(Operation::Delete, key.into(), Vec::new())
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::kv(Operation::Get, key.into(), Vec::new())
    }

    pub fn sql(query: impl Into<Vec<u8>>) -> Self {
        Command {
            operation_type: OperationType::Sql,
            operation: Operation::Set,
            key: Vec::new(),
            value: Vec::new(),
            query: query.into(),
            timestamp: now_ns(),
        }
    }
}

/// Result of applying a [`Command`].
///
/// The timestamps exist for latency observability only.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct CommandResponse {
    pub operation: Option<Operation>,
    pub is_success: bool,
    pub error_message: String,
    pub value: Vec<u8>,
    pub proposed_timestamp: i64,
    pub applied_timestamp: i64,
}

impl CommandResponse {
    pub fn ok(cmd: &Command, value: Vec<u8>) -> Self {
        CommandResponse {
            operation: Some(cmd.operation),
            is_success: true,
            error_message: String::new(),
            value,
            proposed_timestamp: cmd.timestamp,
            applied_timestamp: now_ns(),
        }
    }

    pub fn failed(cmd: &Command, error_message: impl Into<String>) -> Self {
        CommandResponse {
            operation: Some(cmd.operation),
            is_success: false,
            error_message: error_message.into(),
            value: Vec::new(),
            proposed_timestamp: cmd.timestamp,
            applied_timestamp: now_ns(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("no leader is known")]
    NoLeader,
    #[error("operation timed out")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Errors the cluster client may retry until its deadline.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. } | Error::NoLeader | Error::Network(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Network(e.to_string())
    }
}
