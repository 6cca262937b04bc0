//! Binary layouts for peer consensus frames.
//!
//! All integers are big-endian. Optional log ids carry a presence byte.
//! Every response payload starts with an error string (`i32` length, `-1`
//! when there is no error). After a present error comes the encoded openraft
//! error, otherwise the response body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::{BasicNode, CommittedLeaderId, Entry, LeaderId, LogId, SnapshotMeta, StoredMembership, Vote};

use tessera_storage::{LogRecord, LogType};
use tessera_types::codec::{decode, encode};
use tessera_types::{Error, NodeId};
use tessera_wire::Frame;

use crate::types::{entry_from_record, record_from_entry, TypeConfig};

pub const APPEND_ENTRIES_REQUEST: u8 = b'a';
pub const APPEND_ENTRIES_RESPONSE: u8 = b'A';
pub const VOTE_REQUEST: u8 = b'v';
pub const VOTE_RESPONSE: u8 = b'V';
pub const INSTALL_SNAPSHOT_REQUEST: u8 = b's';
pub const INSTALL_SNAPSHOT_RESPONSE: u8 = b'S';

const APPEND_SUCCESS: u8 = 0;
const APPEND_PARTIAL_SUCCESS: u8 = 1;
const APPEND_CONFLICT: u8 = 2;
const APPEND_HIGHER_VOTE: u8 = 3;

#[derive(Debug)]
pub enum PeerRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// A reply; `Err` is the failure the remote node returned.
#[derive(Debug)]
pub enum PeerResponse {
    AppendEntries(Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    Vote(Result<VoteResponse<NodeId>, RaftError<NodeId>>),
    InstallSnapshot(Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>),
}

/// An empty AppendEntries carrying nothing but the leader's vote.
pub fn is_heartbeat(req: &AppendEntriesRequest<TypeConfig>) -> bool {
    req.vote.leader_id.term != 0
        && req.vote.leader_id.node_id != 0
        && req.prev_log_id.map_or(true, |id| id.index == 0 && id.leader_id.term == 0)
        && req.entries.is_empty()
        && req.leader_commit.map_or(true, |id| id.index == 0)
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn short(what: &str) -> Error {
    Error::Protocol(format!("truncated {what}"))
}

fn get_u8(src: &mut Bytes, what: &str) -> Result<u8, Error> {
    if src.remaining() < 1 {
        return Err(short(what));
    }
    Ok(src.get_u8())
}

fn get_u32(src: &mut Bytes, what: &str) -> Result<u32, Error> {
    if src.remaining() < 4 {
        return Err(short(what));
    }
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes, what: &str) -> Result<u64, Error> {
    if src.remaining() < 8 {
        return Err(short(what));
    }
    Ok(src.get_u64())
}

fn get_bytes(src: &mut Bytes, len: usize, what: &str) -> Result<Bytes, Error> {
    if src.remaining() < len {
        return Err(short(what));
    }
    Ok(src.split_to(len))
}

fn get_bool(src: &mut Bytes, what: &str) -> Result<bool, Error> {
    Ok(get_u8(src, what)? != 0)
}

fn put_blob(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
}

fn get_blob(src: &mut Bytes, what: &str) -> Result<Bytes, Error> {
    let len = get_u32(src, what)? as usize;
    get_bytes(src, len, what)
}

fn put_vote(dst: &mut BytesMut, vote: &Vote<NodeId>) {
    dst.put_u64(vote.leader_id.term);
    dst.put_u64(vote.leader_id.node_id);
    dst.put_u8(u8::from(vote.committed));
}

fn get_vote(src: &mut Bytes) -> Result<Vote<NodeId>, Error> {
    let term = get_u64(src, "vote")?;
    let node_id = get_u64(src, "vote")?;
    let committed = get_bool(src, "vote")?;
    Ok(Vote { leader_id: LeaderId::new(term, node_id), committed })
}

fn put_log_id(dst: &mut BytesMut, id: &Option<LogId<NodeId>>) {
    match id {
        Some(id) => {
            dst.put_u8(1);
            dst.put_u64(id.leader_id.term);
            dst.put_u64(id.leader_id.node_id);
            dst.put_u64(id.index);
        }
        None => dst.put_u8(0),
    }
}

fn get_log_id(src: &mut Bytes) -> Result<Option<LogId<NodeId>>, Error> {
    if !get_bool(src, "log id")? {
        return Ok(None);
    }
    let term = get_u64(src, "log id")?;
    let node_id = get_u64(src, "log id")?;
    let index = get_u64(src, "log id")?;
    Ok(Some(LogId::new(CommittedLeaderId::new(term, node_id), index)))
}

fn log_type_byte(t: LogType) -> u8 {
    match t {
        LogType::Blank => 0,
        LogType::Command => 1,
        LogType::Membership => 2,
    }
}

fn put_entry(dst: &mut BytesMut, entry: &Entry<TypeConfig>) -> Result<(), Error> {
    let record = record_from_entry(entry)?;
    dst.put_u64(record.index);
    dst.put_u64(record.term);
    dst.put_u64(record.leader);
    dst.put_u8(log_type_byte(record.log_type));
    put_blob(dst, &record.data);
    Ok(())
}

fn get_entry(src: &mut Bytes) -> Result<Entry<TypeConfig>, Error> {
    let index = get_u64(src, "entry")?;
    let term = get_u64(src, "entry")?;
    let leader = get_u64(src, "entry")?;
    let log_type = match get_u8(src, "entry")? {
        0 => LogType::Blank,
        1 => LogType::Command,
        2 => LogType::Membership,
        other => return Err(Error::Protocol(format!("unknown entry type {other}"))),
    };
    let data = get_blob(src, "entry")?.to_vec();
    entry_from_record(LogRecord { index, term, leader, log_type, data })
}

fn put_snapshot_meta(dst: &mut BytesMut, meta: &SnapshotMeta<NodeId, BasicNode>) -> Result<(), Error> {
    put_log_id(dst, &meta.last_log_id);
    put_blob(dst, &encode(&meta.last_membership)?);
    put_blob(dst, meta.snapshot_id.as_bytes());
    Ok(())
}

fn get_snapshot_meta(src: &mut Bytes) -> Result<SnapshotMeta<NodeId, BasicNode>, Error> {
    let last_log_id = get_log_id(src)?;
    let last_membership: StoredMembership<NodeId, BasicNode> = decode(&get_blob(src, "snapshot meta")?)?;
    let snapshot_id = String::from_utf8(get_blob(src, "snapshot meta")?.to_vec())
        .map_err(|_| Error::Protocol("snapshot id is not UTF-8".into()))?;
    Ok(SnapshotMeta { last_log_id, last_membership, snapshot_id })
}

fn put_error(dst: &mut BytesMut, err: Option<&str>) {
    match err {
        Some(msg) => {
            dst.put_i32(msg.len() as i32);
            dst.put_slice(msg.as_bytes());
        }
        None => dst.put_i32(-1),
    }
}

fn get_error(src: &mut Bytes) -> Result<Option<String>, Error> {
    let len = get_u32(src, "error string")? as i32;
    if len < 0 {
        return Ok(None);
    }
    let raw = get_bytes(src, len as usize, "error string")?;
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

fn put_failure<E: serde::Serialize + std::fmt::Display>(dst: &mut BytesMut, err: &E) -> Result<(), Error> {
    put_error(dst, Some(&err.to_string()));
    put_blob(dst, &encode(err)?);
    Ok(())
}

fn get_failure<E: for<'de> serde::Deserialize<'de>>(src: &mut Bytes) -> Result<E, Error> {
    decode(&get_blob(src, "remote error")?)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

impl PeerRequest {
    pub fn to_frame(&self) -> Result<Frame, Error> {
        let mut buf = BytesMut::new();
        let tag = match self {
            PeerRequest::AppendEntries(req) => {
                put_vote(&mut buf, &req.vote);
                put_log_id(&mut buf, &req.prev_log_id);
                put_log_id(&mut buf, &req.leader_commit);
                buf.put_u32(req.entries.len() as u32);
                for entry in &req.entries {
                    put_entry(&mut buf, entry)?;
                }
                APPEND_ENTRIES_REQUEST
            }
            PeerRequest::Vote(req) => {
                put_vote(&mut buf, &req.vote);
                put_log_id(&mut buf, &req.last_log_id);
                VOTE_REQUEST
            }
            PeerRequest::InstallSnapshot(req) => {
                put_vote(&mut buf, &req.vote);
                put_snapshot_meta(&mut buf, &req.meta)?;
                buf.put_u64(req.offset);
                put_blob(&mut buf, &req.data);
                buf.put_u8(u8::from(req.done));
                INSTALL_SNAPSHOT_REQUEST
            }
        };
        Ok(Frame::new(tag, buf.freeze()))
    }

    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        let mut src = frame.payload;
        let request = match frame.tag {
            APPEND_ENTRIES_REQUEST => {
                let vote = get_vote(&mut src)?;
                let prev_log_id = get_log_id(&mut src)?;
                let leader_commit = get_log_id(&mut src)?;
                let count = get_u32(&mut src, "entry count")? as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    entries.push(get_entry(&mut src)?);
                }
                PeerRequest::AppendEntries(AppendEntriesRequest {
                    vote,
                    prev_log_id,
                    entries,
                    leader_commit,
                })
            }
            VOTE_REQUEST => {
                let vote = get_vote(&mut src)?;
                let last_log_id = get_log_id(&mut src)?;
                PeerRequest::Vote(VoteRequest { vote, last_log_id })
            }
            INSTALL_SNAPSHOT_REQUEST => {
                let vote = get_vote(&mut src)?;
                let meta = get_snapshot_meta(&mut src)?;
                let offset = get_u64(&mut src, "snapshot offset")?;
                let data = get_blob(&mut src, "snapshot data")?.to_vec();
                let done = get_bool(&mut src, "snapshot done")?;
                PeerRequest::InstallSnapshot(InstallSnapshotRequest { vote, meta, offset, data, done })
            }
            other => return Err(Error::Protocol(format!("unexpected peer request tag {other:#04x}"))),
        };
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

impl PeerResponse {
    pub fn to_frame(&self) -> Result<Frame, Error> {
        let mut buf = BytesMut::new();
        let tag = match self {
            PeerResponse::AppendEntries(resp) => {
                match resp {
                    Ok(resp) => {
                        put_error(&mut buf, None);
                        match resp {
                            AppendEntriesResponse::Success => buf.put_u8(APPEND_SUCCESS),
                            AppendEntriesResponse::PartialSuccess(id) => {
                                buf.put_u8(APPEND_PARTIAL_SUCCESS);
                                put_log_id(&mut buf, id);
                            }
                            AppendEntriesResponse::Conflict => buf.put_u8(APPEND_CONFLICT),
                            AppendEntriesResponse::HigherVote(vote) => {
                                buf.put_u8(APPEND_HIGHER_VOTE);
                                put_vote(&mut buf, vote);
                            }
                        }
                    }
                    Err(e) => put_failure(&mut buf, e)?,
                }
                APPEND_ENTRIES_RESPONSE
            }
            PeerResponse::Vote(resp) => {
                match resp {
                    Ok(resp) => {
                        put_error(&mut buf, None);
                        put_vote(&mut buf, &resp.vote);
                        buf.put_u8(u8::from(resp.vote_granted));
                        put_log_id(&mut buf, &resp.last_log_id);
                    }
                    Err(e) => put_failure(&mut buf, e)?,
                }
                VOTE_RESPONSE
            }
            PeerResponse::InstallSnapshot(resp) => {
                match resp {
                    Ok(resp) => {
                        put_error(&mut buf, None);
                        put_vote(&mut buf, &resp.vote);
                    }
                    Err(e) => put_failure(&mut buf, e)?,
                }
                INSTALL_SNAPSHOT_RESPONSE
            }
        };
        Ok(Frame::new(tag, buf.freeze()))
    }

    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        let mut src = frame.payload;
        let failed = get_error(&mut src)?.is_some();
        let response = match frame.tag {
            APPEND_ENTRIES_RESPONSE if failed => PeerResponse::AppendEntries(Err(get_failure(&mut src)?)),
            VOTE_RESPONSE if failed => PeerResponse::Vote(Err(get_failure(&mut src)?)),
            INSTALL_SNAPSHOT_RESPONSE if failed => {
                PeerResponse::InstallSnapshot(Err(get_failure(&mut src)?))
            }
            APPEND_ENTRIES_RESPONSE => {
                let resp = match get_u8(&mut src, "append entries kind")? {
                    APPEND_SUCCESS => AppendEntriesResponse::Success,
                    APPEND_PARTIAL_SUCCESS => AppendEntriesResponse::PartialSuccess(get_log_id(&mut src)?),
                    APPEND_CONFLICT => AppendEntriesResponse::Conflict,
                    APPEND_HIGHER_VOTE => AppendEntriesResponse::HigherVote(get_vote(&mut src)?),
                    other => {
                        return Err(Error::Protocol(format!("unknown append entries kind {other}")))
                    }
                };
                PeerResponse::AppendEntries(Ok(resp))
            }
            VOTE_RESPONSE => {
                let vote = get_vote(&mut src)?;
                let vote_granted = get_bool(&mut src, "vote granted")?;
                let last_log_id = get_log_id(&mut src)?;
                PeerResponse::Vote(Ok(VoteResponse { vote, vote_granted, last_log_id }))
            }
            INSTALL_SNAPSHOT_RESPONSE => {
                PeerResponse::InstallSnapshot(Ok(InstallSnapshotResponse { vote: get_vote(&mut src)? }))
            }
            other => return Err(Error::Protocol(format!("unexpected peer response tag {other:#04x}"))),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::error::{Fatal, SnapshotMismatch};
    use openraft::{EntryPayload, Membership, SnapshotSegmentId};
    use std::collections::BTreeSet;
    use tessera_types::Command;

    fn log_id(term: u64, node: u64, index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(term, node), index)
    }

    fn request_round_trip(req: PeerRequest) {
        let frame = req.to_frame().unwrap();
        let back = PeerRequest::from_frame(frame).unwrap();
        assert_eq!(format!("{back:?}"), format!("{req:?}"));
    }

    fn response_round_trip(resp: PeerResponse) {
        let back = PeerResponse::from_frame(resp.to_frame().unwrap()).unwrap();
        assert_eq!(format!("{back:?}"), format!("{resp:?}"));
    }

    #[test]
    fn append_entries_request_with_every_entry_kind() {
        let entries = vec![
            Entry { log_id: log_id(2, 1, 4), payload: EntryPayload::Blank },
            Entry { log_id: log_id(2, 1, 5), payload: EntryPayload::Normal(Command::sql("SELECT 1")) },
            Entry {
                log_id: log_id(2, 1, 6),
                payload: EntryPayload::Membership(Membership::new(vec![BTreeSet::from([1, 2])], None)),
            },
        ];
        request_round_trip(PeerRequest::AppendEntries(AppendEntriesRequest {
            vote: Vote::new_committed(2, 1),
            prev_log_id: Some(log_id(1, 1, 3)),
            entries,
            leader_commit: Some(log_id(1, 1, 3)),
        }));
    }

    #[test]
    fn vote_and_snapshot_requests() {
        request_round_trip(PeerRequest::Vote(VoteRequest {
            vote: Vote::new(3, 2),
            last_log_id: None,
        }));

        let membership = StoredMembership::new(
            Some(log_id(1, 1, 1)),
            Membership::new(vec![BTreeSet::from([1, 2, 3])], None),
        );
        request_round_trip(PeerRequest::InstallSnapshot(InstallSnapshotRequest {
            vote: Vote::new_committed(3, 1),
            meta: SnapshotMeta {
                last_log_id: Some(log_id(3, 1, 90)),
                last_membership: membership,
                snapshot_id: "90-abc".into(),
            },
            offset: 4096,
            data: vec![1, 2, 3, 4],
            done: true,
        }));
    }

    #[test]
    fn responses_including_errors() {
        response_round_trip(PeerResponse::AppendEntries(Ok(AppendEntriesResponse::Success)));
        response_round_trip(PeerResponse::AppendEntries(Ok(AppendEntriesResponse::PartialSuccess(
            Some(log_id(2, 1, 7)),
        ))));
        response_round_trip(PeerResponse::AppendEntries(Ok(AppendEntriesResponse::Conflict)));
        response_round_trip(PeerResponse::AppendEntries(Ok(AppendEntriesResponse::HigherVote(
            Vote::new(9, 3),
        ))));
        response_round_trip(PeerResponse::AppendEntries(Err(RaftError::Fatal(Fatal::Stopped))));
        response_round_trip(PeerResponse::Vote(Ok(VoteResponse {
            vote: Vote::new(4, 2),
            vote_granted: true,
            last_log_id: Some(log_id(3, 1, 11)),
        })));
        response_round_trip(PeerResponse::Vote(Err(RaftError::Fatal(Fatal::Panicked))));
        response_round_trip(PeerResponse::InstallSnapshot(Ok(InstallSnapshotResponse {
            vote: Vote::new_committed(5, 1),
        })));
        response_round_trip(PeerResponse::InstallSnapshot(Err(RaftError::APIError(
            InstallSnapshotError::SnapshotMismatch(SnapshotMismatch {
                expect: SnapshotSegmentId { id: "a".into(), offset: 0 },
                got: SnapshotSegmentId { id: "b".into(), offset: 64 },
            }),
        ))));
    }

    #[test]
    fn truncated_payloads_are_protocol_errors() {
        let frame = PeerRequest::Vote(VoteRequest { vote: Vote::new(1, 1), last_log_id: None })
            .to_frame()
            .unwrap();
        let cut = Frame::new(frame.tag, frame.payload.slice(..frame.payload.len() - 2));
        assert!(matches!(PeerRequest::from_frame(cut), Err(Error::Protocol(_))));
        assert!(PeerRequest::from_frame(Frame::new(b'?', Bytes::new())).is_err());
    }

    #[test]
    fn heartbeat_detection() {
        let mut req = AppendEntriesRequest::<TypeConfig> {
            vote: Vote::new_committed(1, 1),
            prev_log_id: None,
            entries: vec![],
            leader_commit: None,
        };
        assert!(is_heartbeat(&req));

        req.prev_log_id = Some(log_id(0, 0, 0));
        assert!(is_heartbeat(&req));

        req.leader_commit = Some(log_id(1, 1, 5));
        assert!(!is_heartbeat(&req));

        req.leader_commit = None;
        req.vote = Vote::new_committed(1, 0);
        assert!(!is_heartbeat(&req));

        req.vote = Vote::new_committed(1, 1);
        req.entries.push(Entry { log_id: log_id(1, 1, 1), payload: EntryPayload::Blank });
        assert!(!is_heartbeat(&req));
    }
}
