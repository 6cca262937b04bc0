//! Internal RPC between cluster members: command forwarding, sequence
//! grants, membership joins and node id assignment.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;

use tessera_consensus::RaftNode;
use tessera_types::codec::{decode, encode};
use tessera_types::{Command, CommandResponse, Error, NodeId, SequenceChunkResponse};
use tessera_wire::{dial, Connection, Frame, MuxConfig, MuxListener, Protocol, ERROR_TAG};

use crate::sequence::{SequenceGrantor, NODE_ID_SEQUENCE};

const SEND_COMMAND: u8 = b'c';
const GET_SEQUENCE_CHUNK: u8 = b'q';
const JOIN: u8 = b'j';
const GET_NODE_ID: u8 = b'n';

const COMMAND_RESULT: u8 = b'C';
const SEQUENCE_CHUNK: u8 = b'Q';
const JOINED: u8 = b'J';
const ASSIGNED_NODE_ID: u8 = b'N';
const FAILED: u8 = b'X';

const RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_NODE_ID_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterRequest {
    SendCommand(Command),
    GetSequenceChunk { name: String },
    Join { node_id: NodeId, addr: String },
    GetNodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterResponse {
    Command(CommandResponse),
    SequenceChunk(SequenceChunkResponse),
    Joined,
    NodeId(NodeId),
    Failed(Error),
}

impl ClusterRequest {
    pub fn to_frame(&self) -> Result<Frame, Error> {
        let frame = match self {
            ClusterRequest::SendCommand(cmd) => Frame::new(SEND_COMMAND, encode(cmd)?),
            ClusterRequest::GetSequenceChunk { name } => {
                Frame::new(GET_SEQUENCE_CHUNK, Bytes::copy_from_slice(name.as_bytes()))
            }
            ClusterRequest::Join { node_id, addr } => Frame::new(JOIN, encode(&(node_id, addr))?),
            ClusterRequest::GetNodeId => Frame::new(GET_NODE_ID, Bytes::new()),
        };
        Ok(frame)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, Error> {
        let request = match frame.tag {
            SEND_COMMAND => ClusterRequest::SendCommand(decode(&frame.payload)?),
            GET_SEQUENCE_CHUNK => ClusterRequest::GetSequenceChunk {
                name: String::from_utf8(frame.payload.to_vec())
                    .map_err(|_| Error::Protocol("sequence name is not UTF-8".into()))?,
            },
            JOIN => {
                let (node_id, addr) = decode(&frame.payload)?;
                ClusterRequest::Join { node_id, addr }
            }
            GET_NODE_ID => ClusterRequest::GetNodeId,
            other => return Err(Error::Protocol(format!("unknown cluster request tag {other:#04x}"))),
        };
        Ok(request)
    }
}

impl ClusterResponse {
    pub fn to_frame(&self) -> Result<Frame, Error> {
        let frame = match self {
            ClusterResponse::Command(resp) => Frame::new(COMMAND_RESULT, encode(resp)?),
            ClusterResponse::SequenceChunk(chunk) => Frame::new(SEQUENCE_CHUNK, encode(chunk)?),
            ClusterResponse::Joined => Frame::new(JOINED, Bytes::new()),
            ClusterResponse::NodeId(id) => Frame::new(ASSIGNED_NODE_ID, Bytes::copy_from_slice(&id.to_be_bytes())),
            ClusterResponse::Failed(e) => Frame::new(FAILED, encode(e)?),
        };
        Ok(frame)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, Error> {
        let response = match frame.tag {
            COMMAND_RESULT => ClusterResponse::Command(decode(&frame.payload)?),
            SEQUENCE_CHUNK => ClusterResponse::SequenceChunk(decode(&frame.payload)?),
            JOINED => ClusterResponse::Joined,
            ASSIGNED_NODE_ID => {
                let raw: [u8; 8] = frame
                    .payload
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Protocol("node id must be 8 bytes".into()))?;
                ClusterResponse::NodeId(u64::from_be_bytes(raw))
            }
            FAILED => ClusterResponse::Failed(decode(&frame.payload)?),
            ERROR_TAG => ClusterResponse::Failed(Error::Network(frame.error_message().unwrap_or_default())),
            other => return Err(Error::Protocol(format!("unknown cluster response tag {other:#04x}"))),
        };
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Answers internal RPCs from the local node. Requests that need the leader
/// fail with `NotLeader` carrying the leader's address.
pub struct ClusterServer<N> {
    listener: MuxListener,
    node: Arc<N>,
    grantor: Arc<SequenceGrantor<N>>,
}

impl<N: RaftNode> ClusterServer<N> {
    pub fn new(listener: MuxListener, node: Arc<N>, grantor: Arc<SequenceGrantor<N>>) -> Self {
        ClusterServer { listener, node, grantor }
    }

    pub async fn serve(mut self) {
        tracing::info!(addr = %self.listener.addr(), "cluster rpc accepting");
        loop {
            let accepted = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "cluster listener stopped");
                    return;
                }
            };
            let node = self.node.clone();
            let grantor = self.grantor.clone();
            let peer_addr = accepted.peer_addr;
            tokio::spawn(async move {
                if let Err(e) = handle_conn(accepted.conn, node, grantor).await {
                    tracing::warn!(%peer_addr, error = %e, "cluster connection closed");
                }
            });
        }
    }
}

async fn handle_conn<N: RaftNode>(
    mut conn: Connection,
    node: Arc<N>,
    grantor: Arc<SequenceGrantor<N>>,
) -> Result<(), Error> {
    while let Some(frame) = conn.read_frame().await? {
        let request = ClusterRequest::from_frame(&frame)?;
        let response = handle(&*node, &grantor, request).await;
        conn.write_frame(&response.to_frame()?).await?;
    }
    Ok(())
}

async fn handle<N: RaftNode>(node: &N, grantor: &SequenceGrantor<N>, request: ClusterRequest) -> ClusterResponse {
    let result = match request {
        ClusterRequest::SendCommand(cmd) => node.propose(cmd).await.map(ClusterResponse::Command),
        ClusterRequest::GetSequenceChunk { name } => {
            grantor.grant(&name).await.map(ClusterResponse::SequenceChunk)
        }
        ClusterRequest::Join { node_id, addr } => {
            tracing::info!(node_id, %addr, "join requested");
            node.join(node_id, addr).await.map(|()| ClusterResponse::Joined)
        }
        ClusterRequest::GetNodeId => assign_node_id(node, grantor).await.map(ClusterResponse::NodeId),
    };
    result.unwrap_or_else(ClusterResponse::Failed)
}

/// First id of a fresh `_node_id` lane, skipping ids already taken by
/// members that configured theirs by hand.
async fn assign_node_id<N: RaftNode>(node: &N, grantor: &SequenceGrantor<N>) -> Result<NodeId, Error> {
    for _ in 0..MAX_NODE_ID_ATTEMPTS {
        let id = grantor.grant(NODE_ID_SEQUENCE).await?.id_at(1);
        if node.members().iter().all(|(member, _)| *member != id) {
            tracing::info!(node_id = id, "assigned node id");
            return Ok(id);
        }
    }
    Err(Error::Storage("no free node id found".into()))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Looks up the leader's address from local knowledge, if any.
pub type LeaderLocator = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Default)]
struct ClientState {
    /// Where the next dial goes; set from `NotLeader` hints.
    target: Option<String>,
    conn: Option<Connection>,
}

/// Sends internal RPCs to the leader, following `NotLeader` hints.
///
/// Transient failures (no leader, stale leader, network) are retried until
/// the request timeout. One connection is shared by all callers and redialed
/// lazily under the state mutex.
pub struct ClusterClient {
    seed: Option<String>,
    locate: Option<LeaderLocator>,
    mux: MuxConfig,
    timeout: Duration,
    state: Mutex<ClientState>,
}

impl ClusterClient {
    /// `seed` is any member to try when nothing better is known.
    pub fn new(seed: Option<String>, mux: MuxConfig, timeout: Duration) -> Self {
        ClusterClient { seed, locate: None, mux, timeout, state: Mutex::new(ClientState::default()) }
    }

    pub fn with_locator(mut self, locate: LeaderLocator) -> Self {
        self.locate = Some(locate);
        self
    }

    pub async fn send_command(&self, cmd: Command) -> Result<CommandResponse, Error> {
        match self.call(ClusterRequest::SendCommand(cmd)).await? {
            ClusterResponse::Command(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_sequence_chunk(&self, name: &str) -> Result<SequenceChunkResponse, Error> {
        match self.call(ClusterRequest::GetSequenceChunk { name: name.to_string() }).await? {
            ClusterResponse::SequenceChunk(chunk) => Ok(chunk),
            other => Err(unexpected(other)),
        }
    }

    pub async fn join(&self, node_id: NodeId, addr: &str) -> Result<(), Error> {
        match self.call(ClusterRequest::Join { node_id, addr: addr.to_string() }).await? {
            ClusterResponse::Joined => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_node_id(&self) -> Result<NodeId, Error> {
        match self.call(ClusterRequest::GetNodeId).await? {
            ClusterResponse::NodeId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&self, request: ClusterRequest) -> Result<ClusterResponse, Error> {
        let frame = request.to_frame()?;
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match tokio::time::timeout(remaining, self.attempt(&frame)).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(Error::Timeout),
            };

            let err = match outcome {
                Ok(ClusterResponse::Failed(e)) => e,
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if Instant::now() + RETRY_DELAY >= deadline {
                tracing::debug!(error = %err, "cluster request out of time");
                return Err(Error::Timeout);
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    /// One request/response exchange under the state lock.
    ///
    /// The connection is taken out of the state for the exchange and only
    /// put back after a complete reply, so a failed or cancelled exchange
    /// never leaves a half-read frame behind.
    async fn attempt(&self, frame: &Frame) -> Result<ClusterResponse, Error> {
        let mut state = self.state.lock().await;
        let mut conn = match state.conn.take() {
            Some(conn) => conn,
            None => {
                let addr = state
                    .target
                    .clone()
                    .or_else(|| self.locate.as_ref().and_then(|locate| locate()))
                    .or_else(|| self.seed.clone())
                    .ok_or(Error::NoLeader)?;
                tracing::debug!(%addr, "dialing cluster member");
                match dial(&addr, Protocol::InternalRpc, &self.mux).await {
                    Ok(conn) => {
                        state.target = Some(addr);
                        conn
                    }
                    Err(e) => {
                        state.target = None;
                        return Err(e);
                    }
                }
            }
        };

        let response = match exchange(&mut conn, frame).await {
            Ok(response) => response,
            Err(e) => {
                state.target = None;
                return Err(e);
            }
        };
        match &response {
            ClusterResponse::Failed(Error::NotLeader { leader: Some(addr) })
                if state.target.as_deref() != Some(addr.as_str()) =>
            {
                tracing::debug!(leader = %addr, "following leader hint");
                state.target = Some(addr.clone());
            }
            _ => state.conn = Some(conn),
        }
        Ok(response)
    }
}

async fn exchange(conn: &mut Connection, frame: &Frame) -> Result<ClusterResponse, Error> {
    conn.write_frame(frame).await?;
    let reply = conn
        .read_frame()
        .await?
        .ok_or_else(|| Error::Network("cluster member closed the connection".into()))?;
    ClusterResponse::from_frame(&reply)
}

fn unexpected(response: ClusterResponse) -> Error {
    Error::Protocol(format!("unexpected cluster response {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_wire::Mux;

    #[test]
    fn requests_and_responses_round_trip() {
        let requests = vec![
            ClusterRequest::SendCommand(Command::set("k", "v")),
            ClusterRequest::GetSequenceChunk { name: "users".into() },
            ClusterRequest::Join { node_id: 3, addr: "10.0.0.3:5432".into() },
            ClusterRequest::GetNodeId,
        ];
        for req in requests {
            assert_eq!(ClusterRequest::from_frame(&req.to_frame().unwrap()).unwrap(), req);
        }

        let responses = vec![
            ClusterResponse::Command(CommandResponse::default()),
            ClusterResponse::SequenceChunk(SequenceChunkResponse { start: 1000, end: 2000, offset: 2, count: 4 }),
            ClusterResponse::Joined,
            ClusterResponse::NodeId(42),
            ClusterResponse::Failed(Error::NotLeader { leader: Some("10.0.0.1:5432".into()) }),
        ];
        for resp in responses {
            assert_eq!(ClusterResponse::from_frame(&resp.to_frame().unwrap()).unwrap(), resp);
        }
    }

    #[test]
    fn mux_rejections_read_as_network_failures() {
        let resp = ClusterResponse::from_frame(&Frame::error("listener closed")).unwrap();
        assert_eq!(resp, ClusterResponse::Failed(Error::Network("listener closed".into())));
        assert!(ClusterRequest::from_frame(&Frame::new(b'?', Bytes::new())).is_err());
    }

    /// Answers sequence grants with `NoLeader` forever and commands at once.
    async fn stubborn_member() -> String {
        let mut mux = Mux::bind("127.0.0.1:0", MuxConfig::default()).await.unwrap();
        let mut listener = mux.listener(Protocol::InternalRpc);
        let addr = mux.local_addr().to_string();
        tokio::spawn(mux.serve());
        tokio::spawn(async move {
            while let Ok(accepted) = listener.accept().await {
                tokio::spawn(async move {
                    let mut conn = accepted.conn;
                    while let Ok(Some(frame)) = conn.read_frame().await {
                        let response = match ClusterRequest::from_frame(&frame).unwrap() {
                            ClusterRequest::GetSequenceChunk { .. } => ClusterResponse::Failed(Error::NoLeader),
                            _ => ClusterResponse::Command(CommandResponse::default()),
                        };
                        conn.write_frame(&response.to_frame().unwrap()).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retrying_call_does_not_block_others() {
        let addr = stubborn_member().await;
        let client = Arc::new(ClusterClient::new(Some(addr), MuxConfig::default(), Duration::from_secs(3)));

        let retrying = {
            let client = client.clone();
            tokio::spawn(async move { client.get_sequence_chunk("ids").await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        let forwarded = tokio::time::timeout(Duration::from_secs(1), client.send_command(Command::get("k"))).await;
        assert_eq!(forwarded.expect("command waited on the retry loop").unwrap(), CommandResponse::default());
        assert_eq!(retrying.await.unwrap(), Err(Error::Timeout));
    }

    #[tokio::test]
    async fn client_without_any_address_times_out() {
        let client = ClusterClient::new(None, MuxConfig::default(), Duration::from_millis(300));
        assert_eq!(client.get_node_id().await, Err(Error::Timeout));
    }
}
