//! Peer consensus traffic over the multiplexed listener.
//!
//! The client half implements openraft's network contract; the server half
//! ([`server::PeerServer`]) hands decoded requests to the local node.

pub mod codec;
pub mod server;

use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;

use tessera_types::{Error, NodeId};
use tessera_wire::{dial, Connection, MuxConfig, Protocol, ERROR_TAG};

use crate::types::TypeConfig;
use codec::{PeerRequest, PeerResponse};

pub use server::{dispatch, raft_heartbeat, HeartbeatFn, HeartbeatFuture, HeartbeatResult, PeerServer, Rpc};

/// Creates one [`PeerClient`] per replication target.
#[derive(Clone)]
pub struct PeerNetwork {
    config: MuxConfig,
}

impl PeerNetwork {
    pub fn new(config: MuxConfig) -> Self {
        PeerNetwork { config }
    }
}

impl RaftNetworkFactory<TypeConfig> for PeerNetwork {
    type Network = PeerClient;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        PeerClient { target, addr: node.addr.clone(), config: self.config.clone(), conn: None }
    }
}

/// Connection to one peer, dialed on first use and after any failure.
pub struct PeerClient {
    target: NodeId,
    addr: String,
    config: MuxConfig,
    conn: Option<Connection>,
}

/// How a call failed, before it is shaped into openraft's error type.
enum CallError {
    /// Never got a connection.
    Unreachable(Error),
    Network(Error),
}

impl PeerClient {
    async fn exchange(&mut self, request: &PeerRequest) -> Result<PeerResponse, Error> {
        let frame = request.to_frame()?;
        let conn = self.conn.as_mut().ok_or_else(|| Error::Network("not connected".into()))?;
        conn.write_frame(&frame).await?;
        let reply = conn
            .read_frame()
            .await?
            .ok_or_else(|| Error::Network(format!("peer {} closed the connection", self.target)))?;
        if reply.tag == ERROR_TAG {
            let message = reply.error_message().unwrap_or_default();
            return Err(Error::Network(format!("peer {} rejected: {message}", self.target)));
        }
        PeerResponse::from_frame(reply)
    }

    async fn call(&mut self, request: PeerRequest, ttl: Duration) -> Result<PeerResponse, CallError> {
        if self.conn.is_none() {
            let conn = tokio::time::timeout(ttl, dial(&self.addr, Protocol::Peer, &self.config))
                .await
                .map_err(|_| CallError::Unreachable(Error::Timeout))?
                .map_err(CallError::Unreachable)?;
            tracing::debug!(target_node = self.target, addr = %self.addr, "peer connection established");
            self.conn = Some(conn);
        }

        let result = match tokio::time::timeout(ttl, self.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };
        result.map_err(|e| {
            // The stream may hold half a frame; start over next time.
            self.conn = None;
            tracing::debug!(target_node = self.target, error = %e, "peer rpc failed");
            CallError::Network(e)
        })
    }
}

fn rpc_error<E: std::error::Error>(e: CallError) -> RPCError<NodeId, BasicNode, E> {
    match e {
        CallError::Unreachable(e) => RPCError::Unreachable(Unreachable::new(&e)),
        CallError::Network(e) => RPCError::Network(NetworkError::new(&e)),
    }
}

fn unexpected<E: std::error::Error>(target: NodeId, got: &PeerResponse) -> RPCError<NodeId, BasicNode, E> {
    let e = Error::Protocol(format!("peer {target} answered with {got:?}"));
    RPCError::Network(NetworkError::new(&e))
}

impl RaftNetwork<TypeConfig> for PeerClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.call(PeerRequest::AppendEntries(rpc), option.hard_ttl()).await.map_err(rpc_error)? {
            PeerResponse::AppendEntries(Ok(resp)) => Ok(resp),
            PeerResponse::AppendEntries(Err(e)) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            other => Err(unexpected(self.target, &other)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.call(PeerRequest::Vote(rpc), option.hard_ttl()).await.map_err(rpc_error)? {
            PeerResponse::Vote(Ok(resp)) => Ok(resp),
            PeerResponse::Vote(Err(e)) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            other => Err(unexpected(self.target, &other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        match self.call(PeerRequest::InstallSnapshot(rpc), option.hard_ttl()).await.map_err(rpc_error)? {
            PeerResponse::InstallSnapshot(Ok(resp)) => Ok(resp),
            PeerResponse::InstallSnapshot(Err(e)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            other => Err(unexpected(self.target, &other)),
        }
    }
}
