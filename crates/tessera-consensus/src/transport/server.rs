use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use openraft::error::RaftError;
use openraft::raft::{AppendEntriesRequest, AppendEntriesResponse};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use tessera_types::{Error, NodeId};
use tessera_wire::{Connection, MuxListener};

use super::codec::{is_heartbeat, PeerRequest, PeerResponse};
use crate::types::{Raft, TypeConfig};

const CONSUME_DEPTH: usize = 256;

pub type HeartbeatResult = Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>;

pub type HeartbeatFuture = Pin<Box<dyn Future<Output = HeartbeatResult> + Send>>;

/// Handles heartbeats on the connection task, without going through the RPC
/// channel.
pub type HeartbeatFn = Arc<dyn Fn(AppendEntriesRequest<TypeConfig>) -> HeartbeatFuture + Send + Sync>;

/// Fast path that hands heartbeats straight to `raft`.
pub fn raft_heartbeat(raft: Raft) -> HeartbeatFn {
    Arc::new(move |req: AppendEntriesRequest<TypeConfig>| {
        let raft = raft.clone();
        Box::pin(async move { raft.append_entries(req).await }) as HeartbeatFuture
    })
}

/// A decoded peer request waiting for the local node's answer.
pub struct Rpc {
    pub request: PeerRequest,
    pub respond_to: oneshot::Sender<PeerResponse>,
}

/// Serves the peer protocol family of the multiplexed listener.
pub struct PeerServer {
    listener: MuxListener,
    heartbeat: Arc<RwLock<Option<HeartbeatFn>>>,
    consume: mpsc::Sender<Rpc>,
}

impl PeerServer {
    /// The receiver yields every RPC not taken by the heartbeat fast path.
    pub fn new(listener: MuxListener) -> (Self, mpsc::Receiver<Rpc>) {
        let (consume, rx) = mpsc::channel(CONSUME_DEPTH);
        let server = PeerServer { listener, heartbeat: Arc::new(RwLock::new(None)), consume };
        (server, rx)
    }

    /// Install (or with `None`, remove) the heartbeat fast path. Takes effect
    /// for connections that are already open too.
    pub fn set_heartbeat_handler(&self, handler: Option<HeartbeatFn>) {
        *self.heartbeat.write() = handler;
    }

    pub async fn serve(mut self) {
        tracing::info!(addr = %self.listener.addr(), "peer transport accepting");
        loop {
            let accepted = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "peer listener stopped");
                    return;
                }
            };
            let heartbeat = self.heartbeat.clone();
            let consume = self.consume.clone();
            let peer_addr = accepted.peer_addr;
            tokio::spawn(async move {
                if let Err(e) = handle_conn(accepted.conn, heartbeat, consume).await {
                    tracing::warn!(%peer_addr, error = %e, "peer connection closed");
                }
            });
        }
    }
}

async fn handle_conn(
    mut conn: Connection,
    heartbeat: Arc<RwLock<Option<HeartbeatFn>>>,
    consume: mpsc::Sender<Rpc>,
) -> Result<(), Error> {
    while let Some(frame) = conn.read_frame().await? {
        let request = match PeerRequest::from_frame(frame)? {
            PeerRequest::AppendEntries(req) if is_heartbeat(&req) => {
                let handler = heartbeat.read().clone();
                match handler {
                    Some(handler) => {
                        let resp = PeerResponse::AppendEntries(handler(req).await);
                        conn.write_frame(&resp.to_frame()?).await?;
                        continue;
                    }
                    None => PeerRequest::AppendEntries(req),
                }
            }
            other => other,
        };

        let (respond_to, rx) = oneshot::channel();
        consume
            .send(Rpc { request, respond_to })
            .await
            .map_err(|_| Error::Network("peer rpc consumer stopped".into()))?;
        let response = rx.await.map_err(|_| Error::Network("peer rpc dropped".into()))?;
        conn.write_frame(&response.to_frame()?).await?;
    }
    Ok(())
}

/// Answer every queued RPC from the local openraft node, one task per RPC.
pub async fn dispatch(raft: Raft, mut rx: mpsc::Receiver<Rpc>) {
    while let Some(rpc) = rx.recv().await {
        let raft = raft.clone();
        tokio::spawn(async move {
            let response = match rpc.request {
                PeerRequest::AppendEntries(req) => {
                    PeerResponse::AppendEntries(raft.append_entries(req).await)
                }
                PeerRequest::Vote(req) => PeerResponse::Vote(raft.vote(req).await),
                PeerRequest::InstallSnapshot(req) => {
                    PeerResponse::InstallSnapshot(raft.install_snapshot(req).await)
                }
            };
            let _ = rpc.respond_to.send(response);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use openraft::error::Fatal;
    use openraft::raft::VoteRequest;
    use openraft::{CommittedLeaderId, Entry, EntryPayload, LogId, Vote};
    use tessera_wire::{dial, Mux, MuxConfig, Protocol};

    async fn start() -> (String, PeerServer, mpsc::Receiver<Rpc>) {
        let mut mux = Mux::bind("127.0.0.1:0", MuxConfig::default()).await.unwrap();
        let listener = mux.listener(Protocol::Peer);
        let addr = mux.local_addr().to_string();
        tokio::spawn(mux.serve());
        let (server, rx) = PeerServer::new(listener);
        (addr, server, rx)
    }

    async fn call(conn: &mut Connection, req: PeerRequest) -> PeerResponse {
        conn.write_frame(&req.to_frame().unwrap()).await.unwrap();
        PeerResponse::from_frame(conn.read_frame().await.unwrap().unwrap()).unwrap()
    }

    fn heartbeat() -> PeerRequest {
        PeerRequest::AppendEntries(AppendEntriesRequest {
            vote: Vote::new_committed(1, 1),
            prev_log_id: None,
            entries: vec![],
            leader_commit: None,
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeats_take_the_fast_path() {
        let (addr, server, mut rx) = start().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        server.set_heartbeat_handler(Some(Arc::new(move |req: AppendEntriesRequest<TypeConfig>| {
            assert!(req.entries.is_empty());
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(AppendEntriesResponse::Success) }) as HeartbeatFuture
        })));
        tokio::spawn(server.serve());

        // Everything else goes through the consume channel.
        let consumed = Arc::new(AtomicUsize::new(0));
        let consumed_appends = consumed.clone();
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                let response = match rpc.request {
                    PeerRequest::Vote(req) => PeerResponse::Vote(Ok(openraft::raft::VoteResponse {
                        vote: req.vote,
                        vote_granted: false,
                        last_log_id: None,
                    })),
                    PeerRequest::AppendEntries(req) if req.entries.len() == 1 => {
                        consumed_appends.fetch_add(1, Ordering::SeqCst);
                        PeerResponse::AppendEntries(Ok(AppendEntriesResponse::Conflict))
                    }
                    _ => PeerResponse::AppendEntries(Err(RaftError::Fatal(Fatal::Stopped))),
                };
                let _ = rpc.respond_to.send(response);
            }
        });

        let mut conn = dial(&addr, Protocol::Peer, &MuxConfig::default()).await.unwrap();
        for _ in 0..3 {
            let resp = call(&mut conn, heartbeat()).await;
            assert!(matches!(resp, PeerResponse::AppendEntries(Ok(AppendEntriesResponse::Success))));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let vote = PeerRequest::Vote(VoteRequest { vote: Vote::new(2, 2), last_log_id: None });
        let resp = call(&mut conn, vote).await;
        assert!(matches!(resp, PeerResponse::Vote(Ok(ref v)) if !v.vote_granted));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // Replication carrying entries is never short-circuited.
        let append = PeerRequest::AppendEntries(AppendEntriesRequest {
            vote: Vote::new_committed(1, 1),
            prev_log_id: None,
            entries: vec![Entry {
                log_id: LogId::new(CommittedLeaderId::new(1, 1), 1),
                payload: EntryPayload::Blank,
            }],
            leader_commit: None,
        });
        let resp = call(&mut conn, append).await;
        assert!(matches!(resp, PeerResponse::AppendEntries(Ok(AppendEntriesResponse::Conflict))));
        assert_eq!(consumed.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_errors_reach_the_caller() {
        let (addr, server, _rx) = start().await;
        server.set_heartbeat_handler(Some(Arc::new(|_req: AppendEntriesRequest<TypeConfig>| {
            Box::pin(async { Err(RaftError::Fatal(Fatal::Stopped)) }) as HeartbeatFuture
        })));
        tokio::spawn(server.serve());

        let mut conn = dial(&addr, Protocol::Peer, &MuxConfig::default()).await.unwrap();
        let resp = call(&mut conn, heartbeat()).await;
        assert!(matches!(resp, PeerResponse::AppendEntries(Err(RaftError::Fatal(Fatal::Stopped)))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn without_handler_heartbeats_are_consumed() {
        let (addr, server, mut rx) = start().await;
        tokio::spawn(server.serve());
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                let _ = rpc.respond_to.send(PeerResponse::AppendEntries(Err(RaftError::Fatal(Fatal::Stopped))));
            }
        });

        let mut conn = dial(&addr, Protocol::Peer, &MuxConfig::default()).await.unwrap();
        let resp = call(&mut conn, heartbeat()).await;
        assert!(matches!(resp, PeerResponse::AppendEntries(Err(RaftError::Fatal(Fatal::Stopped)))));
    }
}
