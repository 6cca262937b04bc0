use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers, SnapshotPolicy};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use tessera_storage::{Fsm, KvStore, LogStore, StableStore};
use tessera_types::{Command, CommandResponse, Error, NodeId};
use tessera_wire::{MuxConfig, MuxListener};

use crate::store::{LogStoreAdapter, StateMachineAdapter};
use crate::transport::{dispatch, raft_heartbeat, PeerNetwork, PeerServer};
use crate::types::Raft;
use crate::RaftNode;

/// Consensus tuning, filled from the `[raft]` and `[cluster]` config sections.
#[derive(Debug, Clone)]
pub struct RaftSettings {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Build a snapshot after this many applied entries.
    pub snapshot_threshold: u64,
    /// Entries kept in the log behind a snapshot.
    pub logs_to_keep: u64,
    /// Bound on a single proposal.
    pub request_timeout: Duration,
}

impl Default for RaftSettings {
    fn default() -> Self {
        RaftSettings {
            heartbeat_interval: Duration::from_millis(250),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            snapshot_threshold: 10_000,
            logs_to_keep: 1_000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RaftSettings {
    fn openraft_config(&self) -> Result<openraft::Config, Error> {
        openraft::Config {
            cluster_name: "tessera".into(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: self.logs_to_keep,
            ..Default::default()
        }
        .validate()
        .map_err(|e| Error::InvalidArgument(e.to_string()))
    }
}

fn write_error(e: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>) -> Error {
    if let Some(forward) = e.forward_to_leader::<BasicNode>() {
        return match (&forward.leader_id, &forward.leader_node) {
            (_, Some(node)) => Error::NotLeader { leader: Some(node.addr.clone()) },
            (Some(_), None) => Error::NotLeader { leader: None },
            (None, None) => Error::NoLeader,
        };
    }
    Error::Consensus(e.to_string())
}

/// An openraft replica: log, state machine, peer transport and the `Raft`
/// handle that drives them.
pub struct ReplicaNode {
    id: NodeId,
    raft: Raft,
    fsm: Fsm,
    request_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicaNode {
    /// Open local state from `kv` and start serving peer traffic arriving on
    /// `peers`.
    pub async fn start(
        id: NodeId,
        settings: RaftSettings,
        kv: Arc<KvStore>,
        peers: MuxListener,
        mux: MuxConfig,
    ) -> Result<Self, Error> {
        if id == 0 {
            return Err(Error::InvalidArgument("node id must be non-zero".into()));
        }
        let config = Arc::new(settings.openraft_config()?);

        let log_store = LogStoreAdapter::new(LogStore::new(kv.clone()), StableStore::new(kv.clone()));
        let fsm = Fsm::open(kv).await?;
        let state_machine = StateMachineAdapter::open(fsm.clone()).await?;

        let raft = Raft::new(id, config, PeerNetwork::new(mux), log_store, state_machine)
            .await
            .map_err(|e| Error::Consensus(e.to_string()))?;

        let (server, rx) = PeerServer::new(peers);
        server.set_heartbeat_handler(Some(raft_heartbeat(raft.clone())));
        let tasks = vec![tokio::spawn(server.serve()), tokio::spawn(dispatch(raft.clone(), rx))];

        tracing::info!(node_id = id, "raft node started");
        Ok(ReplicaNode {
            id,
            raft,
            fsm,
            request_timeout: settings.request_timeout,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// Form a single-voter cluster. Already-initialized nodes are left alone,
    /// so this is safe on every restart.
    pub async fn initialize(&self, addr: &str) -> Result<(), Error> {
        let members = BTreeMap::from([(self.id, BasicNode::new(addr))]);
        match self.raft.initialize(members).await {
            Ok(()) => {
                tracing::info!(node_id = self.id, %addr, "bootstrapped cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::debug!(node_id = self.id, "cluster already initialized");
                Ok(())
            }
            Err(e) => Err(Error::Consensus(e.to_string())),
        }
    }

    /// Block until some node is leader, returning its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, Error> {
        let mut metrics = self.raft.metrics();
        tokio::time::timeout(timeout, async move {
            loop {
                let leader = metrics.borrow().current_leader;
                if let Some(leader) = leader {
                    return Ok(leader);
                }
                metrics
                    .changed()
                    .await
                    .map_err(|_| Error::Consensus("raft node stopped".into()))?;
            }
        })
        .await
        .map_err(|_| Error::Timeout)?
    }

    pub async fn trigger_snapshot(&self) -> Result<(), Error> {
        self.raft.trigger().snapshot().await.map_err(|e| Error::Consensus(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.raft.shutdown().await.map_err(|e| Error::Consensus(e.to_string()))?;
        tracing::info!(node_id = self.id, "raft node stopped");
        Ok(())
    }

    /// Membership change limited to the request timeout.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(write_error),
            Err(_) => Err(Error::Timeout),
        }
    }

    fn not_leader(&self) -> Error {
        match self.leader() {
            Some((_, addr)) => Error::NotLeader { leader: Some(addr) },
            None => Error::NoLeader,
        }
    }
}

impl RaftNode for ReplicaNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn leader(&self) -> Option<(NodeId, String)> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let leader = metrics.current_leader?;
        let node = metrics.membership_config.membership().get_node(&leader)?;
        Some((leader, node.addr.clone()))
    }

    fn members(&self) -> Vec<(NodeId, String)> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect()
    }

    fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    async fn propose(&self, cmd: Command) -> Result<CommandResponse, Error> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        match tokio::time::timeout(self.request_timeout, self.raft.client_write(cmd)).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(write_error(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn join(&self, node_id: NodeId, addr: String) -> Result<(), Error> {
        if node_id == 0 {
            return Err(Error::InvalidArgument("node id must be non-zero".into()));
        }
        if !self.is_leader() {
            return Err(self.not_leader());
        }

        let (exact, is_voter, conflicting_voters, conflicting_learners) = {
            let metrics = self.raft.metrics();
            let metrics = metrics.borrow();
            let membership = metrics.membership_config.membership();
            let voters: BTreeSet<NodeId> = membership.voter_ids().collect();

            let mut exact = false;
            let mut conflicting_voters = BTreeSet::new();
            let mut conflicting_learners = BTreeSet::new();
            for (id, node) in membership.nodes() {
                let same_id = *id == node_id;
                let same_addr = node.addr == addr;
                if same_id && same_addr {
                    exact = true;
                } else if same_id || same_addr {
                    if voters.contains(id) {
                        conflicting_voters.insert(*id);
                    } else {
                        conflicting_learners.insert(*id);
                    }
                }
            }
            (exact, voters.contains(&node_id), conflicting_voters, conflicting_learners)
        };

        if exact && is_voter {
            tracing::info!(node_id, %addr, "node already a member, ignoring join");
            return Ok(());
        }
        if conflicting_voters.contains(&self.id) || conflicting_learners.contains(&self.id) {
            return Err(Error::InvalidArgument(format!(
                "join of {node_id} at {addr} conflicts with the leader itself"
            )));
        }

        if !conflicting_voters.is_empty() {
            tracing::info!(node_id, ?conflicting_voters, "removing conflicting voters");
            self.bounded(self.raft.change_membership(ChangeMembers::RemoveVoters(conflicting_voters), false))
                .await?;
        }
        if !conflicting_learners.is_empty() {
            tracing::info!(node_id, ?conflicting_learners, "removing conflicting learners");
            self.bounded(self.raft.change_membership(ChangeMembers::RemoveNodes(conflicting_learners), false))
                .await?;
        }

        if !exact {
            tracing::info!(node_id, %addr, "adding learner");
            let added = self.bounded(self.raft.add_learner(node_id, BasicNode::new(&addr), true)).await;
            if let Err(Error::Timeout) = added {
                // The learner entry is committed before catch-up starts.
                tracing::warn!(node_id, %addr, "learner did not catch up, removing it");
                let removed = self
                    .bounded(self.raft.change_membership(ChangeMembers::RemoveNodes(BTreeSet::from([node_id])), false))
                    .await;
                if let Err(e) = removed {
                    tracing::warn!(node_id, error = %e, "failed to remove stalled learner");
                }
            }
            added?;
        }
        tracing::info!(node_id, %addr, "promoting to voter");
        self.bounded(self.raft.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id])), false))
            .await?;
        Ok(())
    }
}
