//! Raft replication for tessera, built on openraft.

pub mod node;
pub mod store;
pub mod transport;
pub mod types;

use tessera_storage::Fsm;
use tessera_types::{Command, CommandResponse, Error, NodeId};

pub use node::{RaftSettings, ReplicaNode};
pub use types::{Raft, TypeConfig};

// ---------------------------------------------------------------------------
// RaftNode trait
// Uses RPITIT; the explicit `+ Send` bound on each future lets generic
// callers `.await` across thread boundaries.
// ---------------------------------------------------------------------------

pub trait RaftNode: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// Current leader id and its advertised address, if known.
    fn leader(&self) -> Option<(NodeId, String)>;

    /// Every configured member, voters and learners, with its address.
    fn members(&self) -> Vec<(NodeId, String)>;

    fn is_leader(&self) -> bool {
        self.leader().is_some_and(|(id, _)| id == self.node_id())
    }

    /// Local replica for reads.
    fn fsm(&self) -> &Fsm;

    /// Replicate `cmd` and wait for it to be applied here. Only the leader
    /// accepts proposals; others answer `NotLeader` or `NoLeader`.
    fn propose(
        &self,
        cmd: Command,
    ) -> impl std::future::Future<Output = Result<CommandResponse, Error>> + Send;

    /// Add (or re-add under a new address) a voting member. Leader only.
    fn join(
        &self,
        node_id: NodeId,
        addr: String,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send;
}
