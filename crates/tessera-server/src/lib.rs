pub mod cluster;
pub mod sequence;
pub mod store;

use std::sync::Arc;

use tessera_consensus::RaftNode;
use tessera_wire::MuxListener;

pub use cluster::{ClusterClient, ClusterRequest, ClusterResponse, ClusterServer, LeaderLocator};
pub use sequence::{ChunkSource, SequenceChunk, SequenceGrantor, SequenceRegistry, NODE_ID_SEQUENCE};
pub use store::{ChunkRouter, Store};

/// Answer internal RPCs arriving on `listener` until it closes.
pub async fn serve_cluster<N: RaftNode>(
    listener: MuxListener,
    node: Arc<N>,
    grantor: Arc<SequenceGrantor<N>>,
) {
    ClusterServer::new(listener, node, grantor).serve().await
}

/// Leader address as the local node currently sees it.
pub fn leader_locator<N: RaftNode>(node: Arc<N>) -> LeaderLocator {
    Arc::new(move || node.leader().map(|(_, addr)| addr))
}
