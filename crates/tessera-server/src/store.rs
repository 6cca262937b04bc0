//! The store facade handed to the query layer.

use std::sync::Arc;

use tessera_consensus::RaftNode;
use tessera_storage::keys::{data_key, DATA_PREFIX};
use tessera_storage::QueryResult;
use tessera_types::{Command, CommandResponse, Error, NodeId, SequenceChunkResponse};

use crate::cluster::ClusterClient;
use crate::sequence::{ChunkSource, SequenceGrantor, SequenceRegistry};

/// Grants locally while this node leads, otherwise asks the leader.
pub struct ChunkRouter<N> {
    node: Arc<N>,
    grantor: Arc<SequenceGrantor<N>>,
    client: Arc<ClusterClient>,
}

impl<N: RaftNode> ChunkSource for ChunkRouter<N> {
    async fn get_sequence_chunk(&self, name: &str) -> Result<SequenceChunkResponse, Error> {
        if self.node.is_leader() {
            match self.grantor.grant(name).await {
                // Lost leadership between the check and the proposal.
                Err(e) if e.is_transient() => {}
                result => return result,
            }
        }
        self.client.get_sequence_chunk(name).await
    }
}

/// Key-value, SQL and sequence access on top of one replica.
///
/// Writes go through the local node when it leads and are forwarded to the
/// leader otherwise. `query` and `scan_prefix` read the local replica and may
/// trail the leader; `get` is read through the log.
pub struct Store<N> {
    node: Arc<N>,
    client: Arc<ClusterClient>,
    chunks: Arc<ChunkRouter<N>>,
    sequences: SequenceRegistry<ChunkRouter<N>>,
}

impl<N: RaftNode> Store<N> {
    pub fn new(node: Arc<N>, grantor: Arc<SequenceGrantor<N>>, client: Arc<ClusterClient>) -> Self {
        let chunks = Arc::new(ChunkRouter { node: node.clone(), grantor, client: client.clone() });
        Store { node, client, sequences: SequenceRegistry::new(chunks.clone()), chunks }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.node_id()
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let resp = self.apply(Command::get(data_key(key))).await?;
        Ok(resp.is_success.then_some(resp.value))
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let resp = self.apply(Command::set(data_key(key), value)).await?;
        check(resp)
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), Error> {
        let resp = self.apply(Command::delete(data_key(key))).await?;
        check(resp)
    }

    /// Run a statement on every replica. SQL errors come back in
    /// `error_message` rather than as `Err`.
    pub async fn exec(&self, query: &str) -> Result<CommandResponse, Error> {
        self.apply(Command::sql(query)).await
    }

    pub async fn query(&self, query: &str) -> Result<QueryResult, Error> {
        self.node.fsm().query(query.to_string()).await
    }

    /// Application keys under `prefix`, returned without the internal data
    /// partition prefix.
    pub async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let pairs = self.node.fsm().scan_prefix(data_key(prefix)).await?;
        Ok(pairs
            .into_iter()
            .filter_map(|(key, value)| Some((key.strip_prefix(DATA_PREFIX)?.to_vec(), value)))
            .collect())
    }

    pub async fn next_sequence_value_by_id(&self, name: &str) -> Result<u64, Error> {
        self.sequences.next(name).await
    }

    pub async fn get_sequence_chunk(&self, name: &str) -> Result<SequenceChunkResponse, Error> {
        self.chunks.get_sequence_chunk(name).await
    }

    pub async fn join(&self, node_id: NodeId, addr: &str) -> Result<(), Error> {
        if self.node.is_leader() {
            return self.node.join(node_id, addr.to_string()).await;
        }
        self.client.join(node_id, addr).await
    }

    async fn apply(&self, cmd: Command) -> Result<CommandResponse, Error> {
        match self.node.propose(cmd.clone()).await {
            Err(e) if e.is_transient() => {
                tracing::debug!(node_id = self.node.node_id(), error = %e, "forwarding command to leader");
                self.client.send_command(cmd).await
            }
            result => result,
        }
    }
}

fn check(resp: CommandResponse) -> Result<(), Error> {
    if resp.is_success {
        Ok(())
    } else {
        Err(Error::Storage(resp.error_message))
    }
}
