//! Distributed sequence allocation.
//!
//! The leader hands out lanes of 1000-wide blocks ([`SequenceGrantor`]);
//! each process walks its lane locally ([`SequenceChunk`]) and prefetches the
//! next lane once it is past the middle of the current one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use tessera_consensus::RaftNode;
use tessera_storage::keys::sequence_key;
use tessera_types::codec::{decode, encode};
use tessera_types::{Command, Error, Sequence, SequenceChunkResponse};

/// Reserved sequence that numbers cluster members.
pub const NODE_ID_SEQUENCE: &str = "_node_id";

// ---------------------------------------------------------------------------
// Leader side
// ---------------------------------------------------------------------------

/// Grants sequence lanes on the leader.
pub struct SequenceGrantor<N> {
    node: Arc<N>,
    partitions: u64,
    /// Serializes read-modify-write of sequence state in this process.
    lock: Mutex<()>,
}

impl<N: RaftNode> SequenceGrantor<N> {
    pub fn new(node: Arc<N>, partitions: u64) -> Result<Self, Error> {
        // Fail at startup rather than on the first grant.
        Sequence::new(partitions)?;
        Ok(SequenceGrantor { node, partitions, lock: Mutex::new(()) })
    }

    /// Take the next lane of `name`, persisting the advanced state through
    /// the log before returning it.
    pub async fn grant(&self, name: &str) -> Result<SequenceChunkResponse, Error> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("sequence name must not be empty".into()));
        }
        let _guard = self.lock.lock().await;
        let key = sequence_key(name);

        // Read through the log so a new leader never grants from stale state.
        let current = self.node.propose(Command::get(key.clone())).await?;
        let mut sequence = if current.is_success {
            decode::<Sequence>(&current.value)?
        } else {
            Sequence::new(self.partitions)?
        };

        let chunk = sequence.grant();
        let stored = self.node.propose(Command::set(key, encode(&sequence)?)).await?;
        if !stored.is_success {
            return Err(Error::Storage(stored.error_message));
        }
        tracing::debug!(name, start = chunk.start, offset = chunk.offset, "granted sequence lane");
        Ok(chunk)
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Where cursors get their lanes: the local grantor on the leader, the
/// cluster client everywhere else.
pub trait ChunkSource: Send + Sync + 'static {
    fn get_sequence_chunk(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<SequenceChunkResponse, Error>> + Send;
}

#[derive(Default)]
struct CursorState {
    current: Option<SequenceChunkResponse>,
    next: Option<SequenceChunkResponse>,
    index: u64,
    prefetching: bool,
}

/// Process-local position within one sequence's lane.
pub struct SequenceChunk<S> {
    name: String,
    source: Arc<S>,
    state: Mutex<CursorState>,
}

impl<S: ChunkSource> SequenceChunk<S> {
    pub fn new(name: impl Into<String>, source: Arc<S>) -> Arc<Self> {
        Arc::new(SequenceChunk { name: name.into(), source, state: Mutex::new(CursorState::default()) })
    }

    pub async fn next(self: &Arc<Self>) -> Result<u64, Error> {
        let mut state = self.state.lock().await;
        if state.current.is_none() {
            state.current = Some(self.source.get_sequence_chunk(&self.name).await?);
            state.index = 1;
        }

        loop {
            let Some(chunk) = state.current else {
                return Err(Error::Storage("sequence cursor lost its chunk".into()));
            };
            let id = chunk.id_at(state.index);
            if id > chunk.end {
                let next = match state.next.take() {
                    Some(next) => next,
                    None => self.source.get_sequence_chunk(&self.name).await?,
                };
                tracing::debug!(name = %self.name, start = next.start, offset = next.offset, "sequence lane exhausted");
                state.current = Some(next);
                state.index = 1;
                continue;
            }

            let used = (state.index * chunk.count) as f64 / (chunk.end - chunk.start) as f64;
            if state.next.is_none() && !state.prefetching && used > 0.5 {
                state.prefetching = true;
                self.prefetch();
            }
            state.index += 1;
            return Ok(id);
        }
    }

    fn prefetch(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let fetched = this.source.get_sequence_chunk(&this.name).await;
            let mut state = this.state.lock().await;
            state.prefetching = false;
            match fetched {
                Ok(chunk) if state.next.is_none() => state.next = Some(chunk),
                // A synchronous fetch already refilled the cursor; this lane
                // stays unused.
                Ok(chunk) => {
                    tracing::debug!(name = %this.name, start = chunk.start, offset = chunk.offset, "dropping surplus lane")
                }
                Err(e) => tracing::warn!(name = %this.name, error = %e, "sequence prefetch failed"),
            }
        });
    }
}

/// Cursors by sequence name, created on first use.
pub struct SequenceRegistry<S> {
    source: Arc<S>,
    cursors: parking_lot::Mutex<HashMap<String, Arc<SequenceChunk<S>>>>,
}

impl<S: ChunkSource> SequenceRegistry<S> {
    pub fn new(source: Arc<S>) -> Self {
        SequenceRegistry { source, cursors: parking_lot::Mutex::new(HashMap::new()) }
    }

    pub async fn next(&self, name: &str) -> Result<u64, Error> {
        let cursor = self
            .cursors
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| SequenceChunk::new(name, self.source.clone()))
            .clone();
        cursor.next().await
    }
}
