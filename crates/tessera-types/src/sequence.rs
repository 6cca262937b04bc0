use crate::Error;

/// Width of one sequence block.
pub const SEQUENCE_RANGE_SIZE: u64 = 1000;

/// Replicated per-name counter state. Only the leader mutates it, and only
/// through a replicated Set.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Sequence {
    pub current_value: u64,
    pub last_partition_index: u64,
    pub max_partition_index: u64,
    pub partitions: u64,
}

/// A lane of one sequence block handed to a single allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SequenceChunkResponse {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub count: u64,
}

impl Sequence {
    pub fn new(partitions: u64) -> Result<Self, Error> {
        if partitions < 2 {
            return Err(Error::InvalidArgument(format!(
                "sequence needs at least 2 partitions, got {partitions}"
            )));
        }
        Ok(Sequence {
            current_value: 0,
            last_partition_index: 0,
            max_partition_index: partitions - 1,
            partitions,
        })
    }

    /// Hand out the next lane, moving to a fresh block once the last usable
    /// lane of the current one is taken.
    ///
    /// Lanes run from 0 to `max_partition_index - 1`, so a block has
    /// `partitions - 1` of them. Cursors rely on that rollover point.
    pub fn grant(&mut self) -> SequenceChunkResponse {
        if self.last_partition_index >= self.max_partition_index {
            self.current_value += SEQUENCE_RANGE_SIZE;
            self.last_partition_index = 0;
        }
        let offset = self.last_partition_index;
        self.last_partition_index += 1;
        SequenceChunkResponse {
            start: self.current_value,
            end: self.current_value + SEQUENCE_RANGE_SIZE,
            offset,
            count: self.max_partition_index,
        }
    }
}

impl SequenceChunkResponse {
    /// The `index`-th id of this lane (1-based).
    pub fn id_at(&self, index: u64) -> u64 {
        self.start + self.offset + self.count * index - (self.count - 1)
    }
}
