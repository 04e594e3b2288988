//! Durable chunk store boundary
//!
//! The ingester hands closed chunks to a [`ChunkStore`] and never reads
//! them back on the query path. Stores must accept the same chunk more than
//! once: a batch whose `put` failed is re-sent whole on the next sweep.

mod file;
mod frame;
mod memory;

pub use file::{FileChunkStore, FileStoreConfig, SyncPolicy};
pub use frame::ChunkFrame;
pub use memory::MemoryChunkStore;

use crate::chunk::Chunk;
use crate::matcher::{matches_all, LabelMatcher};
use crate::{Result, TimeRange, Timestamp};
use async_trait::async_trait;

/// Long-term chunk storage owned by another subsystem
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Persist a batch of chunks for one tenant
    async fn put(&self, tenant: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of `tenant` overlapping `[from, through]` whose metric
    /// satisfies every matcher
    async fn get(
        &self,
        tenant: &str,
        from: Timestamp,
        through: Timestamp,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<Chunk>>;
}

/// Shared filter for store reads
pub(crate) fn select_chunks<'a>(
    chunks: impl IntoIterator<Item = &'a Chunk>,
    range: TimeRange,
    matchers: &[LabelMatcher],
) -> Vec<Chunk> {
    chunks
        .into_iter()
        .filter(|c| c.overlaps(&range) && matches_all(matchers, &c.metric))
        .cloned()
        .collect()
}
