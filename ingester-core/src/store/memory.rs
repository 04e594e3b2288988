//! In-process chunk store

use super::{select_chunks, ChunkStore};
use crate::chunk::Chunk;
use crate::matcher::LabelMatcher;
use crate::{Fingerprint, IngesterError, Result, SampleStream, TimeRange, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Keeps every put chunk in memory, keyed by tenant. Used by tests and by
/// the server when no data directory is configured.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<String, Vec<Chunk>>>,
    failing: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` and `get` fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `put` calls
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Every chunk stored for a tenant, in arrival order
    pub fn chunks(&self, tenant: &str) -> Vec<Chunk> {
        self.chunks.lock().get(tenant).cloned().unwrap_or_default()
    }

    /// Tenants with at least one stored chunk, sorted
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.chunks.lock().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Decode everything stored for a tenant into one stream per series,
    /// samples sorted by timestamp with re-sent duplicates collapsed
    pub fn decode_tenant(&self, tenant: &str) -> Result<Vec<SampleStream>> {
        let mut streams: BTreeMap<Fingerprint, Vec<SampleStream>> = BTreeMap::new();

        for chunk in self.chunks(tenant) {
            let samples = chunk.samples()?;
            let bucket = streams.entry(chunk.fingerprint).or_default();
            match bucket.iter_mut().find(|s| s.metric == chunk.metric) {
                Some(stream) => stream.samples.extend(samples),
                None => bucket.push(SampleStream {
                    metric: chunk.metric.clone(),
                    samples,
                }),
            }
        }

        let mut out: Vec<SampleStream> = streams.into_values().flatten().collect();
        for stream in &mut out {
            stream.samples.sort_by_key(|s| s.timestamp);
            stream.samples.dedup_by_key(|s| s.timestamp);
        }
        out.sort_by(|a, b| a.metric.cmp(&b.metric));
        Ok(out)
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IngesterError::StoreUnavailable("memory store set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, tenant: &str, chunks: &[Chunk]) -> Result<()> {
        self.check_available()?;
        self.chunks
            .lock()
            .entry(tenant.to_string())
            .or_default()
            .extend_from_slice(chunks);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(
        &self,
        tenant: &str,
        from: Timestamp,
        through: Timestamp,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<Chunk>> {
        self.check_available()?;
        let chunks = self.chunks.lock();
        Ok(chunks
            .get(tenant)
            .map(|c| select_chunks(c, TimeRange::new(from, through), matchers))
            .unwrap_or_default())
    }
}
