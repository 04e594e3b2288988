//! Append-only chunk store on the local filesystem
//!
//! Layout: `<dir>/<tenant>/seg_<id>.chunks`, one [`ChunkFrame`] per `put`.
//! Segments rotate once they exceed `segment_size`. A torn frame at the end
//! of a segment (crash during write) is ignored on read.

use super::{select_chunks, ChunkFrame, ChunkStore};
use crate::chunk::Chunk;
use crate::matcher::LabelMatcher;
use crate::{IngesterError, Result, TimeRange, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// When segment writes are fsynced
#[derive(Debug, Clone, Copy, Default)]
pub enum SyncPolicy {
    /// Sync after every put (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N puts
    EveryN(usize),
    /// Never sync (OS decides)
    None,
}

/// File store configuration
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Root directory
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
    /// LZ4-compress frame payloads
    pub compress: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/chunks"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::STORE_SEGMENT_SIZE,
            compress: true,
        }
    }
}

struct SegmentWriter {
    file: BufWriter<File>,
    segment_id: u64,
    /// Length of the segment up to the last complete frame
    bytes_written: usize,
    writes_since_sync: usize,
    /// The segment may end in a partial frame that could not be cut off
    torn: bool,
}

struct FileStoreInner {
    config: FileStoreConfig,
    writers: Mutex<HashMap<String, SegmentWriter>>,
}

/// Durable chunk store writing CRC-checked frames to segment files
#[derive(Clone)]
pub struct FileChunkStore {
    inner: Arc<FileStoreInner>,
}

impl FileChunkStore {
    /// Open (or create) a store rooted at `config.dir`
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        info!(dir = ?config.dir, "Opened chunk store");
        Ok(Self {
            inner: Arc::new(FileStoreInner {
                config,
                writers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Sync every open segment to disk
    pub fn sync(&self) -> Result<()> {
        let mut writers = self.inner.writers.lock();
        for writer in writers.values_mut() {
            writer.file.flush()?;
            writer.file.get_ref().sync_all()?;
            writer.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Read every chunk stored for a tenant
    pub fn read_tenant(&self, tenant: &str) -> Result<Vec<Chunk>> {
        self.inner.read_tenant(tenant)
    }
}

impl FileStoreInner {
    fn append(&self, tenant: &str, chunks: Vec<Chunk>) -> Result<()> {
        let frame = ChunkFrame::new(chunks).encode(self.config.compress)?;
        let mut writers = self.writers.lock();

        let writer = match writers.entry(tenant.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.open_writer(tenant)?),
        };

        if writer.torn {
            // Never append behind a partial frame
            self.start_segment(tenant, writer)?;
        } else if writer.bytes_written > 0 && writer.bytes_written + frame.len() > self.config.segment_size {
            self.rotate_segment(tenant, writer)?;
        }

        match self.write_frame(writer, &frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(tenant, segment = writer.segment_id, error = %e, "Frame write failed, discarding partial frame");
                self.discard_partial(tenant, writer);
                Err(e)
            }
        }
    }

    fn write_frame(&self, writer: &mut SegmentWriter, frame: &[u8]) -> Result<()> {
        writer.file.write_all(frame)?;
        writer.file.flush()?;

        let sync = match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => writer.writes_since_sync + 1 >= n,
            SyncPolicy::None => false,
        };
        if sync {
            writer.file.get_ref().sync_all()?;
        }

        writer.bytes_written += frame.len();
        writer.writes_since_sync = if sync { 0 } else { writer.writes_since_sync + 1 };
        Ok(())
    }

    /// Cut the segment back to its last complete frame. If that fails the
    /// writer is marked torn and the next put starts a new segment.
    fn discard_partial(&self, tenant: &str, writer: &mut SegmentWriter) {
        let truncated = open_segment(&self.tenant_dir(tenant), writer.segment_id).and_then(|file| {
            // Dropping the old writer may still push buffered bytes, so
            // truncate only after the swap
            drop(std::mem::replace(&mut writer.file, BufWriter::new(file)));
            writer.file.get_ref().set_len(writer.bytes_written as u64)?;
            Ok(())
        });

        if let Err(e) = truncated {
            warn!(tenant, segment = writer.segment_id, error = %e, "Could not truncate segment");
            writer.torn = true;
        }
    }

    fn read_tenant(&self, tenant: &str) -> Result<Vec<Chunk>> {
        // Push buffered frames out before reading our own segments back
        if let Some(writer) = self.writers.lock().get_mut(tenant) {
            writer.file.flush()?;
        }

        let mut chunks = Vec::new();
        for path in find_segments(&self.tenant_dir(tenant))? {
            chunks.extend(read_segment(&path)?);
        }
        Ok(chunks)
    }

    fn tenant_dir(&self, tenant: &str) -> PathBuf {
        self.config.dir.join(escape_tenant(tenant))
    }

    fn open_writer(&self, tenant: &str) -> Result<SegmentWriter> {
        let dir = self.tenant_dir(tenant);
        fs::create_dir_all(&dir)?;

        let segment_id = find_segments(&dir)?
            .last()
            .and_then(|p| parse_segment_id(p))
            .unwrap_or(0);
        let file = open_segment(&dir, segment_id)?;
        let bytes_written = file.metadata()?.len() as usize;

        Ok(SegmentWriter {
            file: BufWriter::new(file),
            segment_id,
            bytes_written,
            writes_since_sync: 0,
            torn: false,
        })
    }

    fn rotate_segment(&self, tenant: &str, writer: &mut SegmentWriter) -> Result<()> {
        // Sync current segment
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;

        self.start_segment(tenant, writer)
    }

    fn start_segment(&self, tenant: &str, writer: &mut SegmentWriter) -> Result<()> {
        let file = open_segment(&self.tenant_dir(tenant), writer.segment_id + 1)?;
        writer.segment_id += 1;
        writer.file = BufWriter::new(file);
        writer.bytes_written = 0;
        writer.writes_since_sync = 0;
        writer.torn = false;

        Ok(())
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn put(&self, tenant: &str, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let tenant = tenant.to_string();
        let chunks = chunks.to_vec();

        tokio::task::spawn_blocking(move || inner.append(&tenant, chunks))
            .await
            .map_err(|e| IngesterError::Internal(format!("chunk store writer panicked: {}", e)))?
            .map_err(|e| IngesterError::StoreUnavailable(e.to_string()))
    }

    async fn get(
        &self,
        tenant: &str,
        from: Timestamp,
        through: Timestamp,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<Chunk>> {
        let inner = self.inner.clone();
        let owned = tenant.to_string();
        let chunks = tokio::task::spawn_blocking(move || inner.read_tenant(&owned))
            .await
            .map_err(|e| IngesterError::Internal(format!("chunk store reader panicked: {}", e)))??;

        Ok(select_chunks(&chunks, TimeRange::new(from, through), matchers))
    }
}

fn read_segment(path: &Path) -> Result<Vec<Chunk>> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut chunks = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match ChunkFrame::decode(&data[offset..]) {
            Ok((frame, bytes_read)) => {
                chunks.extend(frame.chunks);
                offset += bytes_read;
            }
            Err(IngesterError::ChecksumMismatch { .. }) | Err(IngesterError::Corruption(_)) => {
                warn!("Corrupt frame at offset {} in {:?}, skipping rest of segment", offset, path);
                break;
            }
            Err(IngesterError::InvalidFormat(msg)) if msg == "Frame too short" || msg == "Incomplete frame" => {
                // Torn write at the tail
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(chunks)
}

fn find_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if parse_segment_id(&path).is_some() {
            segments.push(path);
        }
    }

    segments.sort_by_key(|p| parse_segment_id(p).unwrap_or(0));
    Ok(segments)
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("seg_"))
        .and_then(|s| s.strip_suffix(".chunks"))
        .and_then(|s| s.parse().ok())
}

fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
    let path = dir.join(format!("seg_{:020}.chunks", segment_id));
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Map a tenant id onto a single safe path component
fn escape_tenant(tenant: &str) -> String {
    let mut out = String::with_capacity(tenant.len());
    for b in tenant.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::EncodingKind;
    use crate::{Metric, Sample};
    use tempfile::TempDir;

    fn chunk(job: &str, from: i64) -> Chunk {
        let samples: Vec<Sample> = (from..from + 100).map(|t| Sample::new(t, t as f64 * 0.25)).collect();
        let block = EncodingKind::Gorilla.codec().encode(&samples).unwrap();
        Chunk::new(Metric::named("up").with_label("job", job), EncodingKind::Gorilla, block)
    }

    fn config(dir: &TempDir, segment_size: usize) -> FileStoreConfig {
        FileStoreConfig {
            dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::None,
            segment_size,
            compress: true,
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(config(&temp_dir, 1024 * 1024)).unwrap();

        store.put("1", &[chunk("api", 0), chunk("web", 0)]).await.unwrap();
        store.put("1", &[chunk("api", 100)]).await.unwrap();
        store.put("2", &[chunk("api", 0)]).await.unwrap();

        assert_eq!(store.get("1", 0, 1000, &[]).await.unwrap().len(), 3);

        let api = LabelMatcher::equal("job", "api").unwrap();
        let hits = store.get("1", 150, 160, &[api]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].first_timestamp, 100);
        assert_eq!(store.get("2", 0, 1000, &[]).await.unwrap().len(), 1);
        assert!(store.get("3", 0, 1000, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_and_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = FileChunkStore::open(config(&temp_dir, 200)).unwrap();
            for i in 0..5 {
                store.put("tenant/a", &[chunk("api", i * 100)]).await.unwrap();
            }
            store.sync().unwrap();
        }

        let tenant_dir = temp_dir.path().join("tenant%2Fa");
        assert!(find_segments(&tenant_dir).unwrap().len() > 1);

        let store = FileChunkStore::open(config(&temp_dir, 200)).unwrap();
        store.put("tenant/a", &[chunk("api", 500)]).await.unwrap();

        let chunks = store.read_tenant("tenant/a").unwrap();
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks.last().map(|c| c.first_timestamp), Some(500));
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(config(&temp_dir, 1024 * 1024)).unwrap();
        store.put("1", &[chunk("api", 0)]).await.unwrap();
        store.put("1", &[chunk("api", 100)]).await.unwrap();
        store.sync().unwrap();

        let segment = find_segments(&temp_dir.path().join("1")).unwrap().remove(0);
        let len = fs::metadata(&segment).unwrap().len();
        OpenOptions::new().write(true).open(&segment).unwrap().set_len(len - 5).unwrap();

        let reopened = FileChunkStore::open(config(&temp_dir, 1024 * 1024)).unwrap();
        assert_eq!(reopened.read_tenant("1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_frame_is_cut_off() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(config(&temp_dir, 1024 * 1024)).unwrap();
        store.put("1", &[chunk("api", 0)]).await.unwrap();

        {
            let mut writers = store.inner.writers.lock();
            let writer = writers.get_mut("1").unwrap();
            // Half a frame left in the buffer by a failed write
            writer.file.write_all(&[0x40, 0, 0, 0, 0]).unwrap();
            store.inner.discard_partial("1", writer);
            assert!(!writer.torn);
        }

        store.put("1", &[chunk("api", 100)]).await.unwrap();
        store.sync().unwrap();

        let chunks = store.read_tenant("1").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(find_segments(&temp_dir.path().join("1")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_torn_segment_is_not_appended_to() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(config(&temp_dir, 1024 * 1024)).unwrap();
        store.put("1", &[chunk("api", 0)]).await.unwrap();

        {
            let mut writers = store.inner.writers.lock();
            let writer = writers.get_mut("1").unwrap();
            writer.file.write_all(&[0x40, 0, 0, 0, 0]).unwrap();
            writer.file.flush().unwrap();
            writer.torn = true;
        }

        store.put("1", &[chunk("api", 100)]).await.unwrap();
        store.put("1", &[chunk("api", 200)]).await.unwrap();
        store.sync().unwrap();

        assert_eq!(find_segments(&temp_dir.path().join("1")).unwrap().len(), 2);
        let starts: Vec<i64> = store.read_tenant("1").unwrap().iter().map(|c| c.first_timestamp).collect();
        assert_eq!(starts, vec![0, 100, 200]);
    }

    #[test]
    fn test_escape_tenant() {
        assert_eq!(escape_tenant("team-a_1"), "team-a_1");
        assert_eq!(escape_tenant("../x"), "%2E%2E%2Fx");
    }
}
