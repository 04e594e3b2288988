//! Per-series chunk buffer
//!
//! A series owns a run of closed chunks (oldest first) and at most one open
//! chunk. Every operation takes the series' own lock for its whole
//! duration, so appends, reads and harvests on one series are serialized
//! while different series never contend.

use crate::chunk::{Chunk, ChunkAppender, ChunkEncoding};
use crate::{Fingerprint, IngesterError, Metric, Result, Sample, TimeRange, Timestamp};
use parking_lot::Mutex;
use std::time::{Duration, SystemTime};

/// Chunk closing policy
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    /// Samples an open chunk may hold
    pub max_samples: usize,
    /// Age since creation past which an open chunk is closed
    pub max_age: Duration,
    /// Time without appends after which a sweep closes the open chunk
    pub max_idle: Option<Duration>,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_samples: crate::config::MAX_SAMPLES_PER_CHUNK,
            max_age: crate::config::MAX_CHUNK_AGE,
            max_idle: Some(crate::config::MAX_CHUNK_IDLE),
        }
    }
}

/// How a sweep treats open chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Close open chunks only past their age or idle limit
    Regular,
    /// Close every open chunk (shutdown)
    Force,
}

/// Chunks handed out by [`SeriesBuffer::harvest_flushable`]
#[derive(Debug, Default)]
pub struct Harvest {
    pub chunks: Vec<Chunk>,
    /// Sequence number of the newest harvested chunk, passed back to
    /// [`SeriesBuffer::mark_flushed`] once the store accepted the batch
    pub through: u64,
}

impl Harvest {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug)]
struct OpenChunk {
    appender: Box<dyn ChunkAppender>,
    created_at: SystemTime,
}

#[derive(Debug)]
struct ClosedChunk {
    seq: u64,
    chunk: Chunk,
    flushed: bool,
}

#[derive(Debug, Default)]
struct SeriesState {
    closed: Vec<ClosedChunk>,
    open: Option<OpenChunk>,
    last_timestamp: Option<Timestamp>,
    last_append: Option<SystemTime>,
    next_seq: u64,
}

/// Point-in-time counters for one series
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesStats {
    pub closed_chunks: usize,
    pub pending_chunks: usize,
    pub open_samples: usize,
    pub has_open_chunk: bool,
}

/// Buffered samples of one series
#[derive(Debug)]
pub struct SeriesBuffer {
    metric: Metric,
    fingerprint: Fingerprint,
    encoding: &'static dyn ChunkEncoding,
    state: Mutex<SeriesState>,
}

impl SeriesBuffer {
    pub fn new(metric: Metric, encoding: &'static dyn ChunkEncoding) -> Self {
        Self {
            fingerprint: metric.fingerprint(),
            metric,
            encoding,
            state: Mutex::new(SeriesState::default()),
        }
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Timestamp of the newest appended sample
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.state.lock().last_timestamp
    }

    /// Append one sample, rotating the open chunk when it is full or older
    /// than `limits.max_age`. A chunk exactly `max_age` old still accepts
    /// the sample.
    pub fn append(&self, sample: Sample, limits: &ChunkLimits, now: SystemTime) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(last) = state.last_timestamp {
            if sample.timestamp <= last {
                return Err(IngesterError::OutOfOrderSample {
                    timestamp: sample.timestamp,
                    last,
                });
            }
        }

        let rotate = state.open.as_ref().is_some_and(|open| {
            open.appender.len() >= limits.max_samples || age(open.created_at, now) > limits.max_age
        });
        if rotate {
            self.close_open(&mut state);
        }

        let open = state.open.get_or_insert_with(|| OpenChunk {
            appender: self.encoding.appender(),
            created_at: now,
        });
        open.appender.append(sample)?;

        state.last_timestamp = Some(sample.timestamp);
        state.last_append = Some(now);
        Ok(())
    }

    /// All buffered samples in `range`, oldest first, closed chunks and the
    /// open chunk alike
    pub fn snapshot(&self, range: &TimeRange) -> Result<Vec<Sample>> {
        let state = self.state.lock();
        let mut samples = Vec::new();

        if range.is_empty() {
            return Ok(samples);
        }

        for closed in &state.closed {
            samples.extend(closed.chunk.samples_in(range)?);
        }

        if let Some(open) = &state.open {
            let first = open.appender.first_timestamp();
            let last = open.appender.last_timestamp();
            if let (Some(first), Some(last)) = (first, last) {
                if range.overlaps(first, last) {
                    let decoded = self.encoding.decode(&open.appender.payload(), open.appender.len())?;
                    samples.extend(decoded.into_iter().filter(|s| range.contains(s.timestamp)));
                }
            }
        }

        Ok(samples)
    }

    /// Close the open chunk if `mode` or the limits call for it, then return
    /// every closed chunk the store has not acknowledged yet. Chunks stay
    /// pending until [`SeriesBuffer::mark_flushed`] is called, so a failed
    /// store write is retried by the next harvest.
    pub fn harvest_flushable(&self, limits: &ChunkLimits, mode: FlushMode, now: SystemTime) -> Harvest {
        let mut state = self.state.lock();

        let close = match (&state.open, mode) {
            (None, _) => false,
            (Some(_), FlushMode::Force) => true,
            (Some(open), FlushMode::Regular) => {
                let idle = match (limits.max_idle, state.last_append) {
                    (Some(max_idle), Some(last)) => age(last, now) > max_idle,
                    _ => false,
                };
                idle || age(open.created_at, now) > limits.max_age
            }
        };
        if close {
            self.close_open(&mut state);
        }

        let mut harvest = Harvest::default();
        for closed in state.closed.iter().filter(|c| !c.flushed) {
            harvest.chunks.push(closed.chunk.clone());
            harvest.through = closed.seq;
        }
        harvest
    }

    /// Record that the store accepted every chunk up to sequence `through`.
    /// Returns how many chunks changed state.
    pub fn mark_flushed(&self, through: u64) -> usize {
        let mut state = self.state.lock();
        let mut marked = 0;
        for closed in state.closed.iter_mut().filter(|c| c.seq <= through && !c.flushed) {
            closed.flushed = true;
            marked += 1;
        }
        marked
    }

    pub fn stats(&self) -> SeriesStats {
        let state = self.state.lock();
        SeriesStats {
            closed_chunks: state.closed.len(),
            pending_chunks: state.closed.iter().filter(|c| !c.flushed).count(),
            open_samples: state.open.as_ref().map_or(0, |o| o.appender.len()),
            has_open_chunk: state.open.is_some(),
        }
    }

    fn close_open(&self, state: &mut SeriesState) {
        let Some(open) = state.open.take() else {
            return;
        };
        if open.appender.is_empty() {
            return;
        }

        let block = open.appender.finish();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.closed.push(ClosedChunk {
            seq,
            chunk: Chunk::new(self.metric.clone(), self.encoding.kind(), block),
            flushed: false,
        });
    }
}

fn age(since: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or_default()
}
