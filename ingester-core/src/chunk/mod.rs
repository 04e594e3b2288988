//! Chunk encodings
//!
//! A chunk is an immutable, time-ordered run of samples for one series.
//! Encodings are pluggable through [`ChunkEncoding`]; the ingester picks one
//! at construction time and every chunk records which one produced it.
//!
//! - **Gorilla**: delta-of-delta timestamps and XOR'd values, ~1.4 bytes per
//!   sample on regular scrapes ("Gorilla: A Fast, Scalable, In-Memory Time
//!   Series Database").
//! - **Raw**: fixed 16 bytes per sample.

mod bitstream;
mod decoder;
mod encoder;
mod raw;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::GorillaDecoder;
pub use encoder::GorillaAppender;
pub use raw::RawAppender;

use crate::{Fingerprint, IngesterError, Metric, Result, Sample, TimeRange, Timestamp};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Incremental encoder behind an open chunk
pub trait ChunkAppender: Send + Sync + fmt::Debug {
    /// Append a sample. Fails with `OutOfOrderSample` unless the timestamp is
    /// strictly after the last appended one; a failed append changes nothing.
    fn append(&mut self, sample: Sample) -> Result<()>;

    /// Number of samples appended
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn first_timestamp(&self) -> Option<Timestamp>;

    fn last_timestamp(&self) -> Option<Timestamp>;

    /// Encoded bytes written so far, decodable with the sample count
    fn payload(&self) -> Vec<u8>;

    /// Seal the chunk
    fn finish(self: Box<Self>) -> EncodedBlock;
}

/// A chunk codec
pub trait ChunkEncoding: Send + Sync + fmt::Debug {
    fn kind(&self) -> EncodingKind;

    /// Start a new open chunk
    fn appender(&self) -> Box<dyn ChunkAppender>;

    /// Decode `count` samples from an encoded payload
    fn decode(&self, data: &[u8], count: usize) -> Result<Vec<Sample>>;

    /// Encode a whole run of samples at once
    fn encode(&self, samples: &[Sample]) -> Result<EncodedBlock> {
        let mut appender = self.appender();
        for sample in samples {
            appender.append(*sample)?;
        }
        Ok(appender.finish())
    }
}

#[derive(Debug, Default)]
pub struct GorillaEncoding;

impl ChunkEncoding for GorillaEncoding {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Gorilla
    }

    fn appender(&self) -> Box<dyn ChunkAppender> {
        Box::new(GorillaAppender::new())
    }

    fn decode(&self, data: &[u8], count: usize) -> Result<Vec<Sample>> {
        GorillaDecoder::new(data, count).decode_all()
    }
}

#[derive(Debug, Default)]
pub struct RawEncoding;

impl ChunkEncoding for RawEncoding {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Raw
    }

    fn appender(&self) -> Box<dyn ChunkAppender> {
        Box::new(RawAppender::new())
    }

    fn decode(&self, data: &[u8], count: usize) -> Result<Vec<Sample>> {
        raw::decode(data, count)
    }
}

static GORILLA: GorillaEncoding = GorillaEncoding;
static RAW: RawEncoding = RawEncoding;

/// Identifies the codec of a chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncodingKind {
    #[default]
    Gorilla = 1,
    Raw = 2,
}

impl EncodingKind {
    /// The codec implementing this encoding
    pub fn codec(self) -> &'static dyn ChunkEncoding {
        match self {
            EncodingKind::Gorilla => &GORILLA,
            EncodingKind::Raw => &RAW,
        }
    }
}

impl TryFrom<u8> for EncodingKind {
    type Error = IngesterError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EncodingKind::Gorilla),
            2 => Ok(EncodingKind::Raw),
            _ => Err(IngesterError::InvalidFormat(format!(
                "Invalid chunk encoding: {}",
                value
            ))),
        }
    }
}

impl FromStr for EncodingKind {
    type Err = IngesterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gorilla" | "doubledelta" => Ok(EncodingKind::Gorilla),
            "raw" => Ok(EncodingKind::Raw),
            other => Err(IngesterError::Config(format!("unknown chunk encoding: {}", other))),
        }
    }
}

/// Output of a finished appender
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    /// Encoded data
    pub data: Vec<u8>,
    /// Number of samples
    pub count: usize,
    /// First timestamp in block
    pub first_timestamp: Timestamp,
    /// Last timestamp in block
    pub last_timestamp: Timestamp,
}

impl EncodedBlock {
    /// Get bytes per sample
    pub fn bytes_per_point(&self) -> f64 {
        self.data.len() as f64 / self.count as f64
    }
}

/// A closed chunk as handed to the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub fingerprint: Fingerprint,
    pub metric: Metric,
    pub encoding: EncodingKind,
    pub first_timestamp: Timestamp,
    pub last_timestamp: Timestamp,
    pub count: usize,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(metric: Metric, encoding: EncodingKind, block: EncodedBlock) -> Self {
        Self {
            fingerprint: metric.fingerprint(),
            metric,
            encoding,
            first_timestamp: block.first_timestamp,
            last_timestamp: block.last_timestamp,
            count: block.count,
            data: Bytes::from(block.data),
        }
    }

    /// Decode every sample in the chunk
    pub fn samples(&self) -> Result<Vec<Sample>> {
        self.encoding.codec().decode(&self.data, self.count)
    }

    /// Decode the samples inside `range`
    pub fn samples_in(&self, range: &TimeRange) -> Result<Vec<Sample>> {
        if !self.overlaps(range) {
            return Ok(Vec::new());
        }
        let mut samples = self.samples()?;
        samples.retain(|s| range.contains(s.timestamp));
        Ok(samples)
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        range.overlaps(self.first_timestamp, self.last_timestamp)
    }
}
