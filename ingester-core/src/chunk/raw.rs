//! Uncompressed chunk encoding: 16 little-endian bytes per sample

use super::{ChunkAppender, EncodedBlock};
use crate::{IngesterError, Result, Sample, Timestamp};
use bytes::{Buf, BufMut, BytesMut};

const SAMPLE_SIZE: usize = 16;

#[derive(Debug, Default)]
pub struct RawAppender {
    buf: BytesMut,
    count: usize,
    first_timestamp: Timestamp,
    last_timestamp: Timestamp,
}

impl RawAppender {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkAppender for RawAppender {
    fn append(&mut self, sample: Sample) -> Result<()> {
        if self.count == 0 {
            self.first_timestamp = sample.timestamp;
        } else if sample.timestamp <= self.last_timestamp {
            return Err(IngesterError::OutOfOrderSample {
                timestamp: sample.timestamp,
                last: self.last_timestamp,
            });
        }

        self.buf.put_i64_le(sample.timestamp);
        self.buf.put_f64_le(sample.value);
        self.last_timestamp = sample.timestamp;
        self.count += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.count
    }

    fn first_timestamp(&self) -> Option<Timestamp> {
        (self.count > 0).then_some(self.first_timestamp)
    }

    fn last_timestamp(&self) -> Option<Timestamp> {
        (self.count > 0).then_some(self.last_timestamp)
    }

    fn payload(&self) -> Vec<u8> {
        self.buf.to_vec()
    }

    fn finish(self: Box<Self>) -> EncodedBlock {
        EncodedBlock {
            data: self.buf.to_vec(),
            count: self.count,
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
        }
    }
}

pub fn decode(mut data: &[u8], count: usize) -> Result<Vec<Sample>> {
    if data.len() != count * SAMPLE_SIZE {
        return Err(IngesterError::Compression(format!(
            "raw chunk holds {} bytes, expected {} for {} samples",
            data.len(),
            count * SAMPLE_SIZE,
            count
        )));
    }

    let mut samples = Vec::with_capacity(count);
    while data.has_remaining() {
        let timestamp = data.get_i64_le();
        let value = data.get_f64_le();
        samples.push(Sample::new(timestamp, value));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip_and_length_check() {
        let mut appender = Box::new(RawAppender::new());
        appender.append(Sample::new(1, 0.5)).unwrap();
        appender.append(Sample::new(2, -0.5)).unwrap();
        assert!(appender.append(Sample::new(2, 9.0)).is_err());

        let block = appender.finish();
        assert_eq!(block.data.len(), 32);
        assert_eq!(
            decode(&block.data, block.count).unwrap(),
            vec![Sample::new(1, 0.5), Sample::new(2, -0.5)]
        );
        assert!(decode(&block.data[..20], 2).is_err());
    }
}
