//! Gorilla decoder

use super::bitstream::BitReader;
use crate::{IngesterError, Result, Sample};

fn truncated() -> IngesterError {
    IngesterError::Compression("unexpected end of chunk data".into())
}

/// Gorilla decoder for one chunk payload
pub struct GorillaDecoder<'a> {
    reader: BitReader<'a>,
    count: usize,
    decoded: usize,

    // Timestamp state
    prev_timestamp: i64,
    prev_timestamp_delta: i64,

    // Value state
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

impl<'a> GorillaDecoder<'a> {
    /// Create a decoder that yields exactly `count` samples
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            count,
            decoded: 0,
            prev_timestamp: 0,
            prev_timestamp_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: 0,
            prev_trailing_zeros: 0,
        }
    }

    /// Decode all samples
    pub fn decode_all(&mut self) -> Result<Vec<Sample>> {
        let mut samples = Vec::with_capacity(self.count);

        while let Some(sample) = self.decode_next()? {
            samples.push(sample);
        }

        Ok(samples)
    }

    /// Decode the next sample
    pub fn decode_next(&mut self) -> Result<Option<Sample>> {
        if self.decoded >= self.count {
            return Ok(None);
        }

        if self.decoded == 0 {
            return self.decode_first().map(Some);
        }

        let timestamp = self.decode_timestamp()?;
        let value = self.decode_value()?;
        self.decoded += 1;

        Ok(Some(Sample::new(timestamp, value)))
    }

    fn read_bit(&mut self) -> Result<bool> {
        self.reader.read_bit().ok_or_else(truncated)
    }

    fn read_bits(&mut self, num_bits: usize) -> Result<u64> {
        self.reader.read_bits(num_bits).ok_or_else(truncated)
    }

    fn decode_first(&mut self) -> Result<Sample> {
        let timestamp = self.read_bits(64)? as i64;
        let value_bits = self.read_bits(64)?;

        self.prev_timestamp = timestamp;
        self.prev_value_bits = value_bits;
        self.decoded = 1;

        Ok(Sample::new(timestamp, f64::from_bits(value_bits)))
    }

    fn decode_timestamp(&mut self) -> Result<i64> {
        let delta_of_delta = if !self.read_bit()? {
            0
        } else if !self.read_bit()? {
            self.read_bits(7)? as i64 - 63
        } else if !self.read_bit()? {
            self.read_bits(9)? as i64 - 255
        } else if !self.read_bit()? {
            self.read_bits(12)? as i64 - 2047
        } else {
            self.read_bits(64)? as i64
        };

        let delta = self.prev_timestamp_delta.wrapping_add(delta_of_delta);
        let timestamp = self.prev_timestamp.wrapping_add(delta);

        if timestamp <= self.prev_timestamp {
            return Err(IngesterError::Compression(format!(
                "decoded timestamp {} does not follow {}",
                timestamp, self.prev_timestamp
            )));
        }

        self.prev_timestamp_delta = delta;
        self.prev_timestamp = timestamp;

        Ok(timestamp)
    }

    fn decode_value(&mut self) -> Result<f64> {
        if !self.read_bit()? {
            return Ok(f64::from_bits(self.prev_value_bits));
        }

        let (leading_zeros, meaningful_bits) = if !self.read_bit()? {
            let meaningful_bits = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
            (self.prev_leading_zeros, meaningful_bits)
        } else {
            let leading = self.read_bits(5)? as u32;
            let meaningful = match self.read_bits(6)? as u32 {
                0 => 64,
                n => n,
            };
            if leading + meaningful > 64 {
                return Err(IngesterError::Compression(format!(
                    "invalid xor window: {} leading + {} meaningful bits",
                    leading, meaningful
                )));
            }

            self.prev_leading_zeros = leading;
            self.prev_trailing_zeros = 64 - leading - meaningful;

            (leading, meaningful)
        };

        let meaningful_value = self.read_bits(meaningful_bits as usize)?;

        let trailing_zeros = 64 - leading_zeros - meaningful_bits;
        let xor = meaningful_value << trailing_zeros;
        let value_bits = self.prev_value_bits ^ xor;

        self.prev_value_bits = value_bits;

        Ok(f64::from_bits(value_bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkAppender, GorillaAppender};

    fn encode(samples: &[Sample]) -> (Vec<u8>, usize) {
        let mut encoder = Box::new(GorillaAppender::new());
        for s in samples {
            encoder.append(*s).unwrap();
        }
        let block = encoder.finish();
        (block.data, block.count)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let samples: Vec<Sample> = (0..100)
            .map(|i| Sample::new(1_000_000 + i * 10_000, 20.0 + i as f64 * 0.5))
            .collect();

        let (data, count) = encode(&samples);
        let decoded = GorillaDecoder::new(&data, count).decode_all().unwrap();

        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_irregular_timestamps_and_extreme_values() {
        let samples = vec![
            Sample::new(-5_000, f64::MAX),
            Sample::new(-4_999, f64::MIN_POSITIVE),
            Sample::new(0, -0.0),
            Sample::new(300, 1.0),
            Sample::new(3_000, f64::NEG_INFINITY),
            Sample::new(3_001, 1e-300),
            Sample::new(10_000_000_000, 42.0),
            Sample::new(10_000_000_001, 42.0),
        ];

        let (data, count) = encode(&samples);
        let decoded = GorillaDecoder::new(&data, count).decode_all().unwrap();

        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(&decoded) {
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.value.to_bits(), b.value.to_bits());
        }
    }

    #[test]
    fn test_decode_truncated_payload() {
        let samples: Vec<Sample> = (0..10).map(|i| Sample::new(i * 7, i as f64 * 1.1)).collect();
        let (data, count) = encode(&samples);

        let result = GorillaDecoder::new(&data[..data.len() / 2], count).decode_all();
        assert!(matches!(result, Err(IngesterError::Compression(_))));
    }
}
