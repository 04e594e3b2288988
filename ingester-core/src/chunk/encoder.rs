//! Gorilla encoder for open chunks
//!
//! Samples are appended one at a time; the payload written so far can be
//! read back at any point without finishing the chunk.

use super::bitstream::BitWriter;
use super::{ChunkAppender, EncodedBlock};
use crate::{IngesterError, Result, Sample, Timestamp};

/// Gorilla encoder for one chunk
#[derive(Debug, Clone)]
pub struct GorillaAppender {
    writer: BitWriter,
    count: usize,

    // Timestamp state
    first_timestamp: Timestamp,
    prev_timestamp: Timestamp,
    prev_timestamp_delta: i64,

    // Value state
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
    has_window: bool,
}

impl GorillaAppender {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(256),
            count: 0,
            first_timestamp: 0,
            prev_timestamp: 0,
            prev_timestamp_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: 0,
            prev_trailing_zeros: 0,
            has_window: false,
        }
    }

    fn encode_first(&mut self, sample: Sample) {
        self.first_timestamp = sample.timestamp;
        self.prev_timestamp = sample.timestamp;

        self.writer.write_bits(sample.timestamp as u64, 64);

        let value_bits = sample.value.to_bits();
        self.writer.write_bits(value_bits, 64);
        self.prev_value_bits = value_bits;
    }

    fn encode_timestamp(&mut self, timestamp: Timestamp) {
        let delta = timestamp.wrapping_sub(self.prev_timestamp);
        let delta_of_delta = delta.wrapping_sub(self.prev_timestamp_delta);

        // Regular scrape intervals make delta-of-delta zero most of the time
        if delta_of_delta == 0 {
            self.writer.write_bit(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            self.writer.write_bits(0b10, 2);
            self.writer.write_bits((delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            self.writer.write_bits(0b110, 3);
            self.writer.write_bits((delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            self.writer.write_bits(0b1110, 4);
            self.writer.write_bits((delta_of_delta + 2047) as u64, 12);
        } else {
            self.writer.write_bits(0b1111, 4);
            self.writer.write_bits(delta_of_delta as u64, 64);
        }

        self.prev_timestamp_delta = delta;
        self.prev_timestamp = timestamp;
    }

    fn encode_value(&mut self, value: f64) {
        let value_bits = value.to_bits();
        let xor = value_bits ^ self.prev_value_bits;

        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            // 5 bits hold the leading-zero count
            let leading_zeros = xor.leading_zeros().min(31);
            let trailing_zeros = xor.trailing_zeros();

            if self.has_window
                && leading_zeros >= self.prev_leading_zeros
                && trailing_zeros >= self.prev_trailing_zeros
            {
                self.writer.write_bit(false);
                let meaningful_bits = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
                self.writer
                    .write_bits(xor >> self.prev_trailing_zeros, meaningful_bits as usize);
            } else {
                self.writer.write_bit(true);
                self.writer.write_bits(leading_zeros as u64, 5);

                // 64 meaningful bits is written as 0
                let meaningful_bits = 64 - leading_zeros - trailing_zeros;
                self.writer.write_bits((meaningful_bits & 0x3f) as u64, 6);
                self.writer
                    .write_bits(xor >> trailing_zeros, meaningful_bits as usize);

                self.prev_leading_zeros = leading_zeros;
                self.prev_trailing_zeros = trailing_zeros;
                self.has_window = true;
            }
        }

        self.prev_value_bits = value_bits;
    }
}

impl Default for GorillaAppender {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAppender for GorillaAppender {
    fn append(&mut self, sample: Sample) -> Result<()> {
        if self.count == 0 {
            self.encode_first(sample);
        } else {
            if sample.timestamp <= self.prev_timestamp {
                return Err(IngesterError::OutOfOrderSample {
                    timestamp: sample.timestamp,
                    last: self.prev_timestamp,
                });
            }
            self.encode_timestamp(sample.timestamp);
            self.encode_value(sample.value);
        }
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
        (self.count > 0).then_some(self.prev_timestamp)
    }

    fn payload(&self) -> Vec<u8> {
        self.writer.snapshot()
    }

    fn finish(self: Box<Self>) -> EncodedBlock {
        let this = *self;
        EncodedBlock {
            count: this.count,
            first_timestamp: this.first_timestamp,
            last_timestamp: this.prev_timestamp,
            data: this.writer.finish(),
        }
    }
}
