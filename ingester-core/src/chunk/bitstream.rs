//! Bit-level I/O for the Gorilla chunk encoding
//!
//! Bits are packed most significant first. The writer stages up to 64 bits
//! in an accumulator and spills whole bytes, so an open chunk can be read
//! back at any point through [`BitWriter::snapshot`].

/// Append-only bit buffer behind an open Gorilla chunk
#[derive(Debug, Clone)]
pub struct BitWriter {
    bytes: Vec<u8>,
    /// Pending bits, right-aligned
    acc: u64,
    /// Number of valid bits in `acc` (always < 8 between calls)
    pending: u32,
}

impl BitWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            acc: 0,
            pending: 0,
        }
    }

    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u64, 1);
    }

    /// Write the low `num_bits` bits of `value`
    pub fn write_bits(&mut self, value: u64, num_bits: usize) {
        debug_assert!(num_bits <= 64);
        if num_bits == 0 {
            return;
        }

        // Split wide writes so the accumulator never overflows
        if num_bits > 56 {
            let low = num_bits - 32;
            self.write_bits(value >> low, 32);
            self.write_bits(value, low);
            return;
        }

        let mask = (1u64 << num_bits) - 1;
        self.acc = (self.acc << num_bits) | (value & mask);
        self.pending += num_bits as u32;

        while self.pending >= 8 {
            self.pending -= 8;
            self.bytes.push((self.acc >> self.pending) as u8);
        }
        self.acc &= (1u64 << self.pending) - 1;
    }

    fn tail_byte(&self) -> Option<u8> {
        (self.pending > 0).then(|| (self.acc << (8 - self.pending)) as u8)
    }

    /// Everything written so far with the last byte zero-padded; the writer
    /// stays usable
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.bytes);
        out.extend(self.tail_byte());
        out
    }

    pub fn finish(mut self) -> Vec<u8> {
        if let Some(tail) = self.tail_byte() {
            self.bytes.push(tail);
        }
        self.bytes
    }

    /// Size in bytes, counting a partial byte
    pub fn len(&self) -> usize {
        self.bytes.len() + usize::from(self.pending > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

/// Cursor over a packed bit payload
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Absolute bit offset
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }

    /// Read `num_bits` bits as the low bits of a u64, `None` past the end
    pub fn read_bits(&mut self, num_bits: usize) -> Option<u64> {
        debug_assert!(num_bits <= 64);
        if num_bits > self.remaining() {
            return None;
        }

        let mut value = 0u64;
        let mut left = num_bits;
        while left > 0 {
            let byte = self.data[self.pos / 8];
            let offset = self.pos % 8;
            let take = left.min(8 - offset);
            let bits = (byte >> (8 - offset - take)) & (0xff >> (8 - take));

            value = (value << take) | bits as u64;
            self.pos += take;
            left -= take;
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_widths() {
        let mut writer = BitWriter::default();
        writer.write_bit(true);
        writer.write_bits(0b01, 2);
        writer.write_bits(0x1234_5678_9abc_def0, 64);
        writer.write_bits(0x7f, 7);
        writer.write_bits(0, 0);

        let data = writer.finish();
        assert_eq!(data.len(), 10);

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bits(2), Some(0b01));
        assert_eq!(reader.read_bits(64), Some(0x1234_5678_9abc_def0));
        assert_eq!(reader.read_bits(7), Some(0x7f));
        assert_eq!(reader.read_bits(6), Some(0));
        assert_eq!(reader.read_bit(), None);
    }

    #[test]
    fn test_snapshot_keeps_writer_open() {
        let mut writer = BitWriter::default();
        writer.write_bits(0b101, 3);
        assert_eq!(writer.snapshot(), vec![0b1010_0000]);

        writer.write_bits(0b11111, 5);
        writer.write_bits(u64::MAX, 64);
        assert_eq!(writer.len(), 9);

        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(8), Some(0b1011_1111));
        assert_eq!(reader.read_bits(64), Some(u64::MAX));
        assert_eq!(reader.read_bit(), None);
    }
}
