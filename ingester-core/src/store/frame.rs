//! On-disk frame holding one `put` batch

use crate::chunk::Chunk;
use crate::{IngesterError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FLAG_LZ4: u8 = 0x01;

/// Smallest valid frame body: flags + payload length + checksum
const MIN_BODY: usize = 1 + 4 + 4;

/// A batch of chunks as written to a segment file
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    pub chunks: Vec<Chunk>,
}

impl ChunkFrame {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// Serialize with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: frame length (excluding this field)
    /// - 1 byte: flags (bit 0: payload is LZ4 compressed)
    /// - 4 bytes: payload length
    /// - N bytes: payload (bincode `Vec<Chunk>`)
    /// - 4 bytes: CRC32 of flags, length and payload
    pub fn encode(&self, compress: bool) -> Result<Bytes> {
        let serialized = bincode::serialize(&self.chunks)
            .map_err(|e| IngesterError::InvalidFormat(e.to_string()))?;
        let (flags, payload) = if compress {
            (FLAG_LZ4, lz4_flex::compress_prepend_size(&serialized))
        } else {
            (0, serialized)
        };

        let mut buf = BytesMut::with_capacity(4 + MIN_BODY + payload.len());

        // Reserve space for length prefix
        buf.put_u32_le(0);
        buf.put_u8(flags);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        Ok(buf.freeze())
    }

    /// Deserialize one frame, validating its checksum. Returns the frame and
    /// the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(IngesterError::InvalidFormat("Frame too short".into()));
        }

        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len < MIN_BODY {
            return Err(IngesterError::Corruption(format!("frame length {} too small", len)));
        }
        if data.len() < 4 + len {
            return Err(IngesterError::InvalidFormat("Incomplete frame".into()));
        }

        let body = &data[4..4 + len];
        let (content, mut trailer) = body.split_at(len - 4);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(IngesterError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = content;
        let flags = cursor.get_u8();
        let payload_len = cursor.get_u32_le() as usize;
        if payload_len != cursor.len() {
            return Err(IngesterError::Corruption(format!(
                "payload length {} does not match frame ({} bytes)",
                payload_len,
                cursor.len()
            )));
        }

        let decompressed;
        let payload = if flags & FLAG_LZ4 != 0 {
            decompressed = lz4_flex::decompress_size_prepended(cursor)
                .map_err(|e| IngesterError::Corruption(e.to_string()))?;
            &decompressed[..]
        } else {
            cursor
        };

        let chunks: Vec<Chunk> = bincode::deserialize(payload)
            .map_err(|e| IngesterError::InvalidFormat(e.to_string()))?;

        Ok((Self { chunks }, 4 + len))
    }
}
