use std::ops::Range;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{DrvError, DrvResult};

/// One uploaded chunk of a file. Immutable once created; a file's content is
/// an ordered list of these with contiguous sequence numbers starting at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub seq: u32,
    pub size: u64,
    /// Opaque reference returned by the endpoint (attachment URL).
    pub remote_ref: String,
    /// Hex SHA-256 of the chunk content.
    pub checksum: String,
    /// URL of the endpoint the chunk was uploaded through.
    pub endpoint: String,
}

pub fn chunk_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn chunk_list_size(chunks: &[ChunkDescriptor]) -> u64 {
    chunks.iter().map(|c| c.size).sum()
}

/// One chunk's share of a requested byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlice {
    /// Index into the chunk list handed to [`plan_range`].
    pub index: usize,
    /// Byte range within that chunk.
    pub inner: Range<u64>,
}

impl ChunkSlice {
    pub fn len(&self) -> u64 {
        self.inner.end - self.inner.start
    }

    pub fn is_empty(&self) -> bool {
        self.inner.start >= self.inner.end
    }
}

/// Compute which chunks overlap `[offset, offset+len)` using a prefix sum
/// over chunk sizes. The result is ordered by sequence number and already
/// trimmed to the requested range; the range end is clamped to the total size.
pub fn plan_range(
    chunks: &[ChunkDescriptor],
    offset: u64,
    len: u64,
) -> DrvResult<Vec<ChunkSlice>> {
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.seq as usize != i {
            return Err(DrvError::Invalid(format!(
                "chunk list is not contiguous: seq {} at position {}",
                chunk.seq, i
            )));
        }
    }

    let total = chunk_list_size(chunks);
    if len == 0 || offset >= total {
        return Ok(Vec::new());
    }
    let end = total.min(offset.saturating_add(len));

    let mut slices = Vec::new();
    let mut chunk_start = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        let chunk_end = chunk_start + chunk.size;
        if chunk_end > offset && chunk_start < end {
            let from = offset.max(chunk_start) - chunk_start;
            let to = end.min(chunk_end) - chunk_start;
            slices.push(ChunkSlice {
                index: i,
                inner: from..to,
            });
        }
        chunk_start = chunk_end;
        if chunk_start >= end {
            break;
        }
    }
    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(seq: u32, size: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            seq,
            size,
            remote_ref: format!("mem://chunk/{}", seq),
            checksum: String::new(),
            endpoint: "ep".to_string(),
        }
    }

    #[test]
    fn test_plan_range_full() {
        let chunks = vec![desc(0, 25), desc(1, 25), desc(2, 10)];
        assert_eq!(chunk_list_size(&chunks), 60);

        let slices = plan_range(&chunks, 0, 60).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].inner, 0..25);
        assert_eq!(slices[1].inner, 0..25);
        assert_eq!(slices[2].inner, 0..10);
    }

    #[test]
    fn test_plan_range_partial() {
        let chunks = vec![desc(0, 25), desc(1, 25), desc(2, 10)];

        // straddles the first two chunks
        let slices = plan_range(&chunks, 20, 10).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].index, 0);
        assert_eq!(slices[0].inner, 20..25);
        assert_eq!(slices[1].index, 1);
        assert_eq!(slices[1].inner, 0..5);

        // inside a single chunk
        let slices = plan_range(&chunks, 30, 5).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].index, 1);
        assert_eq!(slices[0].inner, 5..10);
    }

    #[test]
    fn test_plan_range_clamped() {
        let chunks = vec![desc(0, 25), desc(1, 5)];
        let slices = plan_range(&chunks, 20, 100).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1].inner, 0..5);

        assert!(plan_range(&chunks, 30, 10).unwrap().is_empty());
        assert!(plan_range(&chunks, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_plan_range_rejects_gaps() {
        let chunks = vec![desc(0, 25), desc(2, 25)];
        assert!(plan_range(&chunks, 0, 10).is_err());
    }
}
