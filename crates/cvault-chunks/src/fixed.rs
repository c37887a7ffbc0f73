//! Fixed-size chunking
//!
//! Splits a buffer into `ceil(len / chunk_size)` spans. Every span except
//! possibly the last is exactly `chunk_size` bytes. The partition depends only
//! on `(len, chunk_size)`, so re-splitting the same content always reproduces
//! byte-identical chunk inputs (required for per-chunk fallback reprocessing).

use std::ops::Range;

use cvault_core::{CvaultError, CvaultResult};

/// One chunk's position in the source buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Zero-based chunk index
    pub index: u32,
    /// Byte offset within the source buffer
    pub offset: usize,
    /// Chunk length in bytes
    pub len: usize,
}

impl ChunkSpan {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.range()]
    }
}

/// Number of chunks a buffer of `len` bytes splits into.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size)
}

/// Split `content` into index-ordered fixed-size spans.
///
/// Empty content yields no spans. `chunk_size` must be positive.
pub fn split(content: &[u8], chunk_size: usize) -> CvaultResult<Vec<ChunkSpan>> {
    if chunk_size == 0 {
        return Err(CvaultError::InvalidInput("chunk size must be positive".into()));
    }

    let count = chunk_count(content.len(), chunk_size);
    if count > u32::MAX as usize {
        return Err(CvaultError::InvalidInput(format!(
            "{} bytes at chunk size {chunk_size} exceeds the chunk index range",
            content.len()
        )));
    }

    Ok((0..count)
        .map(|i| {
            let offset = i * chunk_size;
            ChunkSpan {
                index: i as u32,
                offset,
                len: chunk_size.min(content.len() - offset),
            }
        })
        .collect())
}
