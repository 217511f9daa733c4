//! Chunk Calculator
//!
//! Maps a requested byte range onto the fixed, file-aligned chunks the cache
//! stores. Chunk `k` always covers `[k * chunk_size, (k + 1) * chunk_size - 1]`
//! (clamped to the file), so any two reads of the same region share cache
//! entries regardless of where the client's range begins.

use crate::error::{ProxyError, Result};
use crate::models::ByteRange;
use std::ops::RangeInclusive;
use tracing::debug;

/// One aligned chunk and the part of it the caller asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Chunk number within the file
    pub index: u64,
    /// Aligned bytes the chunk covers; this is the unit fetched and cached
    pub range: ByteRange,
    /// Requested bytes within `range`
    pub wanted: ByteRange,
}

impl ChunkSpec {
    /// Offsets of `wanted` relative to the start of the chunk, end exclusive
    pub fn wanted_offsets(&self) -> (usize, usize) {
        let start = (self.wanted.start - self.range.start) as usize;
        let end = (self.wanted.end - self.range.start + 1) as usize;
        (start, end)
    }

    /// Whether the whole chunk is wanted
    pub fn is_whole(&self) -> bool {
        self.range == self.wanted
    }
}

/// Calculator for splitting files into aligned chunks
#[derive(Debug, Clone, Copy)]
pub struct ChunkCalculator {
    chunk_size: u64,
}

impl ChunkCalculator {
    /// Create a new ChunkCalculator
    ///
    /// # Arguments
    /// * `chunk_size` - Size of each chunk in bytes, at least 1
    pub fn new(chunk_size: u64) -> Self {
        ChunkCalculator {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks covering a file of `file_size` bytes
    pub fn total_chunks(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size)
    }

    /// Aligned chunks covering `requested` within a file of `file_size` bytes
    ///
    /// With no requested range the whole file is covered. The requested end
    /// is clamped to the file; a start at or past the end is an
    /// `InvalidRange`. An empty file yields no chunks. Chunks are produced
    /// lazily, so the plan costs the same for any file size.
    pub fn calculate_chunks(
        &self,
        file_size: u64,
        requested: Option<ByteRange>,
    ) -> Result<Chunks> {
        if file_size == 0 {
            debug!("File size is 0, returning empty chunk list");
            return Ok(Chunks::empty(self.chunk_size));
        }

        let (start, end) = match requested {
            Some(range) => {
                if range.start >= file_size {
                    return Err(ProxyError::InvalidRange(format!(
                        "Range start {} is beyond file size {}",
                        range.start, file_size
                    )));
                }
                (range.start, range.end.min(file_size - 1))
            }
            None => (0, file_size - 1),
        };

        let chunks = Chunks {
            chunk_size: self.chunk_size,
            last_byte: file_size - 1,
            wanted: ByteRange { start, end },
            indices: Some(start / self.chunk_size..=end / self.chunk_size),
        };

        debug!(
            "Calculated {} chunks for range {}-{} (file_size={}, chunk_size={})",
            chunks.remaining(),
            start,
            end,
            file_size,
            self.chunk_size
        );

        Ok(chunks)
    }
}

/// Lazy sequence of [`ChunkSpec`]s in file order
#[derive(Debug, Clone)]
pub struct Chunks {
    chunk_size: u64,
    last_byte: u64,
    wanted: ByteRange,
    indices: Option<RangeInclusive<u64>>,
}

impl Chunks {
    fn empty(chunk_size: u64) -> Self {
        Chunks {
            chunk_size,
            last_byte: 0,
            wanted: ByteRange { start: 0, end: 0 },
            indices: None,
        }
    }

    /// Chunks not yet yielded
    pub fn remaining(&self) -> u64 {
        match &self.indices {
            Some(indices) if !indices.is_empty() => indices.end() - indices.start() + 1,
            _ => 0,
        }
    }

    fn spec(&self, index: u64) -> ChunkSpec {
        // index <= last_byte / chunk_size, so the start cannot overflow
        let chunk_start = index * self.chunk_size;
        let chunk_end = chunk_start
            .saturating_add(self.chunk_size - 1)
            .min(self.last_byte);
        ChunkSpec {
            index,
            range: ByteRange {
                start: chunk_start,
                end: chunk_end,
            },
            wanted: ByteRange {
                start: self.wanted.start.max(chunk_start),
                end: self.wanted.end.min(chunk_end),
            },
        }
    }
}

impl Iterator for Chunks {
    type Item = ChunkSpec;

    fn next(&mut self) -> Option<ChunkSpec> {
        let index = self.indices.as_mut()?.next()?;
        Some(self.spec(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining()) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

impl DoubleEndedIterator for Chunks {
    fn next_back(&mut self) -> Option<ChunkSpec> {
        let index = self.indices.as_mut()?.next_back()?;
        Some(self.spec(index))
    }
}
