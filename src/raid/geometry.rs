//! Geometry Mapper
//!
//! Maps a logical byte range onto physical chunk coordinates. Every volume
//! has `N` data chunks and one parity chunk per stripe row. RAID4 keeps
//! parity on the last chunk; RAID5 rotates it left-asymmetrically.
//!
//! ```text
//!            chunk0   chunk1   chunk2   chunk3        (N = 3, RAID5)
//!   row 0    D0       D1       D2       P
//!   row 1    D3       D4       P        D5
//!   row 2    D6       P        D7       D8
//!   row 3    P        D9       D10      D11
//!   row 4    D12      D13      D14      P
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Size of a logical and physical block in bytes
pub const BLOCK_SIZE: usize = 512;

/// log2 of [`BLOCK_SIZE`]
pub const BLOCK_SHIFT: u32 = 9;

/// Blocks reserved at the start of every chunk for metadata and boot area
pub const DEFAULT_DATA_OFFSET_BLOCKS: u64 = 528;

/// Smallest number of chunks a parity volume can have (2 data + 1 parity)
pub const MIN_CHUNKS: usize = 3;

// =============================================================================
// RAID Level
// =============================================================================

/// Parity placement variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    /// Dedicated parity chunk (always the last one)
    Raid4,
    /// Rotating parity, left-asymmetric layout
    Raid5,
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaidLevel::Raid4 => write!(f, "raid4"),
            RaidLevel::Raid5 => write!(f, "raid5"),
        }
    }
}

impl std::str::FromStr for RaidLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raid4" | "4" => Ok(RaidLevel::Raid4),
            "raid5" | "5" => Ok(RaidLevel::Raid5),
            other => Err(Error::InvalidConfig(format!("unknown RAID level: {other}"))),
        }
    }
}

// =============================================================================
// Block Range
// =============================================================================

/// Half-open range of chunk-relative blocks, used for collision detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    /// First block (inclusive)
    pub start: u64,
    /// Last block (exclusive)
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// =============================================================================
// Stripe Segment
// =============================================================================

/// The part of a logical request that falls inside a single strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeSegment {
    /// Global strip number (logical offset / strip size)
    pub strip_no: u64,

    /// Stripe row the strip belongs to
    pub row: u64,

    /// Chunk holding the data for this strip
    pub data_chunk: usize,

    /// Chunk holding the parity for this row
    pub parity_chunk: usize,

    /// Byte offset of the row inside the chunk data area
    pub chunk_offset: u64,

    /// Byte offset inside the strip
    pub strip_offset: u64,

    /// Byte offset on the physical chunk, reserved header included
    pub phys_offset: u64,

    /// Bytes of the request covered by this segment
    pub len: usize,
}

impl StripeSegment {
    /// Physical block address on the target chunk
    pub fn phys_block(&self) -> u64 {
        self.phys_offset >> BLOCK_SHIFT
    }
}

// =============================================================================
// Parity Extent
// =============================================================================

/// A stretch of one row's parity that a write updates.
///
/// Segments of the same row share the row's parity strip. A write folds all
/// of them into one accumulator per row, split at segment boundaries so each
/// extent is covered by the same set of segments end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParityExtent {
    pub row: u64,

    /// Chunk holding the parity for the row
    pub parity_chunk: usize,

    /// Byte offset inside the strip
    pub strip_offset: u64,

    /// Byte offset on every chunk of the row, reserved header included
    pub phys_offset: u64,

    pub len: usize,

    /// Offset of the extent in the write's parity accumulator
    pub parity_at: usize,

    /// `(data chunk, caller buffer offset)` of every segment covering the extent
    pub covering: Vec<(usize, usize)>,
}

impl ParityExtent {
    /// Physical block address on every chunk of the row
    pub fn phys_block(&self) -> u64 {
        self.phys_offset >> BLOCK_SHIFT
    }

    /// Whether a segment on `chunk` supplies new data for this extent
    pub fn is_covered_by(&self, chunk: usize) -> bool {
        self.covering.iter().any(|(c, _)| *c == chunk)
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Layout parameters of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    level: RaidLevel,
    chunk_count: usize,
    strip_size: u64,
    chunk_size: u64,
    data_offset_blocks: u64,
}

impl Geometry {
    /// Create a geometry after validating its parameters.
    pub fn new(
        level: RaidLevel,
        chunk_count: usize,
        strip_size: u64,
        chunk_size: u64,
        data_offset_blocks: u64,
    ) -> Result<Self> {
        if chunk_count < MIN_CHUNKS {
            return Err(Error::InvalidConfig(format!(
                "chunk_count must be >= {MIN_CHUNKS}, got {chunk_count}"
            )));
        }
        if !strip_size.is_power_of_two() || strip_size < BLOCK_SIZE as u64 {
            return Err(Error::InvalidConfig(format!(
                "strip_size must be a power of two >= {BLOCK_SIZE}, got {strip_size}"
            )));
        }
        if chunk_size == 0 || chunk_size % strip_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "chunk_size must be a non-zero multiple of strip_size ({strip_size}), got {chunk_size}"
            )));
        }

        Ok(Self {
            level,
            chunk_count,
            strip_size,
            chunk_size,
            data_offset_blocks,
        })
    }

    pub fn level(&self) -> RaidLevel {
        self.level
    }

    /// Total chunks, parity included
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Data chunks per row (`N`)
    pub fn data_chunks(&self) -> usize {
        self.chunk_count - 1
    }

    pub fn strip_size(&self) -> u64 {
        self.strip_size
    }

    /// Bytes of data area on each chunk
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn data_offset_blocks(&self) -> u64 {
        self.data_offset_blocks
    }

    /// Bytes reserved at the start of each chunk
    pub fn data_offset_bytes(&self) -> u64 {
        self.data_offset_blocks << BLOCK_SHIFT
    }

    /// Number of stripe rows in the volume
    pub fn rows(&self) -> u64 {
        self.chunk_size / self.strip_size
    }

    /// Usable logical capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.data_chunks() as u64 * self.chunk_size
    }

    /// Size of each backing chunk device in bytes, header included
    pub fn chunk_device_size(&self) -> u64 {
        self.data_offset_bytes() + self.chunk_size
    }

    /// Parity chunk for a row.
    pub fn parity_chunk_for_row(&self, row: u64) -> usize {
        let n = self.data_chunks() as u64;
        match self.level {
            RaidLevel::Raid4 => n as usize,
            RaidLevel::Raid5 => (n - (row % (n + 1))) as usize,
        }
    }

    /// Parity chunk for a global strip number.
    pub fn parity_chunk(&self, strip_no: u64) -> usize {
        self.parity_chunk_for_row(strip_no / self.data_chunks() as u64)
    }

    /// Map the start of a logical byte range to the segment covering it.
    ///
    /// `len` is the remaining request length; the segment is clipped to the
    /// end of the strip.
    pub fn map(&self, offset: u64, len: usize) -> StripeSegment {
        let n = self.data_chunks() as u64;
        let strip_no = offset / self.strip_size;
        let strip_offset = offset % self.strip_size;
        let row = strip_no / n;
        let chunk_offset = row * self.strip_size;

        let parity_chunk = self.parity_chunk_for_row(row);
        let mut data_chunk = (strip_no % n) as usize;
        if self.level == RaidLevel::Raid5 && data_chunk >= parity_chunk {
            data_chunk += 1;
        }

        let seg_len = std::cmp::min(self.strip_size - strip_offset, len as u64) as usize;

        StripeSegment {
            strip_no,
            row,
            data_chunk,
            parity_chunk,
            chunk_offset,
            strip_offset,
            phys_offset: self.data_offset_bytes() + chunk_offset + strip_offset,
            len: seg_len,
        }
    }

    /// Iterate over every segment of a logical request.
    ///
    /// Each item carries the offset of the segment inside the caller's buffer.
    pub fn segments(&self, offset: u64, len: usize) -> Segments<'_> {
        Segments {
            geometry: self,
            offset,
            buf_offset: 0,
            remaining: len,
        }
    }

    /// Split a write into the parity extents of the rows it touches.
    ///
    /// Extents are laid out back to back in row order, so the accumulator
    /// for the whole write is `sum(len)` bytes. Gaps in a row that no segment
    /// covers are left out.
    pub fn parity_extents(&self, offset: u64, len: usize) -> Vec<ParityExtent> {
        let mut extents = Vec::new();
        let mut parity_at = 0;
        let mut segments = self.segments(offset, len).peekable();

        while let Some(first) = segments.next() {
            let row = first.1.row;
            let mut in_row = vec![first];
            while let Some(next) = segments.next_if(|(_, s)| s.row == row) {
                in_row.push(next);
            }

            let mut edges: Vec<u64> = in_row
                .iter()
                .flat_map(|(_, s)| [s.strip_offset, s.strip_offset + s.len as u64])
                .collect();
            edges.sort_unstable();
            edges.dedup();

            for pair in edges.windows(2) {
                let (start, end) = (pair[0], pair[1]);
                let covering: Vec<(usize, usize)> = in_row
                    .iter()
                    .filter(|(_, s)| s.strip_offset <= start && end <= s.strip_offset + s.len as u64)
                    .map(|(at, s)| (s.data_chunk, at + (start - s.strip_offset) as usize))
                    .collect();
                if covering.is_empty() {
                    continue;
                }

                let len = (end - start) as usize;
                extents.push(ParityExtent {
                    row,
                    parity_chunk: first.1.parity_chunk,
                    strip_offset: start,
                    phys_offset: self.row_phys_offset(row) + start,
                    len,
                    parity_at,
                    covering,
                });
                parity_at += len;
            }
        }

        extents
    }

    /// Physical byte offset of a row's strips (identical on every chunk).
    pub fn row_phys_offset(&self, row: u64) -> u64 {
        self.data_offset_bytes() + row * self.strip_size
    }

    /// Chunk-relative blocks spanned by a whole row.
    pub fn row_blocks(&self, row: u64) -> BlockRange {
        let start = (row * self.strip_size) >> BLOCK_SHIFT;
        BlockRange::new(start, start + (self.strip_size >> BLOCK_SHIFT))
    }

    /// Whole-row block range touched by a logical request.
    pub fn request_blocks(&self, offset: u64, len: usize) -> BlockRange {
        if len == 0 {
            return BlockRange::new(0, 0);
        }
        let n = self.data_chunks() as u64;
        let first_row = offset / self.strip_size / n;
        let last_row = (offset + len as u64 - 1) / self.strip_size / n;
        BlockRange::new(
            self.row_blocks(first_row).start,
            self.row_blocks(last_row).end,
        )
    }
}

/// Iterator over the stripe segments of a request.
#[derive(Debug)]
pub struct Segments<'a> {
    geometry: &'a Geometry,
    offset: u64,
    buf_offset: usize,
    remaining: usize,
}

impl Iterator for Segments<'_> {
    type Item = (usize, StripeSegment);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let segment = self.geometry.map(self.offset, self.remaining);
        let at = self.buf_offset;

        self.offset += segment.len as u64;
        self.buf_offset += segment.len;
        self.remaining -= segment.len;

        Some((at, segment))
    }
}

// =============================================================================
// Tests
// =============================================================================
