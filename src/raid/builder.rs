//! Work-Unit Builder
//!
//! Turns a work unit's logical range into sub-operations according to the
//! current chunk health. Reads work one stripe segment at a time; writes
//! work one parity extent at a time, since every segment of a row shares
//! the row's parity strip.
//!
//! - Reads go straight to the data chunk when it is readable, otherwise the
//!   strip is reconstructed by XORing every other chunk of the row into the
//!   zeroed destination.
//! - Writes are split in two units. The read/XOR half seeds a parity
//!   accumulator with the new data and folds in the old data and old parity
//!   (read-modify-write), reading each stretch of old parity exactly once.
//!   When a covering data chunk or the parity chunk is being rebuilt its
//!   old contents cannot be trusted, so the half instead folds in the other
//!   data strips of the row (reconstruct-write). Either way the accumulator
//!   ends up holding the new parity, which the write half stores next to the
//!   data.
//!
//! Degraded reconstruction relies on every surviving chunk holding contents
//! consistent with the last full write of the row. Nothing here verifies
//! that; a row never written in full before a chunk failed reconstructs to
//! whatever XOR of the survivors happens to be.

use tracing::trace;

use super::config::MAX_SUBOPS_PER_UNIT;
use super::geometry::{Geometry, BLOCK_SHIFT};
use super::state::ChunkState;
use super::work_unit::{scratch, xor_into, SubOp, UnitKind, WorkUnit, XorTarget};
use crate::error::{Error, InvariantViolation, Result};

/// What a build produced, for logging and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    /// Segments served directly from their data chunk (writes: RMW extents)
    pub direct_segments: usize,
    /// Segments reconstructed from the rest of the row
    pub reconstructed_segments: usize,
    /// Parity extents using reconstruct-write instead of read-modify-write
    pub reconstruct_writes: usize,
}

/// Build (or rebuild) the sub-ops of a work unit from scratch.
pub fn build(geometry: &Geometry, chunks: &[ChunkState], wu: &mut WorkUnit) -> Result<BuildSummary> {
    wu.reset_subops();
    let summary = match wu.kind {
        UnitKind::Read => build_read(geometry, chunks, wu),
        UnitKind::WriteXor => build_write_xor(geometry, chunks, wu),
        UnitKind::Write => build_write(geometry, chunks, wu),
        UnitKind::RebuildXor { chunk, row } => build_rebuild_xor(geometry, chunk, row, wu),
        UnitKind::RebuildWrite { chunk, row } => build_rebuild_write(geometry, chunk, row, wu),
    }?;

    if wu.subops.len() > MAX_SUBOPS_PER_UNIT {
        InvariantViolation::new(
            "builder",
            format!(
                "work unit {} needs {} sub-operations (limit {})",
                wu.id,
                wu.subops.len(),
                MAX_SUBOPS_PER_UNIT
            ),
        )
        .raise();
    }

    trace!(
        unit = wu.id,
        kind = ?wu.kind,
        subops = wu.subops.len(),
        generation = wu.generation,
        "built work unit"
    );
    Ok(summary)
}

// =============================================================================
// Read Path
// =============================================================================

fn build_read(geometry: &Geometry, chunks: &[ChunkState], wu: &mut WorkUnit) -> Result<BuildSummary> {
    let mut summary = BuildSummary::default();

    if wu.data.len() != wu.length {
        wu.data = scratch(wu.length)?;
    }

    for (at, seg) in geometry.segments(wu.offset, wu.length) {
        let block = seg.phys_block();

        if chunks[seg.data_chunk].is_readable() {
            wu.subops
                .push(SubOp::read_direct(seg.data_chunk, block, seg.len, at));
            summary.direct_segments += 1;
            continue;
        }

        // Offline or rebuilding: rebuild the strip from everything else in the row.
        wu.data[at..at + seg.len].fill(0);
        for chunk in (0..geometry.chunk_count()).filter(|c| *c != seg.data_chunk) {
            wu.subops.push(SubOp::read_xor(
                chunk,
                block,
                seg.len,
                XorTarget::Caller { at },
            )?);
        }
        summary.reconstructed_segments += 1;
    }

    Ok(summary)
}

// =============================================================================
// Write Path
// =============================================================================

/// Reject the write if any segment targets an offline data chunk.
fn check_writable(geometry: &Geometry, chunks: &[ChunkState], wu: &WorkUnit) -> Result<()> {
    for (_, seg) in geometry.segments(wu.offset, wu.length) {
        if chunks[seg.data_chunk] == ChunkState::Offline {
            return Err(Error::RejectedWrite {
                chunk: seg.data_chunk,
            });
        }
    }
    Ok(())
}

fn build_write_xor(
    geometry: &Geometry,
    chunks: &[ChunkState],
    wu: &mut WorkUnit,
) -> Result<BuildSummary> {
    check_writable(geometry, chunks, wu)?;
    let mut summary = BuildSummary::default();

    if wu.data.len() != wu.length {
        return Err(Error::Internal(format!(
            "write unit {} carries {} bytes for a {} byte write",
            wu.id,
            wu.data.len(),
            wu.length
        )));
    }

    let extents = geometry.parity_extents(wu.offset, wu.length);
    wu.parity = scratch(extents.iter().map(|e| e.len).sum())?;

    for ext in &extents {
        let (at, len) = (ext.parity_at, ext.len);
        let block = ext.phys_block();
        let target = XorTarget::Parity { at };

        // New data goes in first; old contents are XORed on top as they arrive.
        for (_, data_at) in &ext.covering {
            xor_into(&mut wu.parity[at..at + len], &wu.data[*data_at..*data_at + len]);
        }

        let rebuilding = chunks[ext.parity_chunk] == ChunkState::Rebuilding
            || ext
                .covering
                .iter()
                .any(|(c, _)| chunks[*c] == ChunkState::Rebuilding);

        if rebuilding {
            for chunk in (0..geometry.chunk_count())
                .filter(|c| *c != ext.parity_chunk && !ext.is_covered_by(*c))
            {
                wu.subops.push(SubOp::read_xor(chunk, block, len, target)?);
            }
            summary.reconstruct_writes += 1;
        } else {
            for (chunk, _) in &ext.covering {
                wu.subops.push(SubOp::read_xor(*chunk, block, len, target)?);
            }
            wu.subops
                .push(SubOp::read_xor(ext.parity_chunk, block, len, target)?);
            summary.direct_segments += 1;
        }
    }

    Ok(summary)
}

fn build_write(geometry: &Geometry, chunks: &[ChunkState], wu: &mut WorkUnit) -> Result<BuildSummary> {
    check_writable(geometry, chunks, wu)?;
    let mut summary = BuildSummary::default();

    for (at, seg) in geometry.segments(wu.offset, wu.length) {
        wu.subops
            .push(SubOp::write_data(seg.data_chunk, seg.phys_block(), seg.len, at));
        summary.direct_segments += 1;
    }
    // One parity write per extent, laid out exactly as the read/XOR half built it.
    for ext in geometry.parity_extents(wu.offset, wu.length) {
        wu.subops.push(SubOp::write_parity(
            ext.parity_chunk,
            ext.phys_block(),
            ext.len,
            ext.parity_at,
        ));
    }

    Ok(summary)
}

// =============================================================================
// Rebuild
// =============================================================================

/// A chunk's strip in any row, data or parity, is the XOR of every other
/// chunk's strip in that row.
fn build_rebuild_xor(
    geometry: &Geometry,
    target: usize,
    row: u64,
    wu: &mut WorkUnit,
) -> Result<BuildSummary> {
    let len = geometry.strip_size() as usize;
    let block = geometry.row_phys_offset(row) >> BLOCK_SHIFT;

    wu.parity = scratch(len)?;
    for chunk in (0..geometry.chunk_count()).filter(|c| *c != target) {
        wu.subops.push(SubOp::read_xor(
            chunk,
            block,
            len,
            XorTarget::Parity { at: 0 },
        )?);
    }

    Ok(BuildSummary {
        reconstructed_segments: 1,
        ..Default::default()
    })
}

fn build_rebuild_write(
    geometry: &Geometry,
    target: usize,
    row: u64,
    wu: &mut WorkUnit,
) -> Result<BuildSummary> {
    let len = geometry.strip_size() as usize;
    let block = geometry.row_phys_offset(row) >> BLOCK_SHIFT;
    wu.subops.push(SubOp::write_parity(target, block, len, 0));
    Ok(BuildSummary {
        direct_segments: 1,
        ..Default::default()
    })
}

// =============================================================================
// Tests
// =============================================================================
