//! Property-Based Tests for the Parity Engine
//!
//! # Test Properties
//!
//! 1. **Parity Placement**: every row has exactly one parity chunk and no
//!    data strip lands on it
//! 2. **Roundtrip**: write(data) then read() returns data
//! 3. **Parity Consistency**: after any writes, each row XORs to zero
//! 4. **Degraded Reads**: with any single chunk offline, reads still return
//!    the written data

#![cfg(test)]

use std::sync::mpsc;
use std::sync::Arc;

use proptest::prelude::*;

use super::config::VolumeConfig;
use super::geometry::{Geometry, RaidLevel, BLOCK_SIZE};
use super::state::ChunkState;
use super::volume::Volume;
use super::work_unit::IoRequest;
use crate::adapters::{MemoryChunkStore, MemoryConfigStore};
use crate::error::Result;

// =============================================================================
// Property Strategies
// =============================================================================

fn level_strategy() -> impl Strategy<Value = RaidLevel> {
    prop_oneof![Just(RaidLevel::Raid4), Just(RaidLevel::Raid5)]
}

/// (chunk count, strip size)
fn layout_strategy() -> impl Strategy<Value = (usize, u64)> {
    (3usize..=6, prop_oneof![Just(512u64), Just(1024), Just(4096)])
}

/// (first block, block count) of a write inside a small volume.
fn extent_strategy() -> impl Strategy<Value = (u64, usize)> {
    (0u64..48, 1usize..=16)
}

// =============================================================================
// Helpers
// =============================================================================

struct Fixture {
    volume: Arc<Volume>,
    chunks: Arc<MemoryChunkStore>,
    geometry: Geometry,
}

fn fixture(level: RaidLevel, chunk_count: usize, strip: u64) -> Fixture {
    let config = VolumeConfig::new("prop", level, chunk_count, strip, strip * 64)
        .with_data_offset_blocks(8);
    let geometry = config.geometry().unwrap();
    let chunks = Arc::new(MemoryChunkStore::for_geometry(&geometry));
    let volume = Volume::attach(config, chunks.clone(), Arc::new(MemoryConfigStore::new())).unwrap();
    Fixture {
        volume,
        chunks,
        geometry,
    }
}

fn submit(volume: &Arc<Volume>, request: IoRequest) -> Result<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    volume.handle_io(request, Box::new(move |r| tx.send(r).unwrap()))?;
    rx.recv().unwrap()
}

fn payload(blocks: usize, seed: u8) -> Vec<u8> {
    (0..blocks * BLOCK_SIZE)
        .map(|i| (i as u8) ^ seed.wrapping_add((i / BLOCK_SIZE) as u8))
        .collect()
}

/// XOR of every chunk's strip in `row`.
fn row_xor(f: &Fixture, row: u64) -> Vec<u8> {
    let strip = f.geometry.strip_size() as usize;
    let offset = f.geometry.row_phys_offset(row);
    let mut acc = vec![0u8; strip];
    for chunk in 0..f.geometry.chunk_count() {
        let bytes = f.chunks.read_raw(chunk, offset, strip);
        for (a, b) in acc.iter_mut().zip(bytes) {
            *a ^= b;
        }
    }
    acc
}

// =============================================================================
// Geometry Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the data chunk of a strip is never the parity chunk of its row.
    #[test]
    fn prop_data_never_on_parity(
        level in level_strategy(),
        (chunk_count, strip) in layout_strategy(),
        strip_no in 0u64..10_000,
    ) {
        let g = Geometry::new(level, chunk_count, strip, strip * 16, 0).unwrap();
        let seg = g.map(strip_no * strip, strip as usize);
        prop_assert_ne!(seg.data_chunk, seg.parity_chunk);
        prop_assert!(seg.data_chunk < chunk_count);
        prop_assert!(seg.parity_chunk < chunk_count);
        prop_assert_eq!(seg.row, strip_no / (chunk_count as u64 - 1));
    }

    /// Property: the strips of one row cover every non-parity chunk once.
    #[test]
    fn prop_row_covers_all_data_chunks(
        level in level_strategy(),
        (chunk_count, strip) in layout_strategy(),
        row in 0u64..1000,
    ) {
        let g = Geometry::new(level, chunk_count, strip, strip * 16, 0).unwrap();
        let n = chunk_count as u64 - 1;
        let mut seen: Vec<usize> = (0..n)
            .map(|i| g.map((row * n + i) * strip, 1).data_chunk)
            .collect();
        seen.push(g.parity_chunk_for_row(row));
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..chunk_count).collect::<Vec<_>>());
    }

    /// Property: segments tile the request exactly.
    #[test]
    fn prop_segments_tile_request(
        (chunk_count, strip) in layout_strategy(),
        offset_blocks in 0u64..200,
        blocks in 1usize..64,
    ) {
        let g = Geometry::new(RaidLevel::Raid5, chunk_count, strip, strip * 64, 0).unwrap();
        let mut expected = 0usize;
        for (at, seg) in g.segments(offset_blocks * 512, blocks * 512) {
            prop_assert_eq!(at, expected);
            prop_assert!(seg.len > 0);
            prop_assert!(seg.strip_offset + seg.len as u64 <= strip);
            expected += seg.len;
        }
        prop_assert_eq!(expected, blocks * 512);
    }
}

// =============================================================================
// Engine Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: a write followed by a read returns the written bytes.
    #[test]
    fn prop_roundtrip(
        level in level_strategy(),
        (chunk_count, strip) in layout_strategy(),
        (lba, blocks) in extent_strategy(),
        seed in any::<u8>(),
    ) {
        let f = fixture(level, chunk_count, strip);
        let data = payload(blocks, seed);
        submit(&f.volume, IoRequest::write(lba, data.clone()))?;
        let read = submit(&f.volume, IoRequest::read(lba, data.len()))?;
        prop_assert_eq!(read, data);
    }

    /// Property: every row's strips XOR to zero after arbitrary writes.
    #[test]
    fn prop_parity_consistent(
        level in level_strategy(),
        (chunk_count, strip) in layout_strategy(),
        writes in prop::collection::vec((extent_strategy(), any::<u8>()), 1..6),
    ) {
        let f = fixture(level, chunk_count, strip);
        for ((lba, blocks), seed) in writes {
            submit(&f.volume, IoRequest::write(lba, payload(blocks, seed)))?;
        }
        for row in 0..f.geometry.rows() {
            prop_assert!(row_xor(&f, row).iter().all(|b| *b == 0));
        }
    }

    /// Property: writes keep every row consistent while a chunk is rebuilding.
    #[test]
    fn prop_parity_consistent_while_rebuilding(
        level in level_strategy(),
        (chunk_count, strip) in layout_strategy(),
        writes in prop::collection::vec((extent_strategy(), any::<u8>()), 1..6),
        rebuilding in 0usize..6,
    ) {
        let f = fixture(level, chunk_count, strip);
        let rebuilding = rebuilding % chunk_count;
        f.volume.set_chunk_state(rebuilding, ChunkState::Offline)?;
        f.volume.set_chunk_state(rebuilding, ChunkState::Rebuilding)?;

        for ((lba, blocks), seed) in writes {
            submit(&f.volume, IoRequest::write(lba, payload(blocks, seed)))?;
        }
        for row in 0..f.geometry.rows() {
            prop_assert!(row_xor(&f, row).iter().all(|b| *b == 0));
        }
    }

    /// Property: with one chunk offline, reads still return the written data.
    #[test]
    fn prop_degraded_read(
        level in level_strategy(),
        (chunk_count, strip) in layout_strategy(),
        (lba, blocks) in extent_strategy(),
        seed in any::<u8>(),
        lost in 0usize..6,
    ) {
        let f = fixture(level, chunk_count, strip);
        let data = payload(blocks, seed);
        submit(&f.volume, IoRequest::write(lba, data.clone()))?;

        let lost = lost % chunk_count;
        f.volume.set_chunk_state(lost, ChunkState::Offline)?;
        f.chunks.wipe(lost);

        let read = submit(&f.volume, IoRequest::read(lba, data.len()))?;
        prop_assert_eq!(read, data);
    }
}
