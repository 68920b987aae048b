//! Parity Engine Integration Tests
//!
//! End-to-end tests through the public `Volume` API against in-memory and
//! file-backed chunk devices.

use std::sync::Arc;

use assert_matches::assert_matches;

use raidp::adapters::{CompletionMode, JsonConfigStore, MemoryChunkStore, MemoryConfigStore};
use raidp::raid::geometry::DEFAULT_DATA_OFFSET_BLOCKS;
use raidp::{ChunkState, Error, IoRequest, RaidLevel, Volume, VolumeConfig, VolumeState};

const STRIP: usize = 4096;

fn config(level: RaidLevel) -> VolumeConfig {
    VolumeConfig::new("it", level, 4, STRIP as u64, STRIP as u64 * 16)
}

fn attach(config: VolumeConfig, mode: CompletionMode) -> (Arc<Volume>, Arc<MemoryChunkStore>) {
    let geometry = config.geometry().expect("valid geometry");
    let chunks = Arc::new(MemoryChunkStore::for_geometry(&geometry).with_completion_mode(mode));
    let volume = Volume::attach(config, chunks.clone(), Arc::new(MemoryConfigStore::new()))
        .expect("attach");
    (volume, chunks)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed.wrapping_mul(17))
        .collect()
}

// =============================================================================
// Layout Scenarios
// =============================================================================

#[tokio::test]
async fn test_write_lands_on_data_and_parity_chunks() {
    let (volume, chunks) = attach(config(RaidLevel::Raid5), CompletionMode::Inline);
    let phys = DEFAULT_DATA_OFFSET_BLOCKS * 512;

    volume.write(0, vec![0xAA; STRIP]).await.unwrap();

    assert_eq!(chunks.read_raw(0, phys, STRIP), vec![0xAA; STRIP]);
    assert_eq!(chunks.read_raw(3, phys, STRIP), vec![0xAA; STRIP]);
    assert_eq!(chunks.read_raw(1, phys, STRIP), vec![0; STRIP]);
    assert_eq!(chunks.read_raw(2, phys, STRIP), vec![0; STRIP]);
    // Header area untouched.
    assert_eq!(chunks.read_raw(0, 0, 512), vec![0; 512]);

    assert_eq!(volume.read(0, STRIP).await.unwrap(), vec![0xAA; STRIP]);
}

#[tokio::test]
async fn test_degraded_read_uses_every_other_chunk() {
    let (volume, chunks) = attach(config(RaidLevel::Raid5), CompletionMode::Inline);
    volume.write(0, vec![0xAA; STRIP]).await.unwrap();

    volume.set_chunk_state(1, ChunkState::Offline).unwrap();
    assert_eq!(volume.volume_state(), VolumeState::Degraded);
    chunks.reset_submissions();

    // Logical offset 4096 is strip 1, on chunk 1.
    let data = volume.read(8, STRIP).await.unwrap();

    assert_eq!(data, vec![0; STRIP]);
    assert_eq!(chunks.submissions(0), 1);
    assert_eq!(chunks.submissions(1), 0);
    assert_eq!(chunks.submissions(2), 1);
    assert_eq!(chunks.submissions(3), 1);
    assert_eq!(volume.metrics().reconstructions(), 1);
}

#[tokio::test]
async fn test_raid4_parity_stays_on_last_chunk() {
    let (volume, chunks) = attach(config(RaidLevel::Raid4), CompletionMode::Inline);
    let rows = 4;
    let data = pattern(STRIP * 3 * rows, 3);
    for (i, piece) in data.chunks(STRIP * 3).enumerate() {
        volume
            .write((i * STRIP * 3 / 512) as u64, piece.to_vec())
            .await
            .unwrap();
    }

    let phys = DEFAULT_DATA_OFFSET_BLOCKS * 512;
    for row in 0..rows {
        let offset = phys + (row * STRIP) as u64;
        let mut parity = vec![0u8; STRIP];
        for chunk in 0..3 {
            let strip = chunks.read_raw(chunk, offset, STRIP);
            let logical = (row * 3 + chunk) * STRIP;
            assert_eq!(strip, &data[logical..logical + STRIP]);
            for (p, b) in parity.iter_mut().zip(strip) {
                *p ^= b;
            }
        }
        assert_eq!(chunks.read_raw(3, offset, STRIP), parity);
    }
}

#[tokio::test]
async fn test_two_strip_write_survives_chunk_loss() {
    let (volume, chunks) = attach(config(RaidLevel::Raid5), CompletionMode::Inline);
    let phys = DEFAULT_DATA_OFFSET_BLOCKS * 512;

    // Strips 0 and 1 share row 0 and its parity on chunk 3.
    volume.write(0, vec![0xAA; STRIP * 2]).await.unwrap();
    assert_eq!(chunks.read_raw(3, phys, STRIP), vec![0; STRIP]);

    volume.set_chunk_state(0, ChunkState::Offline).unwrap();
    chunks.wipe(0);
    assert_eq!(volume.read(0, STRIP).await.unwrap(), vec![0xAA; STRIP]);
}

// =============================================================================
// Data Path
// =============================================================================

#[tokio::test]
async fn test_unaligned_multi_row_roundtrip() {
    for level in [RaidLevel::Raid4, RaidLevel::Raid5] {
        let (volume, _) = attach(config(level), CompletionMode::Inline);
        // Starts mid-strip, crosses two row boundaries.
        let data = pattern(STRIP * 7 + 1536, 9);
        volume.write(5, data.clone()).await.unwrap();
        assert_eq!(volume.read(5, data.len()).await.unwrap(), data);

        // Neighbouring blocks stay zero.
        assert_eq!(volume.read(0, 2560).await.unwrap(), vec![0; 2560]);
    }
}

#[tokio::test]
async fn test_degraded_volume_keeps_serving_after_writes() {
    let (volume, chunks) = attach(config(RaidLevel::Raid5), CompletionMode::Inline);
    let data = pattern(STRIP * 6, 1);
    volume.write(0, data.clone()).await.unwrap();

    volume.set_chunk_state(2, ChunkState::Offline).unwrap();
    chunks.wipe(2);

    // Strip 0 (chunk 0) is still writable; strip 2 (chunk 2) is not.
    volume.write(0, vec![0x5C; STRIP]).await.unwrap();
    assert_matches!(
        volume.write(16, vec![0x5C; STRIP]).await,
        Err(Error::RejectedWrite { chunk: 2 })
    );

    let mut expected = data;
    expected[..STRIP].fill(0x5C);
    assert_eq!(volume.read(0, STRIP * 6).await.unwrap(), expected);
}

#[tokio::test]
async fn test_concurrent_writes_from_spawned_completions() {
    let config = config(RaidLevel::Raid5);
    let (volume, _) = attach(
        config,
        CompletionMode::Spawned(tokio::runtime::Handle::current()),
    );

    let writes = (0..16u8).map(|i| {
        let volume = Arc::clone(&volume);
        async move {
            volume
                .write(i as u64 * 8, vec![i + 1; STRIP])
                .await
                .map(|_| i)
        }
    });
    let done = futures::future::try_join_all(writes).await.unwrap();
    assert_eq!(done.len(), 16);

    for i in 0..16u8 {
        assert_eq!(
            volume.read(i as u64 * 8, STRIP).await.unwrap(),
            vec![i + 1; STRIP]
        );
    }
    assert_eq!(volume.live_units(), 0);
    assert_eq!(volume.pool().in_use(), 0);
}

// =============================================================================
// Ordering and Resources
// =============================================================================

#[test]
fn test_overlapping_requests_are_serialized() {
    let (volume, chunks) = attach(config(RaidLevel::Raid5), CompletionMode::Held);
    let (tx, rx) = std::sync::mpsc::channel();

    for (i, byte) in [0x01u8, 0x02].into_iter().enumerate() {
        let tx = tx.clone();
        volume
            .handle_io(
                IoRequest::write(0, vec![byte; STRIP]),
                Box::new(move |r| tx.send((i, r.is_ok())).unwrap()),
            )
            .unwrap();
    }
    // Row 1 does not overlap row 0.
    let tx2 = tx.clone();
    volume
        .handle_io(
            IoRequest::read(24, STRIP),
            Box::new(move |r| tx2.send((2, r.is_ok())).unwrap()),
        )
        .unwrap();

    assert_eq!(volume.deferred_units(), 1);
    assert_eq!(volume.metrics().deferred(), 1);
    // Only the first write's read half and the row 1 read are in flight.
    assert_eq!(chunks.held(), 3);

    chunks.release_held();
    let mut finished: Vec<(usize, bool)> = rx.try_iter().collect();
    finished.sort();
    assert_eq!(finished, vec![(0, true), (1, true), (2, true)]);
    assert_eq!(volume.deferred_units(), 0);

    let (tx, rx) = std::sync::mpsc::channel();
    volume
        .handle_io(
            IoRequest::read(0, STRIP),
            Box::new(move |r| tx.send(r).unwrap()),
        )
        .unwrap();
    chunks.release_held();
    assert_eq!(rx.recv().unwrap().unwrap(), vec![0x02; STRIP]);
}

#[test]
fn test_pool_bounds_concurrent_requests() {
    let config = config(RaidLevel::Raid5).with_pool_size(8);
    let (volume, chunks) = attach(config, CompletionMode::Held);
    assert_eq!(volume.max_concurrent_requests(), 4);

    for i in 0..4u64 {
        volume
            .handle_io(IoRequest::write(i * 24, vec![1; 512]), Box::new(|_| {}))
            .unwrap();
    }
    assert_matches!(
        volume.handle_io(IoRequest::read(200, 512), Box::new(|_| {})),
        Err(Error::ResourceExhausted { .. })
    );

    chunks.release_held();
    assert_eq!(volume.pool().in_use(), 0);
    assert!(volume
        .handle_io(IoRequest::read(200, 512), Box::new(|_| {}))
        .is_ok());
    chunks.release_held();
}

// =============================================================================
// Failure Handling
// =============================================================================

#[tokio::test]
async fn test_chunk_failure_is_detected_and_survived() {
    let (volume, chunks) = attach(config(RaidLevel::Raid5), CompletionMode::Inline);
    let data = pattern(STRIP * 3, 4);
    volume.write(0, data.clone()).await.unwrap();

    chunks.set_faulty(1, true);
    assert_eq!(volume.read(0, STRIP * 3).await.unwrap(), data);
    assert_eq!(volume.chunk_state(1), Some(ChunkState::Offline));
    assert_eq!(volume.volume_state(), VolumeState::Degraded);

    // Second failure takes the volume offline.
    chunks.set_faulty(0, true);
    let _ = volume.read(0, STRIP).await;
    assert_eq!(volume.volume_state(), VolumeState::Offline);
    assert_matches!(
        volume.read(0, STRIP).await,
        Err(Error::VolumeOffline { .. })
    );
}

#[tokio::test]
async fn test_state_changes_are_persisted_and_reloaded() {
    let dir = std::env::temp_dir().join(format!("raidp-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("volume.json");

    let config = config(RaidLevel::Raid5);
    let geometry = config.geometry().unwrap();
    let chunks = Arc::new(MemoryChunkStore::for_geometry(&geometry));
    let store = JsonConfigStore::spawn(&path);
    let volume = Volume::attach(config, chunks.clone(), Arc::new(store.clone())).unwrap();

    let data = pattern(STRIP * 3, 8);
    volume.write(0, data.clone()).await.unwrap();
    chunks.reset_submissions();
    chunks.set_faulty(2, true);
    volume.read(0, STRIP * 3).await.unwrap();
    store.flush().await.unwrap();

    let reloaded = VolumeConfig::load(&path).unwrap();
    assert_eq!(reloaded.id, volume.id());
    assert_eq!(reloaded.chunk_states[2], ChunkState::Offline);

    // Re-attaching derives the volume state from the stored chunk states.
    let again = Volume::attach(reloaded, chunks.clone(), Arc::new(MemoryConfigStore::new())).unwrap();
    assert_eq!(again.volume_state(), VolumeState::Degraded);
    assert_eq!(again.read(0, STRIP * 3).await.unwrap(), data);
    // Only the read that failed ever reached chunk 2.
    assert_eq!(chunks.submissions(2), 1);

    std::fs::remove_dir_all(&dir).unwrap();
}

// =============================================================================
// Rebuild
// =============================================================================

#[tokio::test]
async fn test_replace_and_rebuild_chunk() {
    let (volume, chunks) = attach(config(RaidLevel::Raid5), CompletionMode::Inline);
    let capacity = volume.geometry().capacity() as usize;
    let data = pattern(capacity, 6);
    for (i, piece) in data.chunks(STRIP * 3).enumerate() {
        volume
            .write((i * STRIP * 3 / 512) as u64, piece.to_vec())
            .await
            .unwrap();
    }

    chunks.set_faulty(0, true);
    volume.read(0, STRIP).await.unwrap();
    assert_eq!(volume.chunk_state(0), Some(ChunkState::Offline));

    // Swap in a blank device.
    chunks.set_faulty(0, false);
    chunks.wipe(0);
    volume.rebuild_chunk(0).await.unwrap();

    assert_eq!(volume.chunk_state(0), Some(ChunkState::Online));
    assert_eq!(volume.volume_state(), VolumeState::Online);

    // Every chunk is redundant again: losing another one is survivable.
    volume.set_chunk_state(3, ChunkState::Offline).unwrap();
    for (i, piece) in data.chunks(STRIP * 3).enumerate() {
        let lba = (i * STRIP * 3 / 512) as u64;
        assert_eq!(volume.read(lba, piece.len()).await.unwrap(), piece);
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_backed_volume() {
    use raidp::adapters::FileChunkStore;

    let dir = std::env::temp_dir().join(format!("raidp-file-{}", uuid::Uuid::new_v4()));
    let config = VolumeConfig::new("files", RaidLevel::Raid5, 3, 4096, 4096 * 8)
        .with_data_offset_blocks(8);
    let geometry = config.geometry().unwrap();
    let chunks = Arc::new(
        FileChunkStore::open(&dir, geometry.chunk_count(), geometry.chunk_device_size()).unwrap(),
    );
    let volume = Volume::attach(config, chunks, Arc::new(MemoryConfigStore::new())).unwrap();

    let data = pattern(4096 * 4, 2);
    volume.write(0, data.clone()).await.unwrap();
    assert_eq!(volume.read(0, data.len()).await.unwrap(), data);

    volume.set_chunk_state(1, ChunkState::Offline).unwrap();
    assert_eq!(volume.read(0, data.len()).await.unwrap(), data);

    volume.rebuild_chunk(1).await.unwrap();
    assert_eq!(volume.volume_state(), VolumeState::Online);

    let text = volume.metrics().gather_text().unwrap();
    assert!(text.contains("raidp_work_units_resolved_total"));

    std::fs::remove_dir_all(&dir).unwrap();
}
