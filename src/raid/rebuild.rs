//! Chunk rebuild
//!
//! Regenerates an offline chunk row by row. Each row is a two-unit
//! transaction: a read/XOR half folding every other chunk's strip into a
//! parity accumulator, then a write half storing the result on the target
//! chunk. Both go through the normal scheduling path, so rebuild steps are
//! ordered against caller I/O touching the same row. Up to half of the
//! volume's request slots rebuild rows concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument};

use super::builder;
use super::state::{ChunkState, VolumeState};
use super::volume::{Effects, Volume};
use super::work_unit::{Completion, RebuildCallback, UnitKind, UnitState, WorkUnit};
use crate::error::{Error, Result};

/// Pause between attempts when the work-unit pool is full.
const POOL_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Give up on a row after this many pool attempts.
const MAX_POOL_ATTEMPTS: u32 = 10_000;

impl Volume {
    /// Rebuild an offline chunk from the rest of the volume.
    ///
    /// The chunk goes `Offline -> Rebuilding` and, once every row has been
    /// regenerated, `Rebuilding -> Online`. Any failure takes it back
    /// offline once the rows already submitted have finished.
    #[instrument(skip(self), fields(volume = %self.name()))]
    pub async fn rebuild_chunk(self: &Arc<Self>, chunk: usize) -> Result<()> {
        let state = self.chunk_state(chunk).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "chunk {chunk} out of range ({} chunks)",
                self.geometry().chunk_count()
            ))
        })?;
        if state != ChunkState::Offline {
            return Err(Error::ChunkUnavailable { chunk, state });
        }
        if self.volume_state() == VolumeState::Offline {
            return Err(Error::VolumeOffline {
                volume: self.name().to_string(),
            });
        }

        self.set_chunk_state(chunk, ChunkState::Rebuilding)?;
        let rows = self.geometry().rows();
        info!(chunk, rows, "rebuild started");

        // After the first failure no new rows start, but rows already in
        // flight are drained so none outlives the call.
        let aborted = AtomicBool::new(false);
        let window = (self.max_concurrent_requests() / 2).max(1);
        let mut pending = stream::iter(0..rows)
            .map(|row| {
                let aborted = &aborted;
                async move {
                    if aborted.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                    self.rebuild_row(chunk, row)
                        .await
                        .map(|()| true)
                        .map_err(|e| (row, e))
                }
            })
            .buffer_unordered(window);

        let mut done = 0u64;
        let mut failure = None;
        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(true) => {
                    done += 1;
                    if done % 1024 == 0 {
                        debug!(chunk, done, rows, "rebuild progress");
                    }
                }
                Ok(false) => {}
                Err((row, e)) if failure.is_none() => {
                    error!(chunk, row, "rebuild failed: {}", e);
                    aborted.store(true, Ordering::Release);
                    failure = Some(e);
                }
                Err((row, e)) => debug!(chunk, row, "in-flight row failed after abort: {}", e),
            }
        }
        drop(pending);

        if let Some(e) = failure {
            if self.chunk_state(chunk) == Some(ChunkState::Rebuilding) {
                self.set_chunk_state(chunk, ChunkState::Offline)?;
            }
            return Err(match e {
                Error::RebuildFailed { .. } => e,
                other => Error::RebuildFailed {
                    chunk,
                    reason: other.to_string(),
                },
            });
        }

        // A failed write to the chunk while rebuilding already took it offline.
        let state = self.chunk_state(chunk).unwrap_or(ChunkState::Offline);
        if state != ChunkState::Rebuilding {
            return Err(Error::RebuildFailed {
                chunk,
                reason: format!("chunk went {state} during rebuild"),
            });
        }

        self.set_chunk_state(chunk, ChunkState::Online)?;
        info!(chunk, rows, state = %self.volume_state(), "rebuild complete");
        Ok(())
    }

    async fn rebuild_row(self: &Arc<Self>, chunk: usize, row: u64) -> Result<()> {
        let mut attempts = 0;
        loop {
            let (tx, rx) = oneshot::channel();
            let notify: RebuildCallback = Box::new(move |outcome| {
                let _ = tx.send(outcome);
            });
            match self.submit_rebuild_row(chunk, row, notify) {
                Ok(()) => {
                    return rx.await.map_err(|_| {
                        Error::Internal(format!("rebuild of row {row} dropped before completion"))
                    })?
                }
                Err(Error::ResourceExhausted { resource }) => {
                    attempts += 1;
                    if attempts >= MAX_POOL_ATTEMPTS {
                        return Err(Error::ResourceExhausted { resource });
                    }
                    tokio::time::sleep(POOL_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue the two-unit transaction regenerating one row of `chunk`.
    pub(crate) fn submit_rebuild_row(
        self: &Arc<Self>,
        chunk: usize,
        row: u64,
        notify: RebuildCallback,
    ) -> Result<()> {
        let permits = self.pool().acquire_many(2)?;
        let geometry = self.geometry();
        let offset = geometry.row_phys_offset(row);
        let length = geometry.strip_size() as usize;
        let range = geometry.row_blocks(row);

        let mut effects = Effects::default();
        {
            let mut table = self.units.lock();
            let chunks = self.chunk_snapshot();
            let head_id = table.allocate_id();
            let tail_id = table.allocate_id();

            let mut head = WorkUnit::new(
                head_id,
                UnitKind::RebuildXor { chunk, row },
                offset,
                length,
                range,
            );
            builder::build(geometry, &chunks, &mut head)?;

            let mut tail = WorkUnit::new(
                tail_id,
                UnitKind::RebuildWrite { chunk, row },
                offset,
                length,
                range,
            );
            builder::build(geometry, &chunks, &mut tail)?;

            tail.completion = Some(Completion::Rebuild(notify));
            tail.state = UnitState::AwaitingHead { head: head_id };
            head.collider = Some(tail_id);
            head.permits = permits;

            table.units.insert(head_id, head);
            table.units.insert(tail_id, tail);
            self.schedule(&mut table, head_id, &mut effects);
        }
        self.run(effects);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::adapters::{CompletionMode, MemoryChunkStore, MemoryConfigStore};
    use crate::raid::config::VolumeConfig;
    use crate::raid::geometry::RaidLevel;

    const STRIP: usize = 4096;

    fn volume(level: RaidLevel) -> (Arc<Volume>, Arc<MemoryChunkStore>, Arc<MemoryConfigStore>) {
        volume_with(level, 4, CompletionMode::Inline)
    }

    fn volume_with(
        level: RaidLevel,
        pool_size: usize,
        mode: CompletionMode,
    ) -> (Arc<Volume>, Arc<MemoryChunkStore>, Arc<MemoryConfigStore>) {
        let config = VolumeConfig::new("rebuild", level, 4, STRIP as u64, STRIP as u64 * 8)
            .with_data_offset_blocks(16)
            .with_pool_size(pool_size);
        let geometry = config.geometry().unwrap();
        let chunks = Arc::new(MemoryChunkStore::for_geometry(&geometry).with_completion_mode(mode));
        let store = Arc::new(MemoryConfigStore::new());
        let volume = Volume::attach(config, chunks.clone(), store.clone()).unwrap();
        (volume, chunks, store)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_rebuild_restores_chunk_contents() {
        for level in [RaidLevel::Raid4, RaidLevel::Raid5] {
            let (volume, chunks, _) = volume(level);
            let capacity = volume.geometry().capacity() as usize;
            let data = pattern(capacity, 7);
            for (i, piece) in data.chunks(STRIP * 3).enumerate() {
                let lba = (i * STRIP * 3 / 512) as u64;
                volume.write(lba, piece.to_vec()).await.unwrap();
            }

            let before = chunks.read_raw(2, 0, chunks.chunk_len());
            volume.set_chunk_state(2, ChunkState::Offline).unwrap();
            chunks.wipe(2);

            volume.rebuild_chunk(2).await.unwrap();

            assert_eq!(volume.chunk_state(2), Some(ChunkState::Online));
            assert_eq!(volume.volume_state(), VolumeState::Online);
            assert_eq!(chunks.read_raw(2, 0, chunks.chunk_len()), before);
        }
    }

    #[tokio::test]
    async fn test_rebuild_requires_offline_chunk() {
        let (volume, _, _) = volume(RaidLevel::Raid5);
        assert_matches!(
            volume.rebuild_chunk(1).await,
            Err(Error::ChunkUnavailable {
                chunk: 1,
                state: ChunkState::Online
            })
        );
        assert_matches!(
            volume.rebuild_chunk(9).await,
            Err(Error::InvalidRequest(_))
        );
    }

    #[tokio::test]
    async fn test_rebuild_of_offline_volume_is_refused() {
        let (volume, _, _) = volume(RaidLevel::Raid5);
        volume.set_chunk_state(0, ChunkState::Offline).unwrap();
        volume.set_chunk_state(1, ChunkState::Offline).unwrap();
        assert_matches!(
            volume.rebuild_chunk(0).await,
            Err(Error::VolumeOffline { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_rebuild_returns_chunk_offline() {
        let (volume, chunks, store) = volume(RaidLevel::Raid5);
        volume.set_chunk_state(3, ChunkState::Offline).unwrap();
        chunks.set_faulty(3, true);

        assert_matches!(
            volume.rebuild_chunk(3).await,
            Err(Error::RebuildFailed { chunk: 3, .. })
        );
        assert_eq!(volume.chunk_state(3), Some(ChunkState::Offline));
        assert_eq!(volume.volume_state(), VolumeState::Degraded);
        assert_eq!(volume.pool().in_use(), 0);
        assert_eq!(
            store.latest().unwrap().chunk_states[3],
            ChunkState::Offline
        );
    }

    #[tokio::test]
    async fn test_failed_rebuild_drains_rows_in_flight() {
        let (volume, chunks, _) = volume_with(
            RaidLevel::Raid5,
            16,
            CompletionMode::Spawned(tokio::runtime::Handle::current()),
        );
        volume.set_chunk_state(3, ChunkState::Offline).unwrap();
        chunks.set_faulty(3, true);

        assert_matches!(
            volume.rebuild_chunk(3).await,
            Err(Error::RebuildFailed { chunk: 3, .. })
        );
        // Several rows were in flight when the first one failed.
        assert!(chunks.submissions(3) > 1);
        assert_eq!(volume.live_units(), 0);
        assert_eq!(volume.pool().in_use(), 0);
        assert_eq!(volume.chunk_state(3), Some(ChunkState::Offline));
    }

    #[tokio::test]
    async fn test_io_during_rebuild_is_served() {
        let (volume, _, _) = volume(RaidLevel::Raid5);
        volume.write(0, vec![0x77; STRIP * 3]).await.unwrap();
        volume.set_chunk_state(1, ChunkState::Offline).unwrap();

        let rebuilder = {
            let volume = Arc::clone(&volume);
            tokio::spawn(async move { volume.rebuild_chunk(1).await })
        };
        // Strip 3 (row 1) lives on chunk 0 with parity on chunk 2.
        volume.write(24, vec![0x99; STRIP]).await.unwrap();
        rebuilder.await.unwrap().unwrap();

        assert_eq!(volume.chunk_state(1), Some(ChunkState::Online));
        assert_eq!(volume.read(0, STRIP * 3).await.unwrap(), vec![0x77; STRIP * 3]);
        assert_eq!(volume.read(24, STRIP).await.unwrap(), vec![0x99; STRIP]);
    }
}
