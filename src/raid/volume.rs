//! Parity volume
//!
//! The [`Volume`] is the entry point of the engine. It owns the chunk health
//! table and the table of live work units, each behind its own lock, and
//! moves work between the builder, the I/O layer and the aggregator.
//!
//! # Locking
//!
//! `units` may be held while taking `health`, never the other way round.
//! Neither lock is held while calling out: sub-op submission, caller
//! callbacks and configuration persistence are collected into [`Effects`]
//! and run after the locks are released, so an I/O layer that completes
//! inline re-enters the volume safely.
//!
//! # Ordering
//!
//! Every in-progress unit registers its whole-row block range. A new unit
//! whose range overlaps a registered one is deferred until that unit
//! resolves. The write half of a write transaction is not scheduled through
//! the registry at all: it takes over its read/XOR half's slot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::builder;
use super::config::VolumeConfig;
use super::geometry::{BlockRange, Geometry, BLOCK_SIZE};
use super::pool::WorkUnitPool;
use super::state::{ChunkState, HealthTable, Transition, VolumeState};
use super::work_unit::{
    scratch, Completion, IoCallback, IoRequest, UnitKind, UnitState, WorkUnit, WorkUnitId,
};
use crate::domain::{ChunkIo, ChunkIoRequest, ConfigStore, IoDirection};
use crate::error::{Error, InvariantViolation, Result};
use crate::metrics::EngineMetrics;

// =============================================================================
// Collision Registry
// =============================================================================

/// Block ranges of in-progress work units, ordered by start block.
#[derive(Debug, Default)]
pub(crate) struct CollisionRegistry {
    ranges: BTreeMap<(u64, WorkUnitId), u64>,
}

impl CollisionRegistry {
    pub(crate) fn insert(&mut self, id: WorkUnitId, range: BlockRange) {
        self.ranges.insert((range.start, id), range.end);
    }

    pub(crate) fn remove(&mut self, id: WorkUnitId, range: BlockRange) {
        self.ranges.remove(&(range.start, id));
    }

    /// First registered unit whose range overlaps `range`.
    pub(crate) fn find_overlap(&self, range: BlockRange) -> Option<WorkUnitId> {
        self.ranges
            .range(..(range.end, 0))
            .find(|(_, end)| **end > range.start)
            .map(|((_, id), _)| *id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }
}

// =============================================================================
// Unit Table
// =============================================================================

/// Every live work unit of a volume.
#[derive(Debug, Default)]
pub(crate) struct UnitTable {
    next_id: WorkUnitId,
    pub(crate) units: HashMap<WorkUnitId, WorkUnit>,
    pub(crate) pending: CollisionRegistry,
    pub(crate) deferred: VecDeque<WorkUnitId>,
}

impl UnitTable {
    pub(crate) fn allocate_id(&mut self) -> WorkUnitId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn unit_mut(&mut self, id: WorkUnitId) -> &mut WorkUnit {
        match self.units.get_mut(&id) {
            Some(unit) => unit,
            None => InvariantViolation::new("volume", format!("work unit {id} is not live"))
                .raise(),
        }
    }
}

// =============================================================================
// Effects
// =============================================================================

/// Identifies one sub-op submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubOpTag {
    pub(crate) unit: WorkUnitId,
    pub(crate) generation: u32,
    pub(crate) index: usize,
}

#[derive(Debug)]
pub(crate) struct Submission {
    pub(crate) tag: SubOpTag,
    pub(crate) request: ChunkIoRequest,
}

/// Work collected under the locks and carried out after they are released.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) submissions: Vec<Submission>,
    pub(crate) completions: Vec<(Completion, Result<Vec<u8>>)>,
    pub(crate) snapshots: Vec<VolumeConfig>,
}

// =============================================================================
// Volume
// =============================================================================

/// A RAID4/RAID5 volume attached to its chunk devices.
pub struct Volume {
    config: VolumeConfig,
    geometry: Geometry,
    io: Arc<dyn ChunkIo>,
    store: Arc<dyn ConfigStore>,
    pool: Arc<WorkUnitPool>,
    metrics: EngineMetrics,
    pub(crate) health: Mutex<HealthTable>,
    pub(crate) units: Mutex<UnitTable>,
}

impl Volume {
    /// Attach a volume from its persisted configuration.
    pub fn attach(
        config: VolumeConfig,
        io: Arc<dyn ChunkIo>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let geometry = config.geometry()?;
        let health = HealthTable::new(config.chunk_states.clone()).with_sequence(config.sequence);
        let metrics = EngineMetrics::new(&config.name)?;

        info!(
            volume = %config.name,
            level = %geometry.level(),
            chunks = geometry.chunk_count(),
            strip_size = geometry.strip_size(),
            capacity = geometry.capacity(),
            state = %health.volume(),
            "attached volume"
        );

        Ok(Arc::new(Self {
            pool: WorkUnitPool::new(config.pool_size),
            config,
            geometry,
            io,
            store,
            metrics,
            health: Mutex::new(health),
            units: Mutex::new(UnitTable::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn id(&self) -> Uuid {
        self.config.id
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<WorkUnitPool> {
        &self.pool
    }

    /// Current configuration, chunk states included.
    pub fn config(&self) -> VolumeConfig {
        self.config.snapshot(&self.health.lock())
    }

    pub fn chunk_state(&self, chunk: usize) -> Option<ChunkState> {
        self.health.lock().chunks().get(chunk).copied()
    }

    pub fn chunk_states(&self) -> Vec<ChunkState> {
        self.health.lock().chunks().to_vec()
    }

    pub fn volume_state(&self) -> VolumeState {
        self.health.lock().volume()
    }

    /// Work units alive (in progress, deferred or awaiting their head).
    pub fn live_units(&self) -> usize {
        self.units.lock().units.len()
    }

    /// Work units waiting behind an overlapping unit.
    pub fn deferred_units(&self) -> usize {
        self.units.lock().deferred.len()
    }

    /// Logical requests the volume can accept at once. Every write holds two
    /// work units, so this is half the pool.
    pub fn max_concurrent_requests(&self) -> usize {
        self.pool.capacity() / 2
    }

    // =========================================================================
    // Logical I/O
    // =========================================================================

    /// Start a logical read or write.
    ///
    /// Validation, resource and rejected-write failures are returned here and
    /// the callback is dropped unused. Once this returns `Ok`, the callback
    /// is invoked exactly once with the outcome.
    pub fn handle_io(self: &Arc<Self>, request: IoRequest, callback: IoCallback) -> Result<WorkUnitId> {
        self.validate_request(&request)?;

        let chunks = {
            let health = self.health.lock();
            if health.volume() == VolumeState::Offline {
                return Err(Error::VolumeOffline {
                    volume: self.config.name.clone(),
                });
            }
            health.chunks().to_vec()
        };

        let mut effects = Effects::default();
        let id = match request.direction {
            IoDirection::Read => self.start_read(request, callback, &chunks, &mut effects)?,
            IoDirection::Write => self.start_write(request, callback, &chunks, &mut effects)?,
        };
        self.run(effects);
        Ok(id)
    }

    /// Read `length` bytes starting at logical block `lba`.
    pub async fn read(self: &Arc<Self>, lba: u64, length: usize) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.handle_io(
            IoRequest::read(lba, length),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        rx.await
            .map_err(|_| Error::Internal("read dropped before completion".into()))?
    }

    /// Write `data` starting at logical block `lba`.
    pub async fn write(self: &Arc<Self>, lba: u64, data: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.handle_io(
            IoRequest::write(lba, data),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        rx.await
            .map_err(|_| Error::Internal("write dropped before completion".into()))?
            .map(|_| ())
    }

    fn validate_request(&self, request: &IoRequest) -> Result<()> {
        if request.length == 0 {
            return Err(Error::InvalidRequest("zero-length request".into()));
        }
        if request.length % BLOCK_SIZE != 0 {
            return Err(Error::InvalidRequest(format!(
                "length {} is not a multiple of {BLOCK_SIZE}",
                request.length
            )));
        }
        if request.length > self.config.max_transfer {
            return Err(Error::InvalidRequest(format!(
                "length {} exceeds max transfer {}",
                request.length, self.config.max_transfer
            )));
        }
        if request.direction == IoDirection::Write && request.data.len() != request.length {
            return Err(Error::InvalidRequest(format!(
                "write carries {} bytes for length {}",
                request.data.len(),
                request.length
            )));
        }
        let end = request
            .offset()
            .checked_add(request.length as u64)
            .filter(|end| *end <= self.geometry.capacity());
        if end.is_none() {
            return Err(Error::InvalidRequest(format!(
                "blocks {}..+{} out of range (capacity {} bytes)",
                request.lba,
                request.length / BLOCK_SIZE,
                self.geometry.capacity()
            )));
        }
        Ok(())
    }

    fn start_read(
        &self,
        request: IoRequest,
        callback: IoCallback,
        chunks: &[ChunkState],
        effects: &mut Effects,
    ) -> Result<WorkUnitId> {
        let permits = self.pool.acquire_many(1)?;
        let offset = request.offset();
        let range = self.geometry.request_blocks(offset, request.length);

        let mut table = self.units.lock();
        let id = table.allocate_id();
        let mut unit = WorkUnit::new(id, UnitKind::Read, offset, request.length, range);
        unit.data = scratch(request.length)?;
        let summary = builder::build(&self.geometry, chunks, &mut unit)?;
        unit.completion = Some(Completion::Caller(callback));
        unit.permits = permits;

        debug!(
            unit = id,
            lba = request.lba,
            length = request.length,
            subops = unit.subops.len(),
            reconstructed = summary.reconstructed_segments,
            "read"
        );

        table.units.insert(id, unit);
        self.schedule(&mut table, id, effects);
        self.record_started_read(&table, id, &summary);
        self.metrics.set_inflight(table.units.len());
        Ok(id)
    }

    fn start_write(
        &self,
        request: IoRequest,
        callback: IoCallback,
        chunks: &[ChunkState],
        effects: &mut Effects,
    ) -> Result<WorkUnitId> {
        let mut permits = self.pool.acquire_many(2)?;
        let offset = request.offset();
        let length = request.length;
        let range = self.geometry.request_blocks(offset, length);

        let mut table = self.units.lock();
        let head_id = table.allocate_id();
        let tail_id = table.allocate_id();

        // The payload rides on the read/XOR half, which seeds its parity
        // accumulator from it, and moves to the write half with the parity.
        let mut head = WorkUnit::new(head_id, UnitKind::WriteXor, offset, length, range);
        head.data = request.data;
        let mut tail = WorkUnit::new(tail_id, UnitKind::Write, offset, length, range);

        let built = builder::build(&self.geometry, chunks, &mut head)
            .and_then(|_| builder::build(&self.geometry, chunks, &mut tail));
        let summary = match built {
            Ok(summary) => summary,
            Err(e) => {
                if matches!(e, Error::RejectedWrite { .. }) {
                    self.metrics.record_rejected_write();
                    warn!(lba = request.lba, length, "{}", e);
                }
                return Err(e);
            }
        };

        tail.completion = Some(Completion::Caller(callback));
        tail.state = UnitState::AwaitingHead { head: head_id };
        tail.permits.push(permits.remove(0));
        head.permits = permits;
        head.collider = Some(tail_id);

        debug!(
            unit = head_id,
            collider = tail_id,
            lba = request.lba,
            length,
            subops = head.subops.len() + tail.subops.len(),
            segments = summary.direct_segments,
            "write"
        );

        table.units.insert(head_id, head);
        table.units.insert(tail_id, tail);
        self.schedule(&mut table, head_id, effects);
        self.metrics.set_inflight(table.units.len());
        Ok(tail_id)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Start a unit, or defer it behind the first pending unit it overlaps.
    pub(crate) fn schedule(&self, table: &mut UnitTable, id: WorkUnitId, effects: &mut Effects) {
        let range = table.unit_mut(id).range;
        match table.pending.find_overlap(range) {
            Some(other) => {
                table.unit_mut(id).state = UnitState::Deferred { waiting_on: other };
                table.deferred.push_back(id);
                self.metrics.record_deferred();
                debug!(unit = id, waiting_on = other, %range, "deferred on collision");
            }
            None => self.start(table, id, effects),
        }
    }

    /// Register a unit's range and submit its sub-ops.
    pub(crate) fn start(&self, table: &mut UnitTable, id: WorkUnitId, effects: &mut Effects) {
        let unit = table.unit_mut(id);
        unit.state = UnitState::InProgress;
        let range = unit.range;
        table.pending.insert(id, range);
        self.submit_unit(table, id, effects);
    }

    /// Queue every sub-op of an in-progress unit for submission.
    pub(crate) fn submit_unit(&self, table: &mut UnitTable, id: WorkUnitId, effects: &mut Effects) {
        let unit = table.unit_mut(id);
        if unit.subops.is_empty() {
            self.resolve(table, id, effects);
            return;
        }

        let mut batch = Vec::with_capacity(unit.subops.len());
        for index in 0..unit.subops.len() {
            match unit.take_transfer_buffer(index) {
                Ok(buffer) => {
                    let op = &unit.subops[index];
                    batch.push(Submission {
                        tag: SubOpTag {
                            unit: id,
                            generation: unit.generation,
                            index,
                        },
                        request: ChunkIoRequest {
                            chunk: op.chunk,
                            direction: op.direction,
                            block: op.block,
                            buffer,
                        },
                    });
                }
                Err(e) => {
                    warn!(unit = id, "cannot submit: {}", e);
                    self.fail_unit(table, id, e, effects);
                    return;
                }
            }
        }
        effects.submissions.extend(batch);
    }

    /// Start every unit that was waiting on `resolved`.
    pub(crate) fn release_waiters(
        &self,
        table: &mut UnitTable,
        resolved: WorkUnitId,
        effects: &mut Effects,
    ) {
        let waiting: Vec<WorkUnitId> = table
            .deferred
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    table.units.get(id).map(|u| u.state),
                    Some(UnitState::Deferred { waiting_on }) if waiting_on == resolved
                )
            })
            .collect();
        if waiting.is_empty() {
            return;
        }

        table.deferred.retain(|id| !waiting.contains(id));
        for id in waiting {
            trace!(unit = id, after = resolved, "releasing deferred unit");
            match self.rebuild_released(table, id) {
                Ok(summary) => {
                    self.schedule(table, id, effects);
                    self.record_started_read(table, id, &summary);
                }
                Err(e) => self.fail_unit(table, id, e, effects),
            }
        }
    }

    /// Count a read's reconstructed segments once it actually starts; a
    /// deferred read is rebuilt, and counted, when it is released.
    fn record_started_read(
        &self,
        table: &UnitTable,
        id: WorkUnitId,
        summary: &builder::BuildSummary,
    ) {
        let started = matches!(
            table.units.get(&id),
            Some(unit) if unit.kind == UnitKind::Read && unit.state == UnitState::InProgress
        );
        if started {
            self.metrics
                .record_reconstructions(summary.reconstructed_segments);
        }
    }

    /// Rebuild a deferred unit against the chunk health it will run under.
    ///
    /// The unit it waited on may have taken chunks offline, or a chunk may
    /// have changed state by hand, since it was built.
    fn rebuild_released(
        &self,
        table: &mut UnitTable,
        id: WorkUnitId,
    ) -> Result<builder::BuildSummary> {
        let chunks = self.chunk_snapshot();
        match builder::build(&self.geometry, &chunks, table.unit_mut(id)) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                if let Error::RejectedWrite { chunk } = &e {
                    self.metrics.record_rejected_write();
                    warn!(unit = id, chunk, "deferred write rejected: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Carry out the effects collected under the locks.
    pub(crate) fn run(self: &Arc<Self>, effects: Effects) {
        for snapshot in effects.snapshots {
            self.store.persist(snapshot);
        }
        for (completion, outcome) in effects.completions {
            completion.complete(outcome);
        }
        for submission in effects.submissions {
            let volume = Arc::clone(self);
            let tag = submission.tag;
            let chunk = submission.request.chunk;
            let direction = submission.request.direction;
            let block = submission.request.block;
            let len = submission.request.len();
            let handle = self.io.submit(
                submission.request,
                Box::new(move |completion| volume.complete(tag, completion)),
            );
            trace!(
                unit = tag.unit,
                index = tag.index,
                chunk,
                %direction,
                block,
                len,
                handle = handle.0,
                "submitted"
            );
        }
    }

    // =========================================================================
    // State Administration
    // =========================================================================

    /// Administrative chunk state change.
    ///
    /// An unlisted transition is an invariant violation, not an error.
    pub fn set_chunk_state(&self, chunk: usize, state: ChunkState) -> Result<Transition> {
        if chunk >= self.geometry.chunk_count() {
            return Err(Error::InvalidRequest(format!(
                "chunk {chunk} out of range ({} chunks)",
                self.geometry.chunk_count()
            )));
        }

        let (transition, snapshot) = {
            let mut health = self.health.lock();
            let transition = health.set_chunk(chunk, state);
            (transition, self.config.snapshot(&health))
        };
        self.log_transition(&transition);
        self.store.persist(snapshot);
        Ok(transition)
    }

    /// Recompute the volume state from the chunk tally.
    pub fn recompute_volume_state(&self) -> VolumeState {
        let (before, after, snapshot) = {
            let mut health = self.health.lock();
            let before = health.volume();
            let after = health.recompute();
            (before, after, self.config.snapshot(&health))
        };
        if before != after {
            info!(volume = %self.config.name, from = %before, to = %after, "volume state changed");
            self.store.persist(snapshot);
        }
        after
    }

    /// Take a chunk offline after an I/O failure. Already-offline chunks
    /// are left alone.
    pub(crate) fn fail_chunk(&self, chunk: usize, effects: &mut Effects) {
        let (transition, snapshot) = {
            let mut health = self.health.lock();
            if health.chunk(chunk) == ChunkState::Offline {
                return;
            }
            let transition = health.set_chunk(chunk, ChunkState::Offline);
            (transition, self.config.snapshot(&health))
        };
        self.log_transition(&transition);
        effects.snapshots.push(snapshot);
    }

    pub(crate) fn chunk_snapshot(&self) -> Vec<ChunkState> {
        self.health.lock().chunks().to_vec()
    }

    fn log_transition(&self, t: &Transition) {
        self.metrics.record_transition(&t.to.to_string());
        info!(
            volume = %self.config.name,
            chunk = t.chunk,
            from = %t.from,
            to = %t.to,
            volume_from = %t.volume_from,
            volume_to = %t.volume_to,
            "chunk state changed"
        );
        if t.volume_from != t.volume_to
            && matches!(t.volume_to, VolumeState::Degraded | VolumeState::Offline)
        {
            warn!(volume = %self.config.name, state = %t.volume_to, "volume lost redundancy");
        }
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.config.name)
            .field("geometry", &self.geometry)
            .field("state", &self.volume_state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
