//! Completion Aggregator
//!
//! Folds physical completions into their work units and resolves a unit
//! once every sub-op of its current generation has finished.
//!
//! Resolution rules:
//!
//! - A failed sub-op takes its chunk offline (unless it already is).
//! - Some sub-ops succeeded: the unit resolves successfully. Reads are the
//!   exception, as any failure leaves a hole in the caller's buffer.
//! - Every sub-op failed, or a read had any failure: a read is rebuilt
//!   against the new chunk health and reissued once, anything else fails
//!   permanently.
//! - A read/XOR half hands its payload, parity and pool slots to its write
//!   half and starts it. The write half is rebuilt first against the chunk
//!   health of that moment, which may have changed since it was built.
//! - A failed read/XOR half takes its write half down with it.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::builder;
use super::state::ChunkState;
use super::volume::{Effects, SubOpTag, UnitTable, Volume};
use super::work_unit::{SubOpState, UnitKind, UnitState, WorkUnit, WorkUnitId};
use crate::domain::{ChunkIoCompletion, IoFault};
use crate::error::{Error, InvariantViolation, Result};

impl Volume {
    /// Entry point for the I/O layer: one sub-op finished.
    pub(crate) fn complete(self: &Arc<Self>, tag: SubOpTag, completion: ChunkIoCompletion) {
        let mut effects = Effects::default();
        {
            let mut table = self.units.lock();
            self.fold_completion(&mut table, tag, completion, &mut effects);
            self.metrics().set_inflight(table.units.len());
        }
        self.run(effects);
    }

    fn fold_completion(
        &self,
        table: &mut UnitTable,
        tag: SubOpTag,
        completion: ChunkIoCompletion,
        effects: &mut Effects,
    ) {
        let unit = match table.units.get_mut(&tag.unit) {
            Some(unit) => unit,
            None => InvariantViolation::new(
                "aggregator",
                format!("completion for unknown work unit {}", tag.unit),
            )
            .raise(),
        };
        if unit.generation != tag.generation || unit.state != UnitState::InProgress {
            InvariantViolation::new(
                "aggregator",
                format!(
                    "stale completion for unit {} (generation {} vs {}, {:?})",
                    tag.unit, tag.generation, unit.generation, unit.state
                ),
            )
            .raise();
        }
        let (chunk, expected) = match unit.subops.get(tag.index) {
            Some(op) if op.state == SubOpState::Submitted => (op.chunk, op.len),
            Some(op) => InvariantViolation::new(
                "aggregator",
                format!(
                    "sub-op {} of unit {} completed while {:?}",
                    tag.index, tag.unit, op.state
                ),
            )
            .raise(),
            None => InvariantViolation::new(
                "aggregator",
                format!("unit {} has no sub-op {}", tag.unit, tag.index),
            )
            .raise(),
        };

        let outcome = match completion.result {
            Ok(n) if n == expected => Ok(()),
            Ok(actual) => Err(IoFault::Short { expected, actual }),
            Err(fault) => Err(fault),
        };

        unit.completed += 1;
        match outcome {
            Ok(()) => {
                unit.subops[tag.index].state = SubOpState::Done;
                unit.fold(tag.index, completion.buffer);
            }
            Err(fault) => {
                unit.subops[tag.index].state = SubOpState::Failed;
                unit.failed += 1;
                drop(completion.buffer);
                warn!(
                    unit = tag.unit,
                    index = tag.index,
                    chunk,
                    "sub-operation failed: {}",
                    fault
                );
                self.metrics().record_subop_failure(chunk);
                self.fail_chunk(chunk, effects);
            }
        }

        if table.unit_mut(tag.unit).is_done() {
            self.resolve(table, tag.unit, effects);
        }
    }

    /// Resolve a unit whose sub-ops have all finished.
    pub(crate) fn resolve(&self, table: &mut UnitTable, id: WorkUnitId, effects: &mut Effects) {
        let unit = table.unit_mut(id);
        let (kind, failed, total) = (unit.kind, unit.failed, unit.subops.len());
        let all_failed = unit.all_failed();

        match kind {
            _ if all_failed => self.resolve_failed(table, id, effects),
            // A read with a failed sub-op has a hole in its buffer.
            UnitKind::Read if failed > 0 => self.resolve_failed(table, id, effects),
            UnitKind::RebuildXor { .. } if failed > 0 => {
                let reason = format!("{failed} of {total} reads failed");
                self.fail_unit(table, id, Error::IoFailed { reason }, effects);
            }
            _ => self.resolve_ok(table, id, effects),
        }
    }

    /// Retry a failed read once against the current chunk health, or fail
    /// the unit for good.
    fn resolve_failed(&self, table: &mut UnitTable, id: WorkUnitId, effects: &mut Effects) {
        let unit = table.unit_mut(id);
        if unit.kind == UnitKind::Read && !unit.retried {
            unit.retried = true;
            self.metrics().record_read_retry();
            warn!(
                unit = id,
                failed = unit.failed,
                subops = unit.subops.len(),
                "read failed, retrying"
            );

            let chunks = self.chunk_snapshot();
            let unit = table.unit_mut(id);
            match builder::build(self.geometry(), &chunks, unit) {
                Ok(summary) => {
                    self.metrics()
                        .record_reconstructions(summary.reconstructed_segments);
                    self.submit_unit(table, id, effects);
                }
                Err(e) => self.fail_unit(table, id, e, effects),
            }
            return;
        }

        let reason = format!(
            "{} of {} sub-operations of {:?} unit {} failed",
            unit.failed,
            unit.subops.len(),
            unit.kind,
            id
        );
        self.fail_unit(table, id, Error::IoFailed { reason }, effects);
    }

    fn resolve_ok(&self, table: &mut UnitTable, id: WorkUnitId, effects: &mut Effects) {
        let mut unit = self.retire(table, id);
        self.metrics().record_resolved(true);
        debug!(
            unit = id,
            kind = ?unit.kind,
            failed = unit.failed,
            subops = unit.subops.len(),
            "work unit resolved"
        );

        if let Some(collider) = unit.collider.take() {
            self.start_collider(table, &mut unit, collider, effects);
        } else if let Some(completion) = unit.completion.take() {
            let payload = match unit.kind {
                UnitKind::Read => std::mem::take(&mut unit.data),
                _ => Vec::new(),
            };
            effects.completions.push((completion, Ok(payload)));
        }

        drop(unit);
        self.release_waiters(table, id, effects);
    }

    /// Resolve a unit as permanently failed.
    pub(crate) fn fail_unit(
        &self,
        table: &mut UnitTable,
        id: WorkUnitId,
        err: Error,
        effects: &mut Effects,
    ) {
        let mut unit = self.retire(table, id);
        self.metrics().record_resolved(false);
        error!(unit = id, kind = ?unit.kind, "work unit failed: {}", err);

        match unit.collider.take() {
            Some(collider) => self.abort_collider(table, collider, err, effects),
            None => {
                if let Some(completion) = unit.completion.take() {
                    effects.completions.push((completion, Err(err)));
                }
            }
        }

        drop(unit);
        self.release_waiters(table, id, effects);
    }

    /// Remove a finished unit from the table and the collision registry.
    fn retire(&self, table: &mut UnitTable, id: WorkUnitId) -> WorkUnit {
        let unit = match table.units.remove(&id) {
            Some(unit) => unit,
            None => InvariantViolation::new("aggregator", format!("work unit {id} is not live"))
                .raise(),
        };
        match unit.state {
            UnitState::InProgress => table.pending.remove(id, unit.range),
            UnitState::Deferred { .. } => table.deferred.retain(|d| *d != id),
            UnitState::Built | UnitState::AwaitingHead { .. } => {}
        }
        unit
    }

    /// Hand a resolved head's parity and pool slots to its write half and
    /// start it in the head's place.
    fn start_collider(
        &self,
        table: &mut UnitTable,
        head: &mut WorkUnit,
        collider: WorkUnitId,
        effects: &mut Effects,
    ) {
        let chunks = self.chunk_snapshot();

        let tail = table.unit_mut(collider);
        if tail.state != (UnitState::AwaitingHead { head: head.id }) {
            InvariantViolation::new(
                "aggregator",
                format!(
                    "collider {collider} of unit {} is {:?}",
                    head.id, tail.state
                ),
            )
            .raise();
        }
        tail.parity = std::mem::take(&mut head.parity);
        tail.data = std::mem::take(&mut head.data);
        tail.permits.append(&mut head.permits);

        if head.failed > 0 {
            debug!(unit = collider, head = head.id, "rebuilding write half after partial failure");
        }
        if let Err(e) = self.rebuild_collider(tail, &chunks) {
            let mut tail = self.retire(table, collider);
            self.metrics().record_resolved(false);
            warn!(unit = collider, "write half cannot proceed: {}", e);
            if let Some(completion) = tail.completion.take() {
                effects.completions.push((completion, Err(e)));
            }
            return;
        }

        self.start(table, collider, effects);
    }

    fn rebuild_collider(&self, tail: &mut WorkUnit, chunks: &[ChunkState]) -> Result<()> {
        match builder::build(self.geometry(), chunks, tail) {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e, Error::RejectedWrite { .. }) {
                    self.metrics().record_rejected_write();
                }
                Err(e)
            }
        }
    }

    /// Discard the write half of a failed head, reporting `cause` to its
    /// issuer.
    fn abort_collider(
        &self,
        table: &mut UnitTable,
        collider: WorkUnitId,
        cause: Error,
        effects: &mut Effects,
    ) {
        let mut tail = self.retire(table, collider);
        self.metrics().record_resolved(false);
        debug!(unit = collider, "write half discarded");

        let err = match (tail.kind, cause) {
            (UnitKind::RebuildWrite { chunk, .. }, cause) => Error::RebuildFailed {
                chunk,
                reason: cause.to_string(),
            },
            (_, cause) => cause,
        };
        if let Some(completion) = tail.completion.take() {
            effects.completions.push((completion, Err(err)));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
