//! Work units and sub-operations
//!
//! A [`WorkUnit`] is the engine's record of one logical request (or one half
//! of a write transaction, or one rebuild step). It owns its buffers and an
//! ordered list of [`SubOp`]s, each a single physical transfer on one chunk.
//!
//! Buffers move rather than alias. A sub-op's transfer buffer is handed to
//! the I/O layer at submission and comes back with the completion, where the
//! aggregator folds it into its target and drops it.

use std::fmt;

use super::geometry::{BlockRange, BLOCK_SHIFT};
use super::pool::PoolPermit;
use crate::domain::IoDirection;
use crate::error::{Error, Result};

/// Identifier of a work unit inside one volume
pub type WorkUnitId = u64;

// =============================================================================
// Logical Request
// =============================================================================

/// A logical read or write addressed in 512-byte blocks.
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub direction: IoDirection,

    /// First logical block
    pub lba: u64,

    /// Length in bytes
    pub length: usize,

    /// Payload for writes; empty for reads
    pub data: Vec<u8>,
}

impl IoRequest {
    pub fn read(lba: u64, length: usize) -> Self {
        Self {
            direction: IoDirection::Read,
            lba,
            length,
            data: Vec::new(),
        }
    }

    pub fn write(lba: u64, data: Vec<u8>) -> Self {
        Self {
            direction: IoDirection::Write,
            lba,
            length: data.len(),
            data,
        }
    }

    /// Logical byte offset of the first block
    pub fn offset(&self) -> u64 {
        self.lba << BLOCK_SHIFT
    }
}

/// Completion target for a logical request: read data, or an empty buffer
/// for writes.
pub type IoCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// Completion target for one rebuild step.
pub type RebuildCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Where a resolved work unit reports.
pub enum Completion {
    /// The issuer of a logical request
    Caller(IoCallback),
    /// The chunk rebuild driver
    Rebuild(RebuildCallback),
}

impl Completion {
    /// Deliver the outcome.
    pub fn complete(self, outcome: Result<Vec<u8>>) {
        match self {
            Completion::Caller(callback) => callback(outcome),
            Completion::Rebuild(callback) => callback(outcome.map(|_| ())),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Caller(_) => write!(f, "Completion::Caller"),
            Completion::Rebuild(_) => write!(f, "Completion::Rebuild"),
        }
    }
}

// =============================================================================
// Sub-Operations
// =============================================================================

/// Source or destination of a sub-op's bytes.
#[derive(Debug)]
pub enum SubOpBuffer {
    /// Region of the work unit's caller buffer starting at this offset
    Caller { at: usize },
    /// Region of the work unit's parity accumulator starting at this offset
    Parity { at: usize },
    /// Temporary buffer owned by the sub-op; `None` once handed to the I/O layer
    Scratch(Option<Vec<u8>>),
}

/// Accumulator a completed read is XORed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XorTarget {
    Caller { at: usize },
    Parity { at: usize },
}

/// Progress of a sub-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubOpState {
    Built,
    Submitted,
    Done,
    Failed,
}

/// One physical operation against one chunk.
#[derive(Debug)]
pub struct SubOp {
    pub chunk: usize,
    pub direction: IoDirection,
    /// Physical block address on the chunk
    pub block: u64,
    pub len: usize,
    pub buffer: SubOpBuffer,
    pub xor: Option<XorTarget>,
    pub state: SubOpState,
}

impl SubOp {
    /// Read straight into the caller's buffer.
    pub fn read_direct(chunk: usize, block: u64, len: usize, at: usize) -> Self {
        Self {
            chunk,
            direction: IoDirection::Read,
            block,
            len,
            buffer: SubOpBuffer::Caller { at },
            xor: None,
            state: SubOpState::Built,
        }
    }

    /// Read into a fresh scratch buffer and XOR the result into `target`.
    pub fn read_xor(chunk: usize, block: u64, len: usize, target: XorTarget) -> Result<Self> {
        Ok(Self {
            chunk,
            direction: IoDirection::Read,
            block,
            len,
            buffer: SubOpBuffer::Scratch(Some(scratch(len)?)),
            xor: Some(target),
            state: SubOpState::Built,
        })
    }

    /// Write a region of the caller's buffer.
    pub fn write_data(chunk: usize, block: u64, len: usize, at: usize) -> Self {
        Self {
            chunk,
            direction: IoDirection::Write,
            block,
            len,
            buffer: SubOpBuffer::Caller { at },
            xor: None,
            state: SubOpState::Built,
        }
    }

    /// Write a region of the parity accumulator.
    pub fn write_parity(chunk: usize, block: u64, len: usize, at: usize) -> Self {
        Self {
            chunk,
            direction: IoDirection::Write,
            block,
            len,
            buffer: SubOpBuffer::Parity { at },
            xor: None,
            state: SubOpState::Built,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SubOpState::Done | SubOpState::Failed)
    }
}

/// Allocate a zeroed scratch buffer, reporting allocation failure as an error.
pub fn scratch(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| Error::ResourceExhausted {
            resource: format!("scratch buffer of {len} bytes: {e}"),
        })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// XOR `src` into `dst` byte by byte.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

// =============================================================================
// Work Units
// =============================================================================

/// What a work unit does, and therefore how it is built and resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Logical read
    Read,
    /// Read/XOR half of a write: computes the new parity
    WriteXor,
    /// Write half of a write: data plus parity
    Write,
    /// Read/XOR half of a rebuild step: reconstructs one strip
    RebuildXor { chunk: usize, row: u64 },
    /// Write half of a rebuild step
    RebuildWrite { chunk: usize, row: u64 },
}

impl UnitKind {
    pub fn is_rebuild(&self) -> bool {
        matches!(
            self,
            UnitKind::RebuildXor { .. } | UnitKind::RebuildWrite { .. }
        )
    }

    /// Heads of a two-unit transaction hand their parity to a collider.
    pub fn has_collider(&self) -> bool {
        matches!(self, UnitKind::WriteXor | UnitKind::RebuildXor { .. })
    }
}

/// Scheduling state of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Built, not yet scheduled
    Built,
    /// Range overlaps a pending unit; waits for it to resolve
    Deferred { waiting_on: WorkUnitId },
    /// Write half waiting for its read/XOR half
    AwaitingHead { head: WorkUnitId },
    /// Sub-ops submitted
    InProgress,
}

/// One logical I/O (or half of one) decomposed into sub-operations.
#[derive(Debug)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    pub kind: UnitKind,

    /// Logical byte offset (rebuild units: physical row offset)
    pub offset: u64,

    /// Logical length in bytes
    pub length: usize,

    /// Whole-row chunk block range used for collision detection
    pub range: BlockRange,

    /// Caller data: the payload of a write or the destination of a read
    pub data: Vec<u8>,

    /// Parity accumulator for write and rebuild transactions
    pub parity: Vec<u8>,

    pub subops: Vec<SubOp>,

    /// Sub-ops finished (successfully or not) in the current generation
    pub completed: usize,

    /// Sub-ops failed in the current generation
    pub failed: usize,

    /// Bumped every time the sub-ops are rebuilt
    pub generation: u32,

    /// A failed read has been rebuilt and reissued once
    pub retried: bool,

    /// Write half gated on this unit
    pub collider: Option<WorkUnitId>,

    pub state: UnitState,

    pub completion: Option<Completion>,

    /// Pool slots held until this unit is dropped
    pub permits: Vec<PoolPermit>,
}

impl WorkUnit {
    pub fn new(
        id: WorkUnitId,
        kind: UnitKind,
        offset: u64,
        length: usize,
        range: BlockRange,
    ) -> Self {
        Self {
            id,
            kind,
            offset,
            length,
            range,
            data: Vec::new(),
            parity: Vec::new(),
            subops: Vec::new(),
            completed: 0,
            failed: 0,
            generation: 0,
            retried: false,
            collider: None,
            state: UnitState::Built,
            completion: None,
            permits: Vec::new(),
        }
    }

    pub fn direction(&self) -> IoDirection {
        match self.kind {
            UnitKind::Read | UnitKind::WriteXor | UnitKind::RebuildXor { .. } => {
                IoDirection::Read
            }
            UnitKind::Write | UnitKind::RebuildWrite { .. } => IoDirection::Write,
        }
    }

    /// Every sub-op of the current generation has completed.
    pub fn is_done(&self) -> bool {
        self.completed == self.subops.len()
    }

    pub fn all_failed(&self) -> bool {
        !self.subops.is_empty() && self.failed == self.subops.len()
    }

    /// Drop the current sub-ops and counters ahead of a rebuild.
    pub fn reset_subops(&mut self) {
        self.subops.clear();
        self.completed = 0;
        self.failed = 0;
        self.generation += 1;
    }

    /// Take the buffer to hand to the I/O layer for sub-op `index`.
    ///
    /// Scratch buffers move out; caller and parity regions are copied for
    /// writes and freshly allocated for reads.
    pub fn take_transfer_buffer(&mut self, index: usize) -> Result<Vec<u8>> {
        let subop = &mut self.subops[index];
        let len = subop.len;
        let buf = match (&mut subop.buffer, subop.direction) {
            (SubOpBuffer::Scratch(slot), _) => match slot.take() {
                Some(buf) => buf,
                None => {
                    return Err(Error::Internal(format!(
                        "sub-op {index} of unit {} submitted twice",
                        self.id
                    )))
                }
            },
            (SubOpBuffer::Caller { .. }, IoDirection::Read)
            | (SubOpBuffer::Parity { .. }, IoDirection::Read) => scratch(len)?,
            (SubOpBuffer::Caller { at }, IoDirection::Write) => {
                self.data[*at..*at + len].to_vec()
            }
            (SubOpBuffer::Parity { at }, IoDirection::Write) => {
                self.parity[*at..*at + len].to_vec()
            }
        };
        subop.state = SubOpState::Submitted;
        Ok(buf)
    }

    /// Fold the bytes returned by a successful read into their destination.
    ///
    /// The buffer is consumed here; this is the single release point for
    /// scratch buffers.
    pub fn fold(&mut self, index: usize, buffer: Vec<u8>) {
        let subop = &self.subops[index];
        if subop.direction == IoDirection::Write {
            return;
        }
        let len = subop.len.min(buffer.len());
        match (subop.xor, &subop.buffer) {
            (Some(XorTarget::Caller { at }), _) => {
                xor_into(&mut self.data[at..at + len], &buffer[..len])
            }
            (Some(XorTarget::Parity { at }), _) => {
                xor_into(&mut self.parity[at..at + len], &buffer[..len])
            }
            (None, SubOpBuffer::Caller { at }) => {
                let at = *at;
                self.data[at..at + len].copy_from_slice(&buffer[..len])
            }
            (None, SubOpBuffer::Parity { at }) => {
                let at = *at;
                self.parity[at..at + len].copy_from_slice(&buffer[..len])
            }
            (None, SubOpBuffer::Scratch(_)) => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
