//! Chunk / Volume State Machine
//!
//! Chunk health changes only along the edges of a fixed table. Volume health
//! is never set directly: it is recomputed from the tally of chunk states and
//! the result is itself checked against a second table. Anything off-table is
//! an [`InvariantViolation`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, InvariantViolation, Result};

// =============================================================================
// Chunk State
// =============================================================================

/// Health of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// Serving reads and writes
    Online,
    /// Failed or removed; contents are reconstructed from parity
    Offline,
    /// Online, being verified
    Scrubbing,
    /// Being repopulated from the surviving chunks
    Rebuilding,
}

impl ChunkState {
    pub const ALL: [ChunkState; 4] = [
        ChunkState::Online,
        ChunkState::Offline,
        ChunkState::Scrubbing,
        ChunkState::Rebuilding,
    ];

    /// Whether the transition `self -> next` is in the chunk table.
    pub fn can_transition_to(self, next: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, next),
            (Online, Offline)
                | (Online, Scrubbing)
                | (Offline, Rebuilding)
                | (Scrubbing, Online)
                | (Scrubbing, Offline)
                | (Rebuilding, Online)
                | (Rebuilding, Offline)
        )
    }

    /// Direct reads are allowed from this chunk.
    pub fn is_readable(self) -> bool {
        matches!(self, ChunkState::Online | ChunkState::Scrubbing)
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkState::Online => write!(f, "online"),
            ChunkState::Offline => write!(f, "offline"),
            ChunkState::Scrubbing => write!(f, "scrubbing"),
            ChunkState::Rebuilding => write!(f, "rebuilding"),
        }
    }
}

impl std::str::FromStr for ChunkState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(ChunkState::Online),
            "offline" => Ok(ChunkState::Offline),
            "scrubbing" | "scrub" => Ok(ChunkState::Scrubbing),
            "rebuilding" | "rebuild" => Ok(ChunkState::Rebuilding),
            other => Err(Error::InvalidRequest(format!("unknown chunk state: {other}"))),
        }
    }
}

// =============================================================================
// Volume State
// =============================================================================

/// Aggregate health of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Online,
    /// Exactly one chunk unavailable; all data still recoverable
    Degraded,
    /// Two or more chunks unavailable
    Offline,
    Scrubbing,
    Rebuilding,
}

impl VolumeState {
    /// Whether the transition `self -> next` is in the volume table.
    ///
    /// Staying in the same state is always listed except where noted by the
    /// table itself. Offline is terminal.
    pub fn can_transition_to(self, next: VolumeState) -> bool {
        use VolumeState::*;
        match self {
            Online => true,
            Degraded => matches!(next, Degraded | Offline | Rebuilding),
            Scrubbing => matches!(next, Scrubbing | Online | Degraded | Offline),
            Rebuilding => matches!(next, Rebuilding | Online | Degraded | Offline),
            Offline => next == Offline,
        }
    }

    /// Compute the volume state from the states of its chunks.
    pub fn from_chunks(states: &[ChunkState]) -> VolumeState {
        let tally = StateTally::count(states);
        let total = states.len();

        if tally.online == total {
            VolumeState::Online
        } else if tally.online + 1 < total {
            VolumeState::Offline
        } else if tally.scrubbing > 0 {
            VolumeState::Scrubbing
        } else if tally.rebuilding > 0 {
            VolumeState::Rebuilding
        } else {
            // exactly one chunk down and it is offline
            VolumeState::Degraded
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeState::Online => write!(f, "online"),
            VolumeState::Degraded => write!(f, "degraded"),
            VolumeState::Offline => write!(f, "offline"),
            VolumeState::Scrubbing => write!(f, "scrubbing"),
            VolumeState::Rebuilding => write!(f, "rebuilding"),
        }
    }
}

/// Count of chunks per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateTally {
    pub online: usize,
    pub offline: usize,
    pub scrubbing: usize,
    pub rebuilding: usize,
}

impl StateTally {
    pub fn count(states: &[ChunkState]) -> Self {
        let mut tally = Self::default();
        for state in states {
            match state {
                ChunkState::Online => tally.online += 1,
                ChunkState::Offline => tally.offline += 1,
                ChunkState::Scrubbing => tally.scrubbing += 1,
                ChunkState::Rebuilding => tally.rebuilding += 1,
            }
        }
        tally
    }
}

// =============================================================================
// Health Table
// =============================================================================

/// A state change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub chunk: usize,
    pub from: ChunkState,
    pub to: ChunkState,
    pub volume_from: VolumeState,
    pub volume_to: VolumeState,
}

/// Per-chunk and per-volume health of one volume.
///
/// Not synchronised itself; the owning volume keeps it behind a lock.
#[derive(Debug, Clone)]
pub struct HealthTable {
    chunks: Vec<ChunkState>,
    volume: VolumeState,
    /// Bumped on every applied change; orders configuration snapshots
    sequence: u64,
}

impl HealthTable {
    /// Build a table from persisted chunk states.
    ///
    /// The volume state is derived, not trusted from disk.
    pub fn new(chunks: Vec<ChunkState>) -> Self {
        let volume = VolumeState::from_chunks(&chunks);
        Self {
            chunks,
            volume,
            sequence: 0,
        }
    }

    /// Continue the change sequence of a persisted configuration.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn chunk(&self, index: usize) -> ChunkState {
        match self.chunks.get(index) {
            Some(state) => *state,
            None => InvariantViolation::new(
                "chunk-state",
                format!("chunk {index} out of range ({} chunks)", self.chunks.len()),
            )
            .raise(),
        }
    }

    pub fn chunks(&self) -> &[ChunkState] {
        &self.chunks
    }

    pub fn volume(&self) -> VolumeState {
        self.volume
    }

    /// Apply a validated chunk transition, then recompute the volume state.
    pub fn set_chunk(&mut self, index: usize, next: ChunkState) -> Transition {
        let from = self.chunk(index);
        if !from.can_transition_to(next) {
            InvariantViolation::new(
                "chunk-state",
                format!("chunk {index}: {from} -> {next} is not a valid transition"),
            )
            .raise();
        }

        self.chunks[index] = next;
        self.sequence += 1;
        let volume_from = self.volume;
        let volume_to = self.recompute();

        Transition {
            chunk: index,
            from,
            to: next,
            volume_from,
            volume_to,
        }
    }

    /// Recompute the volume state from the chunk tally and validate the move.
    pub fn recompute(&mut self) -> VolumeState {
        let next = VolumeState::from_chunks(&self.chunks);
        if !self.volume.can_transition_to(next) {
            InvariantViolation::new(
                "volume-state",
                format!(
                    "{} -> {} is not a valid transition (chunks {:?})",
                    self.volume, next, self.chunks
                ),
            )
            .raise();
        }
        if next != self.volume {
            self.sequence += 1;
        }
        self.volume = next;
        next
    }
}

// =============================================================================
// Tests
// =============================================================================
