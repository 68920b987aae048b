//! Parity Engine
//!
//! Single-parity striping (RAID4 and left-asymmetric RAID5) over a set of
//! chunk devices.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Volume                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  logical I/O ──► ┌──────────────┐    ┌──────────────┐                    │
//! │                  │   Geometry   │──► │   Builder    │──► sub-ops ──┐     │
//! │                  │    Mapper    │    │ (read/write) │              │     │
//! │                  └──────────────┘    └──────────────┘              ▼     │
//! │                                             ▲                 ChunkIo    │
//! │                  ┌──────────────┐           │ rebuild              │     │
//! │                  │ Chunk/Volume │◄───┌──────────────┐              │     │
//! │                  │ State Machine│    │  Completion  │◄── completions     │
//! │                  └──────────────┘    │  Aggregator  │                    │
//! │                                      └──────────────┘                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Geometry** (`geometry.rs`): logical offset to (data chunk, parity
//!   chunk, physical offset) mapping.
//! - **State** (`state.rs`): per-chunk health, its transition table and the
//!   derived volume state.
//! - **Work units** (`work_unit.rs`): one logical request decomposed into
//!   physical sub-operations, plus their buffers.
//! - **Builder** (`builder.rs`): chooses direct reads, reconstruction,
//!   read-modify-write or reconstruct-write from the chunk health.
//! - **Aggregator** (`aggregator.rs`): folds completions, takes failing
//!   chunks offline, retries and resolves.
//! - **Volume** (`volume.rs`): entry point, collision ordering, locking.
//! - **Rebuild** (`rebuild.rs`): regenerates an offline chunk row by row.
//!
//! # Usage
//!
//! ```rust,ignore
//! use raidp::adapters::{MemoryChunkStore, MemoryConfigStore};
//! use raidp::raid::{RaidLevel, Volume, VolumeConfig};
//!
//! let config = VolumeConfig::new("vol0", RaidLevel::Raid5, 4, 4096, 1 << 20);
//! let chunks = Arc::new(MemoryChunkStore::for_geometry(&config.geometry()?));
//! let volume = Volume::attach(config, chunks, Arc::new(MemoryConfigStore::new()))?;
//!
//! volume.write(0, vec![0xAA; 4096]).await?;
//! let data = volume.read(0, 4096).await?;
//! ```

mod aggregator;
pub mod builder;
pub mod config;
pub mod geometry;
pub mod pool;
mod rebuild;
pub mod state;
pub mod volume;
pub mod work_unit;

#[cfg(test)]
mod proptest;

pub use builder::BuildSummary;
pub use config::VolumeConfig;
pub use geometry::{BlockRange, Geometry, RaidLevel, StripeSegment, BLOCK_SIZE};
pub use pool::{PoolPermit, WorkUnitPool};
pub use state::{ChunkState, HealthTable, Transition, VolumeState};
pub use volume::Volume;
pub use work_unit::{IoCallback, IoRequest, RebuildCallback, WorkUnitId};
