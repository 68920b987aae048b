//! raidp - RAID-4/RAID-5 Software Parity Engine
//!
//! Stripes a logical block device across N+1 chunk devices with a single
//! XOR parity strip per row. Keeps serving reads with one chunk lost,
//! reconstructing the missing strip from the survivors, and rebuilds a
//! replaced chunk in the background.
//!
//! # Architecture
//!
//! ```text
//! caller ─► Volume ─► Geometry ─► Builder ─► ChunkIo ─► Aggregator ─► caller
//!                                    ▲                      │
//!                                    └──── State Machine ◄──┘
//! ```
//!
//! # Features
//!
//! - RAID4 (dedicated parity) and RAID5 left-asymmetric (rotating parity)
//! - Degraded reads by XOR reconstruction
//! - Read-modify-write and reconstruct-write parity updates
//! - Per-row collision ordering of overlapping requests
//! - Automatic chunk fail-out, single read retry
//! - Online chunk rebuild
//! - Prometheus metrics
//!
//! # Modules
//!
//! - [`adapters`] - Chunk device and configuration store implementations
//! - [`domain`] - Ports the engine consumes (chunk I/O, persistence)
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics integration
//! - [`raid`] - The parity engine

pub mod adapters;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod raid;

// Re-export commonly used types
pub use domain::{ChunkIo, ConfigStore};
pub use error::{Error, InvariantViolation, Result};
pub use metrics::EngineMetrics;
pub use raid::{ChunkState, Geometry, IoRequest, RaidLevel, Volume, VolumeConfig, VolumeState};
