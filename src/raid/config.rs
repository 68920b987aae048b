//! Volume configuration
//!
//! The persisted description of a volume: layout parameters plus the last
//! known health of every chunk. A snapshot is handed to the
//! [`ConfigStore`](crate::domain::ConfigStore) after every state change.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::geometry::{Geometry, RaidLevel, BLOCK_SIZE, DEFAULT_DATA_OFFSET_BLOCKS};
use super::state::{ChunkState, HealthTable};
use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default number of work units per volume
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Default largest logical transfer (bytes)
pub const DEFAULT_MAX_TRANSFER: usize = 64 * 1024;

/// Upper bound on sub-operations in one work unit
pub const MAX_SUBOPS_PER_UNIT: usize = 4096;

fn default_data_offset_blocks() -> u64 {
    DEFAULT_DATA_OFFSET_BLOCKS
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_max_transfer() -> usize {
    DEFAULT_MAX_TRANSFER
}

// =============================================================================
// Volume Configuration
// =============================================================================

/// Persisted configuration of one parity volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Volume identity
    pub id: Uuid,

    /// Human-readable name
    pub name: String,

    /// Parity placement
    pub level: RaidLevel,

    /// Chunks in the volume, parity included
    pub chunk_count: usize,

    /// Bytes per strip (power of two)
    pub strip_size: u64,

    /// Bytes of data area per chunk
    pub chunk_size: u64,

    /// Blocks reserved at the head of every chunk
    #[serde(default = "default_data_offset_blocks")]
    pub data_offset_blocks: u64,

    /// Work units available to the volume
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Largest logical request accepted (bytes)
    #[serde(default = "default_max_transfer")]
    pub max_transfer: usize,

    /// Last known health of each chunk
    pub chunk_states: Vec<ChunkState>,

    /// When this configuration was last written
    pub updated_at: DateTime<Utc>,

    /// Chunk state change counter; a snapshot with a higher sequence supersedes
    #[serde(default)]
    pub sequence: u64,
}

impl VolumeConfig {
    /// Configuration for a new volume with every chunk online.
    pub fn new(
        name: impl Into<String>,
        level: RaidLevel,
        chunk_count: usize,
        strip_size: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            level,
            chunk_count,
            strip_size,
            chunk_size,
            data_offset_blocks: DEFAULT_DATA_OFFSET_BLOCKS,
            pool_size: DEFAULT_POOL_SIZE,
            max_transfer: DEFAULT_MAX_TRANSFER,
            chunk_states: vec![ChunkState::Online; chunk_count],
            updated_at: Utc::now(),
            sequence: 0,
        }
    }

    pub fn with_data_offset_blocks(mut self, blocks: u64) -> Self {
        self.data_offset_blocks = blocks;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_transfer(mut self, max_transfer: usize) -> Self {
        self.max_transfer = max_transfer;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let geometry = self.geometry()?;

        if self.chunk_states.len() != self.chunk_count {
            return Err(Error::InvalidConfig(format!(
                "{} chunk states recorded for {} chunks",
                self.chunk_states.len(),
                self.chunk_count
            )));
        }
        if self.pool_size < 2 || self.pool_size % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "pool_size must be even and >= 2, got {}",
                self.pool_size
            )));
        }
        if self.max_transfer == 0 || self.max_transfer % BLOCK_SIZE != 0 {
            return Err(Error::InvalidConfig(format!(
                "max_transfer must be a non-zero multiple of {BLOCK_SIZE}, got {}",
                self.max_transfer
            )));
        }

        // Worst case: a write splits each row at its segment edges into up to
        // two parity extents per strip, each folding in every other chunk.
        let strips = self.max_transfer.div_ceil(geometry.strip_size() as usize) + 1;
        let worst = 2 * strips * self.chunk_count;
        if worst > MAX_SUBOPS_PER_UNIT {
            return Err(Error::InvalidConfig(format!(
                "max_transfer {} needs up to {worst} sub-operations per request (limit {})",
                self.max_transfer, MAX_SUBOPS_PER_UNIT
            )));
        }
        Ok(())
    }

    /// Layout derived from this configuration.
    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(
            self.level,
            self.chunk_count,
            self.strip_size,
            self.chunk_size,
            self.data_offset_blocks,
        )
    }

    /// Copy of this configuration carrying the current chunk states.
    ///
    /// Take it under the same lock that guards `health` so the sequence
    /// numbers follow the order of the changes.
    pub fn snapshot(&self, health: &HealthTable) -> Self {
        Self {
            chunk_states: health.chunks().to_vec(),
            sequence: health.sequence(),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Load and validate a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config() -> VolumeConfig {
        VolumeConfig::new("vol0", RaidLevel::Raid5, 4, 4096, 1 << 20)
    }

    #[test]
    fn test_new_config_is_valid() {
        let c = config();
        assert!(c.validate().is_ok());
        assert_eq!(c.chunk_states, vec![ChunkState::Online; 4]);
        assert_eq!(c.data_offset_blocks, DEFAULT_DATA_OFFSET_BLOCKS);
        assert_eq!(c.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn test_validation_errors() {
        assert_matches!(
            config().with_pool_size(7).validate(),
            Err(Error::InvalidConfig(_))
        );
        assert_matches!(
            config().with_max_transfer(1000).validate(),
            Err(Error::InvalidConfig(_))
        );

        let mut c = config();
        c.chunk_states.pop();
        assert_matches!(c.validate(), Err(Error::InvalidConfig(_)));

        let c = VolumeConfig::new("bad", RaidLevel::Raid4, 2, 4096, 8192);
        assert_matches!(c.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_subop_bound_is_enforced() {
        let c = VolumeConfig::new("wide", RaidLevel::Raid5, 16, 512, 1 << 20)
            .with_max_transfer(1 << 20);
        assert_matches!(c.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_snapshot_keeps_identity() {
        let c = config();
        let mut health = HealthTable::new(c.chunk_states.clone()).with_sequence(c.sequence);
        health.set_chunk(2, ChunkState::Offline);
        let snap = c.snapshot(&health);
        assert_eq!(snap.id, c.id);
        assert_eq!(snap.chunk_states[2], ChunkState::Offline);
        assert!(snap.sequence > c.sequence);
        assert!(snap.updated_at >= c.updated_at);
    }

    #[test]
    fn test_json_format() {
        let c = config();
        let json = String::from_utf8(c.to_json().unwrap()).unwrap();
        assert!(json.contains("\"level\": \"raid5\""));
        assert!(json.contains("\"chunkStates\""));
        assert!(json.contains("\"online\""));

        let back: VolumeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_defaults_applied_on_load() {
        let json = format!(
            r#"{{"id":"{}","name":"v","level":"raid4","chunkCount":3,"stripSize":512,
                "chunkSize":4096,"chunkStates":["online","offline","online"],
                "updatedAt":"2024-01-01T00:00:00Z"}}"#,
            Uuid::new_v4()
        );
        let c: VolumeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(c.max_transfer, DEFAULT_MAX_TRANSFER);
        assert_eq!(c.chunk_states[1], ChunkState::Offline);
        assert_eq!(c.sequence, 0);
        assert!(c.validate().is_ok());
    }
}
