//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │              ChunkIo        │        ConfigStore            │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ MemoryChunkStore │ FileChunkStore                          │ │
//! │  │ JsonConfigStore  │ MemoryConfigStore                       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use raidp::adapters::{FileChunkStore, JsonConfigStore};
//!
//! let chunks = Arc::new(FileChunkStore::open(&dir, 4, geometry.chunk_device_size())?);
//! let store = Arc::new(JsonConfigStore::spawn(dir.join("volume.json")));
//! let volume = Volume::attach(config, chunks, store.clone())?;
//! ```

mod config_store;
#[cfg(unix)]
mod file;
mod memory;

pub use config_store::{JsonConfigStore, MemoryConfigStore};
#[cfg(unix)]
pub use file::FileChunkStore;
pub use memory::{CompletionMode, MemoryChunkStore};
