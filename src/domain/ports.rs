//! Domain Ports
//!
//! The parity engine sits between a block-device front end and the physical
//! chunk devices. Everything it consumes from its surroundings goes through
//! the traits in this module; adapters provide the implementations.
//!
//! ```text
//!        handle_io()                      persist()
//!   caller ──────────► Volume ───────────────────────► ConfigStore
//!                        │  ▲
//!               submit() │  │ IoDone callback
//!                        ▼  │
//!                       ChunkIo (memory, file, ...)
//! ```

use std::fmt;

use thiserror::Error;

use crate::raid::config::VolumeConfig;

// =============================================================================
// Value Objects
// =============================================================================

/// Direction of a logical request or a physical sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => write!(f, "read"),
            IoDirection::Write => write!(f, "write"),
        }
    }
}

/// Opaque tag returned by [`ChunkIo::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle(pub u64);

/// One physical transfer against one chunk.
///
/// The buffer is moved into the I/O layer and handed back on completion.
/// For writes it holds the payload; for reads its length is the transfer
/// size and the I/O layer fills it in.
#[derive(Debug)]
pub struct ChunkIoRequest {
    pub chunk: usize,
    pub direction: IoDirection,
    /// Physical block address on the chunk device
    pub block: u64,
    pub buffer: Vec<u8>,
}

impl ChunkIoRequest {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Device-level failure reported by the I/O layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoFault {
    #[error("device error: {0}")]
    Device(String),

    #[error("short transfer: expected {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },

    #[error("block {block} out of range for chunk {chunk}")]
    OutOfRange { chunk: usize, block: u64 },
}

/// Completion of a [`ChunkIoRequest`].
#[derive(Debug)]
pub struct ChunkIoCompletion {
    /// The request's buffer, returned to its owner
    pub buffer: Vec<u8>,
    /// Bytes transferred, or the fault
    pub result: std::result::Result<usize, IoFault>,
}

/// Callback invoked exactly once when a submission completes.
pub type IoDone = Box<dyn FnOnce(ChunkIoCompletion) + Send + 'static>;

// =============================================================================
// Ports
// =============================================================================

/// Physical I/O submission layer.
///
/// Completions may be delivered inline, from another thread, or from a
/// runtime task. Timeouts and medium-level retries are the implementor's
/// business; the engine only sees success or failure.
pub trait ChunkIo: Send + Sync {
    fn submit(&self, request: ChunkIoRequest, done: IoDone) -> IoHandle;
}

/// Persistence of volume configuration.
///
/// Fire-and-forget: called after every chunk or volume state change and
/// must not block the caller on the actual write.
pub trait ConfigStore: Send + Sync {
    fn persist(&self, snapshot: VolumeConfig);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_fault_display() {
        let fault = IoFault::Short {
            expected: 4096,
            actual: 512,
        };
        assert_eq!(
            fault.to_string(),
            "short transfer: expected 4096 bytes, got 512"
        );
    }

    #[test]
    fn test_request_len() {
        let req = ChunkIoRequest {
            chunk: 0,
            direction: IoDirection::Read,
            block: 8,
            buffer: vec![0; 1024],
        };
        assert_eq!(req.len(), 1024);
        assert!(!req.is_empty());
    }
}
