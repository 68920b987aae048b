//! In-memory chunk devices
//!
//! Backs every chunk with a byte vector. Used by the test suites; supports
//! fault injection and three completion modes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::trace;

use crate::domain::{
    ChunkIo, ChunkIoCompletion, ChunkIoRequest, IoDirection, IoDone, IoFault, IoHandle,
};
use crate::raid::geometry::{Geometry, BLOCK_SHIFT};

/// How completions are delivered back to the submitter.
#[derive(Debug, Clone, Default)]
pub enum CompletionMode {
    /// Before `submit` returns
    #[default]
    Inline,
    /// From a task on the given runtime
    Spawned(Handle),
    /// Queued until [`MemoryChunkStore::release_held`] is called
    Held,
}

/// Chunk devices held in memory.
pub struct MemoryChunkStore {
    chunks: Vec<RwLock<Vec<u8>>>,
    faulty: Vec<AtomicBool>,
    submissions: Vec<AtomicU64>,
    chunk_len: usize,
    next_handle: AtomicU64,
    mode: CompletionMode,
    held: Mutex<Vec<(IoDone, ChunkIoCompletion)>>,
}

impl MemoryChunkStore {
    /// `count` zero-filled chunks of `chunk_len` bytes each.
    pub fn new(count: usize, chunk_len: usize) -> Self {
        Self {
            chunks: (0..count).map(|_| RwLock::new(vec![0; chunk_len])).collect(),
            faulty: (0..count).map(|_| AtomicBool::new(false)).collect(),
            submissions: (0..count).map(|_| AtomicU64::new(0)).collect(),
            chunk_len,
            next_handle: AtomicU64::new(0),
            mode: CompletionMode::Inline,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Chunks sized for a volume layout, header area included.
    pub fn for_geometry(geometry: &Geometry) -> Self {
        Self::new(
            geometry.chunk_count(),
            geometry.chunk_device_size() as usize,
        )
    }

    pub fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Make every subsequent transfer on `chunk` fail (or stop failing).
    pub fn set_faulty(&self, chunk: usize, faulty: bool) {
        self.faulty[chunk].store(faulty, Ordering::Release);
    }

    pub fn is_faulty(&self, chunk: usize) -> bool {
        self.faulty[chunk].load(Ordering::Acquire)
    }

    /// Raw bytes of a chunk, bypassing the engine.
    pub fn read_raw(&self, chunk: usize, offset: u64, len: usize) -> Vec<u8> {
        let offset = offset as usize;
        self.chunks[chunk].read()[offset..offset + len].to_vec()
    }

    /// Overwrite raw bytes of a chunk, bypassing the engine.
    pub fn write_raw(&self, chunk: usize, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        self.chunks[chunk].write()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Zero a whole chunk, as if the device had been replaced.
    pub fn wipe(&self, chunk: usize) {
        self.chunks[chunk].write().fill(0);
    }

    /// Transfers submitted against `chunk`.
    pub fn submissions(&self, chunk: usize) -> u64 {
        self.submissions[chunk].load(Ordering::Acquire)
    }

    pub fn total_submissions(&self) -> u64 {
        (0..self.chunks.len()).map(|c| self.submissions(c)).sum()
    }

    pub fn reset_submissions(&self) {
        for counter in &self.submissions {
            counter.store(0, Ordering::Release);
        }
    }

    /// Completions waiting in [`CompletionMode::Held`].
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    /// Deliver held completions, including any queued while delivering,
    /// until none are left. Returns how many were delivered.
    pub fn release_held(&self) -> usize {
        let mut delivered = 0;
        loop {
            let batch = std::mem::take(&mut *self.held.lock());
            if batch.is_empty() {
                return delivered;
            }
            for (done, completion) in batch {
                done(completion);
                delivered += 1;
            }
        }
    }

    fn execute(&self, request: &mut ChunkIoRequest) -> Result<usize, IoFault> {
        let chunk = request.chunk;
        let Some(device) = self.chunks.get(chunk) else {
            return Err(IoFault::OutOfRange {
                chunk,
                block: request.block,
            });
        };
        if self.is_faulty(chunk) {
            return Err(IoFault::Device(format!("injected fault on chunk {chunk}")));
        }

        let start = (request.block << BLOCK_SHIFT) as usize;
        let end = start + request.buffer.len();
        if end > self.chunk_len {
            return Err(IoFault::OutOfRange {
                chunk,
                block: request.block,
            });
        }

        match request.direction {
            IoDirection::Read => request.buffer.copy_from_slice(&device.read()[start..end]),
            IoDirection::Write => device.write()[start..end].copy_from_slice(&request.buffer),
        }
        Ok(request.buffer.len())
    }
}

impl std::fmt::Debug for MemoryChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChunkStore")
            .field("chunks", &self.chunks.len())
            .field("chunk_len", &self.chunk_len)
            .field("mode", &self.mode)
            .field("held", &self.held())
            .finish()
    }
}

impl ChunkIo for MemoryChunkStore {
    fn submit(&self, mut request: ChunkIoRequest, done: IoDone) -> IoHandle {
        let handle = IoHandle(self.next_handle.fetch_add(1, Ordering::AcqRel));
        if let Some(counter) = self.submissions.get(request.chunk) {
            counter.fetch_add(1, Ordering::AcqRel);
        }

        let result = self.execute(&mut request);
        trace!(
            chunk = request.chunk,
            direction = %request.direction,
            block = request.block,
            len = request.buffer.len(),
            ok = result.is_ok(),
            "memory transfer"
        );
        let completion = ChunkIoCompletion {
            buffer: request.buffer,
            result,
        };

        match &self.mode {
            CompletionMode::Inline => done(completion),
            CompletionMode::Spawned(runtime) => {
                runtime.spawn(async move { done(completion) });
            }
            CompletionMode::Held => self.held.lock().push((done, completion)),
        }
        handle
    }
}
