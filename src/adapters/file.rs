//! File-backed chunk devices
//!
//! One image file per chunk (`chunk<N>.img`) in a volume directory.
//! Transfers run on the runtime's blocking pool with positioned I/O, so any
//! number can be in flight and completions arrive from pool threads.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::domain::{
    ChunkIo, ChunkIoCompletion, ChunkIoRequest, IoDirection, IoDone, IoFault, IoHandle,
};
use crate::error::{Error, Result};
use crate::raid::geometry::BLOCK_SHIFT;

/// Chunk devices stored as image files.
#[derive(Debug)]
pub struct FileChunkStore {
    files: Vec<Arc<File>>,
    runtime: Handle,
    next_handle: AtomicU64,
}

impl FileChunkStore {
    /// Path of chunk `index` inside `dir`.
    pub fn chunk_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("chunk{index}.img"))
    }

    /// Open (creating if needed) `count` chunk images of `size` bytes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(dir: impl AsRef<Path>, count: usize, size: u64) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut files = Vec::with_capacity(count);
        for index in 0..count {
            let path = Self::chunk_path(dir, index);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            if file.metadata()?.len() < size {
                file.set_len(size)?;
            }
            debug!(path = %path.display(), size, "opened chunk image");
            files.push(Arc::new(file));
        }

        Ok(Self {
            files,
            runtime: Handle::try_current()
                .map_err(|e| Error::Internal(format!("no tokio runtime: {e}")))?,
            next_handle: AtomicU64::new(0),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.files.len()
    }
}

fn transfer(file: &File, direction: IoDirection, offset: u64, buffer: &mut [u8]) -> std::io::Result<()> {
    match direction {
        IoDirection::Read => file.read_exact_at(buffer, offset),
        IoDirection::Write => file.write_all_at(buffer, offset),
    }
}

impl ChunkIo for FileChunkStore {
    fn submit(&self, request: ChunkIoRequest, done: IoDone) -> IoHandle {
        let handle = IoHandle(self.next_handle.fetch_add(1, Ordering::AcqRel));
        let ChunkIoRequest {
            chunk,
            direction,
            block,
            mut buffer,
        } = request;

        let Some(file) = self.files.get(chunk).cloned() else {
            done(ChunkIoCompletion {
                buffer,
                result: Err(IoFault::OutOfRange { chunk, block }),
            });
            return handle;
        };

        self.runtime.spawn_blocking(move || {
            let offset = block << BLOCK_SHIFT;
            let result = transfer(&file, direction, offset, &mut buffer)
                .map(|_| buffer.len())
                .map_err(|e| IoFault::Device(format!("chunk {chunk}: {e}")));
            trace!(chunk, %direction, block, ok = result.is_ok(), "file transfer");
            done(ChunkIoCompletion { buffer, result });
        });
        handle
    }
}
