//! Work-unit pool
//!
//! Bounds the number of work units alive at once. A read holds one permit,
//! a write holds two (read/XOR half and write half), so a volume accepts
//! `capacity / 2` concurrent requests in the worst case.
//!
//! Acquisition never waits: an exhausted pool is reported to the caller as
//! [`Error::ResourceExhausted`].

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{Error, Result};

/// Fixed-capacity pool of work-unit slots.
#[derive(Debug)]
pub struct WorkUnitPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkUnitPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take one slot, failing immediately if none is free.
    pub fn acquire(&self) -> Result<PoolPermit> {
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|e| self.exhausted(1, e))?;
        Ok(PoolPermit { permit })
    }

    /// Take `count` slots atomically: either all of them or none.
    ///
    /// Each slot comes back as its own permit so the halves of a write can
    /// release theirs independently.
    pub fn acquire_many(&self, count: usize) -> Result<Vec<PoolPermit>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let n = u32::try_from(count).map_err(|_| Error::ResourceExhausted {
            resource: format!("work unit pool ({count} slots requested)"),
        })?;
        let mut permit = Arc::clone(&self.semaphore)
            .try_acquire_many_owned(n)
            .map_err(|e| self.exhausted(count, e))?;

        let mut permits = Vec::with_capacity(count);
        while permit.num_permits() > 1 {
            match permit.split(1) {
                Some(one) => permits.push(PoolPermit { permit: one }),
                None => break,
            }
        }
        permits.push(PoolPermit { permit });
        Ok(permits)
    }

    fn exhausted(&self, requested: usize, err: TryAcquireError) -> Error {
        Error::ResourceExhausted {
            resource: format!(
                "work unit pool ({} of {} in use, {} requested): {}",
                self.in_use(),
                self.capacity,
                requested,
                err
            ),
        }
    }
}

/// One work-unit slot. Returned to the pool when dropped.
#[derive(Debug)]
pub struct PoolPermit {
    permit: OwnedSemaphorePermit,
}

impl PoolPermit {
    /// Return the slot to the pool.
    pub fn release(self) {
        drop(self.permit)
    }
}
