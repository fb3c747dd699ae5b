//! Zero-copy buffer pool.
//!
//! Oversized payloads are staged in pool-accounted buffers so the send
//! path can hand them to the wire without an intermediate copy. The pool
//! bounds total outstanding bytes per connection; allocation past the
//! bound fails with `NoMemory` rather than growing without limit.

use ipc_core::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default per-connection bound on outstanding zero-copy bytes.
pub const DEFAULT_POOL_BYTES: usize = 1 << 20;

#[derive(Debug)]
pub(crate) struct ZcbPool {
    allocated: AtomicUsize,
    limit: usize,
}

impl ZcbPool {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            allocated: AtomicUsize::new(0),
            limit,
        })
    }

    /// Total bytes currently allocated out of this pool.
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub(crate) fn alloc(self: &Arc<Self>, size: usize) -> Result<ZcbBuffer, ErrorKind> {
        if size == 0 {
            return Err(ErrorKind::InvalidParam);
        }
        let before = self.allocated.fetch_add(size, Ordering::SeqCst);
        if before + size > self.limit {
            self.allocated.fetch_sub(size, Ordering::SeqCst);
            return Err(ErrorKind::NoMemory);
        }
        Ok(ZcbBuffer {
            data: vec![0u8; size],
            pool: Arc::clone(self),
        })
    }

    pub(crate) fn owns(self: &Arc<Self>, buffer: &ZcbBuffer) -> bool {
        Arc::ptr_eq(self, &buffer.pool)
    }
}

/// A pool-accounted payload buffer.
///
/// Dropping the buffer returns its bytes to the pool, so an alloc
/// followed immediately by a free leaves the pool's allocated-byte count
/// unchanged.
#[derive(Debug)]
pub struct ZcbBuffer {
    data: Vec<u8>,
    pool: Arc<ZcbPool>,
}

impl ZcbBuffer {
    /// Buffer size fixed at allocation.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; zero-sized allocations are rejected.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for ZcbBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ZcbBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for ZcbBuffer {
    fn drop(&mut self) {
        self.pool.allocated.fetch_sub(self.data.len(), Ordering::SeqCst);
    }
}
