//! Fixed-depth byte buffer pool shared by the capture and render threads

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;

struct PoolInner {
    free: ArrayQueue<Vec<u8>>,
    allocations: CachePadded<AtomicUsize>,
}

/// Reuses frame buffers across pipeline passes.
///
/// Depth is the number of buffers that can be alive at once in steady state:
/// one being normalized, one being filtered, one in the exchange slot and one
/// held by the presenter.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(depth.max(1)),
                allocations: CachePadded::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Lease a buffer of exactly `len` bytes. Contents of a reused buffer are
    /// stale; callers overwrite every byte.
    ///
    /// Never blocks: an empty pool allocates a fresh buffer instead.
    pub fn acquire(&self, len: usize) -> PooledBuffer {
        let buf = match self.inner.free.pop() {
            Some(mut buf) => {
                buf.resize(len, 0);
                buf
            }
            None => {
                self.inner.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0; len]
            }
        };

        PooledBuffer {
            buf,
            home: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Buffers allocated because the pool was empty.
    pub fn allocations(&self) -> usize {
        self.inner.allocations.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn depth(&self) -> usize {
        self.inner.free.capacity()
    }
}

/// Byte buffer that returns to its pool when dropped
pub struct PooledBuffer {
    buf: Vec<u8>,
    home: Option<Weak<PoolInner>>,
}

impl PooledBuffer {
    /// Buffer owned outside any pool.
    pub fn detached(buf: Vec<u8>) -> Self {
        Self { buf, home: None }
    }
}

impl From<Vec<u8>> for PooledBuffer {
    fn from(buf: Vec<u8>) -> Self {
        Self::detached(buf)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        Self::detached(self.buf.clone())
    }
}

impl PartialEq for PooledBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf
    }
}

impl Eq for PooledBuffer {}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.home.take().and_then(|home| home.upgrade()) {
            // Full pool: the buffer is simply freed.
            let _ = pool.free.push(std::mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_stops_allocating() {
        let pool = FramePool::new(2);

        for _ in 0..10 {
            let a = pool.acquire(64);
            let b = pool.acquire(64);
            assert_eq!(a.len(), 64);
            drop((a, b));
        }

        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn overflow_buffers_are_dropped() {
        let pool = FramePool::new(1);
        let a = pool.acquire(8);
        let b = pool.acquire(8);
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn reused_buffer_is_resized() {
        let pool = FramePool::new(1);
        drop(pool.acquire(16));
        let buf = pool.acquire(4);
        assert_eq!(buf.len(), 4);
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn clone_is_detached() {
        let pool = FramePool::new(2);
        let a = pool.acquire(4);
        let b = a.clone();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }
}
