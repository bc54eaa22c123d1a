//! Pooled packet buffers for the forwarding hot path.
//!
//! Every forwarding loop checks out one buffer per packet and hands it back
//! when the guard drops, so steady-state forwarding does not allocate.
//! Buffers are sized to hold the largest frame the datagram codec can
//! describe (a 16-bit payload length plus the longest header), which means a
//! read into a pooled buffer can never truncate a well-formed frame.

use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

/// Largest payload a single datagram frame can carry (16-bit length field).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Longest datagram header: type + domain length + 255-byte host + port + length.
pub const MAX_HEADER_SIZE: usize = 1 + 1 + 255 + 2 + 2;

/// Size of every pooled buffer.
pub const BUFFER_SIZE: usize = MAX_PAYLOAD_SIZE + MAX_HEADER_SIZE;

/// Buffers kept around when idle.
const POOL_CAPACITY: usize = 128;

/// Fixed-size buffer pool backed by a lock-free queue.
pub struct BufferPool {
    queue: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool holding at most `capacity` idle buffers of `buffer_size` bytes.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            buffer_size,
        }
    }

    /// Process-wide pool used by the codec and the forwarding loops.
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(|| BufferPool::new(POOL_CAPACITY, BUFFER_SIZE))
    }

    /// Check out a buffer. Allocates only when the pool is empty.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .queue
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Size of each buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.queue.len()
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.buffer_size {
            return;
        }
        // A full queue just drops the extra buffer.
        let _ = self.queue.push(buf);
    }
}

/// RAII guard over a pooled buffer; returns it to the pool on drop.
pub struct PooledBuffer<'a> {
    buf: Option<Vec<u8>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = BufferPool::new(4, 1500);
        assert_eq!(pool.idle(), 0);
        {
            let mut buf = pool.get();
            assert_eq!(buf.len(), 1500);
            buf[0] = 0x45;
        }
        assert_eq!(pool.idle(), 1);
        let _a = pool.get();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_capacity_bounded() {
        let pool = BufferPool::new(2, 64);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_global_buffer_fits_largest_frame() {
        let pool = BufferPool::global();
        assert!(pool.buffer_size() >= MAX_PAYLOAD_SIZE + MAX_HEADER_SIZE);
        assert_eq!(pool.get().len(), BUFFER_SIZE);
    }
}
