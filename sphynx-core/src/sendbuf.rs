//! Send-buffer allocator: cache-line-aligned buffers with a fixed prefix region reserved for
//! the kernel's I/O completion metadata, so a buffer handed to the allocator can be submitted
//! straight to the OS send call without a copy.
//!
//! The returned data pointer is carved out of the middle of one allocation — a fixed number of
//! bytes of opaque header precede it — so `acquire`/`release`/`resize` can convert back to the
//! owning allocation without a second structure: payload region plus opaque prefix reserved for
//! the transport, expressed as one allocation with a known offset via `std::alloc` (this crate
//! targets a portable UDP socket, not a Windows IOCP `OVERLAPPED` struct), with a free-list pool
//! to amortize the allocator call.

use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, realloc, Layout};
use std::ptr::NonNull;

/// Cache-line alignment for the whole allocation.
pub const ALIGNMENT: usize = 64;

/// Bytes reserved ahead of the data pointer for the kernel's I/O completion structure plus the
/// 16-bit relative offset; the encryption trailer's own "TempSendNode reuse
/// trick" (see `connection.rs`) draws on the tail of this same region.
pub const PREFIX_BYTES: usize = 16;

/// One allocation: `PREFIX_BYTES` of opaque header, followed by `capacity` data bytes. Only
/// `data_len` of those data bytes are considered populated.
pub struct SendBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    data_len: usize,
}

unsafe impl Send for SendBuffer {}

impl SendBuffer {
    fn layout_for(capacity: usize) -> Layout {
        Layout::from_size_align(PREFIX_BYTES + capacity, ALIGNMENT).expect("buffer size overflow")
    }

    fn alloc_raw(capacity: usize) -> SendBuffer {
        let layout = Self::layout_for(capacity);
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        SendBuffer {
            ptr,
            capacity,
            data_len: 0,
        }
    }

    /// The prefix region: I/O completion metadata storage, opaque to callers of this module.
    #[inline]
    pub fn prefix_mut(&mut self) -> &mut [u8; PREFIX_BYTES] {
        unsafe { &mut *(self.ptr.as_ptr() as *mut [u8; PREFIX_BYTES]) }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(PREFIX_BYTES) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.data_len) }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), self.data_len) }
    }

    /// Copy `bytes` in and mark the buffer as holding exactly that much data. Caller must have
    /// `Acquire`d at least `bytes.len()` capacity.
    pub fn fill(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.capacity);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr(), bytes.len());
        }
        self.data_len = bytes.len();
    }

    /// Grow or shrink the data region in place, reallocating (and moving the prefix along with
    /// it) if the new size exceeds the current allocation. Callers never hold a raw pointer
    /// across the call, so growing in place or moving to a new allocation is invisible to them.
    pub fn resize(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            self.data_len = self.data_len.min(new_capacity);
            return;
        }
        let old_layout = Self::layout_for(self.capacity);
        let new_layout = Self::layout_for(new_capacity);
        let new_ptr = unsafe { realloc(self.ptr.as_ptr(), old_layout, new_layout.size()) };
        self.ptr = NonNull::new(new_ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(new_layout));
        self.capacity = new_capacity;
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        let layout = Self::layout_for(self.capacity);
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// Free-list pool keyed by a single bucket (buffers are reused regardless of their exact
/// capacity, as long as it's big enough — the common case is the MTU-sized datagram buffer, so
/// in practice every pooled buffer ends up the same size). Thread-safe: `Acquire`/`Release` are
/// called from both the per-connection worker (building a datagram) and the dispatcher thread
/// (recycling after a send completes).
pub struct SendBufferPool {
    free: Mutex<Vec<SendBuffer>>,
}

impl SendBufferPool {
    pub fn new() -> SendBufferPool {
        SendBufferPool { free: Mutex::new(Vec::new()) }
    }

    /// Acquire a buffer with at least `data_bytes` of capacity, reusing a pooled allocation when
    /// one is big enough.
    pub fn acquire(&self, data_bytes: usize) -> SendBuffer {
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().position(|b| b.capacity() >= data_bytes) {
            let mut buf = free.swap_remove(pos);
            buf.data_len = data_bytes;
            return buf;
        }
        drop(free);
        let mut buf = SendBuffer::alloc_raw(data_bytes.max(64));
        buf.data_len = data_bytes;
        buf
    }

    /// Return a buffer to the pool for reuse. Bounded to avoid unbounded growth under bursty
    /// traffic; buffers beyond the cap are simply dropped (freed).
    pub fn release(&self, mut buf: SendBuffer) {
        buf.data_len = 0;
        let mut free = self.free.lock();
        if free.len() < 4096 {
            free.push(buf);
        }
    }
}

impl Default for SendBufferPool {
    fn default() -> SendBufferPool {
        SendBufferPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_fill_roundtrip() {
        let pool = SendBufferPool::new();
        let mut buf = pool.acquire(11);
        buf.fill(b"hello world");
        assert_eq!(buf.data(), b"hello world");
    }

    #[test]
    fn prefix_is_writable_and_does_not_alias_data() {
        let pool = SendBufferPool::new();
        let mut buf = pool.acquire(4);
        buf.fill(&[1, 2, 3, 4]);
        buf.prefix_mut()[0] = 0xaa;
        assert_eq!(buf.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn released_buffer_is_reused() {
        let pool = SendBufferPool::new();
        let buf = pool.acquire(128);
        let cap = buf.capacity();
        pool.release(buf);
        let buf2 = pool.acquire(64);
        assert_eq!(buf2.capacity(), cap);
    }

    #[test]
    fn resize_grows_capacity_and_preserves_prefix_region() {
        let pool = SendBufferPool::new();
        let mut buf = pool.acquire(4);
        buf.fill(&[9, 9, 9, 9]);
        buf.prefix_mut()[0] = 0x42;
        buf.resize(256);
        assert!(buf.capacity() >= 256);
        assert_eq!(buf.prefix_mut()[0], 0x42);
    }

    #[test]
    fn alignment_is_cache_line() {
        let pool = SendBufferPool::new();
        let buf = pool.acquire(100);
        let addr = buf.ptr.as_ptr() as usize;
        assert_eq!(addr % ALIGNMENT, 0);
    }
}
