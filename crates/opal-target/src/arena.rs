//! Non-moving metadata arena
//!
//! Type descriptors and reference-map bytes live outside the garbage-collected
//! heap, in memory that is never moved and never reclaimed. The arena hands
//! out zeroed, aligned slots whose addresses stay valid for as long as the
//! arena exists.

use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Default chunk size; allocations larger than this get a dedicated chunk
const CHUNK_SIZE: usize = 64 * 1024;

/// Alignment of every chunk base address
const CHUNK_ALIGN: usize = 16;

/// One contiguous block of arena memory
struct Chunk {
    base: NonNull<u8>,
    layout: Layout,
    used: usize,
}

impl Chunk {
    fn new(size: usize) -> Self {
        // Chunks are zeroed up front so slots never need clearing.
        let layout = Layout::from_size_align(size, CHUNK_ALIGN)
            .unwrap_or_else(|_| panic!("invalid arena chunk size {}", size));
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| panic!("arena chunk allocation failed"));
        Self {
            base,
            layout,
            used: 0,
        }
    }

    /// Bytes still available after aligning the cursor to `align`
    fn remaining(&self, align: usize) -> usize {
        let aligned = (self.used + align - 1) & !(align - 1);
        self.layout.size().saturating_sub(aligned)
    }

    /// Carve an aligned slot out of this chunk; caller checked it fits
    fn bump(&mut self, size: usize, align: usize) -> NonNull<u8> {
        let aligned = (self.used + align - 1) & !(align - 1);
        debug_assert!(aligned + size <= self.layout.size());
        self.used = aligned + size;
        // Chunk bases are CHUNK_ALIGN-aligned, so base + aligned is aligned.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(aligned)) }
    }
}

struct ArenaInner {
    chunks: Vec<Chunk>,
    allocated: usize,
}

/// Chunked bump allocator with stable addresses
///
/// Thread-safe; allocation takes a short internal lock. Individual slots are
/// never freed; the whole arena is released only when dropped, which in a
/// running image means never.
pub struct StableArena {
    inner: Mutex<ArenaInner>,
}

impl StableArena {
    /// Create an empty arena; the first allocation grabs the first chunk
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                chunks: Vec::new(),
                allocated: 0,
            }),
        }
    }

    /// Allocate a zeroed slot for `layout`
    ///
    /// The returned pointer is aligned to `layout.align()` and stays valid
    /// for the lifetime of the arena.
    ///
    /// # Panics
    ///
    /// Panics if the underlying allocation fails or the requested alignment
    /// exceeds the chunk alignment for a chunk-sized request.
    pub fn alloc_zeroed(&self, layout: Layout) -> NonNull<u8> {
        let size = layout.size().max(1);
        let align = layout.align();
        assert!(
            align <= CHUNK_ALIGN,
            "arena alignment {} exceeds chunk alignment",
            align
        );
        let mut inner = self.inner.lock();
        inner.allocated += size;

        if size + align > CHUNK_SIZE {
            // Oversized request: dedicated chunk, inserted behind the
            // current tail so the tail keeps filling up.
            let mut chunk = Chunk::new(size + align);
            let ptr = chunk.bump(size, align);
            let at = inner.chunks.len().saturating_sub(1);
            inner.chunks.insert(at, chunk);
            return ptr;
        }

        match inner.chunks.last_mut() {
            Some(chunk) if chunk.remaining(align) >= size => chunk.bump(size, align),
            _ => {
                let mut chunk = Chunk::new(CHUNK_SIZE);
                let ptr = chunk.bump(size, align);
                inner.chunks.push(chunk);
                ptr
            }
        }
    }

    /// Total bytes handed out so far (excluding chunk slack)
    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().allocated
    }
}

impl Default for StableArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StableArena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for chunk in &inner.chunks {
            unsafe { dealloc(chunk.base.as_ptr(), chunk.layout) };
        }
    }
}

// The arena only hands out raw memory; the pointers it stores are owned
// exclusively by it and freed exactly once.
unsafe impl Send for StableArena {}
unsafe impl Sync for StableArena {}
