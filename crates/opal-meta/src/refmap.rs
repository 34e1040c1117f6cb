//! Deduplicated GC reference maps
//!
//! A reference map lists the reference-carrying word positions of an
//! instance. Unrelated types frequently share identical maps (a subclass
//! adding only primitive fields reuses its parent's), so each descriptor
//! stores only a compressed offset into one shared, content-addressed table.
//!
//! Encoded entry format: ULEB128 word count, then one ULEB128 delta per
//! word (first delta is the first word index, later deltas are gaps).
//! The empty map is pre-interned at offset 0.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::alloc::Layout;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use opal_target::StableArena;

/// Bytes per table chunk; one encoded map never spans chunks
const CHUNK_SIZE: u32 = 64 * 1024;

/// Upper bound on table chunks (64 MiB of encoded maps)
const MAX_CHUNKS: usize = 1024;

/// Offset of the pre-interned empty map
pub const EMPTY_REF_MAP: u32 = 0;

/// Collects the reference-carrying word indexes of one type
#[derive(Debug, Default)]
pub struct RefMapBuilder {
    words: Vec<u32>,
}

impl RefMapBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reference at word index `word`
    pub fn add_word(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Whether no reference words have been recorded
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Sorted, deduplicated word indexes
    pub fn into_words(mut self) -> Vec<u32> {
        self.words.sort_unstable();
        self.words.dedup();
        self.words
    }
}

/// Encode sorted word indexes into the compact byte format
fn encode_words(words: &[u32]) -> Vec<u8> {
    debug_assert!(words.windows(2).all(|w| w[0] < w[1]));
    let mut bytes = Vec::with_capacity(1 + words.len() * 2);
    write_uleb(&mut bytes, words.len() as u32);
    let mut prev = 0u32;
    for &word in words {
        write_uleb(&mut bytes, word - prev);
        prev = word;
    }
    bytes
}

fn write_uleb(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

struct TableInner {
    /// Exact encoded bytes -> table offset
    dedup: FxHashMap<Box<[u8]>, u32>,

    /// Next free byte position, in the global offset space
    cursor: u32,

    /// Number of chunks allocated so far
    chunk_count: usize,
}

/// Shared, append-only table of encoded reference maps
///
/// Writers hold the internal lock only across encode/compare/insert.
/// Readers (the GC scan loop) go through atomic chunk pointers and never
/// take the lock; published offsets always point at fully written bytes.
pub struct ReferenceMapRegistry {
    arena: Arc<StableArena>,
    chunks: Box<[AtomicPtr<u8>]>,
    inner: Mutex<TableInner>,
}

impl ReferenceMapRegistry {
    /// Create a registry backed by the given arena
    pub fn new(arena: Arc<StableArena>) -> Self {
        let chunks: Box<[AtomicPtr<u8>]> = (0..MAX_CHUNKS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        let registry = Self {
            arena,
            chunks,
            inner: Mutex::new(TableInner {
                dedup: FxHashMap::default(),
                cursor: 0,
                chunk_count: 0,
            }),
        };
        let offset = registry.intern(&encode_words(&[]));
        debug_assert_eq!(offset, EMPTY_REF_MAP);
        registry
    }

    /// Offset of the empty reference map
    #[inline]
    pub fn empty_offset(&self) -> u32 {
        EMPTY_REF_MAP
    }

    /// Obtain the table offset for a type's reference map
    ///
    /// `own_words` are the word indexes of the type's own declared
    /// reference fields; `parent_offset` is the supertype's map. A type
    /// adding no reference words reuses the parent offset unchanged.
    pub fn offset_for(&self, own_words: &[u32], parent_offset: u32) -> u32 {
        if own_words.is_empty() {
            return parent_offset;
        }
        let mut builder = RefMapBuilder::new();
        for word in self.decode(parent_offset) {
            builder.add_word(word);
        }
        for &word in own_words {
            builder.add_word(word);
        }
        self.intern(&encode_words(&builder.into_words()))
    }

    /// Intern encoded bytes, returning the existing offset on a content hit
    fn intern(&self, bytes: &[u8]) -> u32 {
        assert!(
            bytes.len() <= CHUNK_SIZE as usize,
            "encoded reference map exceeds the table chunk size"
        );
        let mut inner = self.inner.lock();
        if let Some(&offset) = inner.dedup.get(bytes) {
            return offset;
        }

        let len = bytes.len() as u32;
        let mut offset = inner.cursor;
        if offset % CHUNK_SIZE + len > CHUNK_SIZE {
            // Entry would span a chunk boundary; waste the tail.
            offset = (offset / CHUNK_SIZE + 1) * CHUNK_SIZE;
        }
        let chunk_index = (offset / CHUNK_SIZE) as usize;
        assert!(chunk_index < MAX_CHUNKS, "reference map table exhausted");
        while inner.chunk_count <= chunk_index {
            let layout = Layout::from_size_align(CHUNK_SIZE as usize, 8)
                .unwrap_or_else(|_| panic!("invalid reference map chunk layout"));
            let ptr = self.arena.alloc_zeroed(layout);
            self.chunks[inner.chunk_count].store(ptr.as_ptr(), Ordering::Release);
            inner.chunk_count += 1;
        }

        let chunk = self.chunks[chunk_index].load(Ordering::Relaxed);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                chunk.add((offset % CHUNK_SIZE) as usize),
                bytes.len(),
            );
        }
        inner.cursor = offset + len;
        inner.dedup.insert(bytes.into(), offset);
        offset
    }

    /// Decode the map at `offset` into an iterator of word indexes
    ///
    /// Used by the GC's per-object scan loop and by the union step when a
    /// subtype extends its parent's map.
    pub fn decode(&self, offset: u32) -> RefMapIter<'_> {
        let chunk = self.chunks[(offset / CHUNK_SIZE) as usize].load(Ordering::Acquire);
        assert!(!chunk.is_null(), "reference map offset {} out of range", offset);
        let entry = unsafe { chunk.add((offset % CHUNK_SIZE) as usize) };
        let mut pos = 0usize;
        let count = unsafe { read_uleb(entry, &mut pos) };
        RefMapIter {
            data: entry,
            pos,
            remaining: count,
            acc: 0,
            _registry: PhantomData,
        }
    }

    /// Number of distinct maps interned so far
    pub fn distinct_maps(&self) -> usize {
        self.inner.lock().dedup.len()
    }
}

/// Read one ULEB128 value, advancing `pos`
///
/// # Safety
///
/// `entry` must point at a fully written encoded map containing the value.
unsafe fn read_uleb(entry: *const u8, pos: &mut usize) -> u32 {
    let mut value = 0u32;
    let mut shift = 0u32;
    loop {
        let byte = *entry.add(*pos);
        *pos += 1;
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

/// Iterator over the word indexes of one encoded reference map
pub struct RefMapIter<'a> {
    data: *const u8,
    pos: usize,
    remaining: u32,
    acc: u32,
    _registry: PhantomData<&'a ReferenceMapRegistry>,
}

impl Iterator for RefMapIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delta = unsafe { read_uleb(self.data, &mut self.pos) };
        self.acc += delta;
        Some(self.acc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for RefMapIter<'_> {}
