//! Object header word
//!
//! Every heap object starts with a one-word header. The low bits are GC
//! flags, the middle bits index the object's type descriptor, and on targets
//! that keep identity hashes in the header the top bits hold the hash.
//!
//! Layout of the 64-bit word:
//! ```text
//! ┌───────────────┬──────────────────────┬───────┐
//! │ identity hash │ hub index            │ flags │
//! │ bits 63..34   │ bits 33..2           │ 1..0  │
//! └───────────────┴──────────────────────┴───────┘
//! ```

/// GC mark bit
const MARK_BIT: u64 = 0b01;

/// Forwarding/remembered bit, reserved for the collector
const REMEMBERED_BIT: u64 = 0b10;

const FLAG_BITS: u64 = MARK_BIT | REMEMBERED_BIT;

const HUB_INDEX_SHIFT: u32 = 2;
const HUB_INDEX_BITS: u32 = 32;
const HUB_INDEX_MASK: u64 = ((1u64 << HUB_INDEX_BITS) - 1) << HUB_INDEX_SHIFT;

const HASH_SHIFT: u32 = HUB_INDEX_SHIFT + HUB_INDEX_BITS;
const HASH_BITS: u32 = 30;
const HASH_MASK: u64 = ((1u64 << HASH_BITS) - 1) << HASH_SHIFT;

/// One-word object header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ObjectHeader(u64);

impl ObjectHeader {
    /// Create a header for an object of the given type, unmarked, hash 0
    #[inline]
    pub fn new(hub_index: u32) -> Self {
        Self((hub_index as u64) << HUB_INDEX_SHIFT)
    }

    /// Raw header word
    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Reconstruct a header from a raw word
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Index of the object's type descriptor
    #[inline]
    pub fn hub_index(self) -> u32 {
        ((self.0 & HUB_INDEX_MASK) >> HUB_INDEX_SHIFT) as u32
    }

    /// Whether the GC mark bit is set
    #[inline]
    pub fn is_marked(self) -> bool {
        self.0 & MARK_BIT != 0
    }

    /// Set the GC mark bit, leaving the hub index and hash untouched
    #[inline]
    pub fn marked(self) -> Self {
        Self(self.0 | MARK_BIT)
    }

    /// Clear the GC mark bit
    #[inline]
    pub fn unmarked(self) -> Self {
        Self(self.0 & !MARK_BIT)
    }

    /// Identity hash stored in the header (in-header placement only)
    #[inline]
    pub fn identity_hash(self) -> u32 {
        ((self.0 & HASH_MASK) >> HASH_SHIFT) as u32
    }

    /// Store an identity hash in the header (truncated to 30 bits)
    #[inline]
    pub fn with_identity_hash(self, hash: u32) -> Self {
        let hash = (hash as u64) & ((1u64 << HASH_BITS) - 1);
        Self((self.0 & !HASH_MASK) | (hash << HASH_SHIFT))
    }

    /// Flag bits reserved for the collector
    #[inline]
    pub fn flags(self) -> u64 {
        self.0 & FLAG_BITS
    }
}

/// Read the header word at the start of an object
///
/// # Safety
///
/// `object` must point at a live, published object whose first word is the
/// header.
#[inline]
pub unsafe fn header_of(object: *const u8) -> ObjectHeader {
    ObjectHeader(std::ptr::read(object as *const u64))
}

/// Read the hub index directly from an object pointer
///
/// # Safety
///
/// Same contract as [`header_of`].
#[inline]
pub unsafe fn hub_index_of(object: *const u8) -> u32 {
    header_of(object).hub_index()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = ObjectHeader::new(0xDEAD_BEEF);
        assert_eq!(header.hub_index(), 0xDEAD_BEEF);
        assert!(!header.is_marked());
        assert_eq!(header.identity_hash(), 0);
    }

    #[test]
    fn test_mark_preserves_hub_index() {
        let header = ObjectHeader::new(42).with_identity_hash(0x1234_5678 & 0x3FFF_FFFF);
        let marked = header.marked();
        assert!(marked.is_marked());
        assert_eq!(marked.hub_index(), 42);
        assert_eq!(marked.identity_hash(), header.identity_hash());
        let unmarked = marked.unmarked();
        assert_eq!(unmarked, header);
    }

    #[test]
    fn test_identity_hash_truncates_to_30_bits() {
        let header = ObjectHeader::new(7).with_identity_hash(u32::MAX);
        assert_eq!(header.identity_hash(), (1 << 30) - 1);
        assert_eq!(header.hub_index(), 7);
    }

    #[test]
    fn test_header_of_reads_first_word() {
        let word = ObjectHeader::new(99).marked().bits();
        let storage = [word, 0u64];
        let header = unsafe { header_of(storage.as_ptr() as *const u8) };
        assert_eq!(header.hub_index(), 99);
        assert!(header.is_marked());
        assert_eq!(unsafe { hub_index_of(storage.as_ptr() as *const u8) }, 99);
    }

    #[test]
    fn test_header_is_one_word() {
        assert_eq!(std::mem::size_of::<ObjectHeader>(), 8);
    }
}
