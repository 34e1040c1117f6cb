//! Layout encoding
//!
//! One 32-bit word per type lets the allocator and the GC classify any
//! object without a secondary table lookup. The decode predicates run once
//! per object on every GC reference walk, so each one must stay a single
//! mask test or comparison.
//!
//! ```text
//! value 0          unused (never a real type)
//! value 1          primitive
//! value 2          interface
//! value 3          abstract (never instantiated)
//! value > 3        pure instance; the value is the aligned allocation size
//! value < 0        array-like:
//!   bit 31         identity tag bit (always set; makes the word negative)
//!   bit 30         primitive-element bit
//!   bit 29         pure bit (set = plain array, clear = hybrid)
//!   bits 19..8     array base offset (12 bits)
//!   bits  7..0     array index shift (8 bits)
//! ```
//!
//! Hybrid objects are array-like for size and GC purposes but instance-like
//! for language-level predicates; both views decode from the same word.

use crate::error::MetaError;
use opal_target::{align_up, IdentityHashMode, TargetMachine};

const NEUTRAL_VALUE: i32 = 0;
const PRIMITIVE_VALUE: i32 = 1;
const INTERFACE_VALUE: i32 = 2;
const ABSTRACT_VALUE: i32 = 3;
const LAST_SPECIAL_VALUE: i32 = 3;

const TAG_IDENTITY: u32 = 0x8000_0000;
const TAG_PRIMITIVE_ELEMENTS: u32 = 0x4000_0000;
const TAG_PURE: u32 = 0x2000_0000;

const BASE_SHIFT: u32 = 8;
const BASE_MAX: u32 = 0xFFF;
const SHIFT_MAX: u32 = 0xFF;

/// Size in bytes of the trailing on-demand identity hash field
const IDENTITY_HASH_FIELD_SIZE: u64 = 4;

/// Bit-packed object shape descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LayoutEncoding(i32);

impl LayoutEncoding {
    /// The unused sentinel; never attached to a real type
    pub const NEUTRAL: LayoutEncoding = LayoutEncoding(NEUTRAL_VALUE);

    // ===== Constructors =====

    /// Encoding for a primitive type (never allocated)
    pub fn for_primitive() -> Self {
        Self(PRIMITIVE_VALUE)
    }

    /// Encoding for an interface type (never allocated)
    pub fn for_interface() -> Self {
        Self(INTERFACE_VALUE)
    }

    /// Encoding for an abstract class (never instantiated)
    pub fn for_abstract() -> Self {
        Self(ABSTRACT_VALUE)
    }

    /// Encoding for a pure instance type of the given aligned size
    pub fn for_pure_instance(size: u64) -> Result<Self, MetaError> {
        if size <= LAST_SPECIAL_VALUE as u64 || size > i32::MAX as u64 {
            return Err(MetaError::InstanceSizeOverflow(size));
        }
        let encoding = Self(size as i32);
        assert!(encoding.is_pure_instance());
        assert_eq!(encoding.pure_instance_size(), size);
        Ok(encoding)
    }

    /// Encoding for a plain (non-hybrid) array
    pub fn for_array(base_offset: u32, index_shift: u32, object_elements: bool) -> Result<Self, MetaError> {
        Self::pack_array_like(base_offset, index_shift, object_elements, false)
    }

    /// Encoding for a hybrid: fixed fields plus a trailing array region
    pub fn for_hybrid(base_offset: u32, index_shift: u32, object_elements: bool) -> Result<Self, MetaError> {
        Self::pack_array_like(base_offset, index_shift, object_elements, true)
    }

    /// Encoding for the type descriptor type itself
    ///
    /// A hub is a hybrid whose trailing region is its vtable, an array of
    /// reference-sized entries.
    pub fn for_dynamic_hub(base_offset: u32, index_shift: u32) -> Result<Self, MetaError> {
        Self::pack_array_like(base_offset, index_shift, false, true)
    }

    fn pack_array_like(
        base_offset: u32,
        index_shift: u32,
        object_elements: bool,
        hybrid: bool,
    ) -> Result<Self, MetaError> {
        if base_offset > BASE_MAX {
            return Err(MetaError::ArrayBaseOverflow(base_offset));
        }
        if index_shift > SHIFT_MAX {
            return Err(MetaError::IndexShiftOverflow(index_shift));
        }
        let mut word = TAG_IDENTITY | (base_offset << BASE_SHIFT) | index_shift;
        if !object_elements {
            word |= TAG_PRIMITIVE_ELEMENTS;
        }
        if !hybrid {
            word |= TAG_PURE;
        }
        let encoding = Self(word as i32);
        // The requested shape must round-trip exactly, and the hybrid view
        // must match the caller's structural claim.
        assert!(encoding.is_array_like());
        assert_eq!(encoding.is_hybrid(), hybrid);
        assert_eq!(encoding.is_array(), !hybrid);
        assert_eq!(encoding.is_object_array_like(), object_elements);
        assert_eq!(encoding.array_base_offset(), base_offset);
        assert_eq!(encoding.array_index_shift(), index_shift);
        Ok(encoding)
    }

    /// Recover an encoding from its raw word (image loading)
    #[inline]
    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    /// Raw 32-bit word
    #[inline]
    pub fn bits(self) -> i32 {
        self.0
    }

    // ===== Decode predicates (GC hot path) =====

    /// Whether this is the unused sentinel
    #[inline]
    pub fn is_neutral(self) -> bool {
        self.0 == NEUTRAL_VALUE
    }

    /// Primitive type
    #[inline]
    pub fn is_primitive(self) -> bool {
        self.0 == PRIMITIVE_VALUE
    }

    /// Interface type
    #[inline]
    pub fn is_interface(self) -> bool {
        self.0 == INTERFACE_VALUE
    }

    /// Abstract class
    #[inline]
    pub fn is_abstract(self) -> bool {
        self.0 == ABSTRACT_VALUE
    }

    /// Instance type with a fixed allocation size
    #[inline]
    pub fn is_pure_instance(self) -> bool {
        self.0 > LAST_SPECIAL_VALUE
    }

    /// Array or hybrid: anything with a trailing indexed region
    #[inline]
    pub fn is_array_like(self) -> bool {
        self.0 < 0
    }

    /// Plain array (not a hybrid)
    #[inline]
    pub fn is_array(self) -> bool {
        (self.0 as u32) & (TAG_IDENTITY | TAG_PURE) == (TAG_IDENTITY | TAG_PURE)
    }

    /// Hybrid: instance-like type with a trailing array region
    #[inline]
    pub fn is_hybrid(self) -> bool {
        (self.0 as u32) & (TAG_IDENTITY | TAG_PURE) == TAG_IDENTITY
    }

    /// Plain array of primitive elements
    #[inline]
    pub fn is_primitive_array(self) -> bool {
        const MASK: u32 = TAG_IDENTITY | TAG_PRIMITIVE_ELEMENTS | TAG_PURE;
        (self.0 as u32) & MASK == MASK
    }

    /// Plain array of object references
    #[inline]
    pub fn is_object_array(self) -> bool {
        const MASK: u32 = TAG_IDENTITY | TAG_PRIMITIVE_ELEMENTS | TAG_PURE;
        (self.0 as u32) & MASK == (TAG_IDENTITY | TAG_PURE)
    }

    /// Array-like with primitive elements (arrays and hybrids)
    #[inline]
    pub fn is_primitive_array_like(self) -> bool {
        const MASK: u32 = TAG_IDENTITY | TAG_PRIMITIVE_ELEMENTS;
        (self.0 as u32) & MASK == MASK
    }

    /// Array-like with object-reference elements (arrays and hybrids)
    #[inline]
    pub fn is_object_array_like(self) -> bool {
        const MASK: u32 = TAG_IDENTITY | TAG_PRIMITIVE_ELEMENTS;
        (self.0 as u32) & MASK == TAG_IDENTITY
    }

    // ===== Decoding =====

    /// Aligned allocation size of a pure instance
    #[inline]
    pub fn pure_instance_size(self) -> u64 {
        debug_assert!(self.is_pure_instance());
        self.0 as u64
    }

    /// Byte offset of the first element of an array-like object
    #[inline]
    pub fn array_base_offset(self) -> u32 {
        debug_assert!(self.is_array_like());
        ((self.0 as u32) >> BASE_SHIFT) & BASE_MAX
    }

    /// Index shift of an array-like object: element size is `1 << shift`
    #[inline]
    pub fn array_index_shift(self) -> u32 {
        debug_assert!(self.is_array_like());
        (self.0 as u32) & SHIFT_MAX
    }

    /// Size in bytes of one element
    #[inline]
    pub fn array_element_size(self) -> u64 {
        1u64 << self.array_index_shift()
    }

    /// Byte offset of element `index`
    #[inline]
    pub fn array_element_offset(self, index: u64) -> u64 {
        self.array_base_offset() as u64 + (index << self.array_index_shift())
    }

    // ===== Size computation =====

    /// Total allocation size of an array-like object with `length` elements
    ///
    /// When the target stores identity hashes as an optional trailing field
    /// and `with_identity_hash` is set, room for that field is reserved
    /// before the final alignment. Under the in-header and fixed-offset
    /// policies the flag adds nothing.
    pub fn array_size(self, length: u64, machine: &TargetMachine, with_identity_hash: bool) -> u64 {
        let unpadded = self.array_element_offset(length);
        self.finish_size(unpadded, machine, with_identity_hash)
    }

    /// Total allocation size of a pure instance
    pub fn instance_size(self, machine: &TargetMachine, with_identity_hash: bool) -> u64 {
        self.finish_size(self.pure_instance_size(), machine, with_identity_hash)
    }

    fn finish_size(self, unpadded: u64, machine: &TargetMachine, with_identity_hash: bool) -> u64 {
        let alignment = machine.object_alignment() as u64;
        let size = match machine.identity_hash_mode() {
            IdentityHashMode::OptionalTrailing if with_identity_hash => {
                align_up(unpadded, IDENTITY_HASH_FIELD_SIZE) + IDENTITY_HASH_FIELD_SIZE
            }
            _ => unpadded,
        };
        align_up(size, alignment)
    }
}

impl Default for LayoutEncoding {
    fn default() -> Self {
        Self::NEUTRAL
    }
}
