//! Target machine model
//!
//! Describes everything the metadata encoders need to know about the target:
//! reference size, object alignment, array layout per element kind, and
//! where an object's identity hash lives.

use thiserror::Error;

/// Errors raised while building a target machine description
#[derive(Debug, Error)]
pub enum TargetError {
    /// Identity-hash placement read from configuration is not a known mode
    #[error("Unknown identity hash placement mode: {0}")]
    UnknownIdentityHashMode(u8),

    /// Reference size other than 4 or 8 bytes
    #[error("Unsupported reference size: {0}")]
    UnsupportedReferenceSize(u32),

    /// Object alignment that is zero or not a power of two
    #[error("Unsupported object alignment: {0}")]
    UnsupportedObjectAlignment(u32),
}

/// Kind of element stored in an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Bool,
    I8,
    I16,
    U16,
    I32,
    I64,
    F32,
    F64,
    Reference,
}

impl ElementKind {
    /// Whether elements of this kind are object references
    #[inline]
    pub fn is_reference(self) -> bool {
        matches!(self, ElementKind::Reference)
    }
}

/// Where the identity hash of an object is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityHashMode {
    /// Packed into the object header word
    InHeader,

    /// At a fixed byte offset in every object
    FixedOffset(u32),

    /// Appended to the object on demand; sizes must reserve a trailing field
    OptionalTrailing,
}

impl IdentityHashMode {
    /// Decode a mode from raw configuration input
    ///
    /// Tag 0 = in-header, 1 = fixed offset (`offset` applies), 2 = optional
    /// trailing. Any other tag is a configuration error.
    pub fn from_raw(tag: u8, offset: u32) -> Result<Self, TargetError> {
        match tag {
            0 => Ok(IdentityHashMode::InHeader),
            1 => Ok(IdentityHashMode::FixedOffset(offset)),
            2 => Ok(IdentityHashMode::OptionalTrailing),
            other => Err(TargetError::UnknownIdentityHashMode(other)),
        }
    }
}

/// Align `value` up to `alignment` (a power of two)
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Static description of the compilation target
///
/// Constructed once per build (or per running image) and threaded through
/// every encoder that needs layout facts. Arrays are laid out as a one-word
/// header, a 32-bit length field, then elements starting at the first
/// offset aligned for the element kind.
#[derive(Debug, Clone)]
pub struct TargetMachine {
    /// Size of an object reference in bytes (4 or 8)
    reference_size: u32,

    /// Allocation granule; every object size is a multiple of this
    object_alignment: u32,

    /// Size of the object header word in bytes
    header_size: u32,

    /// Identity hash placement policy
    identity_hash: IdentityHashMode,
}

impl TargetMachine {
    /// Size of the array length field in bytes
    pub const LENGTH_FIELD_SIZE: u32 = 4;

    /// Create a machine description
    pub fn new(
        reference_size: u32,
        object_alignment: u32,
        identity_hash: IdentityHashMode,
    ) -> Result<Self, TargetError> {
        if reference_size != 4 && reference_size != 8 {
            return Err(TargetError::UnsupportedReferenceSize(reference_size));
        }
        if object_alignment == 0 || !object_alignment.is_power_of_two() {
            return Err(TargetError::UnsupportedObjectAlignment(object_alignment));
        }
        Ok(Self {
            reference_size,
            object_alignment,
            header_size: reference_size,
            identity_hash,
        })
    }

    /// Default description of a 64-bit host target
    pub fn host() -> Self {
        Self {
            reference_size: 8,
            object_alignment: 8,
            header_size: 8,
            identity_hash: IdentityHashMode::InHeader,
        }
    }

    /// Size of an object reference in bytes
    #[inline]
    pub fn reference_size(&self) -> u32 {
        self.reference_size
    }

    /// Allocation alignment in bytes
    #[inline]
    pub fn object_alignment(&self) -> u32 {
        self.object_alignment
    }

    /// Size of the object header word in bytes
    #[inline]
    pub fn header_size(&self) -> u32 {
        self.header_size
    }

    /// Identity-hash placement policy for this target
    #[inline]
    pub fn identity_hash_mode(&self) -> IdentityHashMode {
        self.identity_hash
    }

    /// Byte offset of the array length field
    #[inline]
    pub fn array_length_offset(&self) -> u32 {
        self.header_size
    }

    /// Size in bytes of one element of the given kind
    #[inline]
    pub fn element_size(&self, kind: ElementKind) -> u32 {
        match kind {
            ElementKind::Bool | ElementKind::I8 => 1,
            ElementKind::I16 | ElementKind::U16 => 2,
            ElementKind::I32 | ElementKind::F32 => 4,
            ElementKind::I64 | ElementKind::F64 => 8,
            ElementKind::Reference => self.reference_size,
        }
    }

    /// Index shift for the given kind: `log2(element_size)`
    #[inline]
    pub fn array_index_shift(&self, kind: ElementKind) -> u32 {
        self.element_size(kind).trailing_zeros()
    }

    /// Byte offset of the first array element of the given kind
    #[inline]
    pub fn array_base_offset(&self, kind: ElementKind) -> u32 {
        let unaligned = self.header_size + Self::LENGTH_FIELD_SIZE;
        align_up(unaligned as u64, self.element_size(kind) as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes_are_powers_of_two() {
        let machine = TargetMachine::host();
        for kind in [
            ElementKind::Bool,
            ElementKind::I8,
            ElementKind::I16,
            ElementKind::U16,
            ElementKind::I32,
            ElementKind::I64,
            ElementKind::F32,
            ElementKind::F64,
            ElementKind::Reference,
        ] {
            let size = machine.element_size(kind);
            assert!(size.is_power_of_two());
            assert_eq!(1 << machine.array_index_shift(kind), size);
        }
    }

    #[test]
    fn test_array_base_alignment() {
        let machine = TargetMachine::host();
        // Header (8) + length (4) = 12; byte arrays start right there,
        // wider elements get padded up.
        assert_eq!(machine.array_base_offset(ElementKind::I8), 12);
        assert_eq!(machine.array_base_offset(ElementKind::I32), 12);
        assert_eq!(machine.array_base_offset(ElementKind::I64), 16);
        assert_eq!(machine.array_base_offset(ElementKind::Reference), 16);
    }

    #[test]
    fn test_identity_hash_mode_from_raw() {
        assert_eq!(
            IdentityHashMode::from_raw(0, 0).unwrap(),
            IdentityHashMode::InHeader
        );
        assert_eq!(
            IdentityHashMode::from_raw(1, 24).unwrap(),
            IdentityHashMode::FixedOffset(24)
        );
        assert_eq!(
            IdentityHashMode::from_raw(2, 0).unwrap(),
            IdentityHashMode::OptionalTrailing
        );
        assert!(IdentityHashMode::from_raw(7, 0).is_err());
    }

    #[test]
    fn test_rejects_bad_configuration() {
        assert!(TargetMachine::new(3, 8, IdentityHashMode::InHeader).is_err());
        assert!(TargetMachine::new(8, 12, IdentityHashMode::InHeader).is_err());
        assert!(TargetMachine::new(4, 8, IdentityHashMode::InHeader).is_ok());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 4), 16);
    }
}
