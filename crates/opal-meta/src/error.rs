//! Error types for metadata construction and runtime type definition

use opal_target::TargetError;
use thiserror::Error;

/// Fatal build-time invariant violations
///
/// Every variant is a configuration error that aborts image generation.
/// None of these are caught or retried.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Instance size too large (or too small) to encode in the layout word
    #[error("Instance size {0} does not fit the layout encoding")]
    InstanceSizeOverflow(u64),

    /// Array base offset does not fit the 12-bit field
    #[error("Array base offset {0} does not fit 12 bits")]
    ArrayBaseOverflow(u32),

    /// Array index shift does not fit the 8-bit field
    #[error("Array index shift {0} does not fit 8 bits")]
    IndexShiftOverflow(u32),

    /// An itable offset that cannot be encoded even in the linear slot list
    #[error("Itable offset {offset} for interface {interface_id} cannot be encoded")]
    ItableOffsetOverflow { offset: u64, interface_id: u32 },

    /// Interface id 0 would be indistinguishable from an empty hash slot
    #[error("Interface id 0 is not a valid interface key")]
    ZeroInterfaceId,

    /// A type id that does not name a registered type
    #[error("Type id {0} is not registered")]
    UnknownTypeId(u32),

    /// Second initialization of the write-once type-check payload
    #[error("Type check data already set for type {0}")]
    TypeCheckAlreadySet(u32),

    /// Structural category and layout word disagree
    #[error("Type `{name}` declares a category its layout encoding contradicts")]
    CategoryLayoutMismatch { name: String },

    /// A type-check payload of the wrong variant for the build's world kind
    #[error("Type `{0}` carries a type-check payload for the wrong world kind")]
    WrongWorldPayload(String),

    /// Vtable length for which no descriptor slot layout exists
    #[error("Vtable length {0} exceeds the descriptor slot limit")]
    VtableTooLarge(usize),

    /// Interface arrays of mismatched length in the encoder input
    #[error("Type check input lists {ids} interface ids but {offsets} itable offsets")]
    InterfaceInputMismatch { ids: usize, offsets: usize },

    /// A target configuration error surfaced during metadata construction
    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Runtime class-loading failures
///
/// Surfaced to the loading thread; shared registries are never mutated
/// before validation succeeds, so a failed definition leaves no trace.
#[derive(Debug, Error)]
pub enum LinkageError {
    /// Another loader already defined a type with this name
    #[error("Duplicate definition of type `{0}`")]
    DuplicateDefinition(String),

    /// The requested supertype id is not a loaded type
    #[error("Unresolved supertype {super_id} while defining `{name}`")]
    UnresolvedSupertype { name: String, super_id: u32 },

    /// The requested component type id is not a loaded type
    #[error("Unresolved component type {component_id} while defining `{name}`")]
    UnresolvedComponent { name: String, component_id: u32 },

    /// Dynamic definition attempted in a closed-world image
    #[error("Cannot define `{0}`: this image was built with a closed type world")]
    ClosedWorld(String),

    /// A metadata invariant violation during definition
    #[error(transparent)]
    Metadata(#[from] MetaError),
}
