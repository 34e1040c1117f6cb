//! Type metadata for the Opal ahead-of-time compiled runtime
//!
//! Every class, array, and interface gets one compact, immutable descriptor
//! (a hub) consumed by the allocator, the garbage collector, and compiled
//! subtype-check/dispatch fast paths:
//!
//! - [`LayoutEncoding`]: one bit-packed word describing object shape
//! - [`ReferenceMapRegistry`]: deduplicated GC reference bitmaps
//! - [`typecheck`]: open-world subtype/interface dispatch encoding,
//!   including the shift-and-mask perfect hash over interface ids
//! - [`Hub`]: the per-type record aggregating all of the above
//! - [`HubAllocator`]: runtime construction of hubs when the image
//!   supports dynamic class definition

mod error;
mod hub;
mod layout;
mod loader;
mod refmap;
mod registry;
pub mod typecheck;

pub use error::{LinkageError, MetaError};
pub use hub::{
    Hub, HubBuilder, HubCompanion, MethodRef, TypeCategory, TypeCheckData, TypeId,
};
pub use layout::LayoutEncoding;
pub use loader::{DefinedKind, HubAllocator, TypeDefinition};
pub use refmap::{RefMapBuilder, RefMapIter, ReferenceMapRegistry, EMPTY_REF_MAP};
pub use registry::{TypeRegistry, WorldKind};
pub use typecheck::{
    encode_type_checks, hash, hash_param, HashingConfig, InterfaceSlot, OpenTypeCheckData,
    TypeCheckInput,
};
