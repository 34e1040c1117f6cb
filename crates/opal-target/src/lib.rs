//! Target facts the Opal metadata subsystem builds against
//!
//! This crate is the external-collaborator surface consumed by `opal-meta`:
//! the target machine model (reference size, array layout, identity-hash
//! placement), the non-moving arena that backs type descriptors and
//! reference-map bytes, and the object header word the GC reads.

mod arena;
mod header;
mod machine;

pub use arena::StableArena;
pub use header::{header_of, hub_index_of, ObjectHeader};
pub use machine::{align_up, ElementKind, IdentityHashMode, TargetError, TargetMachine};
