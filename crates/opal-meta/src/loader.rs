//! Runtime type definition
//!
//! When the image supports dynamic class definition (open world only), new
//! hubs are constructed on whatever thread triggered the class-loading
//! request. Validation happens before any shared mutation, so a failed
//! definition leaves the registry untouched; the load lock makes the first
//! successful loader win atomically.

use opal_target::ElementKind;

use crate::error::{LinkageError, MetaError};
use crate::hub::{Hub, HubBuilder, MethodRef, TypeCategory, TypeCheckData, TypeId};
use crate::layout::LayoutEncoding;
use crate::registry::{TypeRegistry, WorldKind};
use crate::typecheck::{encode_type_checks, TypeCheckInput};

/// Requested shape of a dynamically defined type
#[derive(Debug, Clone)]
pub enum DefinedKind {
    /// Concrete class; `size` is the unaligned instance size in bytes
    Instance { size: u64 },

    /// Abstract class
    Abstract,

    /// Interface
    Interface,

    /// Array of the given component type
    Array {
        component: TypeId,
        element: ElementKind,
    },
}

/// A dynamic type definition request
#[derive(Debug, Clone)]
pub struct TypeDefinition {
    /// Fully qualified type name
    pub name: String,

    /// Requested shape
    pub kind: DefinedKind,

    /// Direct supertype, if any (`None` only for hierarchy roots)
    pub super_type: Option<TypeId>,

    /// Ids of all implemented interfaces
    pub interface_ids: Vec<u32>,

    /// Per-interface itable start as a vtable entry index
    pub itable_starts: Vec<u32>,

    /// Whether the type has dispatchable methods
    pub implements_methods: bool,

    /// Word indexes of the type's own declared reference fields
    pub own_reference_words: Vec<u32>,

    /// Vtable entries, already compiled/linked
    pub vtable: Vec<MethodRef>,
}

impl TypeDefinition {
    /// A plain instance definition with no interfaces or methods
    pub fn instance(name: impl Into<String>, size: u64, super_type: Option<TypeId>) -> Self {
        Self {
            name: name.into(),
            kind: DefinedKind::Instance { size },
            super_type,
            interface_ids: Vec::new(),
            itable_starts: Vec::new(),
            implements_methods: false,
            own_reference_words: Vec::new(),
            vtable: Vec::new(),
        }
    }
}

/// Constructs hubs for dynamically defined types
pub struct HubAllocator<'a> {
    registry: &'a TypeRegistry,

    /// Byte offset of the vtable area within a descriptor slot
    vtable_base_offset: u32,

    /// Byte stride of one vtable entry
    vtable_entry_size: u32,
}

impl<'a> HubAllocator<'a> {
    /// Create an allocator over the given registry
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self {
            registry,
            vtable_base_offset: std::mem::size_of::<Hub>() as u32,
            vtable_entry_size: std::mem::size_of::<MethodRef>() as u32,
        }
    }

    /// Define a new type, returning its hub
    ///
    /// Serialized on the registry's load lock; the first definition of a
    /// name wins and every later attempt gets `DuplicateDefinition`.
    pub fn define(&self, definition: TypeDefinition) -> Result<&'a Hub, LinkageError> {
        if self.registry.world() != WorldKind::Open {
            return Err(LinkageError::ClosedWorld(definition.name));
        }

        let _guard = self.registry.load_guard();

        // All validation happens under the lock but before any mutation.
        if self.registry.name_taken(&definition.name) {
            return Err(LinkageError::DuplicateDefinition(definition.name));
        }
        let super_hub = match definition.super_type {
            Some(id) => Some(self.registry.hub(id).ok_or_else(|| {
                LinkageError::UnresolvedSupertype {
                    name: definition.name.clone(),
                    super_id: id.as_u32(),
                }
            })?),
            None => None,
        };
        if let DefinedKind::Array { component, .. } = definition.kind {
            if self.registry.hub(component).is_none() {
                return Err(LinkageError::UnresolvedComponent {
                    name: definition.name,
                    component_id: component.as_u32(),
                });
            }
        }

        // Derive category and layout from the requested shape.
        let machine = self.registry.machine();
        let (category, layout) = match definition.kind {
            DefinedKind::Instance { size } => {
                let aligned =
                    opal_target::align_up(size.max(1), machine.object_alignment() as u64);
                (
                    TypeCategory::Instance,
                    LayoutEncoding::for_pure_instance(aligned)?,
                )
            }
            DefinedKind::Abstract => (TypeCategory::Abstract, LayoutEncoding::for_abstract()),
            DefinedKind::Interface => (TypeCategory::Interface, LayoutEncoding::for_interface()),
            DefinedKind::Array { element, .. } => (
                TypeCategory::Array {
                    object_elements: element.is_reference(),
                },
                LayoutEncoding::for_array(
                    machine.array_base_offset(element),
                    machine.array_index_shift(element),
                    element.is_reference(),
                )?,
            ),
        };

        // The id the registry will assign; valid because the load lock is
        // held until publication.
        let type_id = self.registry.type_count() as u32;
        let mut ancestors: Vec<u32> = match (&super_hub, super_hub.and_then(|h| h.type_check())) {
            (Some(_), Some(TypeCheckData::Open(data))) => data.ancestor_ids.to_vec(),
            (Some(hub), _) => {
                return Err(LinkageError::Metadata(MetaError::WrongWorldPayload(
                    hub.name().to_string(),
                )))
            }
            (None, _) => Vec::new(),
        };
        ancestors.push(type_id);

        let type_check = encode_type_checks(
            &TypeCheckInput {
                implements_methods: definition.implements_methods,
                ancestor_ids: &ancestors,
                interface_ids: &definition.interface_ids,
                itable_starts: &definition.itable_starts,
                vtable_base_offset: self.vtable_base_offset,
                vtable_entry_size: self.vtable_entry_size,
            },
            self.registry.hashing(),
        )?;

        // Reference map: reuse the parent's offset verbatim when this type
        // adds no reference-carrying fields. Interning mutates the shared
        // table, so everything that can still fail comes before this point.
        let parent_offset = super_hub
            .map(|hub| hub.reference_map_offset())
            .unwrap_or_else(|| self.registry.reference_maps().empty_offset());
        let reference_map_offset = self
            .registry
            .reference_maps()
            .offset_for(&definition.own_reference_words, parent_offset);

        let mut builder = HubBuilder::new(definition.name, category, layout)
            .reference_map_offset(reference_map_offset)
            .vtable(definition.vtable)
            .type_check(TypeCheckData::Open(type_check));
        if let DefinedKind::Array { component, .. } = definition.kind {
            builder = builder.component(component);
        }

        // Allocation writes every field, fences, and only then the registry
        // publishes the pointer; the check-and-set completes while we still
        // hold the load lock, so no thread observes a partially loaded type.
        let hub = self.registry.register_locked(builder)?;
        debug_assert_eq!(hub.type_id().as_u32(), type_id);
        Ok(hub)
    }
}
