//! Type descriptors (hubs)
//!
//! One immutable `Hub` per class, array, or interface aggregates everything
//! the allocator, the GC, and compiled type-check/dispatch code need:
//! identity, the layout encoding word, the vtable, the reference-map offset,
//! and exactly one of the two type-check payloads. Hubs live in the
//! non-moving metadata arena, are published with a release fence, and are
//! never destroyed.
//!
//! A hub is itself a hybrid object: the fixed fields are followed by the
//! vtable region in the same allocation.

use once_cell::sync::OnceCell;
use std::alloc::Layout;
use std::ptr::{addr_of_mut, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};

use opal_target::StableArena;

use crate::error::MetaError;
use crate::layout::LayoutEncoding;
use crate::typecheck::OpenTypeCheckData;

/// Numeric type id, unique per type per build layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeId(u32);

impl TypeId {
    /// Wrap a raw id
    #[inline]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id value
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// The id as a table index
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reference to a compiled method entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct MethodRef(pub usize);

impl MethodRef {
    /// An unresolved vtable entry
    pub const NULL: MethodRef = MethodRef(0);
}

/// Structural category of a type
///
/// Enum-dispatched; the GC-hot classification goes through the layout word
/// instead, this is for language-level predicates and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    /// Primitive type; never allocated
    Primitive,

    /// Interface; never instantiated directly
    Interface,

    /// Abstract class; never instantiated
    Abstract,

    /// Concrete class with a fixed instance size
    Instance,

    /// Array with a component type
    Array {
        /// Whether elements are object references
        object_elements: bool,
    },

    /// Fixed fields plus a trailing array region in one allocation
    Hybrid {
        /// Whether the trailing elements are object references
        object_elements: bool,
    },
}

/// The write-once subtype-check payload; exactly one strategy per build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeCheckData {
    /// Closed world: contiguous id range over one slot column
    Closed {
        /// First id of the range assigned to this type's subtypes
        start: u32,

        /// Number of ids in the range
        range: u32,

        /// Which column of the shared slot array this type's check reads
        slot: u16,

        /// This type's own column values, indexed by slot
        slot_values: Box<[u32]>,
    },

    /// Open world: ancestor prefix plus hashed/linear interface tables
    Open(OpenTypeCheckData),
}

/// Mutable side record of a hub
///
/// Everything about a type that may legally change after publication lives
/// here, behind atomics; the hub itself stays immutable.
#[derive(Debug)]
pub struct HubCompanion {
    /// 0 = linked, 1 = initializing, 2 = initialized
    init_state: AtomicU8,

    /// Whether any instance of this type was ever allocated
    instantiated: AtomicBool,

    /// Lazily inflated class monitor, 0 until first contended lock
    monitor: AtomicUsize,
}

const INIT_LINKED: u8 = 0;
const INIT_RUNNING: u8 = 1;
const INIT_DONE: u8 = 2;

impl HubCompanion {
    fn new(instantiated: bool) -> Self {
        Self {
            init_state: AtomicU8::new(INIT_LINKED),
            instantiated: AtomicBool::new(instantiated),
            monitor: AtomicUsize::new(0),
        }
    }

    /// Try to claim class initialization; false if someone already did
    pub fn begin_initialization(&self) -> bool {
        self.init_state
            .compare_exchange(INIT_LINKED, INIT_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark class initialization complete
    pub fn finish_initialization(&self) {
        self.init_state.store(INIT_DONE, Ordering::Release);
    }

    /// Whether class initialization has completed
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.init_state.load(Ordering::Acquire) == INIT_DONE
    }

    /// Record that an instance was allocated
    pub fn set_instantiated(&self) {
        self.instantiated.store(true, Ordering::Release);
    }

    /// Whether any instance was ever allocated
    #[inline]
    pub fn is_instantiated(&self) -> bool {
        self.instantiated.load(Ordering::Acquire)
    }

    /// The inflated class monitor, or `None` before first inflation
    #[inline]
    pub fn monitor(&self) -> Option<usize> {
        match self.monitor.load(Ordering::Acquire) {
            0 => None,
            m => Some(m),
        }
    }

    /// Install an inflated monitor; the first installer wins
    pub fn install_monitor(&self, monitor: usize) -> usize {
        debug_assert_ne!(monitor, 0);
        match self
            .monitor
            .compare_exchange(0, monitor, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => monitor,
            Err(existing) => existing,
        }
    }
}

/// Per-type runtime metadata record
///
/// Immutable after construction except for the write-once type-check
/// payload and the companion's atomics. Only ever created inside an arena
/// slot by [`HubBuilder::allocate_in`]; the vtable region trails the struct
/// in the same slot.
#[derive(Debug)]
pub struct Hub {
    name: Box<str>,
    type_id: TypeId,
    category: TypeCategory,
    layout: LayoutEncoding,
    component: Option<TypeId>,
    reference_map_offset: u32,
    vtable_len: u32,
    companion: Box<HubCompanion>,
    type_check: OnceCell<TypeCheckData>,
}

/// Byte offset of the vtable region within a hub slot
#[inline]
const fn vtable_offset() -> usize {
    let size = std::mem::size_of::<Hub>();
    let align = std::mem::align_of::<MethodRef>();
    (size + align - 1) & !(align - 1)
}

impl Hub {
    /// Type name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric type id
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Structural category
    #[inline]
    pub fn category(&self) -> TypeCategory {
        self.category
    }

    /// The layout encoding word the allocator and GC classify by
    #[inline]
    pub fn layout_encoding(&self) -> LayoutEncoding {
        self.layout
    }

    /// Component type of an array
    #[inline]
    pub fn component(&self) -> Option<TypeId> {
        self.component
    }

    /// Compressed offset into the shared reference-map table
    #[inline]
    pub fn reference_map_offset(&self) -> u32 {
        self.reference_map_offset
    }

    /// The mutable side record
    #[inline]
    pub fn companion(&self) -> &HubCompanion {
        &self.companion
    }

    /// The vtable region trailing this hub's slot
    #[inline]
    pub fn vtable(&self) -> &[MethodRef] {
        // Hubs only exist inside arena slots sized for the trailing region.
        unsafe {
            let base = (self as *const Hub as *const u8).add(vtable_offset());
            std::slice::from_raw_parts(base as *const MethodRef, self.vtable_len as usize)
        }
    }

    /// The type-check payload, once set
    #[inline]
    pub fn type_check(&self) -> Option<&TypeCheckData> {
        self.type_check.get()
    }

    /// Install the type-check payload
    ///
    /// Write-once: a second call fails fast and never overwrites. Compiled
    /// code is allowed to float reads of this data once a type is loaded,
    /// which is only sound because nothing can change it afterwards.
    pub fn set_type_check(&self, data: TypeCheckData) -> Result<(), MetaError> {
        self.type_check
            .set(data)
            .map_err(|_| MetaError::TypeCheckAlreadySet(self.type_id.as_u32()))
    }

    // ===== Subtype checks =====

    /// Whether a value of `candidate`'s type is assignable to this type
    pub fn is_assignable_from(&self, candidate: &Hub) -> bool {
        match self.type_check.get() {
            Some(TypeCheckData::Closed { start, range, slot, .. }) => {
                match candidate.type_check.get() {
                    Some(TypeCheckData::Closed { slot_values, .. }) => {
                        // start <= v < start + range, as one unsigned compare.
                        // A candidate built with fewer slot columns than this
                        // type's slot index is malformed input; treat it as
                        // outside every range rather than panicking.
                        match slot_values.get(*slot as usize) {
                            Some(&v) => v.wrapping_sub(*start) < *range,
                            None => false,
                        }
                    }
                    _ => false,
                }
            }
            Some(TypeCheckData::Open(data)) => match candidate.type_check.get() {
                Some(TypeCheckData::Open(candidate_data)) => {
                    if matches!(self.category, TypeCategory::Interface) {
                        candidate_data.implements(self.type_id.as_u32())
                    } else {
                        candidate_data.ancestor_ids.get(data.depth()).copied()
                            == Some(self.type_id.as_u32())
                    }
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Itable offset for interface dispatch (open world)
    #[inline]
    pub fn itable_offset(&self, interface_id: u32) -> Option<u32> {
        match self.type_check.get() {
            Some(TypeCheckData::Open(data)) => data.itable_offset(interface_id),
            _ => None,
        }
    }
}

/// Two-phase hub construction: mutate the builder, then allocate
///
/// Turning the "every field written before publication" protocol into a
/// type-level guarantee: the immutable `Hub` only comes into existence
/// fully formed.
#[derive(Debug)]
pub struct HubBuilder {
    name: String,
    category: TypeCategory,
    layout: LayoutEncoding,
    component: Option<TypeId>,
    reference_map_offset: u32,
    vtable: Vec<MethodRef>,
    instantiated: bool,
    type_check: Option<TypeCheckData>,
}

impl HubBuilder {
    /// Start building a hub for a type of the given category and layout
    pub fn new(name: impl Into<String>, category: TypeCategory, layout: LayoutEncoding) -> Self {
        Self {
            name: name.into(),
            category,
            layout,
            component: None,
            reference_map_offset: 0,
            vtable: Vec::new(),
            instantiated: false,
            type_check: None,
        }
    }

    /// Set the array component type
    pub fn component(mut self, component: TypeId) -> Self {
        self.component = Some(component);
        self
    }

    /// Set the reference-map table offset
    pub fn reference_map_offset(mut self, offset: u32) -> Self {
        self.reference_map_offset = offset;
        self
    }

    /// Set the vtable entries
    pub fn vtable(mut self, vtable: Vec<MethodRef>) -> Self {
        self.vtable = vtable;
        self
    }

    /// Mark the type as instantiated at build time
    pub fn instantiated(mut self, instantiated: bool) -> Self {
        self.instantiated = instantiated;
        self
    }

    /// Pre-set the type-check payload
    pub fn type_check(mut self, data: TypeCheckData) -> Self {
        self.type_check = Some(data);
        self
    }

    /// Requested vtable length
    pub fn vtable_len(&self) -> usize {
        self.vtable.len()
    }

    /// Name the hub will carry
    pub fn pending_name(&self) -> &str {
        &self.name
    }

    /// Type-check payload set on the builder, if any
    pub fn pending_type_check(&self) -> Option<&TypeCheckData> {
        self.type_check.as_ref()
    }

    fn validate(&self) -> Result<(), MetaError> {
        let layout = self.layout;
        let ok = match self.category {
            TypeCategory::Primitive => layout.is_primitive(),
            TypeCategory::Interface => layout.is_interface(),
            TypeCategory::Abstract => layout.is_abstract(),
            TypeCategory::Instance => layout.is_pure_instance(),
            TypeCategory::Array { object_elements } => {
                layout.is_array()
                    && layout.is_object_array() == object_elements
                    && self.component.is_some()
            }
            TypeCategory::Hybrid { object_elements } => {
                layout.is_hybrid() && layout.is_object_array_like() == object_elements
            }
        };
        if ok {
            Ok(())
        } else {
            Err(MetaError::CategoryLayoutMismatch {
                name: self.name.clone(),
            })
        }
    }

    /// Allocate the hub in its final arena slot
    ///
    /// Allocates a zeroed slot sized for the hub plus the vtable region,
    /// writes every field in a fixed order, copies the vtable entries, and
    /// issues a store-store fence before the reference escapes. Concurrent
    /// readers that obtain the published pointer are therefore guaranteed
    /// to see a fully initialized descriptor.
    pub fn allocate_in<'a>(
        self,
        type_id: TypeId,
        arena: &'a StableArena,
    ) -> Result<&'a Hub, MetaError> {
        self.validate()?;
        let vtable_len = self.vtable.len();
        let slot_layout = hub_slot_layout(vtable_len)?;
        let slot = arena.alloc_zeroed(slot_layout);
        let hub: NonNull<Hub> = slot.cast();

        unsafe {
            let p = hub.as_ptr();
            addr_of_mut!((*p).name).write(self.name.into_boxed_str());
            addr_of_mut!((*p).type_id).write(type_id);
            addr_of_mut!((*p).category).write(self.category);
            addr_of_mut!((*p).layout).write(self.layout);
            addr_of_mut!((*p).component).write(self.component);
            addr_of_mut!((*p).reference_map_offset).write(self.reference_map_offset);
            addr_of_mut!((*p).vtable_len).write(vtable_len as u32);
            addr_of_mut!((*p).companion).write(Box::new(HubCompanion::new(self.instantiated)));
            addr_of_mut!((*p).type_check).write(match self.type_check {
                Some(data) => OnceCell::with_value(data),
                None => OnceCell::new(),
            });

            let vtable = (p as *mut u8).add(vtable_offset()) as *mut MethodRef;
            for (i, &entry) in self.vtable.iter().enumerate() {
                vtable.add(i).write(entry);
            }
        }

        // Store-store barrier: every field above must be visible before the
        // pointer is. A GC root scan may reach the slot through the freshly
        // published table entry at any point afterwards.
        fence(Ordering::Release);
        Ok(unsafe { hub.as_ref() })
    }
}

/// Layout of one hub slot: the struct plus `vtable_len` trailing entries
fn hub_slot_layout(vtable_len: usize) -> Result<Layout, MetaError> {
    let entries =
        Layout::array::<MethodRef>(vtable_len).map_err(|_| MetaError::VtableTooLarge(vtable_len))?;
    let (layout, offset) = Layout::new::<Hub>()
        .extend(entries)
        .map_err(|_| MetaError::VtableTooLarge(vtable_len))?;
    debug_assert_eq!(offset, vtable_offset());
    Ok(layout.pad_to_align())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typecheck::{encode_type_checks, HashingConfig, TypeCheckInput};

    fn arena() -> StableArena {
        StableArena::new()
    }

    fn instance_builder(name: &str, size: u64) -> HubBuilder {
        HubBuilder::new(
            name,
            TypeCategory::Instance,
            LayoutEncoding::for_pure_instance(size).unwrap(),
        )
    }

    fn open_data(ancestors: &[u32], interfaces: &[u32]) -> TypeCheckData {
        let starts: Vec<u32> = (0..interfaces.len() as u32).collect();
        TypeCheckData::Open(
            encode_type_checks(
                &TypeCheckInput {
                    implements_methods: true,
                    ancestor_ids: ancestors,
                    interface_ids: interfaces,
                    itable_starts: &starts,
                    vtable_base_offset: 64,
                    vtable_entry_size: 8,
                },
                HashingConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_builder_produces_complete_hub() {
        let arena = arena();
        let hub = instance_builder("app.Point", 24)
            .reference_map_offset(17)
            .vtable(vec![MethodRef(0x1000), MethodRef(0x2000)])
            .instantiated(true)
            .allocate_in(TypeId::new(5), &arena)
            .unwrap();

        assert_eq!(hub.name(), "app.Point");
        assert_eq!(hub.type_id(), TypeId::new(5));
        assert_eq!(hub.category(), TypeCategory::Instance);
        assert!(hub.layout_encoding().is_pure_instance());
        assert_eq!(hub.reference_map_offset(), 17);
        assert_eq!(hub.vtable(), &[MethodRef(0x1000), MethodRef(0x2000)]);
        assert!(hub.companion().is_instantiated());
        assert!(hub.type_check().is_none());
    }

    #[test]
    fn test_category_layout_mismatch_is_fatal() {
        let arena = arena();
        let err = HubBuilder::new(
            "app.Broken",
            TypeCategory::Interface,
            LayoutEncoding::for_pure_instance(16).unwrap(),
        )
        .allocate_in(TypeId::new(1), &arena);
        assert!(matches!(err, Err(MetaError::CategoryLayoutMismatch { .. })));
    }

    #[test]
    fn test_array_requires_component() {
        let arena = arena();
        let layout = LayoutEncoding::for_array(16, 3, true).unwrap();
        let no_component = HubBuilder::new(
            "app.Thing[]",
            TypeCategory::Array {
                object_elements: true,
            },
            layout,
        )
        .allocate_in(TypeId::new(2), &arena);
        assert!(no_component.is_err());

        let hub = HubBuilder::new(
            "app.Thing[]",
            TypeCategory::Array {
                object_elements: true,
            },
            layout,
        )
        .component(TypeId::new(9))
        .allocate_in(TypeId::new(2), &arena)
        .unwrap();
        assert_eq!(hub.component(), Some(TypeId::new(9)));
    }

    #[test]
    fn test_type_check_is_write_once() {
        let arena = arena();
        let hub = instance_builder("app.A", 16)
            .allocate_in(TypeId::new(3), &arena)
            .unwrap();

        hub.set_type_check(open_data(&[0, 3], &[])).unwrap();
        let err = hub.set_type_check(open_data(&[0, 3], &[]));
        assert!(matches!(err, Err(MetaError::TypeCheckAlreadySet(3))));
        // The first payload survives untouched.
        assert!(hub.type_check().is_some());
    }

    #[test]
    fn test_closed_world_range_boundaries() {
        let arena = arena();
        let parent = instance_builder("app.Base", 16)
            .type_check(TypeCheckData::Closed {
                start: 10,
                range: 3,
                slot: 0,
                slot_values: Box::new([10]),
            })
            .allocate_in(TypeId::new(1), &arena)
            .unwrap();

        let candidate_with = |value: u32| {
            instance_builder("app.Sub", 16)
                .type_check(TypeCheckData::Closed {
                    start: value,
                    range: 1,
                    slot: 0,
                    slot_values: Box::new([value]),
                })
                .allocate_in(TypeId::new(2), &arena)
                .unwrap()
        };

        assert!(!parent.is_assignable_from(candidate_with(9)));
        assert!(parent.is_assignable_from(candidate_with(10)));
        assert!(parent.is_assignable_from(candidate_with(12)));
        assert!(!parent.is_assignable_from(candidate_with(13)));
    }

    #[test]
    fn test_closed_world_short_slot_column_is_rejected() {
        let arena = arena();
        // This type reads slot column 1.
        let parent = instance_builder("app.Base", 16)
            .type_check(TypeCheckData::Closed {
                start: 0,
                range: 100,
                slot: 1,
                slot_values: Box::new([0, 0]),
            })
            .allocate_in(TypeId::new(1), &arena)
            .unwrap();
        // Malformed candidate with a single column: not assignable, no panic.
        let candidate = instance_builder("app.Sub", 16)
            .type_check(TypeCheckData::Closed {
                start: 5,
                range: 1,
                slot: 0,
                slot_values: Box::new([5]),
            })
            .allocate_in(TypeId::new(2), &arena)
            .unwrap();
        assert!(!parent.is_assignable_from(candidate));
    }

    #[test]
    fn test_open_world_class_check_uses_ancestor_prefix() {
        let arena = arena();
        let base = instance_builder("app.Base", 16)
            .type_check(open_data(&[1], &[]))
            .allocate_in(TypeId::new(1), &arena)
            .unwrap();
        let sub = instance_builder("app.Sub", 16)
            .type_check(open_data(&[1, 2], &[]))
            .allocate_in(TypeId::new(2), &arena)
            .unwrap();
        let other = instance_builder("app.Other", 16)
            .type_check(open_data(&[3], &[]))
            .allocate_in(TypeId::new(3), &arena)
            .unwrap();

        assert!(base.is_assignable_from(sub));
        assert!(base.is_assignable_from(base));
        assert!(!base.is_assignable_from(other));
        assert!(!sub.is_assignable_from(base));
    }

    #[test]
    fn test_open_world_interface_check() {
        let arena = arena();
        let iface = HubBuilder::new("app.Drawable", TypeCategory::Interface, LayoutEncoding::for_interface())
            .type_check(open_data(&[7], &[]))
            .allocate_in(TypeId::new(7), &arena)
            .unwrap();
        let implementor = instance_builder("app.Circle", 24)
            .type_check(open_data(&[1, 9], &[7]))
            .allocate_in(TypeId::new(9), &arena)
            .unwrap();
        let bystander = instance_builder("app.Blob", 24)
            .type_check(open_data(&[1, 11], &[]))
            .allocate_in(TypeId::new(11), &arena)
            .unwrap();

        assert!(iface.is_assignable_from(implementor));
        assert!(!iface.is_assignable_from(bystander));
        assert_eq!(implementor.itable_offset(7), Some(64));
    }

    #[test]
    fn test_monitor_first_installer_wins() {
        let arena = arena();
        let hub = instance_builder("app.Locked", 16)
            .allocate_in(TypeId::new(6), &arena)
            .unwrap();
        let companion = hub.companion();
        assert_eq!(companion.monitor(), None);
        assert_eq!(companion.install_monitor(0x1000), 0x1000);
        assert_eq!(companion.install_monitor(0x2000), 0x1000);
        assert_eq!(companion.monitor(), Some(0x1000));
    }

    #[test]
    fn test_empty_vtable() {
        let arena = arena();
        let hub = instance_builder("app.NoMethods", 8)
            .allocate_in(TypeId::new(4), &arena)
            .unwrap();
        assert!(hub.vtable().is_empty());
    }
}
