//! Type registry
//!
//! The explicitly constructed context object threaded through everything
//! that touches type metadata: the world kind, the target machine, the
//! metadata arena, the reference-map table, and the flat id -> hub table.
//! Types are referenced by small integer id; the id is the sole
//! cross-reference key other subsystems store.

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use opal_target::{StableArena, TargetMachine};

use crate::error::MetaError;
use crate::hub::{Hub, HubBuilder, TypeCheckData, TypeId};
use crate::refmap::ReferenceMapRegistry;
use crate::typecheck::HashingConfig;

/// Which whole-program subtype-check representation this build uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldKind {
    /// The full hierarchy is known at build time; range checks apply
    Closed,

    /// Types may be introduced after the initial build
    Open,
}

/// Registry of every type in a build layer
///
/// Build-time registration is single-threaded. At run time the registry is
/// append-only: hubs are added by the dynamic loader and never removed or
/// replaced.
pub struct TypeRegistry {
    world: WorldKind,
    machine: TargetMachine,
    hashing: HashingConfig,
    arena: Arc<StableArena>,
    reference_maps: ReferenceMapRegistry,

    /// Flat id -> hub table; index is the type id
    hubs: RwLock<Vec<NonNull<Hub>>>,

    /// Name -> id, for loader lookups and duplicate detection
    names: RwLock<FxHashMap<Box<str>, TypeId>>,

    /// Serializes "already loaded?" check-and-set during dynamic definition
    load_lock: Mutex<()>,
}

// Hubs are immutable after publication (their interior mutability is all
// atomics/once-cells) and live in the arena owned by this registry.
unsafe impl Send for TypeRegistry {}
unsafe impl Sync for TypeRegistry {}

impl TypeRegistry {
    /// Create a registry for a build with the given world kind
    pub fn new(world: WorldKind, machine: TargetMachine, hashing: HashingConfig) -> Self {
        let arena = Arc::new(StableArena::new());
        let reference_maps = ReferenceMapRegistry::new(Arc::clone(&arena));
        Self {
            world,
            machine,
            hashing,
            arena,
            reference_maps,
            hubs: RwLock::new(Vec::new()),
            names: RwLock::new(FxHashMap::default()),
            load_lock: Mutex::new(()),
        }
    }

    /// World kind this build was generated with
    #[inline]
    pub fn world(&self) -> WorldKind {
        self.world
    }

    /// The target machine description
    #[inline]
    pub fn machine(&self) -> &TargetMachine {
        &self.machine
    }

    /// Interface hashing configuration
    #[inline]
    pub fn hashing(&self) -> HashingConfig {
        self.hashing
    }

    /// The arena descriptors and reference maps live in
    #[inline]
    pub fn arena(&self) -> &Arc<StableArena> {
        &self.arena
    }

    /// The shared reference-map table
    #[inline]
    pub fn reference_maps(&self) -> &ReferenceMapRegistry {
        &self.reference_maps
    }

    /// Number of registered types
    pub fn type_count(&self) -> usize {
        self.hubs.read().len()
    }

    /// Look up a hub by type id
    #[inline]
    pub fn hub(&self, id: TypeId) -> Option<&Hub> {
        let hubs = self.hubs.read();
        let ptr = hubs.get(id.index()).copied()?;
        // Published hubs are fully initialized (release fence at allocation)
        // and never deallocated.
        Some(unsafe { &*ptr.as_ptr() })
    }

    /// Look up a hub by name
    pub fn hub_by_name(&self, name: &str) -> Option<&Hub> {
        let id = *self.names.read().get(name)?;
        self.hub(id)
    }

    /// Register a type during build-time analysis
    ///
    /// Assigns the next type id, allocates the hub in the arena, and
    /// publishes it. A pre-set type-check payload must match the build's
    /// world kind.
    pub fn register(&self, builder: HubBuilder) -> Result<&Hub, MetaError> {
        let _guard = self.load_lock.lock();
        self.register_locked(builder)
    }

    /// Install the type-check payload for a registered type
    ///
    /// The variant must match the build's world kind; the payload is
    /// write-once and a second installation fails fast.
    pub fn install_type_check(&self, id: TypeId, data: TypeCheckData) -> Result<(), MetaError> {
        let hub = self.hub(id).ok_or(MetaError::UnknownTypeId(id.as_u32()))?;
        self.check_world(hub.name(), &data)?;
        hub.set_type_check(data)
    }

    pub(crate) fn check_world(&self, name: &str, data: &TypeCheckData) -> Result<(), MetaError> {
        let matches = match (self.world, data) {
            (WorldKind::Closed, TypeCheckData::Closed { .. }) => true,
            (WorldKind::Open, TypeCheckData::Open(_)) => true,
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(MetaError::WrongWorldPayload(name.to_string()))
        }
    }

    /// Hold the load lock; dynamic definition keeps it until publication
    pub(crate) fn load_guard(&self) -> MutexGuard<'_, ()> {
        self.load_lock.lock()
    }

    /// Whether a name is already taken (callers hold the load lock)
    pub(crate) fn name_taken(&self, name: &str) -> bool {
        self.names.read().contains_key(name)
    }

    /// Register with the load lock already held
    pub(crate) fn register_locked(&self, builder: HubBuilder) -> Result<&Hub, MetaError> {
        if let Some(data) = builder.pending_type_check() {
            self.check_world(builder.pending_name(), data)?;
        }
        let id = TypeId::new(self.hubs.read().len() as u32);
        let hub = builder.allocate_in(id, &self.arena)?;
        self.hubs.write().push(NonNull::from(hub));
        self.names
            .write()
            .insert(hub.name().into(), hub.type_id());
        Ok(hub)
    }
}
