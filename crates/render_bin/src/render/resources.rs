//! Device resource lifecycle
//!
//! Compiled draw lists and textures may live on several device contexts at
//! once. Each resource carries a creation mask with one bit per context and
//! the context stamp it was created under, so a recreated context is told
//! apart from a reused bit.
//!
//! # Lifecycle
//!
//! ```text
//! allocate ──► render thread creates on context N (bit N set)
//!    │
//! retire ──► frees queued on every canvas whose bit is set
//!    │
//! render thread frees on device ──► acknowledges on its canvas
//!    │
//! reconcile (update thread) clears bit N ──► mask empty ──► id returned once
//! ```
//!
//! Only the mask read-modify-write is locked; render passes never hold a
//! resource lock while drawing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::config::MAX_CONTEXT_BITS;
use crate::foundation::collections::IdPool;
use crate::render::canvas::CanvasState;
use crate::scene::{GeometryId, TextureId};

/// Which free list a draw-list id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Shared list compiled from every eligible atom of a molecule
    Molecule,
    /// Dedicated list for one reused geometry piece
    Piece,
}

impl ListKind {
    const fn index(self) -> usize {
        match self {
            Self::Molecule => 0,
            Self::Piece => 1,
        }
    }
}

/// Identity of a compiled draw list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayListId {
    /// Free list the id is drawn from
    pub kind: ListKind,
    /// Index within that free list
    pub index: u32,
}

/// What a resource is on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// Compiled draw list
    DrawList(DisplayListId),
    /// Texture object
    Texture(TextureId),
}

/// Per-context creation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationMask {
    bits: u32,
    stamps: [u64; MAX_CONTEXT_BITS],
    generations: [u64; MAX_CONTEXT_BITS],
}

impl Default for CreationMask {
    fn default() -> Self {
        Self {
            bits: 0,
            stamps: [0; MAX_CONTEXT_BITS],
            generations: [0; MAX_CONTEXT_BITS],
        }
    }
}

impl CreationMask {
    /// Whether the resource must be (re)created on context `bit`
    pub fn needs_create(&self, bit: u32, stamp: u64, generation: u64) -> bool {
        let slot = bit as usize;
        self.bits & (1 << bit) == 0 || self.stamps[slot] != stamp || self.generations[slot] != generation
    }

    /// Record creation on context `bit`
    pub fn mark_created(&mut self, bit: u32, stamp: u64, generation: u64) {
        let slot = bit as usize;
        self.bits |= 1 << bit;
        self.stamps[slot] = stamp;
        self.generations[slot] = generation;
    }

    /// Clear context `bit`; `false` if it was not set
    pub fn clear(&mut self, bit: u32) -> bool {
        let was_set = self.bits & (1 << bit) != 0;
        self.bits &= !(1 << bit);
        was_set
    }

    /// Whether the resource exists under the current context stamp
    pub fn is_current(&self, bit: u32, stamp: u64) -> bool {
        self.bits & (1 << bit) != 0 && self.stamps[bit as usize] == stamp
    }

    /// Raw context bits
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// No context holds the resource
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

/// A draw list or texture shared by every context that renders it
#[derive(Debug)]
pub struct DeviceResource {
    key: ResourceKey,
    mask: Mutex<CreationMask>,
    generation: AtomicU64,
    retired: AtomicBool,
    returned: AtomicBool,
}

impl DeviceResource {
    fn new(key: ResourceKey) -> Self {
        Self {
            key,
            mask: Mutex::new(CreationMask::default()),
            generation: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            returned: AtomicBool::new(false),
        }
    }

    /// Device identity
    pub fn key(&self) -> ResourceKey {
        self.key
    }

    /// Content generation; bumped whenever the contents must be rebuilt
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Contents changed: every context must recreate it
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether `canvas` must (re)create the resource before use
    pub fn needs_create(&self, canvas: &CanvasState) -> bool {
        self.mask
            .lock()
            .needs_create(canvas.context_bit(), canvas.context_stamp(), self.generation())
    }

    /// Render thread created the resource on `canvas`'s context
    pub fn mark_created(&self, canvas: &CanvasState) {
        let generation = self.generation();
        self.mask
            .lock()
            .mark_created(canvas.context_bit(), canvas.context_stamp(), generation);
    }

    /// Whether the resource lives on `canvas`'s current context
    pub fn is_current_on(&self, canvas: &CanvasState) -> bool {
        self.mask.lock().is_current(canvas.context_bit(), canvas.context_stamp())
    }

    /// Context bits holding the resource
    pub fn context_bits(&self) -> u32 {
        self.mask.lock().bits()
    }

    /// Whether the owner let go of the resource
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Whether the id went back to its pool
    pub fn is_returned(&self) -> bool {
        self.returned.load(Ordering::Acquire)
    }

    fn clear_bit(&self, bit: u32) -> (bool, bool) {
        let mut mask = self.mask.lock();
        let was_set = mask.clear(bit);
        (was_set, mask.is_empty())
    }
}

#[derive(Debug)]
struct SharedEntry {
    resource: Arc<DeviceResource>,
    users: usize,
}

impl SharedEntry {
    fn new(key: ResourceKey) -> Self {
        Self {
            resource: Arc::new(DeviceResource::new(key)),
            users: 0,
        }
    }
}

/// Diagnostics snapshot of the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    /// Live molecule list ids
    pub molecule_lists: usize,
    /// Live piece list ids
    pub piece_lists: usize,
    /// Molecule ids waiting for reuse
    pub molecule_free: usize,
    /// Piece ids waiting for reuse
    pub piece_free: usize,
    /// Textures referenced by bins
    pub textures: usize,
    /// Geometries with a dedicated piece list
    pub shared_geometries: usize,
    /// Resources retired but still held by some context
    pub retiring: usize,
}

/// Update-thread owner of every draw-list id and texture record
#[derive(Debug)]
pub struct ResourceRegistry {
    pools: [IdPool; 2],
    lists: HashMap<DisplayListId, Arc<DeviceResource>>,
    textures: HashMap<TextureId, SharedEntry>,
    pieces: HashMap<GeometryId, SharedEntry>,
    retiring: Vec<Arc<DeviceResource>>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            pools: [IdPool::new(), IdPool::new()],
            lists: HashMap::new(),
            textures: HashMap::new(),
            pieces: HashMap::new(),
            retiring: Vec::new(),
        }
    }

    /// Allocate a draw list from the `kind` free list
    pub fn allocate_list(&mut self, kind: ListKind) -> Arc<DeviceResource> {
        let id = DisplayListId {
            kind,
            index: self.pools[kind.index()].allocate(),
        };
        let resource = Arc::new(DeviceResource::new(ResourceKey::DrawList(id)));
        self.lists.insert(id, Arc::clone(&resource));
        log::trace!("Allocated draw list {id:?}");
        resource
    }

    /// Look up a live draw list
    pub fn list(&self, id: DisplayListId) -> Option<&Arc<DeviceResource>> {
        self.lists.get(&id)
    }

    /// A texture bin started using `texture`
    pub fn acquire_texture(&mut self, texture: TextureId) -> Arc<DeviceResource> {
        let entry = self
            .textures
            .entry(texture)
            .or_insert_with(|| SharedEntry::new(ResourceKey::Texture(texture)));
        entry.users += 1;
        Arc::clone(&entry.resource)
    }

    /// A texture bin stopped using `texture`; the last user retires it
    pub fn release_texture(&mut self, texture: TextureId, canvases: &[Arc<CanvasState>]) {
        let Some(entry) = self.textures.get_mut(&texture) else {
            log::error!("Texture {texture:?} released more often than acquired");
            return;
        };
        entry.users -= 1;
        if entry.users == 0 {
            if let Some(entry) = self.textures.remove(&texture) {
                self.retire(&entry.resource, canvases);
            }
        }
    }

    /// A piece of `geometry` started drawing through the geometry's dedicated list
    ///
    /// Every atom reusing the geometry shares one list id.
    pub fn acquire_piece_list(&mut self, geometry: GeometryId) -> Arc<DeviceResource> {
        if let Some(entry) = self.pieces.get_mut(&geometry) {
            entry.users += 1;
            return Arc::clone(&entry.resource);
        }
        let resource = self.allocate_list(ListKind::Piece);
        self.pieces.insert(
            geometry,
            SharedEntry {
                resource: Arc::clone(&resource),
                users: 1,
            },
        );
        resource
    }

    /// A piece stopped using the dedicated list of `geometry`; the last user retires it
    pub fn release_piece_list(&mut self, geometry: GeometryId, canvases: &[Arc<CanvasState>]) {
        let Some(entry) = self.pieces.get_mut(&geometry) else {
            log::error!("Piece list of {geometry:?} released more often than acquired");
            return;
        };
        entry.users -= 1;
        if entry.users == 0 {
            if let Some(entry) = self.pieces.remove(&geometry) {
                self.retire(&entry.resource, canvases);
            }
        }
    }

    /// Geometry contents changed; returns whether a dedicated list exists
    pub fn invalidate_piece_list(&self, geometry: GeometryId) -> bool {
        self.pieces.get(&geometry).map(|e| e.resource.invalidate()).is_some()
    }

    /// Texture record, if any bin uses it
    pub fn texture(&self, texture: TextureId) -> Option<&Arc<DeviceResource>> {
        self.textures.get(&texture).map(|e| &e.resource)
    }

    /// Texture contents changed; returns whether any bin uses it
    pub fn invalidate_texture(&self, texture: TextureId) -> bool {
        self.textures.get(&texture).map(|e| e.resource.invalidate()).is_some()
    }

    /// The owner is done with `resource`
    ///
    /// Frees are queued on one canvas per context bit that holds it. A
    /// resource no context holds goes straight back to its pool.
    pub fn retire(&mut self, resource: &Arc<DeviceResource>, canvases: &[Arc<CanvasState>]) {
        if resource.retired.swap(true, Ordering::AcqRel) {
            log::error!("Resource {:?} retired twice", resource.key);
            return;
        }
        let bits = resource.context_bits();
        for bit in (0..MAX_CONTEXT_BITS as u32).filter(|b| bits & (1 << b) != 0) {
            match canvases.iter().find(|c| c.context_bit() == bit) {
                Some(canvas) => canvas.queue_free(Arc::clone(resource)),
                None => {
                    resource.clear_bit(bit);
                }
            }
        }
        if resource.context_bits() == 0 {
            self.finish(resource);
        } else {
            self.retiring.push(Arc::clone(resource));
        }
    }

    /// Context `bit` no longer holds `resource`
    ///
    /// Returns `false` (and logs) when the bit was already clear, so a
    /// repeated release never returns the id twice.
    pub fn release(&mut self, resource: &Arc<DeviceResource>, bit: u32) -> bool {
        let (was_set, empty) = resource.clear_bit(bit);
        if !was_set {
            log::error!("Resource {:?} released twice on context bit {bit}", resource.key);
            return false;
        }
        if empty && resource.is_retired() {
            self.finish(resource);
        }
        true
    }

    /// Apply frees the render threads acknowledged
    pub fn reconcile(&mut self, canvases: &[Arc<CanvasState>]) -> usize {
        let mut released = 0;
        for canvas in canvases {
            for resource in canvas.take_freed() {
                if self.release(&resource, canvas.context_bit()) {
                    released += 1;
                }
            }
        }
        released
    }

    /// A context went away; drop its bit from every resource
    pub fn forget_context(&mut self, bit: u32) {
        let all: Vec<Arc<DeviceResource>> = self.all_resources().cloned().collect();
        for resource in all {
            let (was_set, empty) = resource.clear_bit(bit);
            if was_set && empty && resource.is_retired() {
                self.finish(&resource);
            }
        }
    }

    /// Every resource not yet returned, live or retiring
    pub fn all_resources(&self) -> impl Iterator<Item = &Arc<DeviceResource>> {
        self.lists
            .values()
            .chain(self.textures.values().map(|e| &e.resource))
            .chain(self.retiring.iter().filter(|r| matches!(r.key, ResourceKey::Texture(_))))
    }

    /// Resources currently held by context `bit`
    pub fn resources_on(&self, bit: u32) -> Vec<Arc<DeviceResource>> {
        self.all_resources()
            .filter(|r| r.context_bits() & (1 << bit) != 0)
            .cloned()
            .collect()
    }

    /// Counts for diagnostics and tests
    pub fn counts(&self) -> ResourceCounts {
        ResourceCounts {
            molecule_lists: self.pools[ListKind::Molecule.index()].live_count(),
            piece_lists: self.pools[ListKind::Piece.index()].live_count(),
            molecule_free: self.pools[ListKind::Molecule.index()].free_count(),
            piece_free: self.pools[ListKind::Piece.index()].free_count(),
            textures: self.textures.len(),
            shared_geometries: self.pieces.len(),
            retiring: self.retiring.len(),
        }
    }

    fn finish(&mut self, resource: &Arc<DeviceResource>) {
        if resource.returned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.retiring.retain(|r| !Arc::ptr_eq(r, resource));
        if let ResourceKey::DrawList(id) = resource.key {
            self.lists.remove(&id);
            if !self.pools[id.kind.index()].release(id.index) {
                log::error!("Draw list {id:?} returned to a pool that did not hand it out");
            }
        }
        log::trace!("Resource {:?} returned", resource.key);
    }
}
