//! # Render Bin
//!
//! One view's state-sorted bin hierarchy and everything that keeps it
//! current. The structure-update thread drives it with
//! [`RenderBin::process_messages`] followed by [`RenderBin::update_object`];
//! render threads walk it with the `render_*` passes in between.
//!
//! ## Frame Protocol
//!
//! ```text
//! process_messages(t)   drain messages ≤ t, stage changes, visibility diff
//! update_object()       apply staging to the bins in one step
//! render_*(context)     read-only walk, one render thread per canvas
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::config::{Config, RenderBinConfig, TransparencySortMode};
use crate::foundation::collections::SlotMap;
use crate::foundation::math::Mat4;
use crate::render::atom::{AtomState, RenderAtom};
use crate::render::bins::{AtomKey, BinChain, BinCounts, BinTree, DomainId};
use crate::render::canvas::{CanvasDescriptor, CanvasId, CanvasState};
use crate::render::compaction::CompactionPolicy;
use crate::render::error::{RenderBinError, RenderBinResult};
use crate::render::flags::{AtomFlags, CanvasDirty, StagingDirty};
use crate::render::messages::MessageQueue;
use crate::render::resources::{ResourceCounts, ResourceRegistry};
use crate::render::transparency::{SortTarget, TransparencyList};
use crate::render::update::Staging;
use crate::scene::{
    Appearance, Background, DrawAtom, DrawAtomId, EnvironmentResolver, Fog, FogId, GeometryId, Light, LightId,
    ModelClip, ModelClipId, OrderedGroupId, TransformGroupId, ViewSettings, VisibilityQuery,
};

/// Frame counter and scene time of the current update cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameState {
    /// Completed update cycles
    pub frame: u64,
    /// Scene time passed to the last `process_messages`
    pub reference_time: u64,
}

/// Scene-side services the bin calls back into
#[derive(Clone)]
pub struct Collaborators {
    /// Visible-set queries
    pub visibility: Arc<dyn VisibilityQuery>,
    /// Light/fog/clip/alternate appearance resolution
    pub environment: Arc<dyn EnvironmentResolver>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// A draw atom the scene graph registered with this view
#[derive(Debug, Clone)]
pub(crate) struct Registered {
    pub(crate) draw_atom: Arc<DrawAtom>,
    pub(crate) appearance: Arc<Appearance>,
    pub(crate) background: bool,
    pub(crate) switched_off: bool,
}

impl Registered {
    pub(crate) fn new(draw_atom: Arc<DrawAtom>, background: bool) -> Self {
        let appearance = draw_atom.appearance.clone().unwrap_or_default();
        Self {
            draw_atom,
            appearance,
            background,
            switched_off: false,
        }
    }
}

/// Transparency list of a domain; ordered domains are not depth sorted
pub(crate) fn domain_list<'a>(
    scene: &'a mut TransparencyList,
    background: &'a mut TransparencyList,
    domain: DomainId,
) -> Option<&'a mut TransparencyList> {
    match domain {
        DomainId::Scene => Some(scene),
        DomainId::Background => Some(background),
        DomainId::Ordered(..) => None,
    }
}

/// The render bin of one view
#[derive(Debug)]
pub struct RenderBin {
    pub(crate) config: RenderBinConfig,
    pub(crate) collaborators: Collaborators,
    pub(crate) queue: MessageQueue,
    pub(crate) frame: FrameState,
    pub(crate) view: ViewSettings,

    pub(crate) registered: HashMap<DrawAtomId, Registered>,
    pub(crate) geometry_users: HashMap<GeometryId, usize>,
    pub(crate) atoms: SlotMap<AtomKey, RenderAtom>,
    pub(crate) index: HashMap<DrawAtomId, AtomKey>,

    pub(crate) transforms: HashMap<TransformGroupId, Mat4>,
    pub(crate) lights: HashMap<LightId, Light>,
    pub(crate) fogs: HashMap<FogId, Fog>,
    pub(crate) clips: HashMap<ModelClipId, ModelClip>,
    pub(crate) background: Background,
    pub(crate) ordered_tables: HashMap<OrderedGroupId, Vec<usize>>,

    pub(crate) tree: BinTree,
    pub(crate) transparent: TransparencyList,
    pub(crate) background_transparent: TransparencyList,
    pub(crate) resources: ResourceRegistry,
    pub(crate) canvases: Vec<Arc<CanvasState>>,
    pub(crate) compaction: CompactionPolicy,
    pub(crate) staging: Staging,
}

impl RenderBin {
    /// Create the render bin for a view
    ///
    /// # Arguments
    /// * `config` - Capacity, transparency and compaction tuning
    /// * `collaborators` - Visibility and environment services
    /// * `queue` - This view's subscription to the message bus
    ///
    /// # Errors
    ///
    /// [`RenderBinError::Config`] when the configuration does not validate.
    pub fn new(config: RenderBinConfig, collaborators: Collaborators, queue: MessageQueue) -> RenderBinResult<Self> {
        config.validate()?;
        let view = ViewSettings::from_config(&config.transparency);
        let sorting = view.sort_mode == TransparencySortMode::Geometry;
        let list = || TransparencyList::new(view.order, config.transparency.incremental_threshold, sorting);
        log::info!(
            "Render bin created: {} lights, {} contexts, sort mode {:?}",
            config.max_lights,
            config.max_contexts,
            view.sort_mode
        );
        Ok(Self {
            tree: BinTree::new(config.max_lights),
            transparent: list(),
            background_transparent: list(),
            compaction: CompactionPolicy::new(config.compaction.clone()),
            config,
            collaborators,
            queue,
            frame: FrameState::default(),
            view,
            registered: HashMap::new(),
            geometry_users: HashMap::new(),
            atoms: SlotMap::with_key(),
            index: HashMap::new(),
            transforms: HashMap::new(),
            lights: HashMap::new(),
            fogs: HashMap::new(),
            clips: HashMap::new(),
            background: Background::default(),
            ordered_tables: HashMap::new(),
            resources: ResourceRegistry::new(),
            canvases: Vec::new(),
            staging: Staging::default(),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &RenderBinConfig {
        &self.config
    }

    /// Frame counter and reference time
    pub fn frame(&self) -> FrameState {
        self.frame
    }

    /// View settings applied by the last update
    pub fn view(&self) -> &ViewSettings {
        &self.view
    }

    // Direct registration

    /// Register a draw atom without going through the message queue
    ///
    /// It joins the bins on the next update if it is visible.
    pub fn insert(&mut self, draw_atom: Arc<DrawAtom>) {
        self.register(draw_atom, false);
    }

    /// Unregister a draw atom; it leaves the bins on the next update
    pub fn remove(&mut self, atom: DrawAtomId) {
        self.unregister(atom);
    }

    pub(crate) fn register(&mut self, draw_atom: Arc<DrawAtom>, background: bool) {
        let id = draw_atom.id;
        if let Some(previous) = self.registered.remove(&id) {
            log::debug!("Draw atom {id:?} registered again; replacing it");
            self.count_geometry(&previous.draw_atom, false);
            if self.index.contains_key(&id) {
                self.staging.change(id).rebin = true;
            }
        }
        self.count_geometry(&draw_atom, true);
        self.registered.insert(id, Registered::new(draw_atom, background));
        self.staging.dirty.insert(StagingDirty::VISIBILITY);
    }

    pub(crate) fn unregister(&mut self, atom: DrawAtomId) {
        let Some(registered) = self.registered.remove(&atom) else {
            log::warn!("Removal of unknown draw atom {atom:?} ignored");
            return;
        };
        self.count_geometry(&registered.draw_atom, false);
        if let Some(key) = self.index.get(&atom).copied() {
            self.stage_leave(key);
        }
        self.staging.change(atom).forget = true;
        self.staging.dirty.insert(StagingDirty::VISIBILITY);
    }

    pub(crate) fn count_geometry(&mut self, draw_atom: &DrawAtom, add: bool) {
        for geometry in &draw_atom.geometry {
            if add {
                *self.geometry_users.entry(geometry.id).or_insert(0) += 1;
            } else if let Some(users) = self.geometry_users.get_mut(&geometry.id) {
                *users -= 1;
                if *users == 0 {
                    self.geometry_users.remove(&geometry.id);
                }
            }
        }
    }

    /// Local-to-world transform of `group`, falling back to the atom's own
    pub(crate) fn transform_of(&self, group: TransformGroupId, fallback: &Mat4) -> Mat4 {
        self.transforms.get(&group).copied().unwrap_or(*fallback)
    }

    /// Like [`Self::transform_of`], but sees transforms staged this frame
    pub(crate) fn pending_transform(&self, group: TransformGroupId, fallback: &Mat4) -> Mat4 {
        match self.staging.transforms.get(&group) {
            Some(matrix) => *matrix,
            None => self.transform_of(group, fallback),
        }
    }

    // Canvases

    /// Attach a canvas; canvases in one share group share a context bit
    ///
    /// # Errors
    ///
    /// [`RenderBinError::ContextLimitExceeded`] when every context bit is taken.
    pub fn attach_canvas(&mut self, descriptor: &CanvasDescriptor) -> RenderBinResult<Arc<CanvasState>> {
        if self.canvas(descriptor.id).is_some() {
            log::warn!("Canvas {:?} attached twice", descriptor.id);
        }
        let (bit, peer_stamp) = self.assign_context_bit(descriptor.share_group, None)?;
        let canvas = Arc::new(CanvasState::new(descriptor, bit));
        if let Some(stamp) = peer_stamp {
            canvas.rebind_context(bit, descriptor.share_group, stamp);
        }
        self.canvases.push(Arc::clone(&canvas));
        log::info!("Canvas {:?} attached on context bit {bit}", descriptor.id);
        Ok(canvas)
    }

    /// Context bit for a canvas in `group`, with the stamp of the canvas
    /// already rendering through it
    fn assign_context_bit(&self, group: Option<u32>, moving: Option<CanvasId>) -> RenderBinResult<(u32, Option<u64>)> {
        let others = || self.canvases.iter().filter(move |c| Some(c.id()) != moving);
        if let Some(peer) = group.and_then(|g| others().find(|c| c.share_group() == Some(g))) {
            return Ok((peer.context_bit(), Some(peer.context_stamp())));
        }
        let used: HashSet<u32> = others().map(|c| c.context_bit()).collect();
        (0..self.config.max_contexts as u32)
            .find(|b| !used.contains(b))
            .map(|bit| (bit, None))
            .ok_or(RenderBinError::ContextLimitExceeded(self.config.max_contexts))
    }

    /// Move a canvas into another share group, or onto a context of its own
    ///
    /// The canvas renders through a different device context afterwards, so
    /// it recreates what it draws on first use. Frees queued for its old
    /// context move to a canvas still using that context; without one, the
    /// old context is forgotten.
    ///
    /// # Errors
    ///
    /// [`RenderBinError::UnknownCanvas`] for a canvas that is not attached,
    /// [`RenderBinError::ContextLimitExceeded`] when no context bit is free.
    /// Nothing changes on error.
    pub fn set_share_group(&mut self, id: CanvasId, group: Option<u32>) -> RenderBinResult<()> {
        let canvas = Arc::clone(self.require_canvas(id)?);
        if canvas.share_group() == group {
            return Ok(());
        }
        let (bit, peer_stamp) = self.assign_context_bit(group, Some(id))?;
        let old_bit = canvas.context_bit();
        self.resources.reconcile(std::slice::from_ref(&canvas));
        let stale = canvas.take_pending_frees();
        let remaining = self.canvases.iter().find(|c| c.context_bit() == old_bit && c.id() != id).cloned();
        match remaining {
            Some(peer) => {
                for resource in stale {
                    peer.queue_free(resource);
                }
            }
            None => self.resources.forget_context(old_bit),
        }
        let stamp = peer_stamp.unwrap_or_else(|| canvas.context_stamp() + 1);
        canvas.rebind_context(bit, group, stamp);
        log::info!("Canvas {id:?} moved from context bit {old_bit} to {bit} (share group {group:?})");
        Ok(())
    }

    /// Attached canvas by id
    pub fn canvas(&self, id: CanvasId) -> Option<&Arc<CanvasState>> {
        self.canvases.iter().find(|c| c.id() == id)
    }

    /// Every attached canvas
    pub fn canvases(&self) -> &[Arc<CanvasState>] {
        &self.canvases
    }

    fn require_canvas(&self, id: CanvasId) -> RenderBinResult<&Arc<CanvasState>> {
        self.canvas(id).ok_or(RenderBinError::UnknownCanvas(id))
    }

    /// Ask the canvas's render thread to free its device resources
    ///
    /// # Errors
    ///
    /// [`RenderBinError::UnknownCanvas`] for a canvas that is not attached.
    pub fn request_teardown(&self, id: CanvasId) -> RenderBinResult<Arc<CanvasState>> {
        let canvas = self.require_canvas(id)?;
        canvas.request_teardown();
        Ok(Arc::clone(canvas))
    }

    /// Detach a canvas whose teardown the render thread acknowledged
    ///
    /// # Errors
    ///
    /// [`RenderBinError::UnknownCanvas`] for a canvas that is not attached,
    /// [`RenderBinError::TeardownPending`] before the acknowledgement.
    pub fn detach_canvas(&mut self, id: CanvasId) -> RenderBinResult<()> {
        let canvas = Arc::clone(self.require_canvas(id)?);
        if !canvas.teardown_acknowledged() {
            return Err(RenderBinError::TeardownPending(id));
        }
        self.resources.reconcile(std::slice::from_ref(&canvas));
        self.canvases.retain(|c| c.id() != id);
        let bit = canvas.context_bit();
        if !self.canvases.iter().any(|c| c.context_bit() == bit) {
            self.resources.forget_context(bit);
        }
        log::info!("Canvas {id:?} detached");
        Ok(())
    }

    /// The canvas's context was lost and recreated
    ///
    /// Every resource is recreated on first use; frees queued for the old
    /// context are dropped.
    ///
    /// # Errors
    ///
    /// [`RenderBinError::UnknownCanvas`] for a canvas that is not attached.
    pub fn context_lost(&mut self, id: CanvasId) -> RenderBinResult<()> {
        let canvas = Arc::clone(self.require_canvas(id)?);
        canvas.context_lost();
        let stale = canvas.take_pending_frees();
        if !stale.is_empty() {
            log::debug!("Dropped {} frees queued for the lost context", stale.len());
        }
        let bit = canvas.context_bit();
        for other in self.canvases.iter().filter(|c| c.context_bit() == bit && c.id() != id) {
            other.context_lost();
            other.take_pending_frees();
        }
        self.resources.forget_context(bit);
        Ok(())
    }

    /// Set or clear a canvas's off-screen buffer size
    ///
    /// # Errors
    ///
    /// [`RenderBinError::UnknownCanvas`] for a canvas that is not attached.
    pub fn set_offscreen_size(&self, id: CanvasId, size: Option<(u32, u32)>) -> RenderBinResult<()> {
        self.require_canvas(id)?.set_offscreen_size(size);
        Ok(())
    }

    /// Start an off-screen render on a canvas
    ///
    /// # Errors
    ///
    /// [`RenderBinError::UnknownCanvas`], [`RenderBinError::OffscreenNotConfigured`]
    /// or [`RenderBinError::OffscreenBusy`]; nothing changes on error.
    pub fn request_offscreen(&self, id: CanvasId) -> RenderBinResult<()> {
        self.require_canvas(id)?.request_offscreen()
    }

    // Teardown

    /// Drain pending messages, remove every atom and release every resource
    ///
    /// Frees for attached canvases stay queued until their render threads
    /// perform them.
    pub fn shutdown(&mut self) {
        let dropped = self.queue.drain_all().len();
        let ids: Vec<DrawAtomId> = self.registered.keys().copied().collect();
        for id in ids {
            self.unregister(id);
        }
        self.update_object();
        log::info!(
            "Render bin shut down; {dropped} pending messages dropped, {} frees outstanding",
            self.canvases.iter().map(|c| c.pending_free_count()).sum::<usize>()
        );
    }

    // Diagnostics

    /// Lifecycle state of a registered atom
    pub fn atom_state(&self, atom: DrawAtomId) -> Option<AtomState> {
        match self.index.get(&atom).and_then(|k| self.atoms.get(*k)) {
            Some(tracked) => Some(tracked.state()),
            None => self.registered.contains_key(&atom).then_some(AtomState::NotVisible),
        }
    }

    /// Bins an in-bin atom is linked under
    pub fn chain_of(&self, atom: DrawAtomId) -> Option<BinChain> {
        self.index.get(&atom).and_then(|k| self.atoms.get(*k)).and_then(|a| a.chain)
    }

    /// Atoms with a tracking entry
    pub fn tracked_count(&self) -> usize {
        self.atoms.len()
    }

    /// Atoms registered by the scene graph
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Live nodes per bin level
    pub fn bin_counts(&self) -> BinCounts {
        self.tree.counts()
    }

    /// Draw-list and texture bookkeeping
    pub fn resource_counts(&self) -> ResourceCounts {
        self.resources.counts()
    }

    /// Depths of the scene transparency list in draw order
    pub fn transparent_depths(&self) -> Vec<f32> {
        self.transparent.depths()
    }

    /// Number of records on the scene and background transparency lists
    pub fn transparent_record_count(&self) -> (usize, usize) {
        (self.transparent.len(), self.background_transparent.len())
    }

    /// Check every structural invariant; the first violation is returned
    ///
    /// # Errors
    ///
    /// A description of the violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.tree.verify(&self.atoms)?;
        if !self.transparent.is_sorted() || !self.background_transparent.is_sorted() {
            return Err("transparency list out of order".into());
        }
        for (key, atom) in &self.atoms {
            if self.index.get(&atom.id()) != Some(&key) {
                return Err(format!("atom {:?} missing from the id index", atom.id()));
            }
            let in_bin = atom.flags.contains(AtomFlags::IN_BIN);
            if in_bin && !atom.flags.contains(AtomFlags::VISIBLE) {
                return Err(format!("atom {:?} is binned but not visible", atom.id()));
            }
            if in_bin && atom.flags.contains(AtomFlags::SWITCHED_OFF) {
                return Err(format!("atom {:?} is binned but switched off", atom.id()));
            }
            let sorted = atom.pieces.iter().any(|p| p.transparent.is_some());
            if sorted && !atom.chain.is_some_and(|c| c.transparent) {
                return Err(format!("atom {:?} has stale depth-sort records", atom.id()));
            }
            if sorted != atom.flags.contains(AtomFlags::IN_DEPTH_SORT_LIST) {
                return Err(format!("atom {:?} depth-sort flag disagrees with its records", atom.id()));
            }
            let Some(chain) = atom.chain else {
                continue;
            };
            if chain.transparent != atom.flags.contains(AtomFlags::TRANSPARENT) {
                return Err(format!("atom {:?} transparency flag disagrees with its molecule list", atom.id()));
            }
            let background = atom.flags.contains(AtomFlags::BACKGROUND);
            let expected = match chain.domain {
                DomainId::Background => background,
                DomainId::Ordered(..) => !background && atom.flags.contains(AtomFlags::IN_ORDERED),
                DomainId::Scene => !background,
            };
            if !expected {
                return Err(format!("atom {:?} sits in the wrong domain {:?}", atom.id(), chain.domain));
            }
        }
        let counted: usize = self.tree.molecules.values().map(|m| m.atom_count).sum();
        let binned = self.atoms.values().filter(|a| a.chain.is_some()).count();
        if counted != binned {
            return Err(format!("{counted} atoms in molecules but {binned} binned"));
        }
        Ok(())
    }

    /// Record `flags` on every canvas and hand them to the render threads
    pub(crate) fn publish_canvas_dirty(&self, flags: CanvasDirty) {
        for canvas in &self.canvases {
            if !flags.is_empty() {
                canvas.mark_dirty(flags);
            }
            canvas.publish_dirty();
        }
    }

    /// Drop every record of both transparency lists
    pub(crate) fn clear_transparency_records(&mut self) {
        for target in self.transparent.clear().into_iter().chain(self.background_transparent.clear()) {
            match target {
                SortTarget::TextureBin(texture_bin) => {
                    if let Some(bin) = self.tree.texture_bins.get_mut(texture_bin) {
                        bin.state.transparent_record = None;
                    }
                }
                SortTarget::Piece { atom, piece } => {
                    if let Some(p) = self.atoms.get_mut(atom).and_then(|a| a.pieces.get_mut(piece)) {
                        p.transparent = None;
                    }
                }
            }
        }
        for atom in self.atoms.values_mut() {
            atom.flags.remove(AtomFlags::IN_DEPTH_SORT_LIST);
        }
    }
}
