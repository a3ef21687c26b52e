//! Two-phase update: message staging and the bin update
//!
//! [`RenderBin::process_messages`] only records what changed and decides
//! visibility; [`RenderBin::update_object`] applies everything in one step
//! while no render thread is walking the bins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::config::TransparencySortMode;
use crate::foundation::math::{Bounds, Mat4, Point3};
use crate::render::atom::RenderAtom;
use crate::render::bins::{AtomKey, BinChain, DomainId, Placement, SoleUpdate};
use crate::render::canvas::CanvasId;
use crate::render::flags::{AtomFlags, CanvasDirty, Reevaluate, StagingDirty};
use crate::render::messages::MutationMessage;
use crate::render::render_bin::{domain_list, RenderBin};
use crate::render::resources::ListKind;
use crate::render::transparency::{ResortKind, SortTarget};
use crate::scene::{
    Appearance, AppearanceComponents, Background, Candidates, DrawAtom, DrawAtomId, Fog, GeometryId, Light,
    ModelClip, OrderedGroupId, ResolvedEnvironment, TextureId, TransformGroupId, ViewSettings,
};

/// Staged work for one draw atom
#[derive(Debug, Default)]
pub(crate) struct AtomChange {
    /// Leave the bins
    pub(crate) leave: bool,
    /// Unlink (if linked) and classify again
    pub(crate) rebin: bool,
    /// Drop the tracking entry once unregistered
    pub(crate) forget: bool,
    /// Environment resolved this frame
    pub(crate) environment: Option<ResolvedEnvironment>,
    /// New effective appearance for an atom that keeps its bins
    pub(crate) appearance: Option<Arc<Appearance>>,
    /// Sole-user component changes applied in place
    pub(crate) sole_updates: Vec<SoleUpdate>,
}

/// Everything collected between two updates
#[derive(Debug, Default)]
pub(crate) struct Staging {
    pub(crate) dirty: StagingDirty,
    pub(crate) reevaluate: Reevaluate,
    pub(crate) view: Option<ViewSettings>,
    pub(crate) transforms: HashMap<TransformGroupId, Mat4>,
    pub(crate) lights: Vec<Light>,
    pub(crate) fogs: Vec<Fog>,
    pub(crate) clips: Vec<ModelClip>,
    pub(crate) background: Option<Background>,
    pub(crate) ordered_tables: Vec<(OrderedGroupId, Option<Vec<usize>>)>,
    pub(crate) textures: Vec<TextureId>,
    pub(crate) geometries: Vec<GeometryId>,
    pub(crate) offscreen: Vec<CanvasId>,
    pub(crate) canvas_dirty: CanvasDirty,
    changes: HashMap<DrawAtomId, AtomChange>,
    order: Vec<DrawAtomId>,
}

impl Staging {
    /// Change record for `atom`, created on first use
    pub(crate) fn change(&mut self, atom: DrawAtomId) -> &mut AtomChange {
        if !self.changes.contains_key(&atom) {
            self.order.push(atom);
        }
        self.changes.entry(atom).or_default()
    }

    pub(crate) fn staged(&self, atom: DrawAtomId) -> Option<&AtomChange> {
        self.changes.get(&atom)
    }

    /// Changes in the order atoms were first staged
    fn take_changes(&mut self) -> Vec<(DrawAtomId, AtomChange)> {
        let mut changes = std::mem::take(&mut self.changes);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| changes.remove(&id).map(|c| (id, c)))
            .collect()
    }
}

/// What one [`RenderBin::update_object`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Atoms linked into a molecule
    pub inserted: usize,
    /// Atoms unlinked from a molecule
    pub removed: usize,
    /// Tracking entries dropped for unregistered atoms
    pub forgotten: usize,
    /// Bins freed after they went empty
    pub released_bins: usize,
    /// Pending bins merged into live lists
    pub merged_bins: usize,
    /// Sole-user components updated in place
    pub sole_updates: usize,
    /// How the scene transparency list was restored
    pub resort: ResortKind,
    /// Device resources whose ids went back to their pool
    pub resources_released: usize,
    /// Tracking entries dropped by compaction
    pub compacted: usize,
}

impl UpdateStats {
    /// Whether the bin hierarchy changed shape
    pub fn structure_changed(&self) -> bool {
        self.inserted + self.removed + self.released_bins + self.merged_bins + self.sole_updates > 0
    }
}

/// Union of the piece bounds of `draw_atom` placed at `local_to_world`
fn world_bounds(draw_atom: &DrawAtom, local_to_world: &Mat4) -> Option<Bounds> {
    draw_atom
        .geometry
        .iter()
        .map(|g| g.bounds.transformed(local_to_world))
        .reduce(|a, b| a.union(&b))
}

impl RenderBin {
    // Phase one: staging

    /// Drain messages up to `reference_time` and stage their effects
    ///
    /// Nothing a render pass reads is modified here. Returns the number of
    /// messages handled.
    pub fn process_messages(&mut self, reference_time: u64) -> usize {
        self.frame.reference_time = reference_time;
        let messages = self.queue.drain_until(reference_time);
        for envelope in &messages {
            log::trace!("Handling {} #{}", envelope.message.name(), envelope.seq);
            self.handle(&envelope.message);
        }
        let handled = messages.len();
        drop(messages);

        let view = self.staging.view.clone().unwrap_or_else(|| self.view.clone());
        self.stage_visibility(&view, reference_time);
        self.stage_reevaluation(&view);
        if handled > 0 {
            log::debug!(
                "Processed {handled} messages at t={reference_time}: {:?}, {} atoms staged",
                self.staging.dirty,
                self.staging.order.len()
            );
        }
        handled
    }

    fn handle(&mut self, message: &MutationMessage) {
        match message {
            MutationMessage::InsertNodes(atoms) => {
                for atom in atoms {
                    self.register(Arc::clone(atom), false);
                }
            }
            MutationMessage::RemoveNodes(ids) => {
                for id in ids {
                    self.unregister(*id);
                }
            }
            MutationMessage::TransformChanged(transforms) => {
                self.staging.transforms.extend(transforms.iter().copied());
                self.staging.dirty.insert(StagingDirty::VISIBILITY);
                self.staging.canvas_dirty.insert(CanvasDirty::TRANSFORMS);
            }
            MutationMessage::LightChanged { light, scope_changed } => {
                self.staging.lights.push(light.clone());
                self.stage_environment(CanvasDirty::LIGHTS, *scope_changed, Reevaluate::LIGHTS);
            }
            MutationMessage::FogChanged { fog, scope_changed } => {
                self.staging.fogs.push(fog.clone());
                self.stage_environment(CanvasDirty::FOG, *scope_changed, Reevaluate::FOG);
            }
            MutationMessage::ModelClipChanged { clip, scope_changed } => {
                self.staging.clips.push(clip.clone());
                self.stage_environment(CanvasDirty::MODEL_CLIP, *scope_changed, Reevaluate::MODEL_CLIP);
            }
            MutationMessage::AlternateAppearanceChanged => {
                self.staging.reevaluate.insert(Reevaluate::ALTERNATE_APPEARANCE);
            }
            MutationMessage::BackgroundChanged(background) => self.stage_background(background),
            MutationMessage::AppearanceChanged {
                appearance,
                components,
                atoms,
            } => {
                for id in atoms {
                    self.stage_appearance(*id, Arc::clone(appearance), *components);
                }
            }
            MutationMessage::GeometryChanged(atoms) => {
                for atom in atoms {
                    self.stage_geometry(Arc::clone(atom));
                }
                self.staging.dirty.insert(StagingDirty::VISIBILITY);
            }
            MutationMessage::TextureChanged(texture) => {
                self.staging.textures.push(*texture);
                self.staging.canvas_dirty.insert(CanvasDirty::TEXTURES);
            }
            MutationMessage::ShaderChanged { shader, atoms } => {
                for id in atoms {
                    let Some(registered) = self.registered.get(id) else {
                        log::warn!("Shader change for unknown draw atom {id:?} ignored");
                        continue;
                    };
                    let appearance = Arc::new(Appearance {
                        shader: shader.clone(),
                        ..(*registered.appearance).clone()
                    });
                    self.stage_appearance(*id, appearance, AppearanceComponents::SHADER);
                }
            }
            MutationMessage::OrderedGroupInserted { group, child_order } => {
                self.staging.ordered_tables.push((*group, child_order.clone()));
                self.staging.dirty.insert(StagingDirty::ORDERED);
            }
            MutationMessage::OrderedGroupRemoved(group) => {
                self.staging.ordered_tables.push((*group, None));
                self.staging.dirty.insert(StagingDirty::ORDERED);
            }
            MutationMessage::OrderedGroupTableChanged { group, child_order } => {
                self.staging.ordered_tables.push((*group, child_order.clone()));
                self.staging.dirty.insert(StagingDirty::ORDERED);
                self.staging.canvas_dirty.insert(CanvasDirty::BINS);
            }
            MutationMessage::UpdateView(view) => {
                if view.sort_inputs_changed(&self.view) {
                    self.staging.dirty.insert(StagingDirty::RESORT_ALL);
                }
                self.staging.view = Some(view.clone());
                self.staging.dirty.insert(StagingDirty::VIEW | StagingDirty::VISIBILITY);
                self.staging.canvas_dirty.insert(CanvasDirty::VIEW);
            }
            MutationMessage::SwitchChanged { on, off } => {
                for (ids, switched_off) in [(on, false), (off, true)] {
                    for id in ids {
                        self.set_switched_off(*id, switched_off);
                    }
                }
                self.staging.dirty.insert(StagingDirty::VISIBILITY);
            }
            MutationMessage::RenderOffscreen(canvas) => self.staging.offscreen.push(*canvas),
        }
    }

    fn stage_environment(&mut self, canvas: CanvasDirty, scope_changed: bool, category: Reevaluate) {
        self.staging.canvas_dirty.insert(canvas);
        self.staging.dirty.insert(StagingDirty::ENVIRONMENT);
        if scope_changed {
            self.staging.reevaluate.insert(category);
        }
    }

    fn stage_background(&mut self, background: &Background) {
        let incoming: HashSet<DrawAtomId> = background.geometry.iter().map(|a| a.id).collect();
        let stale: Vec<DrawAtomId> = self
            .registered
            .iter()
            .filter(|(id, r)| r.background && !incoming.contains(id))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.unregister(id);
        }
        for atom in &background.geometry {
            let unchanged = self
                .registered
                .get(&atom.id)
                .is_some_and(|r| r.background && Arc::ptr_eq(&r.draw_atom, atom));
            if !unchanged {
                self.register(Arc::clone(atom), true);
            }
        }
        self.staging.background = Some(background.clone());
        self.staging.dirty.insert(StagingDirty::BACKGROUND);
        self.staging.canvas_dirty.insert(CanvasDirty::BACKGROUND);
    }

    fn stage_appearance(&mut self, id: DrawAtomId, appearance: Arc<Appearance>, components: AppearanceComponents) {
        let Some(registered) = self.registered.get_mut(&id) else {
            log::warn!("Appearance change for unknown draw atom {id:?} ignored");
            return;
        };
        registered.appearance = Arc::clone(&appearance);
        let Some(atom) = self.index.get(&id).and_then(|k| self.atoms.get(*k)) else {
            return;
        };
        if atom.environment.alternate_appearance.is_some() || atom.flags.contains(AtomFlags::PENDING_REMOVAL) {
            return;
        }
        let Some(chain) = atom.chain else {
            return;
        };
        if self.staging.staged(id).is_some_and(|c| c.rebin) {
            return;
        }
        let placement = if RenderAtom::classify_transparent(&appearance, &atom.draw_atom) != chain.transparent {
            Placement::Reinsert
        } else {
            self.tree.placement(&chain, &appearance, &atom.draw_atom, components)
        };
        let change = self.staging.change(id);
        match placement {
            Placement::Unchanged => change.appearance = Some(appearance),
            Placement::InPlace(updates) => {
                change.appearance = Some(appearance);
                change.sole_updates.extend(updates);
            }
            Placement::Reinsert => change.rebin = true,
        }
    }

    fn stage_geometry(&mut self, draw_atom: Arc<DrawAtom>) {
        let id = draw_atom.id;
        let Some(registered) = self.registered.get_mut(&id) else {
            log::warn!("Geometry change for unknown draw atom {id:?} ignored");
            return;
        };
        let previous = std::mem::replace(&mut registered.draw_atom, Arc::clone(&draw_atom));
        self.count_geometry(&previous, false);
        self.count_geometry(&draw_atom, true);
        self.staging.geometries.extend(draw_atom.geometry.iter().map(|g| g.id));
        if self.index.contains_key(&id) {
            self.staging.change(id).rebin = true;
        }
    }

    fn set_switched_off(&mut self, id: DrawAtomId, switched_off: bool) {
        let Some(registered) = self.registered.get_mut(&id) else {
            log::warn!("Switch change for unknown draw atom {id:?} ignored");
            return;
        };
        registered.switched_off = switched_off;
        if let Some(atom) = self.index.get(&id).and_then(|k| self.atoms.get_mut(*k)) {
            atom.flags.set(AtomFlags::SWITCHED_OFF, switched_off);
        }
    }

    /// Mark a tracked atom as leaving the visible set
    pub(crate) fn stage_leave(&mut self, key: AtomKey) {
        let Some(atom) = self.atoms.get_mut(key) else {
            return;
        };
        atom.flags.remove(AtomFlags::VISIBLE);
        if atom.flags.contains(AtomFlags::IN_BIN) {
            atom.flags.insert(AtomFlags::PENDING_REMOVAL);
        }
        let id = atom.id();
        self.staging.change(id).leave = true;
    }

    fn stage_enter(&mut self, id: DrawAtomId, view: &ViewSettings) {
        let Some(registered) = self.registered.get(&id) else {
            return;
        };
        let draw_atom = Arc::clone(&registered.draw_atom);
        let background = registered.background;
        let environment = self
            .collaborators
            .environment
            .resolve(&draw_atom, view)
            .normalized(self.config.max_lights);
        let key = match self.index.get(&id) {
            Some(&key) => key,
            None => {
                let transform = self.pending_transform(draw_atom.transform_group, &draw_atom.local_to_world);
                let key = self.atoms.insert(RenderAtom::new(draw_atom, &transform, self.frame.frame));
                self.index.insert(id, key);
                key
            }
        };
        if let Some(atom) = self.atoms.get_mut(key) {
            atom.flags.insert(AtomFlags::VISIBLE);
            atom.flags.remove(AtomFlags::PENDING_REMOVAL | AtomFlags::SWITCHED_OFF);
            atom.flags.set(AtomFlags::BACKGROUND, background);
        }
        let change = self.staging.change(id);
        change.rebin = true;
        change.environment = Some(environment);
    }

    fn passes_visibility(&self, id: DrawAtomId, view: &ViewSettings, candidates: &Candidates) -> bool {
        let Some(registered) = self.registered.get(&id) else {
            return false;
        };
        let atom = &registered.draw_atom;
        if registered.switched_off || !atom.visible {
            return false;
        }
        if registered.background {
            return true;
        }
        if !atom.in_view(view.view_index) {
            return false;
        }
        if let Candidates::Only(set) = candidates {
            if !set.contains(&id) {
                return false;
            }
        }
        let transform = self.pending_transform(atom.transform_group, &atom.local_to_world);
        world_bounds(atom, &transform).map_or(true, |bounds| view.frustum.intersects(&bounds))
    }

    fn stage_visibility(&mut self, view: &ViewSettings, reference_time: u64) {
        let result = self.collaborators.visibility.query(view, reference_time);
        if !result.changed && !self.staging.dirty.intersects(StagingDirty::VISIBILITY | StagingDirty::VIEW) {
            return;
        }
        let mut ids: Vec<DrawAtomId> = self.registered.keys().copied().collect();
        ids.sort_unstable();
        let (mut entering, mut leaving) = (0, 0);
        for id in ids {
            let visible = self.passes_visibility(id, view, &result.candidates);
            let key = self.index.get(&id).copied();
            let was_visible = key
                .and_then(|k| self.atoms.get(k))
                .is_some_and(|a| a.flags.contains(AtomFlags::VISIBLE));
            match (visible, key) {
                (true, _) if !was_visible => {
                    self.stage_enter(id, view);
                    entering += 1;
                }
                (false, Some(key)) if was_visible => {
                    self.stage_leave(key);
                    leaving += 1;
                }
                _ => {}
            }
        }
        if entering + leaving > 0 {
            log::debug!("Visibility: {entering} entering, {leaving} leaving");
        }
    }

    fn stage_reevaluation(&mut self, view: &ViewSettings) {
        let categories = std::mem::take(&mut self.staging.reevaluate);
        if categories.is_empty() {
            return;
        }
        let full = categories.needs_full_pass();
        let mut live: Vec<(DrawAtomId, AtomKey)> = self
            .atoms
            .iter()
            .filter(|(_, a)| a.flags.contains(AtomFlags::VISIBLE))
            .map(|(k, a)| (a.id(), k))
            .collect();
        live.sort_unstable_by_key(|(id, _)| *id);

        let mut changed = 0;
        for (id, key) in live {
            if self.staging.staged(id).is_some_and(|c| c.environment.is_some()) {
                continue;
            }
            let Some(atom) = self.atoms.get(key) else {
                continue;
            };
            let resolved = self
                .collaborators
                .environment
                .resolve(&atom.draw_atom, view)
                .normalized(self.config.max_lights);
            let current = &atom.environment;
            let differs = if full {
                !resolved.same_environment(current) || resolved.alternate_appearance != current.alternate_appearance
            } else {
                (categories.contains(Reevaluate::LIGHTS) && resolved.lights != current.lights)
                    || (categories.contains(Reevaluate::FOG) && resolved.fog != current.fog)
                    || (categories.contains(Reevaluate::MODEL_CLIP) && resolved.model_clip != current.model_clip)
                    || (categories.contains(Reevaluate::ALTERNATE_APPEARANCE)
                        && resolved.alternate_appearance != current.alternate_appearance)
            };
            if differs {
                let change = self.staging.change(id);
                change.environment = Some(resolved);
                change.rebin = true;
                changed += 1;
            }
        }
        log::debug!(
            "{} environment pass over {categories:?}: {changed} atoms rebinned",
            if full { "Full" } else { "Targeted" }
        );
    }

    // Phase two: bin update

    /// Apply everything staged since the last update
    ///
    /// Runs removals before insertions, then frees emptied bins, merges
    /// pending bins, applies sole-user updates, refreshes molecule draw
    /// lists, resorts the transparency lists and reconciles device resources.
    pub fn update_object(&mut self) -> UpdateStats {
        let mut stats = UpdateStats::default();
        let mut canvas_dirty = std::mem::take(&mut self.staging.canvas_dirty);
        let dirty = std::mem::take(&mut self.staging.dirty);
        self.apply_globals(dirty, &mut canvas_dirty);
        let mut changes = self.staging.take_changes();

        for (id, change) in &changes {
            if !(change.leave || change.rebin || change.forget) {
                continue;
            }
            if let Some(&key) = self.index.get(id) {
                if self.detach(key) {
                    stats.removed += 1;
                }
            }
        }

        for (id, change) in &mut changes {
            if change.forget && !self.registered.contains_key(id) {
                if let Some(key) = self.index.remove(id) {
                    self.atoms.remove(key);
                    stats.forgotten += 1;
                }
                continue;
            }
            if let Some(appearance) = change.appearance.take() {
                if let Some(atom) = self.index.get(id).and_then(|k| self.atoms.get_mut(*k)) {
                    atom.appearance = appearance;
                }
            }
        }

        for (id, change) in &mut changes {
            let Some(&key) = self.index.get(id) else {
                continue;
            };
            let ready = self
                .atoms
                .get(key)
                .is_some_and(|a| a.flags.contains(AtomFlags::VISIBLE) && !a.flags.contains(AtomFlags::IN_BIN));
            if ready && self.bind(*id, key, change.environment.take()) {
                stats.inserted += 1;
            }
        }

        stats.released_bins = self.tree.release_empty(&mut self.resources, &self.canvases);
        stats.merged_bins = self.tree.merge_pending();
        for (_, change) in &mut changes {
            for update in change.sole_updates.drain(..) {
                if matches!(update, SoleUpdate::Textures(..)) {
                    canvas_dirty.insert(CanvasDirty::TEXTURES);
                }
                if self.tree.apply_sole_update(update, &mut self.resources, &self.canvases) {
                    stats.sole_updates += 1;
                }
            }
        }
        self.refresh_molecule_lists();

        stats.resort = self.transparent.resort();
        self.background_transparent.resort();

        for texture in std::mem::take(&mut self.staging.textures) {
            if !self.resources.invalidate_texture(texture) {
                log::trace!("Changed texture {texture:?} is not bound by any bin");
            }
        }
        for geometry in std::mem::take(&mut self.staging.geometries) {
            self.resources.invalidate_piece_list(geometry);
        }
        for id in std::mem::take(&mut self.staging.offscreen) {
            match self.canvas(id) {
                Some(canvas) => {
                    if let Err(err) = canvas.request_offscreen() {
                        log::warn!("Off-screen render request dropped: {err}");
                    }
                }
                None => log::warn!("Off-screen render requested for unknown canvas {id:?}"),
            }
        }
        stats.resources_released = self.resources.reconcile(&self.canvases);
        stats.compacted = self.compact();

        if stats.structure_changed() {
            canvas_dirty.insert(CanvasDirty::BINS);
        }
        self.publish_canvas_dirty(canvas_dirty);
        self.frame.frame += 1;
        if !dirty.is_empty() || stats.structure_changed() {
            log::trace!("Update {} ({dirty:?}): {stats:?}", self.frame.frame);
        }
        stats
    }

    fn apply_globals(&mut self, dirty: StagingDirty, canvas_dirty: &mut CanvasDirty) {
        if dirty.contains(StagingDirty::ENVIRONMENT) {
            for light in std::mem::take(&mut self.staging.lights) {
                self.lights.insert(light.id, light);
            }
            for fog in std::mem::take(&mut self.staging.fogs) {
                self.fogs.insert(fog.id, fog);
            }
            for clip in std::mem::take(&mut self.staging.clips) {
                self.clips.insert(clip.id, clip);
            }
        }
        if dirty.contains(StagingDirty::BACKGROUND) {
            if let Some(background) = self.staging.background.take() {
                self.background = background;
            }
        }

        if let Some(view) = self.staging.view.take().filter(|_| dirty.contains(StagingDirty::VIEW)) {
            let mode_switched = view.sort_mode != self.view.sort_mode;
            if dirty.contains(StagingDirty::RESORT_ALL) {
                for list in [&mut self.transparent, &mut self.background_transparent] {
                    list.set_eye(view.eye);
                    list.set_order(view.order);
                    list.set_comparator(view.comparator.clone());
                }
            }
            self.view = view;
            if mode_switched {
                log::info!("Transparency sort mode switched to {:?}", self.view.sort_mode);
                self.rebuild_transparency_records();
            }
        }

        let transforms = std::mem::take(&mut self.staging.transforms);
        if !transforms.is_empty() {
            self.transforms.extend(transforms.iter().map(|(g, m)| (*g, *m)));
            for (_, atom) in self.atoms.iter_mut() {
                let Some(matrix) = transforms.get(&atom.draw_atom.transform_group) else {
                    continue;
                };
                atom.update_world_bounds(matrix);
                let Some(list) = atom
                    .chain
                    .and_then(|c| domain_list(&mut self.transparent, &mut self.background_transparent, c.domain))
                else {
                    continue;
                };
                for piece in &atom.pieces {
                    if let Some(record) = piece.transparent {
                        list.update_centroid(record, piece.centroid());
                    }
                }
            }
            canvas_dirty.insert(CanvasDirty::TRANSFORMS);
        }

        if !dirty.contains(StagingDirty::ORDERED) {
            return;
        }
        for (group, order) in std::mem::take(&mut self.staging.ordered_tables) {
            match &order {
                Some(order) => {
                    self.ordered_tables.insert(group, order.clone());
                }
                None => {
                    self.ordered_tables.remove(&group);
                }
            }
            self.tree.set_child_order(group, order);
        }
    }

    /// Link a visible atom into its bins with its current state
    fn bind(&mut self, id: DrawAtomId, key: AtomKey, environment: Option<ResolvedEnvironment>) -> bool {
        let Some(registered) = self.registered.get(&id) else {
            return false;
        };
        let draw_atom = Arc::clone(&registered.draw_atom);
        let base = Arc::clone(&registered.appearance);
        let background = registered.background;
        let transform = self.transform_of(draw_atom.transform_group, &draw_atom.local_to_world);

        let Some(atom) = self.atoms.get_mut(key) else {
            return false;
        };
        if !Arc::ptr_eq(&atom.draw_atom, &draw_atom) {
            atom.rebind(draw_atom, &transform);
        }
        if let Some(environment) = environment {
            atom.environment = environment;
        }
        atom.appearance = atom.environment.alternate_appearance.clone().unwrap_or(base);
        let transparent = atom.is_transparent();
        atom.flags.set(AtomFlags::TRANSPARENT, transparent);
        atom.flags.set(AtomFlags::BACKGROUND, background);
        let ordered_path = atom.draw_atom.ordered_path.clone();

        let domain = match ordered_path {
            _ if background => DomainId::Background,
            Some(path) => self.tree.ordered_domain(&path, &self.ordered_tables),
            None => DomainId::Scene,
        };
        let Some(chain) = self.tree.insert(&mut self.atoms, key, domain, &mut self.resources) else {
            log::error!("Draw atom {id:?} could not be classified");
            return false;
        };
        self.acquire_piece_lists(key);
        self.attach_transparency(key, chain);
        true
    }

    /// Unlink an atom and release its depth-sort records and dedicated lists
    fn detach(&mut self, key: AtomKey) -> bool {
        let Some(chain) = self.tree.remove(&mut self.atoms, key) else {
            return false;
        };
        let Some(atom) = self.atoms.get_mut(key) else {
            return true;
        };
        atom.flags
            .remove(AtomFlags::PENDING_REMOVAL | AtomFlags::IN_DEPTH_SORT_LIST | AtomFlags::TRANSPARENT);
        for piece in &mut atom.pieces {
            if let Some(record) = piece.transparent.take() {
                if let Some(list) = domain_list(&mut self.transparent, &mut self.background_transparent, chain.domain) {
                    list.remove(record);
                }
            }
            if piece.dedicated_list.take().is_some() {
                self.resources.release_piece_list(piece.geometry.id, &self.canvases);
            }
        }
        if chain.transparent && !self.tree.has_transparent_atoms(chain.texture_bin) {
            let record = self
                .tree
                .texture_bins
                .get_mut(chain.texture_bin)
                .and_then(|bin| bin.state.transparent_record.take());
            if let Some(record) = record {
                if let Some(list) = domain_list(&mut self.transparent, &mut self.background_transparent, chain.domain) {
                    list.remove(record);
                }
            }
        }
        true
    }

    /// Geometry drawn by more than one registered atom gets a shared list
    fn acquire_piece_lists(&mut self, key: AtomKey) {
        let Some(atom) = self.atoms.get_mut(key) else {
            return;
        };
        for piece in &mut atom.pieces {
            let users = self.geometry_users.get(&piece.geometry.id).copied().unwrap_or(0);
            if users >= 2 && piece.geometry.compilable {
                piece.dedicated_list = Some(self.resources.acquire_piece_list(piece.geometry.id));
            }
        }
    }

    /// Depth-sort records for a transparent atom outside ordered groups
    fn attach_transparency(&mut self, key: AtomKey, chain: BinChain) {
        if !chain.transparent {
            return;
        }
        let Some(list) = domain_list(&mut self.transparent, &mut self.background_transparent, chain.domain) else {
            return;
        };
        match self.view.sort_mode {
            TransparencySortMode::Geometry => {
                let Some(atom) = self.atoms.get_mut(key) else {
                    return;
                };
                let id = atom.id();
                for (index, piece) in atom.pieces.iter_mut().enumerate() {
                    let target = SortTarget::Piece { atom: key, piece: index };
                    piece.transparent = Some(list.insert(target, piece.centroid(), Some(id)));
                }
                if !atom.pieces.is_empty() {
                    atom.flags.insert(AtomFlags::IN_DEPTH_SORT_LIST);
                }
            }
            TransparencySortMode::None => {
                let centroid = self.atoms.get(key).and_then(RenderAtom::world_bounds).map(|b| b.center());
                if let Some(bin) = self.tree.texture_bins.get_mut(chain.texture_bin) {
                    if bin.state.transparent_record.is_none() {
                        let centroid = centroid.unwrap_or_else(Point3::origin);
                        let target = SortTarget::TextureBin(chain.texture_bin);
                        bin.state.transparent_record = Some(list.insert(target, centroid, None));
                    }
                }
            }
        }
    }

    /// Recreate every depth-sort record for the current sort mode
    fn rebuild_transparency_records(&mut self) {
        self.clear_transparency_records();
        let sorting = self.view.sort_mode == TransparencySortMode::Geometry;
        self.transparent.set_sorting(sorting);
        self.background_transparent.set_sorting(sorting);
        let transparent: Vec<(AtomKey, BinChain)> = self
            .atoms
            .iter()
            .filter_map(|(k, a)| a.chain.filter(|c| c.transparent).map(|c| (k, c)))
            .collect();
        for (key, chain) in transparent {
            self.attach_transparency(key, chain);
        }
    }

    /// Allocate, invalidate or retire molecule draw lists after membership changes
    fn refresh_molecule_lists(&mut self) {
        for key in self.tree.take_touched() {
            let Some(molecule) = self.tree.molecules.get(key) else {
                continue;
            };
            let compiled = molecule.opaque.iter(&self.atoms).any(|(_, a)| a.in_molecule_list());
            match (compiled, molecule.draw_list.clone()) {
                (true, Some(list)) => list.invalidate(),
                (true, None) => {
                    let list = self.resources.allocate_list(ListKind::Molecule);
                    if let Some(molecule) = self.tree.molecules.get_mut(key) {
                        molecule.draw_list = Some(list);
                    }
                }
                (false, Some(list)) => {
                    self.resources.retire(&list, &self.canvases);
                    if let Some(molecule) = self.tree.molecules.get_mut(key) {
                        molecule.draw_list = None;
                    }
                }
                (false, None) => {}
            }
        }
    }

    fn compact(&mut self) -> usize {
        let frame = self.frame.frame;
        for atom in self.atoms.values_mut() {
            if atom.flags.contains(AtomFlags::VISIBLE) {
                atom.last_visible_frame = frame;
            }
        }
        if !self.compaction.tick() {
            return 0;
        }
        let Some(dead) = self.compaction.scan(self.atoms.iter(), frame) else {
            return 0;
        };
        for key in &dead {
            if let Some(atom) = self.atoms.remove(*key) {
                self.index.remove(&atom.id());
            }
        }
        log::debug!("Compaction dropped {} tracking entries, {} remain", dead.len(), self.atoms.len());
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::scene::Geometry;

    #[test]
    fn test_changes_keep_staging_order() {
        let mut staging = Staging::default();
        staging.change(DrawAtomId(3)).leave = true;
        staging.change(DrawAtomId(1)).rebin = true;
        staging.change(DrawAtomId(3)).forget = true;

        let changes = staging.take_changes();
        assert_eq!(changes.iter().map(|(id, _)| id.0).collect::<Vec<_>>(), vec![3, 1]);
        assert!(changes[0].1.leave && changes[0].1.forget);
        assert!(staging.staged(DrawAtomId(3)).is_none());
    }

    #[test]
    fn test_world_bounds_cover_every_piece() {
        let near = Bounds::from_center_extents(Point3::origin(), Vec3::new(1.0, 1.0, 1.0));
        let far = Bounds::from_center_extents(Point3::new(10.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 1.0));
        let atom = DrawAtom::new(1, vec![Arc::new(Geometry::triangles(1, near)), Arc::new(Geometry::triangles(2, far))]);

        let bounds = world_bounds(&atom, &Mat4::identity()).unwrap();
        assert_eq!(bounds.min.x, -1.0);
        assert_eq!(bounds.max.x, 11.0);
        assert!(world_bounds(&DrawAtom::new(2, Vec::new()), &Mat4::identity()).is_none());
    }
}
