//! Render passes
//!
//! Every pass borrows the bin immutably, so any number of render threads may
//! walk it at once between two updates. Device state is issued top-down and
//! skipped when the canvas's [`StateCache`](crate::render::pipeline::StateCache)
//! already holds it.
//!
//! ```text
//! render_frame
//!   ├── begin_frame         queued frees, dirty flags
//!   ├── clear
//!   ├── render_background   background bins, then background transparency list
//!   ├── render_opaque       scene bins, opaque atoms
//!   ├── render_ordered      ordered collections in draw order
//!   ├── render_transparent  scene transparency list, head to tail
//!   └── swap_buffers        (or off-screen completion)
//! ```

use std::sync::Arc;

use crate::foundation::collections::SiblingList;
use crate::render::atom::{RenderAtom, RenderAtomListInfo};
use crate::render::bins::{
    slot_bit, AtomKey, AttributeBinKey, DomainId, EnvSetKey, MoleculeKey, OrderedBinKey, RenderMolecule,
    ShaderBinKey, TextureBinKey,
};
use crate::render::error::{RenderBinError, RenderBinResult};
use crate::render::pipeline::{DeviceError, DeviceResult, RenderContext, RenderStats};
use crate::render::render_bin::RenderBin;
use crate::render::resources::{DeviceResource, DisplayListId, ResourceKey};
use crate::render::transparency::{SortTarget, TransparencyList};
use crate::scene::{Geometry, Light};

/// Bins above a molecule, enough to issue its state
#[derive(Debug, Clone, Copy)]
struct StatePath {
    env_set: EnvSetKey,
    attribute_bin: AttributeBinKey,
    shader_bin: ShaderBinKey,
    texture_bin: TextureBinKey,
}

fn list_id(resource: &DeviceResource) -> Option<DisplayListId> {
    match resource.key() {
        ResourceKey::DrawList(id) => Some(id),
        ResourceKey::Texture(_) => None,
    }
}

impl RenderBin {
    // Entry points

    /// Render a complete frame on one canvas
    ///
    /// A canvas with a pending teardown request releases its resources and
    /// acknowledges instead of drawing.
    ///
    /// # Errors
    ///
    /// [`RenderBinError::CanvasDisabled`] after a fatal device error,
    /// [`RenderBinError::Device`] when a device call fails this frame.
    pub fn render_frame(&self, context: &mut RenderContext<'_>) -> RenderBinResult<RenderStats> {
        self.check_enabled(context)?;
        if context.canvas.teardown_requested() {
            if !context.canvas.teardown_acknowledged() {
                self.release_canvas_resources(context)?;
            }
            return Ok(RenderStats::default());
        }
        let mut stats = RenderStats::default();
        self.frame_pass(context, &mut stats)
            .map_err(|err| self.device_failed(context, err))?;
        log::trace!("Canvas {:?} frame: {stats:?}", context.canvas.id());
        Ok(stats)
    }

    /// Perform queued frees and pick up published dirty flags
    ///
    /// # Errors
    ///
    /// [`RenderBinError::Device`] when freeing fails; unfreed resources stay queued.
    pub fn begin_frame(&self, context: &mut RenderContext<'_>) -> RenderBinResult<usize> {
        self.check_enabled(context)?;
        self.begin_pass(context).map_err(|err| self.device_failed(context, err))
    }

    /// Draw the background bins and background transparency list
    ///
    /// # Errors
    ///
    /// See [`Self::render_frame`].
    pub fn render_background(&self, context: &mut RenderContext<'_>) -> RenderBinResult<RenderStats> {
        self.check_enabled(context)?;
        let mut stats = RenderStats::default();
        self.background_pass(context, &mut stats)
            .map_err(|err| self.device_failed(context, err))?;
        Ok(stats)
    }

    /// Draw every opaque atom of the scene bins
    ///
    /// # Errors
    ///
    /// See [`Self::render_frame`].
    pub fn render_opaque(&self, context: &mut RenderContext<'_>) -> RenderBinResult<RenderStats> {
        self.check_enabled(context)?;
        let mut stats = RenderStats::default();
        self.opaque_pass(context, &mut stats)
            .map_err(|err| self.device_failed(context, err))?;
        Ok(stats)
    }

    /// Draw ordered collections child by child
    ///
    /// # Errors
    ///
    /// See [`Self::render_frame`].
    pub fn render_ordered(&self, context: &mut RenderContext<'_>) -> RenderBinResult<RenderStats> {
        self.check_enabled(context)?;
        let mut stats = RenderStats::default();
        self.ordered_pass(context, &mut stats)
            .map_err(|err| self.device_failed(context, err))?;
        Ok(stats)
    }

    /// Draw the scene transparency list head to tail
    ///
    /// # Errors
    ///
    /// See [`Self::render_frame`].
    pub fn render_transparent(&self, context: &mut RenderContext<'_>) -> RenderBinResult<RenderStats> {
        self.check_enabled(context)?;
        let mut stats = RenderStats::default();
        self.transparent_pass(context, &self.transparent, &mut stats)
            .map_err(|err| self.device_failed(context, err))?;
        Ok(stats)
    }

    /// Free everything this canvas holds and acknowledge its teardown
    ///
    /// Resources shared with another attached canvas of the same share group
    /// stay on the device.
    ///
    /// # Errors
    ///
    /// [`RenderBinError::Device`] when a free fails; teardown is not acknowledged.
    pub fn release_canvas_resources(&self, context: &mut RenderContext<'_>) -> RenderBinResult<()> {
        self.begin_pass(context).map_err(|err| self.device_failed(context, err))?;
        let canvas = context.canvas;
        let bit = canvas.context_bit();
        let shared = self.canvases.iter().any(|c| c.context_bit() == bit && c.id() != canvas.id());
        let mut freed = Vec::new();
        if !shared {
            // Retired resources were freed through the queue above
            for resource in self.resources.resources_on(bit).into_iter().filter(|r| !r.is_retired()) {
                if resource.is_current_on(canvas) {
                    if let Err(err) = Self::free_on_device(context, &resource) {
                        canvas.acknowledge_frees(freed);
                        return Err(self.device_failed(context, err));
                    }
                }
                freed.push(resource);
            }
        }
        log::info!("Canvas {:?} released {} resources for teardown", canvas.id(), freed.len());
        canvas.acknowledge_frees(freed);
        context.cache.reset();
        canvas.acknowledge_teardown();
        Ok(())
    }

    // Error handling

    fn check_enabled(&self, context: &RenderContext<'_>) -> RenderBinResult<()> {
        if context.canvas.is_disabled() {
            return Err(RenderBinError::CanvasDisabled(context.canvas.id()));
        }
        Ok(())
    }

    fn device_failed(&self, context: &mut RenderContext<'_>, err: DeviceError) -> RenderBinError {
        context.cache.reset();
        match &err {
            DeviceError::ContextLost => {
                log::warn!("Canvas {:?} lost its device context", context.canvas.id());
            }
            DeviceError::Fatal(reason) => {
                log::error!("Canvas {:?} device failure: {reason}", context.canvas.id());
                context.canvas.mark_fatal();
            }
        }
        RenderBinError::Device(err)
    }

    // Passes

    fn frame_pass(&self, context: &mut RenderContext<'_>, stats: &mut RenderStats) -> DeviceResult<()> {
        self.begin_pass(context)?;
        context.device.clear(self.background.color)?;
        self.background_pass(context, stats)?;
        self.opaque_pass(context, stats)?;
        self.ordered_pass(context, stats)?;
        self.transparent_pass(context, &self.transparent, stats)?;
        if context.canvas.offscreen_in_progress() {
            context.canvas.complete_offscreen();
            Ok(())
        } else {
            context.device.swap_buffers()
        }
    }

    fn begin_pass(&self, context: &mut RenderContext<'_>) -> DeviceResult<usize> {
        let canvas = context.canvas;
        let mut pending = canvas.take_pending_frees().into_iter();
        let mut freed = Vec::new();
        let mut failure = None;
        for resource in pending.by_ref() {
            if resource.is_current_on(canvas) {
                if let Err(err) = Self::free_on_device(context, &resource) {
                    canvas.queue_free(resource);
                    failure = Some(err);
                    break;
                }
            }
            freed.push(resource);
        }
        for rest in pending {
            canvas.queue_free(rest);
        }
        let count = freed.len();
        canvas.acknowledge_frees(freed);
        if let Some(err) = failure {
            return Err(err);
        }
        context.cache.invalidate(canvas.take_render_dirty());
        Ok(count)
    }

    fn free_on_device(context: &mut RenderContext<'_>, resource: &Arc<DeviceResource>) -> DeviceResult<()> {
        match resource.key() {
            ResourceKey::DrawList(id) => context.device.free_draw_list(id),
            ResourceKey::Texture(texture) => context.device.free_texture(texture),
        }
    }

    fn background_pass(&self, context: &mut RenderContext<'_>, stats: &mut RenderStats) -> DeviceResult<()> {
        self.set_depth_write(context, false)?;
        self.domain_pass(context, DomainId::Background, false, stats)?;
        self.transparent_pass(context, &self.background_transparent, stats)
    }

    fn opaque_pass(&self, context: &mut RenderContext<'_>, stats: &mut RenderStats) -> DeviceResult<()> {
        self.set_depth_write(context, true)?;
        self.domain_pass(context, DomainId::Scene, false, stats)
    }

    fn ordered_pass(&self, context: &mut RenderContext<'_>, stats: &mut RenderStats) -> DeviceResult<()> {
        let Some(scene) = self.tree.domains().get(DomainId::Scene) else {
            return Ok(());
        };
        for &key in &scene.ordered {
            self.ordered_bin_pass(context, key, stats)?;
        }
        Ok(())
    }

    fn ordered_bin_pass(
        &self,
        context: &mut RenderContext<'_>,
        key: OrderedBinKey,
        stats: &mut RenderStats,
    ) -> DeviceResult<()> {
        let Some(bin) = self.tree.domains().ordered(key) else {
            return Ok(());
        };
        for child in bin.draw_order() {
            let domain = DomainId::Ordered(key, child);
            self.domain_pass(context, domain, true, stats)?;
            let nested = self.tree.domains().get(domain).map(|d| d.ordered.clone()).unwrap_or_default();
            for nested in nested {
                self.ordered_bin_pass(context, nested, stats)?;
            }
        }
        Ok(())
    }

    /// Walk every live bin of a domain; `with_transparent` also draws the
    /// transparent atoms in bin order
    fn domain_pass(
        &self,
        context: &mut RenderContext<'_>,
        domain: DomainId,
        with_transparent: bool,
        stats: &mut RenderStats,
    ) -> DeviceResult<()> {
        let Some(root) = self.tree.domains().get(domain) else {
            return Ok(());
        };
        for (_, light_bin) in root.light_bins.iter(&self.tree.light_bins) {
            for (env_set, env) in light_bin.children.iter(&self.tree.env_sets) {
                for (attribute_bin, attributes) in env.children.iter(&self.tree.attribute_bins) {
                    for (shader_bin, shader) in attributes.children.iter(&self.tree.shader_bins) {
                        for (texture_bin, textures) in shader.children.iter(&self.tree.texture_bins) {
                            let path = StatePath {
                                env_set,
                                attribute_bin,
                                shader_bin,
                                texture_bin,
                            };
                            for (key, molecule) in textures.children.iter(&self.tree.molecules) {
                                if !molecule.opaque.is_empty() {
                                    self.issue_path(context, path, stats)?;
                                    self.issue_molecule(context, key, molecule, false, stats)?;
                                    self.draw_opaque(context, molecule, stats)?;
                                }
                                if with_transparent && !molecule.transparent.is_empty() {
                                    self.issue_path(context, path, stats)?;
                                    self.issue_molecule(context, key, molecule, true, stats)?;
                                    self.draw_atoms(context, &molecule.transparent, stats)?;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn transparent_pass(
        &self,
        context: &mut RenderContext<'_>,
        list: &TransparencyList,
        stats: &mut RenderStats,
    ) -> DeviceResult<()> {
        if list.is_empty() {
            return Ok(());
        }
        self.set_depth_write(context, !self.view.freeze_depth_writes)?;
        for (_, record) in list.iter() {
            match record.target {
                SortTarget::Piece { atom, piece } => {
                    let Some(render_atom) = self.atoms.get(atom) else {
                        continue;
                    };
                    let (Some(chain), Some(piece)) = (render_atom.chain, render_atom.pieces.get(piece)) else {
                        continue;
                    };
                    let Some(molecule) = self.tree.molecules.get(chain.molecule) else {
                        continue;
                    };
                    let path = StatePath {
                        env_set: chain.env_set,
                        attribute_bin: chain.attribute_bin,
                        shader_bin: chain.shader_bin,
                        texture_bin: chain.texture_bin,
                    };
                    self.issue_path(context, path, stats)?;
                    self.issue_molecule(context, chain.molecule, molecule, true, stats)?;
                    self.issue_transform(context, render_atom)?;
                    self.draw_piece(context, piece, stats)?;
                }
                SortTarget::TextureBin(texture_bin) => {
                    let Some(bin) = self.tree.texture_bins.get(texture_bin) else {
                        continue;
                    };
                    let Some(path) = self.path_of(texture_bin) else {
                        continue;
                    };
                    for (key, molecule) in bin.children.iter(&self.tree.molecules) {
                        if molecule.transparent.is_empty() {
                            continue;
                        }
                        self.issue_path(context, path, stats)?;
                        self.issue_molecule(context, key, molecule, true, stats)?;
                        self.draw_atoms(context, &molecule.transparent, stats)?;
                    }
                }
            }
        }
        Ok(())
    }

    // State

    fn path_of(&self, texture_bin: TextureBinKey) -> Option<StatePath> {
        let shader_bin = self.tree.texture_bins.get(texture_bin)?.parent;
        let attribute_bin = self.tree.shader_bins.get(shader_bin)?.parent;
        let env_set = self.tree.attribute_bins.get(attribute_bin)?.parent;
        Some(StatePath {
            env_set,
            attribute_bin,
            shader_bin,
            texture_bin,
        })
    }

    fn issue_path(&self, context: &mut RenderContext<'_>, path: StatePath, stats: &mut RenderStats) -> DeviceResult<()> {
        if context.cache.env_set != Some(path.env_set) {
            if let Some(env) = self.tree.env_sets.get(path.env_set) {
                let mut mask = env.state.enable_mask;
                let mut lights: Vec<(usize, &Light)> = Vec::with_capacity(env.state.slots.len());
                for &(slot, id) in &env.state.slots {
                    match self.lights.get(&id) {
                        Some(light) if light.enabled => lights.push((slot, light)),
                        _ => mask &= !slot_bit(slot),
                    }
                }
                context.device.set_lights(&lights, mask)?;
                context
                    .device
                    .set_fog(env.state.fog.and_then(|id| self.fogs.get(&id)))?;
                context
                    .device
                    .set_model_clip(env.state.model_clip.and_then(|id| self.clips.get(&id)))?;
                stats.state_changes += 1;
            }
            context.cache.env_set = Some(path.env_set);
        }
        if context.cache.attribute_bin != Some(path.attribute_bin) {
            if let Some(bin) = self.tree.attribute_bins.get(path.attribute_bin) {
                let attributes = bin.state.as_ref().map(|c| c.value.clone()).unwrap_or_default();
                context.device.set_rendering_attributes(&attributes)?;
                stats.state_changes += 1;
            }
            context.cache.attribute_bin = Some(path.attribute_bin);
        }
        if context.cache.shader_bin != Some(path.shader_bin) {
            if let Some(bin) = self.tree.shader_bins.get(path.shader_bin) {
                context.device.set_shader(bin.state.as_ref().map(|c| &c.value))?;
                stats.state_changes += 1;
            }
            context.cache.shader_bin = Some(path.shader_bin);
        }
        if context.cache.texture_bin != Some(path.texture_bin) {
            if let Some(bin) = self.tree.texture_bins.get(path.texture_bin) {
                for texture in &bin.state.textures {
                    if texture.needs_create(context.canvas) {
                        if let ResourceKey::Texture(id) = texture.key() {
                            context.device.create_texture(id)?;
                        }
                        texture.mark_created(context.canvas);
                        stats.resources_created += 1;
                    }
                }
                context.device.bind_textures(&bin.state.units)?;
                stats.state_changes += 1;
            }
            context.cache.texture_bin = Some(path.texture_bin);
        }
        Ok(())
    }

    fn issue_molecule(
        &self,
        context: &mut RenderContext<'_>,
        key: MoleculeKey,
        molecule: &RenderMolecule,
        blended: bool,
        stats: &mut RenderStats,
    ) -> DeviceResult<()> {
        if context.cache.molecule == Some(key) && context.cache.blend == Some(blended) {
            return Ok(());
        }
        let state = &molecule.state;
        context
            .device
            .set_material(&state.material_or_default(), &state.polygon_or_default())?;
        let transparency = state.transparency.as_ref().map(|c| &c.value).filter(|_| blended);
        context.device.set_blend(transparency)?;
        context.cache.molecule = Some(key);
        context.cache.blend = Some(blended);
        stats.state_changes += 1;
        Ok(())
    }

    fn set_depth_write(&self, context: &mut RenderContext<'_>, enabled: bool) -> DeviceResult<()> {
        if context.cache.depth_write != Some(enabled) {
            context.device.set_depth_write(enabled)?;
            context.cache.depth_write = Some(enabled);
        }
        Ok(())
    }

    fn issue_transform(&self, context: &mut RenderContext<'_>, atom: &RenderAtom) -> DeviceResult<()> {
        let group = atom.draw_atom.transform_group;
        if context.cache.transform != Some(group) {
            let matrix = self.transform_of(group, &atom.draw_atom.local_to_world);
            context.device.set_transform(&matrix)?;
            context.cache.transform = Some(group);
        }
        Ok(())
    }

    // Draws

    fn draw_opaque(&self, context: &mut RenderContext<'_>, molecule: &RenderMolecule, stats: &mut RenderStats) -> DeviceResult<()> {
        let Some(list) = &molecule.draw_list else {
            return self.draw_atoms(context, &molecule.opaque, stats);
        };
        let compiled: Vec<&RenderAtom> = molecule
            .opaque
            .iter(&self.atoms)
            .map(|(_, a)| a)
            .filter(|a| a.in_molecule_list())
            .collect();
        if let Some(first) = compiled.first() {
            self.issue_transform(context, first)?;
            let pieces: Vec<&Geometry> = compiled
                .iter()
                .flat_map(|a| a.pieces.iter().map(|p| p.geometry.as_ref()))
                .collect();
            if let Some(id) = Self::ensure_list(context, list, &pieces, stats)? {
                context.device.call_draw_list(id)?;
                stats.list_calls += 1;
            }
        }
        for (_, atom) in molecule.opaque.iter(&self.atoms) {
            if !atom.in_molecule_list() {
                self.draw_atom(context, atom, stats)?;
            }
        }
        Ok(())
    }

    fn draw_atoms(&self, context: &mut RenderContext<'_>, atoms: &SiblingList<AtomKey>, stats: &mut RenderStats) -> DeviceResult<()> {
        for (_, atom) in atoms.iter(&self.atoms) {
            self.draw_atom(context, atom, stats)?;
        }
        Ok(())
    }

    fn draw_atom(&self, context: &mut RenderContext<'_>, atom: &RenderAtom, stats: &mut RenderStats) -> DeviceResult<()> {
        self.issue_transform(context, atom)?;
        for piece in &atom.pieces {
            self.draw_piece(context, piece, stats)?;
        }
        Ok(())
    }

    fn draw_piece(&self, context: &mut RenderContext<'_>, piece: &RenderAtomListInfo, stats: &mut RenderStats) -> DeviceResult<()> {
        if let Some(list) = &piece.dedicated_list {
            if let Some(id) = Self::ensure_list(context, list, &[piece.geometry.as_ref()], stats)? {
                context.device.call_draw_list(id)?;
                stats.list_calls += 1;
                return Ok(());
            }
        }
        context.device.draw_geometry(&piece.geometry)?;
        stats.draws += 1;
        Ok(())
    }

    /// Compile `list` on this canvas if it is missing or stale
    fn ensure_list(
        context: &mut RenderContext<'_>,
        list: &DeviceResource,
        pieces: &[&Geometry],
        stats: &mut RenderStats,
    ) -> DeviceResult<Option<DisplayListId>> {
        let Some(id) = list_id(list) else {
            return Ok(None);
        };
        if list.needs_create(context.canvas) {
            context.device.create_draw_list(id, pieces)?;
            list.mark_created(context.canvas);
            stats.resources_created += 1;
        }
        Ok(Some(id))
    }
}
