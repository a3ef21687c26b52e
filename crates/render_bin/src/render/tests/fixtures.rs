//! Shared fixtures: a recording device, scene builders and a stepping harness

use std::sync::Arc;

use crate::core::config::RenderBinConfig;
use crate::foundation::math::{Bounds, Mat4, Point3, Vec3};
use crate::render::canvas::CanvasState;
use crate::render::error::RenderBinResult;
use crate::render::messages::{MessageBus, MutationMessage};
use crate::render::pipeline::{DeviceError, DevicePipeline, DeviceResult, RenderContext, RenderStats};
use crate::render::render_bin::{Collaborators, RenderBin};
use crate::render::resources::DisplayListId;
use crate::render::update::UpdateStats;
use crate::scene::{
    AllRegistered, Appearance, CandidateSet, Component, DrawAtom, DrawAtomId, Fog, Geometry, GeometryId, Light,
    Material, ModelClip, PolygonAttributes, RenderingAttributes, ScopedEnvironment, ShaderProgram, TextureId,
    TextureUnitState, TransformGroupId, TransparencyAttributes, VisibilityQuery,
};

/// One call into the device
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeviceCall {
    Clear([f32; 4]),
    CreateDrawList(DisplayListId, usize),
    CallDrawList(DisplayListId),
    FreeDrawList(DisplayListId),
    CreateTexture(TextureId),
    FreeTexture(TextureId),
    SetLights(usize, u32),
    SetFog(bool),
    SetModelClip(bool),
    SetTransform(Point3),
    SetRenderingAttributes,
    SetShader(Option<String>),
    BindTextures(usize),
    SetMaterial([f32; 3]),
    SetBlend(bool),
    SetDepthWrite(bool),
    DrawGeometry(GeometryId),
    SwapBuffers,
}

/// Device that records every call and can be told to fail draws
#[derive(Debug, Default)]
pub(crate) struct RecordingDevice {
    pub(crate) calls: Vec<DeviceCall>,
    pub(crate) fail_draws: Option<DeviceError>,
}

impl RecordingDevice {
    fn record(&mut self, call: DeviceCall) -> DeviceResult<()> {
        self.calls.push(call);
        Ok(())
    }

    pub(crate) fn count(&self, matches: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|c| matches(c)).count()
    }

    /// Geometry drawn immediately, in call order
    pub(crate) fn drawn(&self) -> Vec<u64> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::DrawGeometry(id) => Some(id.0),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clear_calls(&mut self) {
        self.calls.clear();
    }
}

impl DevicePipeline for RecordingDevice {
    fn clear(&mut self, color: [f32; 4]) -> DeviceResult<()> {
        self.record(DeviceCall::Clear(color))
    }

    fn create_draw_list(&mut self, id: DisplayListId, pieces: &[&Geometry]) -> DeviceResult<()> {
        self.record(DeviceCall::CreateDrawList(id, pieces.len()))
    }

    fn call_draw_list(&mut self, id: DisplayListId) -> DeviceResult<()> {
        if let Some(err) = self.fail_draws.clone() {
            return Err(err);
        }
        self.record(DeviceCall::CallDrawList(id))
    }

    fn free_draw_list(&mut self, id: DisplayListId) -> DeviceResult<()> {
        self.record(DeviceCall::FreeDrawList(id))
    }

    fn create_texture(&mut self, id: TextureId) -> DeviceResult<()> {
        self.record(DeviceCall::CreateTexture(id))
    }

    fn free_texture(&mut self, id: TextureId) -> DeviceResult<()> {
        self.record(DeviceCall::FreeTexture(id))
    }

    fn set_lights(&mut self, lights: &[(usize, &Light)], enable_mask: u32) -> DeviceResult<()> {
        self.record(DeviceCall::SetLights(lights.len(), enable_mask))
    }

    fn set_fog(&mut self, fog: Option<&Fog>) -> DeviceResult<()> {
        self.record(DeviceCall::SetFog(fog.is_some()))
    }

    fn set_model_clip(&mut self, clip: Option<&ModelClip>) -> DeviceResult<()> {
        self.record(DeviceCall::SetModelClip(clip.is_some()))
    }

    fn set_transform(&mut self, local_to_world: &Mat4) -> DeviceResult<()> {
        self.record(DeviceCall::SetTransform(local_to_world.transform_point(&Point3::origin())))
    }

    fn set_rendering_attributes(&mut self, _attributes: &RenderingAttributes) -> DeviceResult<()> {
        self.record(DeviceCall::SetRenderingAttributes)
    }

    fn set_shader(&mut self, program: Option<&ShaderProgram>) -> DeviceResult<()> {
        self.record(DeviceCall::SetShader(program.map(|p| p.name.clone())))
    }

    fn bind_textures(&mut self, units: &[Component<TextureUnitState>]) -> DeviceResult<()> {
        self.record(DeviceCall::BindTextures(units.len()))
    }

    fn set_material(&mut self, material: &Material, _polygon: &PolygonAttributes) -> DeviceResult<()> {
        self.record(DeviceCall::SetMaterial(material.diffuse))
    }

    fn set_blend(&mut self, transparency: Option<&TransparencyAttributes>) -> DeviceResult<()> {
        self.record(DeviceCall::SetBlend(transparency.is_some()))
    }

    fn set_depth_write(&mut self, enabled: bool) -> DeviceResult<()> {
        self.record(DeviceCall::SetDepthWrite(enabled))
    }

    fn draw_geometry(&mut self, geometry: &Geometry) -> DeviceResult<()> {
        if let Some(err) = self.fail_draws.clone() {
            return Err(err);
        }
        self.record(DeviceCall::DrawGeometry(geometry.id))
    }

    fn swap_buffers(&mut self) -> DeviceResult<()> {
        self.record(DeviceCall::SwapBuffers)
    }
}

// Scene builders

/// Unit piece centred on `center` in local coordinates
pub(crate) fn piece(id: u64, center: Point3) -> Arc<Geometry> {
    Arc::new(Geometry::triangles(
        id,
        Bounds::from_center_extents(center, Vec3::new(0.5, 0.5, 0.5)),
    ))
}

/// Same as [`piece`], but never compiled into a draw list
pub(crate) fn dynamic_piece(id: u64, center: Point3) -> Arc<Geometry> {
    Arc::new(Geometry::triangles(id, Bounds::from_center_extents(center, Vec3::new(0.5, 0.5, 0.5))).dynamic())
}

/// Opaque atom with one static piece at the origin
pub(crate) fn solid(id: u64) -> DrawAtom {
    DrawAtom::new(id, vec![piece(id, Point3::origin())])
}

/// Opaque atom with one dynamic piece, so every draw shows up as `DrawGeometry`
pub(crate) fn immediate(id: u64) -> DrawAtom {
    DrawAtom::new(id, vec![dynamic_piece(id, Point3::origin())])
}

pub(crate) fn painted(r: f32, g: f32, b: f32) -> Arc<Appearance> {
    Arc::new(Appearance::default().with_material(Component::shared(100, Material::diffuse(r, g, b))))
}

pub(crate) fn glass() -> Arc<Appearance> {
    Arc::new(Appearance::default().with_transparency(Component::shared(200, TransparencyAttributes::blended(0.5))))
}

/// Blended atom in its own transform group, translated to `position`
pub(crate) fn pane(id: u64, position: Vec3) -> DrawAtom {
    DrawAtom::new(id, vec![piece(id, Point3::origin())])
        .with_appearance(glass())
        .with_transform(TransformGroupId(id), Mat4::new_translation(&position))
}

pub(crate) fn ids(atoms: &[u64]) -> Vec<DrawAtomId> {
    atoms.iter().copied().map(DrawAtomId).collect()
}

// Harness

/// A render bin on its own bus, stepped one update at a time
pub(crate) struct Harness {
    pub(crate) bus: MessageBus,
    pub(crate) bin: RenderBin,
    pub(crate) environment: Arc<ScopedEnvironment>,
    pub(crate) candidates: Arc<CandidateSet>,
    pub(crate) time: u64,
}

impl Harness {
    /// Every registered atom is a visibility candidate
    pub(crate) fn new(config: RenderBinConfig) -> Self {
        Self::build(config, None)
    }

    /// Only atoms shown through `self.candidates` are candidates
    pub(crate) fn with_candidates(config: RenderBinConfig) -> Self {
        let candidates = Arc::new(CandidateSet::new());
        Self::build(config, Some(candidates))
    }

    fn build(config: RenderBinConfig, candidates: Option<Arc<CandidateSet>>) -> Self {
        crate::foundation::logging::init_for_tests();
        let bus = MessageBus::new();
        let environment = Arc::new(ScopedEnvironment::new());
        let visibility: Arc<dyn VisibilityQuery> = match &candidates {
            Some(set) => Arc::clone(set) as Arc<dyn VisibilityQuery>,
            None => Arc::new(AllRegistered),
        };
        let collaborators = Collaborators {
            visibility,
            environment: Arc::clone(&environment) as _,
        };
        let bin = RenderBin::new(config, collaborators, bus.subscribe()).expect("valid config");
        Self {
            bus,
            bin,
            environment,
            candidates: candidates.unwrap_or_default(),
            time: 0,
        }
    }

    /// Publish `messages` at the next time step and run one update
    pub(crate) fn step(&mut self, messages: impl IntoIterator<Item = MutationMessage>) -> UpdateStats {
        self.time += 1;
        for message in messages {
            self.bus.publish(self.time, message);
        }
        self.bin.process_messages(self.time);
        let stats = self.bin.update_object();
        if let Err(violation) = self.bin.check_invariants() {
            panic!("invariant violated after update {}: {violation}", self.time);
        }
        stats
    }

    pub(crate) fn insert(&mut self, atoms: impl IntoIterator<Item = DrawAtom>) -> UpdateStats {
        let atoms = atoms.into_iter().map(Arc::new).collect();
        self.step([MutationMessage::InsertNodes(atoms)])
    }

    pub(crate) fn remove(&mut self, atoms: &[u64]) -> UpdateStats {
        self.step([MutationMessage::RemoveNodes(ids(atoms))])
    }

    /// One frame on `canvas` with a fresh state cache
    pub(crate) fn render(&self, canvas: &CanvasState, device: &mut RecordingDevice) -> RenderBinResult<RenderStats> {
        let mut context = RenderContext::new(canvas, device);
        self.bin.render_frame(&mut context)
    }
}
