//! Device pipeline abstraction
//!
//! This module defines the trait the native graphics layer implements. The
//! render bin only calls it from render threads, inside the `render_*`
//! entry points; the update thread never touches the device.

use crate::foundation::math::Mat4;
use crate::render::bins::{AttributeBinKey, EnvSetKey, MoleculeKey, ShaderBinKey, TextureBinKey};
use crate::render::canvas::CanvasState;
use crate::render::flags::CanvasDirty;
use crate::render::resources::DisplayListId;
use crate::scene::{
    Component, Fog, Geometry, Light, Material, ModelClip, PolygonAttributes, RenderingAttributes, ShaderProgram,
    TextureId, TextureUnitState, TransformGroupId, TransparencyAttributes,
};

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Failures reported by the device
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The context was lost; resources must be recreated on a new one
    #[error("Device context lost")]
    ContextLost,

    /// Unrecoverable device failure
    #[error("Fatal device error: {0}")]
    Fatal(String),
}

/// Native graphics device operations used by the render passes
pub trait DevicePipeline {
    /// Clear color and depth buffers
    fn clear(&mut self, color: [f32; 4]) -> DeviceResult<()>;

    /// Compile geometry pieces into the draw list `id`
    fn create_draw_list(&mut self, id: DisplayListId, pieces: &[&Geometry]) -> DeviceResult<()>;

    /// Execute a compiled draw list
    fn call_draw_list(&mut self, id: DisplayListId) -> DeviceResult<()>;

    /// Destroy a compiled draw list
    fn free_draw_list(&mut self, id: DisplayListId) -> DeviceResult<()>;

    /// Upload (or re-upload) a texture object
    fn create_texture(&mut self, id: TextureId) -> DeviceResult<()>;

    /// Destroy a texture object
    fn free_texture(&mut self, id: TextureId) -> DeviceResult<()>;

    /// Load lights into device slots; `enable_mask` has one bit per slot
    fn set_lights(&mut self, lights: &[(usize, &Light)], enable_mask: u32) -> DeviceResult<()>;

    /// Set or disable fog
    fn set_fog(&mut self, fog: Option<&Fog>) -> DeviceResult<()>;

    /// Set or disable model clip planes
    fn set_model_clip(&mut self, clip: Option<&ModelClip>) -> DeviceResult<()>;

    /// Set the local-to-world transform for following draws
    fn set_transform(&mut self, local_to_world: &Mat4) -> DeviceResult<()>;

    /// Apply rendering attributes
    fn set_rendering_attributes(&mut self, attributes: &RenderingAttributes) -> DeviceResult<()>;

    /// Bind a shader program, or the fixed-function path for `None`
    fn set_shader(&mut self, program: Option<&ShaderProgram>) -> DeviceResult<()>;

    /// Bind texture units; an empty slice disables texturing
    fn bind_textures(&mut self, units: &[Component<TextureUnitState>]) -> DeviceResult<()>;

    /// Apply material and polygon state
    fn set_material(&mut self, material: &Material, polygon: &PolygonAttributes) -> DeviceResult<()>;

    /// Enable blending with the given attributes, or disable it with `None`
    fn set_blend(&mut self, transparency: Option<&TransparencyAttributes>) -> DeviceResult<()>;

    /// Enable or freeze depth-buffer writes
    fn set_depth_write(&mut self, enabled: bool) -> DeviceResult<()>;

    /// Draw one geometry piece immediately
    fn draw_geometry(&mut self, geometry: &Geometry) -> DeviceResult<()>;

    /// Present the frame
    fn swap_buffers(&mut self) -> DeviceResult<()>;
}

/// Device state last issued on a canvas
///
/// A bin whose key matches the cached one is not re-issued. Canvas dirty
/// flags drop the entries they affect at the start of each frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCache {
    pub(crate) env_set: Option<EnvSetKey>,
    pub(crate) attribute_bin: Option<AttributeBinKey>,
    pub(crate) shader_bin: Option<ShaderBinKey>,
    pub(crate) texture_bin: Option<TextureBinKey>,
    pub(crate) molecule: Option<MoleculeKey>,
    pub(crate) transform: Option<TransformGroupId>,
    pub(crate) blend: Option<bool>,
    pub(crate) depth_write: Option<bool>,
}

impl StateCache {
    /// Forget everything
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Forget the entries `dirty` makes stale
    pub fn invalidate(&mut self, dirty: CanvasDirty) {
        if dirty.contains(CanvasDirty::BINS) {
            self.reset();
            return;
        }
        if dirty.intersects(CanvasDirty::LIGHTS | CanvasDirty::FOG | CanvasDirty::MODEL_CLIP) {
            self.env_set = None;
        }
        if dirty.contains(CanvasDirty::TEXTURES) {
            self.texture_bin = None;
        }
        if dirty.intersects(CanvasDirty::TRANSFORMS | CanvasDirty::VIEW) {
            self.transform = None;
        }
    }
}

/// Everything a render pass needs for one canvas
///
/// A render thread keeps its context across frames so the state cache
/// carries over.
pub struct RenderContext<'a> {
    /// Canvas being rendered
    pub canvas: &'a CanvasState,
    /// Device owned by the canvas's render thread
    pub device: &'a mut dyn DevicePipeline,
    /// Last issued device state
    pub cache: StateCache,
}

impl<'a> RenderContext<'a> {
    /// Bundle a canvas with its device
    pub fn new(canvas: &'a CanvasState, device: &'a mut dyn DevicePipeline) -> Self {
        Self {
            canvas,
            device,
            cache: StateCache::default(),
        }
    }
}

/// Counters returned by each render pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Light/fog/clip, attribute, shader, texture and material changes issued
    pub state_changes: usize,
    /// Immediate geometry draws
    pub draws: usize,
    /// Draw-list executions
    pub list_calls: usize,
    /// Draw lists or textures created on the device
    pub resources_created: usize,
}

impl RenderStats {
    /// Sum two sets of counters
    pub fn merged(self, other: Self) -> Self {
        Self {
            state_changes: self.state_changes + other.state_changes,
            draws: self.draws + other.draws,
            list_calls: self.list_calls + other.list_calls,
            resources_created: self.resources_created + other.resources_created,
        }
    }
}
