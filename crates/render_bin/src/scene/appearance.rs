//! Appearance state objects
//!
//! Each appearance component is the defining state of one bin level:
//! rendering attributes pick the AttributeBin, the shader program the
//! ShaderBin, texture units the TextureBin, and material / transparency /
//! polygon attributes the RenderMolecule.

use bitflags::bitflags;

/// Identity of one scene-graph component object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

/// Identity of a texture object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// A component snapshot together with its identity and sharing mode
///
/// A *sole user* component is privately owned by one bin: bins compare it by
/// identity and may update it in place instead of reclassifying atoms.
#[derive(Debug, Clone, PartialEq)]
pub struct Component<T> {
    /// Scene-graph object identity
    pub id: ComponentId,
    /// Snapshot of the component contents
    pub value: T,
    /// Privately owned by a single bin
    pub sole_user: bool,
}

impl<T> Component<T> {
    /// A shareable component, compared by value
    pub fn shared(id: u64, value: T) -> Self {
        Self {
            id: ComponentId(id),
            value,
            sole_user: false,
        }
    }

    /// A privately owned component, compared by identity
    pub fn sole(id: u64, value: T) -> Self {
        Self {
            id: ComponentId(id),
            value,
            sole_user: true,
        }
    }
}

/// Level equivalence predicate for an optional component
///
/// `None` stands for the default state. Sole-user components only match the
/// same object.
pub fn equivalent<T: PartialEq + Default>(a: Option<&Component<T>>, b: Option<&Component<T>>) -> bool {
    let sole = a.is_some_and(|c| c.sole_user) || b.is_some_and(|c| c.sole_user);
    if sole {
        return matches!((a, b), (Some(a), Some(b)) if a.id == b.id);
    }
    match (a, b) {
        (Some(a), Some(b)) => a.value == b.value,
        (Some(c), None) | (None, Some(c)) => c.value == T::default(),
        (None, None) => true,
    }
}

/// Whether `new` can replace `current` in place on a sole-user bin
pub fn same_sole_object<T>(current: Option<&Component<T>>, new: Option<&Component<T>>) -> bool {
    matches!((current, new), (Some(a), Some(b)) if a.sole_user && b.sole_user && a.id == b.id)
}

/// Unit-by-unit equivalence of two texture-unit arrays
pub fn equivalent_units<T: PartialEq + Default>(a: &[Component<T>], b: &[Component<T>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equivalent(Some(x), Some(y)))
}

/// Depth/alpha comparison function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareFunction {
    /// Always passes
    #[default]
    Always,
    /// Never passes
    Never,
    /// Passes when less
    Less,
    /// Passes when less or equal
    LessOrEqual,
    /// Passes when greater
    Greater,
    /// Passes when greater or equal
    GreaterOrEqual,
}

/// Rendering attributes (AttributeBin state)
#[derive(Debug, Clone, PartialEq)]
pub struct RenderingAttributes {
    /// Depth test enabled
    pub depth_test: bool,
    /// Depth writes enabled
    pub depth_write: bool,
    /// Alpha test function
    pub alpha_test: CompareFunction,
    /// Alpha test reference value
    pub alpha_test_value: f32,
    /// Geometry is drawn at all
    pub visible: bool,
    /// Per-vertex colours are ignored (and with them per-vertex alpha)
    pub ignore_vertex_colors: bool,
}

impl Default for RenderingAttributes {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            alpha_test: CompareFunction::Always,
            alpha_test_value: 0.0,
            visible: true,
            ignore_vertex_colors: false,
        }
    }
}

/// Transparency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransparencyMode {
    /// Opaque
    #[default]
    None,
    /// Blended, implementation picks the fastest method
    Fastest,
    /// Blended, implementation picks the nicest method
    Nicest,
    /// Stipple pattern; drawn with the opaque geometry
    Screendoor,
    /// Alpha blended
    Blended,
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendFactor {
    /// 0
    Zero,
    /// 1
    One,
    /// Source alpha
    #[default]
    SrcAlpha,
    /// 1 - source alpha
    OneMinusSrcAlpha,
}

/// Transparency attributes (part of the RenderMolecule state)
#[derive(Debug, Clone, PartialEq)]
pub struct TransparencyAttributes {
    /// Transparency mode
    pub mode: TransparencyMode,
    /// Transparency value, 0 = opaque
    pub transparency: f32,
    /// Source blend factor
    pub src_blend: BlendFactor,
    /// Destination blend factor
    pub dst_blend: BlendFactor,
}

impl TransparencyAttributes {
    /// Alpha-blended transparency with the given value
    pub fn blended(transparency: f32) -> Self {
        Self {
            mode: TransparencyMode::Blended,
            transparency,
            ..Self::default()
        }
    }

    /// Whether geometry with these attributes goes through the blended path
    pub fn is_blended(&self) -> bool {
        !matches!(self.mode, TransparencyMode::None | TransparencyMode::Screendoor)
    }
}

impl Default for TransparencyAttributes {
    fn default() -> Self {
        Self {
            mode: TransparencyMode::None,
            transparency: 0.0,
            src_blend: BlendFactor::SrcAlpha,
            dst_blend: BlendFactor::OneMinusSrcAlpha,
        }
    }
}

/// Named uniform value of a shader program
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderAttribute {
    /// Uniform name
    pub name: String,
    /// Uniform value
    pub value: [f32; 4],
}

/// Shader program (ShaderBin state); `None` means the fixed-function path
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShaderProgram {
    /// Program name, for diagnostics
    pub name: String,
    /// Hash of the vertex stage source
    pub vertex_source_hash: u64,
    /// Hash of the fragment stage source
    pub fragment_source_hash: u64,
    /// Uniform attribute set
    pub attributes: Vec<ShaderAttribute>,
}

/// Texture environment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureMode {
    /// Multiply with the fragment colour
    #[default]
    Modulate,
    /// Replace the fragment colour
    Replace,
    /// Decal
    Decal,
    /// Blend with a constant colour
    Blend,
}

/// One texture unit (TextureBin state is the array of units)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextureUnitState {
    /// Bound texture, if any
    pub texture: Option<TextureId>,
    /// Texture environment mode
    pub mode: TextureMode,
    /// Texture coordinate generation enabled
    pub coordinate_generation: bool,
}

impl TextureUnitState {
    /// A unit sampling `texture` with the default mode
    pub fn with_texture(texture: TextureId) -> Self {
        Self {
            texture: Some(texture),
            ..Self::default()
        }
    }
}

/// Material (part of the RenderMolecule state)
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    /// Ambient colour
    pub ambient: [f32; 3],
    /// Diffuse colour
    pub diffuse: [f32; 3],
    /// Specular colour
    pub specular: [f32; 3],
    /// Emissive colour
    pub emissive: [f32; 3],
    /// Specular exponent
    pub shininess: f32,
    /// Lighting enabled for this material
    pub lighting_enabled: bool,
}

impl Material {
    /// A lit material with the given diffuse colour
    pub fn diffuse(r: f32, g: f32, b: f32) -> Self {
        Self {
            diffuse: [r, g, b],
            ..Self::default()
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self {
            ambient: [0.2, 0.2, 0.2],
            diffuse: [1.0, 1.0, 1.0],
            specular: [1.0, 1.0, 1.0],
            emissive: [0.0, 0.0, 0.0],
            shininess: 64.0,
            lighting_enabled: true,
        }
    }
}

/// Polygon rasterization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolygonMode {
    /// Filled
    #[default]
    Fill,
    /// Outlines
    Line,
    /// Vertices
    Point,
}

/// Face culling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullFace {
    /// No culling
    None,
    /// Cull back faces
    #[default]
    Back,
    /// Cull front faces
    Front,
}

/// Polygon attributes (part of the RenderMolecule state)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolygonAttributes {
    /// Rasterization mode
    pub mode: PolygonMode,
    /// Culling
    pub cull: CullFace,
    /// Depth offset
    pub polygon_offset: f32,
}

bitflags! {
    /// Which parts of an appearance a change touches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AppearanceComponents: u32 {
        /// Rendering attributes
        const RENDERING = 1 << 0;
        /// Transparency attributes
        const TRANSPARENCY = 1 << 1;
        /// Shader program
        const SHADER = 1 << 2;
        /// Texture units
        const TEXTURE = 1 << 3;
        /// Material
        const MATERIAL = 1 << 4;
        /// Polygon attributes
        const POLYGON = 1 << 5;
    }
}

/// Complete appearance of a shape; every component defaults when absent
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Appearance {
    /// Rendering attributes
    pub rendering: Option<Component<RenderingAttributes>>,
    /// Transparency attributes
    pub transparency: Option<Component<TransparencyAttributes>>,
    /// Shader program
    pub shader: Option<Component<ShaderProgram>>,
    /// Texture units
    pub texture_units: Vec<Component<TextureUnitState>>,
    /// Material
    pub material: Option<Component<Material>>,
    /// Polygon attributes
    pub polygon: Option<Component<PolygonAttributes>>,
}

impl Appearance {
    /// Set the material
    pub fn with_material(mut self, material: Component<Material>) -> Self {
        self.material = Some(material);
        self
    }

    /// Set the transparency attributes
    pub fn with_transparency(mut self, transparency: Component<TransparencyAttributes>) -> Self {
        self.transparency = Some(transparency);
        self
    }

    /// Set the rendering attributes
    pub fn with_rendering(mut self, rendering: Component<RenderingAttributes>) -> Self {
        self.rendering = Some(rendering);
        self
    }

    /// Set the shader program
    pub fn with_shader(mut self, shader: Component<ShaderProgram>) -> Self {
        self.shader = Some(shader);
        self
    }

    /// Append a texture unit
    pub fn with_texture_unit(mut self, unit: Component<TextureUnitState>) -> Self {
        self.texture_units.push(unit);
        self
    }

    /// Set the polygon attributes
    pub fn with_polygon(mut self, polygon: Component<PolygonAttributes>) -> Self {
        self.polygon = Some(polygon);
        self
    }

    /// Transparency attributes request blending
    pub fn is_blended(&self) -> bool {
        self.transparency.as_ref().is_some_and(|t| t.value.is_blended())
    }

    /// Per-vertex colours (and their alpha) are in effect
    pub fn uses_vertex_colors(&self) -> bool {
        !self.rendering.as_ref().is_some_and(|r| r.value.ignore_vertex_colors)
    }

    /// Textures referenced by any unit
    pub fn textures(&self) -> impl Iterator<Item = TextureId> + '_ {
        self.texture_units.iter().filter_map(|u| u.value.texture)
    }
}
